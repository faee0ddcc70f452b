use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Values closer than this to an integer are treated as that integer when rounding.
const ROUNDING_TOLERANCE: f64 = 1e-9;

/// key: billing-units -> metric/billing unit with factor relative to the canonical metric unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Metric the unit measures. `None` is the canonical unit, compatible with any metric.
    pub metric_id: Option<String>,
    pub billing_factor: f64,
}

impl Unit {
    pub fn metric() -> Self {
        Self {
            metric_id: None,
            billing_factor: 1.0,
        }
    }

    pub fn billing(metric_id: impl Into<String>, billing_factor: f64) -> BillingResult<Self> {
        let metric_id = metric_id.into();
        if !billing_factor.is_finite() || billing_factor <= 0.0 {
            return Err(BillingError::InvalidUnit(format!(
                "billing factor {billing_factor} for metric {metric_id} must be finite and positive"
            )));
        }
        Ok(Self {
            metric_id: Some(metric_id),
            billing_factor,
        })
    }

    pub fn is_canonical(&self) -> bool {
        self.billing_factor == 1.0
    }

    fn ensure_compatible(&self, other: &Unit) -> BillingResult<()> {
        match (&self.metric_id, &other.metric_id) {
            (Some(lhs), Some(rhs)) if lhs != rhs => Err(BillingError::InvalidUnit(format!(
                "cannot convert between {lhs} and {rhs}"
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.metric_id {
            Some(metric) => write!(f, "{metric}@{}", self.billing_factor),
            None => write!(f, "metric"),
        }
    }
}

/// key: billing-quantity -> unit-aware value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    /// Canonical metric-unit quantity.
    pub fn of(value: f64) -> Self {
        Self {
            value,
            unit: Unit::metric(),
        }
    }

    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    /// Re-express the quantity in `target`, always through the canonical metric amount.
    pub fn to(&self, target: &Unit) -> BillingResult<Quantity> {
        self.unit.ensure_compatible(target)?;
        if self.unit.billing_factor == target.billing_factor {
            return Ok(Quantity::new(self.value, target.clone()));
        }
        let canonical = self.value / self.unit.billing_factor;
        Ok(Quantity::new(canonical * target.billing_factor, target.clone()))
    }

    pub fn to_metric(&self) -> BillingResult<Quantity> {
        let target = Unit {
            metric_id: self.unit.metric_id.clone(),
            billing_factor: 1.0,
        };
        self.to(&target)
    }

    pub fn add(&self, other: &Quantity) -> BillingResult<Quantity> {
        let other = other.to(&self.unit)?;
        Ok(Quantity::new(self.value + other.value, self.unit.clone()))
    }

    pub fn subtract(&self, other: &Quantity) -> BillingResult<Quantity> {
        let other = other.to(&self.unit)?;
        Ok(Quantity::new(self.value - other.value, self.unit.clone()))
    }

    /// Round up within the current unit.
    pub fn ceil(&self) -> Quantity {
        let nearest = self.value.round();
        let value = if (self.value - nearest).abs() < ROUNDING_TOLERANCE {
            nearest
        } else {
            self.value.ceil()
        };
        Quantity::new(value, self.unit.clone())
    }

    pub fn positive_or_zero(&self) -> Quantity {
        Quantity::new(self.value.max(0.0), self.unit.clone())
    }

    pub fn scale(&self, factor: f64) -> Quantity {
        Quantity::new(self.value * factor, self.unit.clone())
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}
