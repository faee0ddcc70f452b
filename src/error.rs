use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// How the message-consumption loop should settle a message that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the message for redelivery with backoff.
    Retry,
    /// Acknowledge the message and preserve it for manual remediation.
    Reject,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("contract missing: {0}")]
    ContractMissing(String),
    #[error("external service error: {0}")]
    ExternalService(String),
    #[error("invalid unit: {0}")]
    InvalidUnit(String),
    #[error("usage regressed from {previous} to {current} for {key}")]
    UsageRegression {
        key: String,
        previous: f64,
        current: f64,
    },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BillingError {
    pub fn disposition(&self) -> Disposition {
        match self {
            BillingError::ContractMissing(_)
            | BillingError::ExternalService(_)
            | BillingError::Persistence(_) => Disposition::Retry,
            BillingError::Configuration(_)
            | BillingError::InvalidUnit(_)
            | BillingError::UsageRegression { .. }
            | BillingError::InvalidMessage(_)
            | BillingError::Serialization(_) => Disposition::Reject,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BillingError::Configuration(_) => "configuration_error",
            BillingError::ContractMissing(_) => "contract_missing",
            BillingError::ExternalService(_) => "external_service_error",
            BillingError::InvalidUnit(_) => "invalid_unit",
            BillingError::UsageRegression { .. } => "usage_regression",
            BillingError::InvalidMessage(_) => "invalid_message",
            BillingError::Persistence(_) => "persistence_error",
            BillingError::Serialization(_) => "serialization_error",
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("billing error: {0}")]
    Billing(#[from] BillingError),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Billing(BillingError::InvalidMessage(_)) => StatusCode::BAD_REQUEST,
            AppError::Db(_) | AppError::Billing(_) | AppError::Message(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
