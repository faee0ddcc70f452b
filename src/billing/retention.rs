use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::store::RemittanceStore;
use crate::error::BillingResult;

/// Payload of the enabled-orgs signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnabledOrg {
    pub org_id: String,
}

/// key: retention-purger -> per-org deletion of rows past the retention window
#[derive(Clone)]
pub struct RetentionPurger {
    store: Arc<dyn RemittanceStore>,
    retention: Option<Duration>,
}

impl RetentionPurger {
    pub fn new(store: Arc<dyn RemittanceStore>, retention: Option<Duration>) -> Self {
        Self { store, retention }
    }

    pub fn is_enabled(&self) -> bool {
        self.retention.is_some()
    }

    /// Returns the number of rows deleted; `None` when retention is not configured.
    pub async fn purge(&self, org_id: &str) -> BillingResult<Option<u64>> {
        let Some(retention) = self.retention else {
            debug!(%org_id, "remittance retention not configured; skipping purge");
            return Ok(None);
        };
        let cutoff = Utc::now() - retention;
        let deleted = self.store.delete_older_than(org_id, cutoff).await?;
        info!(%org_id, %cutoff, deleted, "purged remittances past retention");
        Ok(Some(deleted))
    }
}
