//! Alert recording with catalog-backed de-duplication
//!
//! Delivery (email, paging) is an external concern; the engine's job is to
//! classify failures, record them durably, and avoid re-raising the same
//! alert on every retried invocation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use peerflow_core::{ErrorAction, NormalizeError, Result};

use crate::store::Catalog;

const DEFAULT_DEDUP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Records classified failures in the catalog, suppressing duplicates of
/// the same key inside the de-dup interval.
pub struct Alerter<C: Catalog> {
    catalog: Arc<C>,
    dedup_interval: Duration,
}

impl<C: Catalog> Alerter<C> {
    pub fn new(catalog: Arc<C>) -> Self {
        Self {
            catalog,
            dedup_interval: DEFAULT_DEDUP_INTERVAL,
        }
    }

    pub fn with_dedup_interval(mut self, interval: Duration) -> Self {
        self.dedup_interval = interval;
        self
    }

    /// Record an alert unless one with the same key fired recently.
    ///
    /// Returns whether the alert was recorded.
    pub async fn alert(&self, alert_key: &str, message: &str) -> Result<bool> {
        if let Some(last) = self.catalog.last_alert_time(alert_key).await? {
            let age = Utc::now().signed_duration_since(last);
            if age.to_std().map_or(true, |age| age < self.dedup_interval) {
                debug!(alert_key, "suppressing duplicate alert");
                return Ok(false);
            }
        }
        self.catalog.record_alert(alert_key, 0, message).await?;
        Ok(true)
    }

    /// Classify and record a normalization failure for a flow.
    ///
    /// Only failures whose policy is a notification are recorded; retries
    /// and expected conditions are logged and left to the orchestrator.
    pub async fn report_error(&self, flow_job_name: &str, err: &NormalizeError) -> Result<()> {
        let class = err.error_class();
        let alert_key = format!("{flow_job_name}:{class}");
        let message = format!("[{flow_job_name}] {err}");

        match err.error_action() {
            ErrorAction::NotifyCritical => {
                error!(flow = flow_job_name, class = ?class, "CRITICAL: {err}");
                self.alert(&alert_key, &message).await?;
            }
            ErrorAction::NotifyWarning => {
                warn!(flow = flow_job_name, class = ?class, "{err}");
                self.alert(&alert_key, &message).await?;
            }
            ErrorAction::Retry | ErrorAction::Ignore => {
                debug!(flow = flow_job_name, class = ?class, "not alerting: {err}");
            }
        }
        Ok(())
    }
}
