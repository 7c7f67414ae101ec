use crate::config::Config;
use crate::utils::retry::RetryConfig;
use std::sync::Arc;
use std::time::Duration;

use attempt_runner::AttemptRegistry;
use lms_client::{HttpLmsClient, LmsApi};
use notification_aggregator::DismissalStore;
use status_cache::StatusSignals;

/// How long finished attempt runs stay readable.
const ATTEMPT_RETENTION: Duration = Duration::from_secs(30 * 60);
/// How long an unfinished, untimed run may sit without answers or submits.
const ATTEMPT_IDLE_LIMIT: Duration = Duration::from_secs(4 * 60 * 60);

pub struct AppState {
    pub config: Config,
    pub lms: Arc<dyn LmsApi>,
    pub signals: StatusSignals,
    pub attempts: AttemptRegistry,
    pub dismissals: DismissalStore,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = HttpLmsClient::new(&config.lms_api_url, timeout)
            .map_err(|e| anyhow::anyhow!("Failed to build LMS client: {}", e))?
            .with_read_retry(RetryConfig::default());

        tracing::info!(
            "LMS client ready: base_url={}, timeout={:?}",
            config.lms_api_url,
            timeout
        );

        Ok(Self::with_lms(config, Arc::new(client)))
    }

    pub fn with_lms(config: Config, lms: Arc<dyn LmsApi>) -> Self {
        Self {
            config,
            lms,
            signals: StatusSignals::new(),
            attempts: AttemptRegistry::new(ATTEMPT_RETENTION, ATTEMPT_IDLE_LIMIT),
            dismissals: DismissalStore::new(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.status_poll_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.config.timer_tick_interval_ms)
    }
}

pub mod attempt_runner;
pub mod lms_client;
pub mod module_access;
pub mod notification_aggregator;
pub mod quiz_status;
pub mod status_cache;

#[cfg(test)]
pub mod test_support;
