use std::time::Duration;

use benchbot_core::{
    config::PipelineConfig,
    models::{STATUS_FAILURE, STATUS_SUCCESS, StoreKey},
    shutdown::Shutdown,
};
use benchbot_db::MetaStore;

use crate::PipelineError;

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Multiplier applied to the interval after every miss. 1.0 polls at a fixed rate.
    pub backoff_factor: f64,
    pub max_interval: Duration,
}

impl From<&PipelineConfig> for PollConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            max_attempts: config.poll_max_attempts,
            backoff_factor: config.poll_backoff_factor,
            max_interval: Duration::from_secs(config.poll_max_interval_secs),
        }
    }
}

impl PollConfig {
    fn next_interval(&self, current: Duration) -> Duration {
        if self.backoff_factor <= 1.0 {
            return current;
        }
        current.mul_f64(self.backoff_factor).min(self.max_interval.max(current))
    }
}

/// Poll `key` until it reads `SUCCESS`.
///
/// A missing key counts as not ready yet: a build that never started and one that
/// is still running look the same. `FAILURE` ends the wait early, as does any
/// store error.
pub async fn wait_for_status(
    store: &dyn MetaStore,
    key: &StoreKey,
    config: &PollConfig,
    mut shutdown: Shutdown,
) -> Result<(), PipelineError> {
    let mut interval = config.interval;
    for attempt in 1..=config.max_attempts {
        let status = store
            .get(key)
            .await
            .map_err(|source| PipelineError::Store { key: key.to_path(), source })?;
        match status.as_deref() {
            Some(s) if s == STATUS_SUCCESS.as_bytes() => {
                tracing::info!("{} ready after {} attempts", key, attempt);
                return Ok(());
            }
            Some(s) if s == STATUS_FAILURE.as_bytes() => {
                return Err(PipelineError::BuildFailed { key: key.to_path() });
            }
            Some(s) => {
                tracing::debug!("{} is {} (attempt {})", key, String::from_utf8_lossy(s), attempt)
            }
            None => tracing::debug!("{} not found (attempt {})", key, attempt),
        }
        if attempt == config.max_attempts {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.wait() => return Err(PipelineError::Cancelled { key: key.to_path() }),
        }
        interval = config.next_interval(interval);
    }
    Err(PipelineError::Timeout { key: key.to_path(), attempts: config.max_attempts })
}
