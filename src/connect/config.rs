use std::time::Duration;

use educe::Educe;
use serde::{Deserialize, Serialize};

use crate::conf::{ConfError, ConfResult};
use crate::retry::RetryPolicy;

/// Management API endpoint and HTTP behaviour.
#[derive(Educe, Deserialize, Serialize, PartialEq, Clone)]
#[educe(Debug, Default)]
#[serde(default)]
pub struct ConnectConf {
    #[educe(Default = "http://localhost:8083")]
    pub url: String,
    #[educe(Default = 15)]
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl ConnectConf {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> ConfResult<()> {
        if self.url.trim().is_empty() {
            return Err(ConfError::validation("connect.url must not be empty"));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfError::validation(format!(
                "connect.url must start with http:// or https://, got '{}'",
                self.url
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ConfError::validation("connect.timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Bounds for the waits inside lifecycle workflows.
#[derive(Educe, Deserialize, Serialize, PartialEq, Clone)]
#[educe(Debug, Default)]
#[serde(default)]
pub struct LifecycleConf {
    /// How long a restarted connector gets to report RUNNING before it is recreated.
    #[educe(Default = 60_000)]
    pub restart_wait_ms: u64,
    /// Grace period for UNASSIGNED/RESTARTING connectors to settle on their own.
    #[educe(Default = 15_000)]
    pub settle_wait_ms: u64,
    #[educe(Default = 30_000)]
    pub delete_wait_ms: u64,
    #[educe(Default = 1_000)]
    pub poll_interval_ms: u64,
}

impl LifecycleConf {
    pub fn restart_wait(&self) -> Duration {
        Duration::from_millis(self.restart_wait_ms)
    }

    pub fn settle_wait(&self) -> Duration {
        Duration::from_millis(self.settle_wait_ms)
    }

    pub fn delete_wait(&self) -> Duration {
        Duration::from_millis(self.delete_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> ConfResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(ConfError::validation(
                "lifecycle.poll_interval_ms must be > 0",
            ));
        }
        if self.restart_wait_ms < self.poll_interval_ms {
            return Err(ConfError::validation(
                "lifecycle.restart_wait_ms must not be shorter than lifecycle.poll_interval_ms",
            ));
        }
        Ok(())
    }
}
