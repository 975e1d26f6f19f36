use std::collections::BTreeMap;
use std::time::Duration;

use educe::Educe;
use serde::{Deserialize, Serialize};

use crate::conf::{ConfError, ConfResult};
use crate::retry::RetryPolicy;

#[derive(Educe, Deserialize, Serialize, PartialEq, Clone)]
#[educe(Debug, Default)]
#[serde(default)]
pub struct IngestConf {
    #[educe(Default = "localhost:9092")]
    pub brokers: String,
    #[educe(Default = "cdc-ingest")]
    pub group_id: String,
    /// Flush once this many events are buffered.
    #[educe(Default = 500)]
    pub batch_size: usize,
    /// Flush once the oldest buffered message is this old.
    #[educe(Default = 1_000)]
    pub batch_max_age_ms: u64,
    #[educe(Default = 200)]
    pub poll_timeout_ms: u64,
    /// Pause between persistence retries.
    #[educe(Default = 2_000)]
    pub failure_pause_ms: u64,
    #[educe(Default = 5_000)]
    pub join_timeout_ms: u64,
    #[educe(Default(expression = RetryPolicy::new(8, Duration::from_millis(500))))]
    pub reconnect: RetryPolicy,
    /// Extra consumer settings, `"key = value"` per entry.
    #[educe(Default(expression = Some(vec![
        "enable.partition.eof = false".to_string(),
        "auto.offset.reset = earliest".to_string(),
    ])))]
    pub config: Option<Vec<String>>,
}

impl IngestConf {
    pub fn batch_max_age(&self) -> Duration {
        Duration::from_millis(self.batch_max_age_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn failure_pause(&self) -> Duration {
        Duration::from_millis(self.failure_pause_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Parsed `config` entries; malformed entries are skipped.
    pub fn client_overrides(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for entry in self.config.iter().flatten() {
            if let Some((k, v)) = entry.split_once('=') {
                let (k, v) = (k.trim(), v.trim());
                if !k.is_empty() {
                    map.insert(k.to_string(), v.to_string());
                }
            }
        }
        map
    }

    pub fn validate(&self) -> ConfResult<()> {
        if self.brokers.trim().is_empty() {
            return Err(ConfError::validation("ingest.brokers must not be empty"));
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfError::validation("ingest.group_id must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(ConfError::validation("ingest.batch_size must be > 0"));
        }
        if self.batch_max_age_ms == 0 {
            return Err(ConfError::validation("ingest.batch_max_age_ms must be > 0"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfError::validation("ingest.poll_timeout_ms must be > 0"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfError::validation("ingest.reconnect.max_attempts must be > 0"));
        }
        // 位点只能在落库之后提交
        if self
            .client_overrides()
            .get("enable.auto.commit")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            return Err(ConfError::validation(
                "ingest.config must not enable enable.auto.commit",
            ));
        }
        Ok(())
    }
}
