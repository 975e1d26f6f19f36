//! TOML configuration for the whole coordinator.
//!
//! ```toml
//! [connect]
//! url = "http://connect:8083"
//!
//! [connect.retry]
//! max_attempts = 5
//!
//! [lifecycle]
//! restart_wait_ms = 30000
//!
//! [ingest]
//! brokers = "kafka:9092"
//! group_id = "cdc-ingest"
//! config = ["session.timeout.ms = 10000"]
//!
//! [offset]
//! lookup_timeout_ms = 5000
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connect::{ConnectConf, LifecycleConf};
use crate::ingest::IngestConf;
use crate::offset::OffsetConf;

pub type ConfResult<T> = Result<T, ConfError>;

#[derive(Error, Debug)]
pub enum ConfError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

impl ConfError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ConfError::Validation(msg.into())
    }
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct CoordinatorConf {
    pub connect: ConnectConf,
    pub lifecycle: LifecycleConf,
    pub ingest: IngestConf,
    pub offset: OffsetConf,
}

impl CoordinatorConf {
    pub fn from_toml_str(raw: &str) -> ConfResult<Self> {
        let conf: CoordinatorConf = toml::from_str(raw)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn load(path: impl AsRef<Path>) -> ConfResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> ConfResult<()> {
        self.connect.validate()?;
        self.lifecycle.validate()?;
        self.ingest.validate()?;
        self.offset.validate()?;
        Ok(())
    }
}
