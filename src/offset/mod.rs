//! Best-effort "where is the source right now" lookups.
//!
//! 每个引擎一个 `OffsetReader`，查询失败只记录日志并返回 `None`，
//! 不会影响调用方的主流程。

#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "sqlserver")]
mod sqlserver;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use educe::Educe;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::conf::{ConfError, ConfResult};
use crate::connect::ConnectorConfig;
use crate::descriptor::{ConnectionDescriptor, EngineType};

#[cfg(feature = "mysql")]
pub use mysql::MysqlOffsetReader;
#[cfg(feature = "postgres")]
pub use postgres::PostgresOffsetReader;
#[cfg(feature = "sqlserver")]
pub use sqlserver::SqlServerOffsetReader;

/// Opaque per-engine position; never compared across engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    pub engine: EngineType,
    pub position: String,
    pub captured_at: DateTime<Utc>,
}

/// Identifies which capture stream a position belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureCursor {
    /// Logical replication slot (Postgres).
    ReplicationSlot(String),
}

impl CaptureCursor {
    /// Cursor named by a generated capture connector config (`slot.name`).
    pub fn from_config(config: &ConnectorConfig) -> Option<Self> {
        config
            .get("slot.name")
            .map(|slot| slot.trim())
            .filter(|slot| !slot.is_empty())
            .map(|slot| CaptureCursor::ReplicationSlot(slot.to_string()))
    }
}

#[async_trait]
pub trait OffsetReader: Send + Sync {
    async fn read(
        &self,
        descriptor: &ConnectionDescriptor,
        cursor: Option<&CaptureCursor>,
    ) -> anyhow::Result<String>;
}

#[derive(Educe, Deserialize, Serialize, PartialEq, Clone)]
#[educe(Debug, Default)]
#[serde(default)]
pub struct OffsetConf {
    #[educe(Default = 5000)]
    pub lookup_timeout_ms: u64,
}

impl OffsetConf {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn validate(&self) -> ConfResult<()> {
        if self.lookup_timeout_ms == 0 {
            return Err(ConfError::validation("offset.lookup_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

pub struct OffsetTracker {
    readers: HashMap<EngineType, Arc<dyn OffsetReader>>,
    lookup_timeout: Duration,
}

impl OffsetTracker {
    /// Tracker without readers; every lookup yields `None` until one is registered.
    pub fn new(conf: &OffsetConf) -> Self {
        Self {
            readers: HashMap::new(),
            lookup_timeout: conf.lookup_timeout(),
        }
    }

    /// Readers for every relational engine compiled in.
    pub fn with_default_readers(conf: &OffsetConf) -> Self {
        #[allow(unused_mut)]
        let mut tracker = Self::new(conf);
        #[cfg(feature = "postgres")]
        tracker.register(EngineType::Postgres, Arc::new(PostgresOffsetReader));
        #[cfg(feature = "mysql")]
        tracker.register(EngineType::Mysql, Arc::new(MysqlOffsetReader));
        #[cfg(feature = "sqlserver")]
        tracker.register(EngineType::SqlServer, Arc::new(SqlServerOffsetReader));
        tracker
    }

    pub fn register(&mut self, engine: EngineType, reader: Arc<dyn OffsetReader>) {
        self.readers.insert(engine, reader);
    }

    pub fn supports(&self, engine: EngineType) -> bool {
        self.readers.contains_key(&engine)
    }

    pub async fn current_offset(
        &self,
        descriptor: &ConnectionDescriptor,
        cursor: Option<&CaptureCursor>,
    ) -> Option<Offset> {
        let engine = descriptor.engine;
        let Some(reader) = self.readers.get(&engine) else {
            debug!("[offset] no reader for {}", engine);
            return None;
        };
        match tokio::time::timeout(self.lookup_timeout, reader.read(descriptor, cursor)).await {
            Ok(Ok(position)) => Some(Offset {
                engine,
                position,
                captured_at: Utc::now(),
            }),
            Ok(Err(err)) => {
                warn!(
                    "[offset] {} lookup on {} failed: {:#}",
                    engine, descriptor.host, err
                );
                None
            }
            Err(_) => {
                warn!(
                    "[offset] {} lookup on {} timed out after {:?}",
                    engine, descriptor.host, self.lookup_timeout
                );
                None
            }
        }
    }
}
