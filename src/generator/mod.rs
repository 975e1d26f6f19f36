//! Connector configuration generation.
//!
//! Pure translation from a [`ConfigRequest`] to a flat connector config: no network,
//! no state. Each target has a typed builder whose required fields are plain
//! (non-optional) values, so a builder that exists is a builder that validated;
//! it is flattened into strings only by [`ConfigWriter`].

mod debezium;
mod jdbc;
mod naming;
mod s3;
mod snowflake;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use educe::Educe;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connect::ConnectorConfig;
use crate::descriptor::{ConnectionDescriptor, EngineType};

pub use debezium::{DebeziumSourceConfig, SchemaHistory, SourceSpecifics};
pub use jdbc::{JdbcSinkConfig, TopicRoute};
pub use naming::{connector_name, table_of};
pub use s3::{S3Credentials, S3SinkConfig};
pub use snowflake::{SnowflakeAuth, SnowflakeSinkConfig, normalize_account};

pub type GenerateResult<T> = Result<T, GenerateError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerateError {
    #[error("{0} must not be empty")]
    Missing(String),
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("{engine} cannot be used as a {role} connector")]
    Unsupported {
        engine: EngineType,
        role: ConnectorRole,
    },
}

impl GenerateError {
    pub(crate) fn missing(field: impl Into<String>) -> Self {
        GenerateError::Missing(field.into())
    }

    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        GenerateError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorRole {
    /// Capture connector reading the source database.
    Source,
    /// Writer connector consuming topics into the target.
    Sink,
}

impl ConnectorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorRole::Source => "source",
            ConnectorRole::Sink => "sink",
        }
    }
}

impl Display for ConnectorRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How relational sinks derive the row key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", content = "fields", rename_all = "snake_case")]
pub enum PrimaryKeyStrategy {
    /// Topic/partition/offset coordinates; rows are appended.
    #[default]
    TransportOffset,
    /// Business key carried in the row image; rows are upserted.
    Fields(Vec<String>),
}

#[derive(Educe, Deserialize, Serialize, PartialEq, Clone)]
#[educe(Debug, Default)]
#[serde(default)]
pub struct TuningOptions {
    #[educe(Default = 1)]
    pub tasks_max: u32,
    /// JDBC batch size.
    pub batch_size: Option<u32>,
    /// Records per S3 object; small by default to keep latency low.
    pub flush_size: Option<u32>,
    pub rotate_interval_ms: Option<u64>,
    pub primary_key: PrimaryKeyStrategy,
    /// Explicit topic → target table names, overriding the naming convention.
    pub topic_table_map: BTreeMap<String, String>,
    pub snapshot_mode: Option<String>,
    pub buffer_count_records: Option<u32>,
    pub buffer_flush_time_secs: Option<u32>,
    /// Brokers for the capture engine's schema history topic (MySQL, SQL Server).
    pub history_bootstrap_servers: Option<String>,
    /// Raw keys applied last; `connector.class` cannot be overridden.
    pub overrides: BTreeMap<String, String>,
}

/// Everything the generator needs for one connector.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigRequest {
    pub role: ConnectorRole,
    pub pipeline: String,
    pub connection: ConnectionDescriptor,
    pub topics: Vec<String>,
    /// Target schema for sinks, captured schema for sources.
    pub schema: String,
    pub options: TuningOptions,
}

impl ConfigRequest {
    pub fn new(role: ConnectorRole, pipeline: &str, connection: ConnectionDescriptor) -> Self {
        Self {
            role,
            pipeline: pipeline.to_string(),
            connection,
            topics: Vec::new(),
            schema: String::new(),
            options: TuningOptions::default(),
        }
    }

    pub fn sink(pipeline: &str, connection: ConnectionDescriptor) -> Self {
        Self::new(ConnectorRole::Sink, pipeline, connection)
    }

    pub fn source(pipeline: &str, connection: ConnectionDescriptor) -> Self {
        Self::new(ConnectorRole::Source, pipeline, connection)
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    pub fn with_options(mut self, options: TuningOptions) -> Self {
        self.options = options;
        self
    }

    /// Request schema, else the descriptor's schema.
    pub(crate) fn effective_schema(&self) -> Option<&str> {
        let own = self.schema.trim();
        if !own.is_empty() {
            return Some(own);
        }
        self.connection
            .schema
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Trimmed topics, empty entries dropped, order kept.
    pub(crate) fn clean_topics(&self, field: &str) -> GenerateResult<Vec<String>> {
        let topics: Vec<String> = self
            .topics
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if topics.is_empty() {
            return Err(GenerateError::missing(field));
        }
        Ok(topics)
    }
}

/// Output of the generator, ready for `ConnectorLifecycleManager::ensure_created`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorDescriptor {
    pub name: String,
    pub class: String,
    pub config: ConnectorConfig,
}

/// Flattening boundary: typed values in, sorted string map out.
pub(crate) struct ConfigWriter {
    entries: ConnectorConfig,
}

impl ConfigWriter {
    pub(crate) fn new(class: &str, tasks_max: u32) -> Self {
        let mut entries = ConnectorConfig::new();
        entries.insert("connector.class".into(), class.to_string());
        entries.insert("tasks.max".into(), tasks_max.max(1).to_string());
        Self { entries }
    }

    pub(crate) fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.entries.insert(key.to_string(), value.to_string());
        self
    }

    pub(crate) fn set_opt<V: ToString>(&mut self, key: &str, value: Option<V>) -> &mut Self {
        if let Some(value) = value {
            self.set(key, value);
        }
        self
    }

    /// Dead-letter friendly error handling shared by every sink.
    pub(crate) fn tolerate_errors(&mut self) -> &mut Self {
        self.set("errors.tolerance", "all")
            .set("errors.log.enable", "true")
            .set("errors.log.include.messages", "true")
    }

    pub(crate) fn finish(mut self, overrides: &BTreeMap<String, String>) -> ConnectorConfig {
        for (key, value) in overrides {
            if key == "connector.class" {
                debug!("[generator] ignoring override of connector.class");
                continue;
            }
            self.entries.insert(key.clone(), value.clone());
        }
        self.entries
    }
}

/// Build the connector for `request`, dispatching on engine and role.
pub fn generate(request: &ConfigRequest) -> GenerateResult<ConnectorDescriptor> {
    let engine = request.connection.engine;
    let (class, config) = match (request.role, engine) {
        (ConnectorRole::Sink, EngineType::Postgres | EngineType::Mysql | EngineType::SqlServer) => {
            let built = JdbcSinkConfig::from_request(request)?;
            (JdbcSinkConfig::CLASS, built.into_config(&request.options.overrides))
        }
        (ConnectorRole::Sink, EngineType::S3) => {
            let built = S3SinkConfig::from_request(request)?;
            (S3SinkConfig::CLASS, built.into_config(&request.options.overrides))
        }
        (ConnectorRole::Sink, EngineType::Snowflake) => {
            let built = SnowflakeSinkConfig::from_request(request)?;
            (SnowflakeSinkConfig::CLASS, built.into_config(&request.options.overrides))
        }
        (ConnectorRole::Source, engine) if engine.is_relational() => {
            let built = DebeziumSourceConfig::from_request(request)?;
            (built.class(), built.into_config(&request.options.overrides))
        }
        (role, engine) => return Err(GenerateError::Unsupported { engine, role }),
    };
    let name = connector_name(&request.pipeline, request.role, request.effective_schema().unwrap_or(""));
    if name.is_empty() {
        return Err(GenerateError::missing("pipeline"));
    }
    Ok(ConnectorDescriptor {
        name,
        class: class.to_string(),
        config,
    })
}
