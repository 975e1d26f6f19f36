//! Debezium capture connectors for relational sources.

use std::collections::BTreeMap;

use super::naming::{identifier, join_unique, schema_table_of};
use super::{ConfigRequest, ConfigWriter, ConnectorRole, GenerateError, GenerateResult};
use crate::connect::ConnectorConfig;
use crate::descriptor::{EngineType, extra};

const DEFAULT_SNAPSHOT_MODE: &str = "initial";

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaHistory {
    pub bootstrap_servers: String,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpecifics {
    Postgres { slot: String, publication: String },
    Mysql { server_id: u32, history: SchemaHistory },
    SqlServer { history: SchemaHistory },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebeziumSourceConfig {
    pub engine: EngineType,
    pub topic_prefix: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// `schema.table` entries in topic order.
    pub tables: Vec<String>,
    pub snapshot_mode: String,
    pub ssl: bool,
    pub trust_server_certificate: bool,
    pub specifics: SourceSpecifics,
}

impl DebeziumSourceConfig {
    pub fn from_request(request: &ConfigRequest) -> GenerateResult<Self> {
        let conn = &request.connection;
        let engine = conn.engine;
        if !engine.is_relational() {
            return Err(GenerateError::Unsupported {
                engine,
                role: ConnectorRole::Source,
            });
        }
        let field = |name: &str| format!("{}.{}", engine, name);
        let topics = request.clean_topics("topics")?;
        let topic_prefix = request.pipeline.trim().to_string();
        if topic_prefix.is_empty() {
            return Err(GenerateError::missing("pipeline"));
        }
        let host = conn.host.trim();
        if host.is_empty() {
            return Err(GenerateError::missing(field("host")));
        }
        let database = conn.database.trim();
        if database.is_empty() {
            return Err(GenerateError::missing(field("database")));
        }
        if conn.username.trim().is_empty() {
            return Err(GenerateError::missing(field("username")));
        }
        if conn.password.is_empty() {
            return Err(GenerateError::missing(field("password")));
        }
        let port = conn
            .effective_port()
            .ok_or_else(|| GenerateError::missing(field("port")))?;

        let default_schema = request.effective_schema().unwrap_or(match engine {
            EngineType::Postgres => "public",
            EngineType::SqlServer => "dbo",
            _ => database,
        });
        let tables = topics
            .iter()
            .map(|t| {
                let (schema, table) = schema_table_of(t, default_schema);
                format!("{schema}.{table}")
            })
            .collect();

        let history = || -> GenerateResult<SchemaHistory> {
            let servers = request
                .options
                .history_bootstrap_servers
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| GenerateError::missing("history_bootstrap_servers"))?;
            Ok(SchemaHistory {
                bootstrap_servers: servers.to_string(),
                topic: format!("{topic_prefix}.schema-history"),
            })
        };
        let specifics = match engine {
            EngineType::Postgres => SourceSpecifics::Postgres {
                slot: identifier(&format!("{topic_prefix}_slot"), 63),
                publication: identifier(&format!("{topic_prefix}_pub"), 63),
            },
            EngineType::Mysql => SourceSpecifics::Mysql {
                server_id: server_id(&topic_prefix),
                history: history()?,
            },
            _ => SourceSpecifics::SqlServer {
                history: history()?,
            },
        };

        Ok(Self {
            engine,
            host: host.to_string(),
            port,
            user: conn.username.trim().to_string(),
            password: conn.password.clone(),
            database: database.to_string(),
            tables,
            snapshot_mode: request
                .options
                .snapshot_mode
                .clone()
                .unwrap_or_else(|| DEFAULT_SNAPSHOT_MODE.to_string()),
            ssl: conn.extra_flag(extra::SSL),
            trust_server_certificate: conn.extra_flag(extra::TRUST_CERT),
            specifics,
            topic_prefix,
        })
    }

    pub fn class(&self) -> &'static str {
        match self.specifics {
            SourceSpecifics::Postgres { .. } => "io.debezium.connector.postgresql.PostgresConnector",
            SourceSpecifics::Mysql { .. } => "io.debezium.connector.mysql.MySqlConnector",
            SourceSpecifics::SqlServer { .. } => "io.debezium.connector.sqlserver.SqlServerConnector",
        }
    }

    pub fn into_config(self, overrides: &BTreeMap<String, String>) -> ConnectorConfig {
        // 捕获端只允许单任务
        let mut w = ConfigWriter::new(self.class(), 1);
        w.set("topic.prefix", &self.topic_prefix)
            .set("database.hostname", &self.host)
            .set("database.port", self.port)
            .set("database.user", &self.user)
            .set("database.password", &self.password)
            .set("table.include.list", join_unique(self.tables.iter().map(String::as_str)))
            .set("snapshot.mode", &self.snapshot_mode);

        match &self.specifics {
            SourceSpecifics::Postgres { slot, publication } => {
                w.set("database.dbname", &self.database)
                    .set("plugin.name", "pgoutput")
                    .set("slot.name", slot)
                    .set("publication.name", publication)
                    .set("publication.autocreate.mode", "filtered");
                if self.ssl {
                    w.set("database.sslmode", "require");
                }
            }
            SourceSpecifics::Mysql { server_id, history } => {
                let schemas = self.tables.iter().filter_map(|t| t.split('.').next());
                w.set("database.server.id", server_id)
                    .set("database.include.list", join_unique(schemas));
                if self.ssl {
                    w.set("database.ssl.mode", "required");
                }
                write_history(&mut w, history);
            }
            SourceSpecifics::SqlServer { history } => {
                w.set("database.names", &self.database)
                    .set("database.encrypt", self.ssl)
                    .set("database.trustServerCertificate", self.trust_server_certificate)
                    // <prefix>.<db>.<schema>.<table> -> <prefix>.<schema>.<table>
                    .set("transforms", "route")
                    .set(
                        "transforms.route.type",
                        "org.apache.kafka.connect.transforms.RegexRouter",
                    )
                    .set("transforms.route.regex", r"^([^.]+)\.[^.]+\.([^.]+)\.([^.]+)$")
                    .set("transforms.route.replacement", "$1.$2.$3");
                write_history(&mut w, history);
            }
        }
        w.finish(overrides)
    }
}

fn write_history(w: &mut ConfigWriter, history: &SchemaHistory) {
    w.set(
        "schema.history.internal.kafka.bootstrap.servers",
        &history.bootstrap_servers,
    )
    .set("schema.history.internal.kafka.topic", &history.topic);
}

/// Stable id in `[10000, 4_000_010_000)` derived from the pipeline name (FNV-1a).
fn server_id(pipeline: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in pipeline.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    10_000 + hash % 4_000_000_000
}
