use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of engines a pipeline can read from or write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Postgres,
    Mysql,
    SqlServer,
    S3,
    Snowflake,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Postgres => "postgres",
            EngineType::Mysql => "mysql",
            EngineType::SqlServer => "sqlserver",
            EngineType::S3 => "s3",
            EngineType::Snowflake => "snowflake",
        }
    }

    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            EngineType::Postgres | EngineType::Mysql | EngineType::SqlServer
        )
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            EngineType::Postgres => Some(5432),
            EngineType::Mysql => Some(3306),
            EngineType::SqlServer => Some(1433),
            EngineType::S3 | EngineType::Snowflake => None,
        }
    }
}

impl Display for EngineType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(EngineType::Postgres),
            "mysql" => Ok(EngineType::Mysql),
            "sqlserver" | "mssql" => Ok(EngineType::SqlServer),
            "s3" => Ok(EngineType::S3),
            "snowflake" => Ok(EngineType::Snowflake),
            other => Err(format!("unknown engine type '{other}'")),
        }
    }
}

/// Keys understood in [`ConnectionDescriptor::extra`].
pub mod extra {
    pub const ACCOUNT: &str = "account";
    pub const WAREHOUSE: &str = "warehouse";
    pub const ROLE: &str = "role";
    pub const PRIVATE_KEY: &str = "private_key";
    pub const PRIVATE_KEY_PASSPHRASE: &str = "private_key_passphrase";
    pub const REGION: &str = "region";
    pub const BUCKET: &str = "bucket";
    pub const ENDPOINT: &str = "endpoint";
    pub const SSL: &str = "ssl";
    pub const TRUST_CERT: &str = "trust_server_certificate";
}

/// Where and how to reach a database, bucket or warehouse.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub engine: EngineType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ConnectionDescriptor {
    pub fn new(engine: EngineType, host: impl Into<String>) -> Self {
        Self {
            engine,
            host: host.into(),
            port: None,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            schema: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = user.into();
        self.password = password.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Explicit port, or the engine's well-known one.
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.engine.default_port())
    }

    /// Trimmed, non-empty extra option.
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn extra_flag(&self, key: &str) -> bool {
        matches!(
            self.extra(key).map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("true" | "1" | "yes" | "on")
        )
    }
}

impl Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let extra: BTreeMap<&str, &str> = self
            .extra
            .iter()
            .map(|(k, v)| {
                if k.contains("key") || k.contains("secret") || k.contains("passphrase") {
                    (k.as_str(), "***")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("ConnectionDescriptor")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("extra", &extra)
            .finish()
    }
}
