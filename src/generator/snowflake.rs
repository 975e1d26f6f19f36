//! Snowflake Kafka connector for the warehouse target.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use super::naming::resolve_table;
use super::{ConfigRequest, ConfigWriter, GenerateError, GenerateResult};
use crate::connect::ConnectorConfig;
use crate::descriptor::extra;

const DEFAULT_BUFFER_COUNT_RECORDS: u32 = 10_000;
const DEFAULT_BUFFER_FLUSH_TIME_SECS: u32 = 60;
const DOMAIN_SUFFIX: &str = ".snowflakecomputing.com";

#[derive(Clone, PartialEq)]
pub enum SnowflakeAuth {
    /// Base64 body of a PKCS#8 key, armour and whitespace removed.
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
    Password(String),
}

impl Debug for SnowflakeAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SnowflakeAuth::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("key", &"***")
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
            SnowflakeAuth::Password(_) => f.debug_tuple("Password").field(&"***").finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnowflakeSinkConfig {
    pub topics: Vec<String>,
    pub tasks_max: u32,
    /// Bare account identifier, e.g. `acme-prod`.
    pub account: String,
    pub user: String,
    pub database: String,
    pub schema: String,
    pub role: Option<String>,
    pub auth: SnowflakeAuth,
    /// `(topic, table)` pairs in topic order.
    pub topic_tables: Vec<(String, String)>,
    pub buffer_count_records: u32,
    pub buffer_flush_time_secs: u32,
}

impl SnowflakeSinkConfig {
    pub const CLASS: &'static str = "com.snowflake.kafka.connector.SnowflakeSinkConnector";

    pub fn from_request(request: &ConfigRequest) -> GenerateResult<Self> {
        let conn = &request.connection;
        let topics = request.clean_topics("topics")?;

        let account = conn
            .extra(extra::ACCOUNT)
            .or_else(|| Some(conn.host.trim()).filter(|h| !h.is_empty()))
            .map(normalize_account)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| GenerateError::missing("snowflake.account"))?;
        let user = conn.username.trim();
        if user.is_empty() {
            return Err(GenerateError::missing("snowflake.user"));
        }
        let database = conn.database.trim();
        if database.is_empty() {
            return Err(GenerateError::missing("snowflake.database"));
        }
        let schema = request
            .effective_schema()
            .ok_or_else(|| GenerateError::missing("snowflake.schema"))?;

        let topic_tables = topics
            .iter()
            .map(|t| {
                (
                    t.clone(),
                    resolve_table(t, &request.options.topic_table_map).to_string(),
                )
            })
            .collect();

        Ok(Self {
            tasks_max: request.options.tasks_max,
            account,
            user: user.to_string(),
            database: database.to_string(),
            schema: schema.to_string(),
            role: conn.extra(extra::ROLE).map(str::to_string),
            auth: resolve_auth(request)?,
            topic_tables,
            topics,
            buffer_count_records: request
                .options
                .buffer_count_records
                .unwrap_or(DEFAULT_BUFFER_COUNT_RECORDS),
            buffer_flush_time_secs: request
                .options
                .buffer_flush_time_secs
                .unwrap_or(DEFAULT_BUFFER_FLUSH_TIME_SECS),
        })
    }

    pub fn url(&self) -> String {
        format!("https://{}{}:443", self.account, DOMAIN_SUFFIX)
    }

    pub fn into_config(self, overrides: &BTreeMap<String, String>) -> ConnectorConfig {
        let mut w = ConfigWriter::new(Self::CLASS, self.tasks_max);
        let map: Vec<String> = self
            .topic_tables
            .iter()
            .map(|(topic, table)| format!("{topic}:{table}"))
            .collect();
        w.set("topics", self.topics.join(","))
            .set("snowflake.url.name", self.url())
            .set("snowflake.user.name", &self.user)
            .set("snowflake.database.name", &self.database)
            .set("snowflake.schema.name", &self.schema)
            .set("snowflake.topic2table.map", map.join(","))
            .set_opt("snowflake.role.name", self.role.as_deref())
            .set("buffer.count.records", self.buffer_count_records)
            .set("buffer.flush.time", self.buffer_flush_time_secs)
            .set("key.converter", "org.apache.kafka.connect.storage.StringConverter")
            .set(
                "value.converter",
                "com.snowflake.kafka.connector.records.SnowflakeJsonConverter",
            )
            .tolerate_errors();
        match &self.auth {
            SnowflakeAuth::PrivateKey { key, passphrase } => {
                w.set("snowflake.private.key", key)
                    .set_opt("snowflake.private.key.passphrase", passphrase.as_deref());
            }
            SnowflakeAuth::Password(password) => {
                w.set("snowflake.password", password);
            }
        }
        w.finish(overrides)
    }
}

/// Private key wins over password when both are configured.
fn resolve_auth(request: &ConfigRequest) -> GenerateResult<SnowflakeAuth> {
    let conn = &request.connection;
    if let Some(key) = conn.extra(extra::PRIVATE_KEY).map(strip_pem).filter(|k| !k.is_empty()) {
        return Ok(SnowflakeAuth::PrivateKey {
            key,
            passphrase: conn.extra(extra::PRIVATE_KEY_PASSPHRASE).map(str::to_string),
        });
    }
    if !conn.password.is_empty() {
        return Ok(SnowflakeAuth::Password(conn.password.clone()));
    }
    Err(GenerateError::invalid(
        "snowflake.auth",
        "either a private key or a password is required",
    ))
}

/// Accepts `acme`, `ACME.snowflakecomputing.com`, `https://acme.snowflakecomputing.com:443/console`…
pub fn normalize_account(raw: &str) -> String {
    let mut account = raw.trim().to_ascii_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = account.strip_prefix(scheme) {
            account = rest.to_string();
        }
    }
    if let Some(idx) = account.find('/') {
        account.truncate(idx);
    }
    if let Some(idx) = account.find(':') {
        account.truncate(idx);
    }
    if let Some(rest) = account.strip_suffix(DOMAIN_SUFFIX) {
        account = rest.to_string();
    }
    account
}

/// Drop `-----BEGIN/END ...-----` lines and every whitespace character.
fn strip_pem(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----"))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .collect()
}
