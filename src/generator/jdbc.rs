//! Debezium JDBC sink for relational targets.

use std::collections::BTreeMap;

use super::naming::{regex_literal, resolve_table};
use super::{ConfigRequest, ConfigWriter, GenerateError, GenerateResult, PrimaryKeyStrategy};
use crate::connect::ConnectorConfig;
use crate::descriptor::{ConnectionDescriptor, EngineType, extra};

const REGEX_ROUTER: &str = "org.apache.kafka.connect.transforms.RegexRouter";

/// One `RegexRouter` step rewriting a topic into a table name.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicRoute {
    pub alias: String,
    pub regex: String,
    pub replacement: String,
}

impl TopicRoute {
    fn convention() -> Self {
        Self {
            alias: "route".into(),
            regex: r"^.*\.([^.]+)$".into(),
            replacement: "$1".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JdbcSinkConfig {
    pub topics: Vec<String>,
    pub tasks_max: u32,
    pub url: String,
    pub username: String,
    pub password: String,
    pub target_schema: Option<String>,
    pub primary_key: PrimaryKeyStrategy,
    pub batch_size: Option<u32>,
    pub routes: Vec<TopicRoute>,
}

impl JdbcSinkConfig {
    pub const CLASS: &'static str = "io.debezium.connector.jdbc.JdbcSinkConnector";

    pub fn from_request(request: &ConfigRequest) -> GenerateResult<Self> {
        let conn = &request.connection;
        let engine = conn.engine;
        let topics = request.clean_topics("topics")?;
        let field = |name: &str| format!("{}.{}", engine, name);
        if conn.host.trim().is_empty() {
            return Err(GenerateError::missing(field("host")));
        }
        if conn.database.trim().is_empty() {
            return Err(GenerateError::missing(field("database")));
        }
        if conn.username.trim().is_empty() {
            return Err(GenerateError::missing(field("username")));
        }
        if conn.password.is_empty() {
            return Err(GenerateError::missing(field("password")));
        }
        if let PrimaryKeyStrategy::Fields(fields) = &request.options.primary_key
            && fields.iter().all(|f| f.trim().is_empty())
        {
            return Err(GenerateError::invalid(
                "primary_key.fields",
                "record key strategy needs at least one field",
            ));
        }

        Ok(Self {
            routes: routes_for(&topics, &request.options.topic_table_map)?,
            topics,
            tasks_max: request.options.tasks_max,
            url: jdbc_url(conn),
            username: conn.username.trim().to_string(),
            password: conn.password.clone(),
            target_schema: request.effective_schema().map(str::to_string),
            primary_key: request.options.primary_key.clone(),
            batch_size: request.options.batch_size,
        })
    }

    pub fn into_config(self, overrides: &BTreeMap<String, String>) -> ConnectorConfig {
        let mut w = ConfigWriter::new(Self::CLASS, self.tasks_max);
        w.set("topics", self.topics.join(","))
            .set("connection.url", &self.url)
            .set("connection.username", &self.username)
            .set("connection.password", &self.password)
            .set("delete.enabled", "false")
            .set("schema.evolution", "basic")
            .set_opt("batch.size", self.batch_size)
            .tolerate_errors();

        match &self.primary_key {
            PrimaryKeyStrategy::TransportOffset => {
                w.set("primary.key.mode", "kafka").set("insert.mode", "insert");
            }
            PrimaryKeyStrategy::Fields(fields) => {
                let fields: Vec<&str> = fields
                    .iter()
                    .map(|f| f.trim())
                    .filter(|f| !f.is_empty())
                    .collect();
                w.set("primary.key.mode", "record_value")
                    .set("primary.key.fields", fields.join(","))
                    .set("insert.mode", "upsert");
            }
        }

        let table_format = match &self.target_schema {
            Some(schema) => format!("{schema}.${{topic}}"),
            None => "${topic}".to_string(),
        };
        w.set("table.name.format", table_format);

        let aliases: Vec<&str> = self.routes.iter().map(|r| r.alias.as_str()).collect();
        w.set("transforms", aliases.join(","));
        for route in &self.routes {
            let prefix = format!("transforms.{}", route.alias);
            w.set(&format!("{prefix}.type"), REGEX_ROUTER)
                .set(&format!("{prefix}.regex"), &route.regex)
                .set(&format!("{prefix}.replacement"), &route.replacement);
        }
        w.finish(overrides)
    }
}

/// One route per mapped topic, then the convention route if any topic is left unmapped.
fn routes_for(topics: &[String], map: &BTreeMap<String, String>) -> GenerateResult<Vec<TopicRoute>> {
    let mut routes = Vec::new();
    let mut unmapped = false;
    for topic in topics {
        let Some(table) = map.get(topic).map(|t| t.trim()).filter(|t| !t.is_empty()) else {
            unmapped = true;
            continue;
        };
        // 映射后的表名会再经过约定规则，不能含 '.'
        if table.contains(['.', '$']) {
            return Err(GenerateError::invalid(
                format!("topic_table_map.{topic}"),
                "table name must not contain '.' or '$'",
            ));
        }
        routes.push(TopicRoute {
            alias: format!("route{}", routes.len()),
            regex: format!("^{}$", regex_literal(topic)),
            replacement: resolve_table(topic, map).to_string(),
        });
    }
    if unmapped || routes.is_empty() {
        routes.push(TopicRoute::convention());
    }
    Ok(routes)
}

fn jdbc_url(conn: &ConnectionDescriptor) -> String {
    let host = conn.host.trim();
    let port = conn
        .effective_port()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    let db = conn.database.trim();
    let ssl = conn.extra_flag(extra::SSL);
    match conn.engine {
        EngineType::Postgres => {
            let mut url = format!("jdbc:postgresql://{host}{port}/{db}");
            if ssl {
                url.push_str("?sslmode=require");
            }
            url
        }
        EngineType::Mysql => {
            let mut url = format!("jdbc:mysql://{host}{port}/{db}");
            if ssl {
                url.push_str("?sslMode=REQUIRED");
            }
            url
        }
        EngineType::SqlServer => format!(
            "jdbc:sqlserver://{host}{port};databaseName={db};encrypt={};trustServerCertificate={}",
            ssl,
            conn.extra_flag(extra::TRUST_CERT)
        ),
        // 非关系型引擎不会走到这里
        EngineType::S3 | EngineType::Snowflake => format!("jdbc:{}://{host}{port}/{db}", conn.engine),
    }
}
