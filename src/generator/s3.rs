//! Confluent S3 sink for the object-store target.

use std::collections::BTreeMap;

use super::naming::identifier;
use super::{ConfigRequest, ConfigWriter, GenerateError, GenerateResult};
use crate::connect::ConnectorConfig;
use crate::descriptor::extra;

const DEFAULT_FLUSH_SIZE: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct S3SinkConfig {
    pub topics: Vec<String>,
    pub tasks_max: u32,
    pub bucket: String,
    pub region: String,
    /// Object key prefix, also used as `topics.dir`.
    pub prefix: String,
    pub flush_size: u32,
    pub rotate_interval_ms: Option<u64>,
    pub endpoint: Option<String>,
    pub credentials: Option<S3Credentials>,
}

impl S3SinkConfig {
    pub const CLASS: &'static str = "io.confluent.connect.s3.S3SinkConnector";

    pub fn from_request(request: &ConfigRequest) -> GenerateResult<Self> {
        let conn = &request.connection;
        let topics = request.clean_topics("topics")?;

        // bucket 可以放在 extra 里，也可以直接用 database 字段
        let bucket = conn
            .extra(extra::BUCKET)
            .or_else(|| Some(conn.database.trim()).filter(|d| !d.is_empty()))
            .ok_or_else(|| GenerateError::missing("s3.bucket"))?
            .to_string();
        let region = conn
            .extra(extra::REGION)
            .ok_or_else(|| GenerateError::missing("s3.region"))?
            .to_string();
        let prefix = request
            .effective_schema()
            .map(|s| identifier(s, 255))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GenerateError::missing("s3.prefix"))?;

        let flush_size = request.options.flush_size.unwrap_or(DEFAULT_FLUSH_SIZE);
        if flush_size == 0 {
            return Err(GenerateError::invalid("s3.flush_size", "must be > 0"));
        }

        let key_id = conn.username.trim();
        let secret = conn.password.trim();
        let credentials = match (key_id.is_empty(), secret.is_empty()) {
            (true, true) => None,
            (false, false) => Some(S3Credentials {
                access_key_id: key_id.to_string(),
                secret_access_key: secret.to_string(),
            }),
            _ => {
                return Err(GenerateError::invalid(
                    "s3.credentials",
                    "access key id and secret access key must be given together",
                ));
            }
        };

        Ok(Self {
            topics,
            tasks_max: request.options.tasks_max,
            bucket,
            region,
            prefix,
            flush_size,
            rotate_interval_ms: request.options.rotate_interval_ms,
            endpoint: conn.extra(extra::ENDPOINT).map(str::to_string),
            credentials,
        })
    }

    pub fn into_config(self, overrides: &BTreeMap<String, String>) -> ConnectorConfig {
        let mut w = ConfigWriter::new(Self::CLASS, self.tasks_max);
        w.set("topics", self.topics.join(","))
            .set("s3.bucket.name", &self.bucket)
            .set("s3.region", &self.region)
            .set("s3.prefix", &self.prefix)
            .set("topics.dir", &self.prefix)
            .set("flush.size", self.flush_size)
            .set("storage.class", "io.confluent.connect.s3.storage.S3Storage")
            .set("format.class", "io.confluent.connect.s3.format.json.JsonFormat")
            .set(
                "partitioner.class",
                "io.confluent.connect.storage.partitioner.DefaultPartitioner",
            )
            .set("schema.compatibility", "NONE")
            .set_opt("rotate.interval.ms", self.rotate_interval_ms)
            .set_opt("store.url", self.endpoint.as_deref())
            .tolerate_errors();
        if let Some(creds) = &self.credentials {
            w.set("aws.access.key.id", &creds.access_key_id)
                .set("aws.secret.access.key", &creds.secret_access_key);
        }
        w.finish(overrides)
    }
}
