//! Debezium JSON envelope decoding.
//!
//! 支持两种形态：
//! - 带 schema 包装：`{"schema": {...}, "payload": {"op": ..., ...}}`
//! - 直接信封：`{"op": ..., "before": ..., "after": ..., "source": {...}}`

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::error::DecodeError;
use super::event::{ChangeEvent, ChangeKind};
use super::transport::TransportMessage;

/// `Ok(None)` for tombstones, which carry nothing to persist.
pub fn decode(msg: &TransportMessage, pipeline_id: &str) -> Result<Option<ChangeEvent>, DecodeError> {
    let Some(raw) = msg.payload.as_deref().filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    let root: Value = serde_json::from_slice(raw)?;
    let envelope = match &root {
        Value::Null => return Ok(None),
        Value::Object(obj) if obj.get("op").is_none() && obj.contains_key("payload") => {
            match &obj["payload"] {
                Value::Null => return Ok(None),
                Value::Object(inner) => inner,
                _ => return Err(DecodeError::NotObject),
            }
        }
        Value::Object(obj) => obj,
        _ => return Err(DecodeError::NotObject),
    };

    let op = envelope
        .get("op")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingOp)?;
    let kind = ChangeKind::from_op(op).ok_or_else(|| DecodeError::UnknownOp(op.to_string()))?;
    let image = |name: &'static str| match envelope.get(name) {
        Some(v) if !v.is_null() => Ok(v.clone()),
        _ => Err(DecodeError::MissingImage(name)),
    };
    let (payload, before) = match kind {
        ChangeKind::Insert => (image("after")?, None),
        ChangeKind::Update => (image("after")?, image("before").ok()),
        ChangeKind::Delete => (image("before")?, None),
        ChangeKind::Truncate => (Value::Null, None),
    };

    let empty = Map::new();
    let source = envelope
        .get("source")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let (topic_schema, topic_table) = topic_parts(&msg.topic);

    Ok(Some(ChangeEvent {
        pipeline_id: pipeline_id.to_string(),
        kind,
        schema: str_field(source, "schema")
            .or_else(|| str_field(source, "db"))
            .unwrap_or(topic_schema)
            .to_string(),
        table: str_field(source, "table").unwrap_or(topic_table).to_string(),
        timestamp: timestamp(source, envelope, msg.timestamp_ms),
        payload,
        before,
        position: position(source),
        topic: msg.topic.clone(),
        partition: msg.partition,
        offset: msg.offset,
    }))
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `<prefix>.<schema>.<table>` → `(schema, table)`.
fn topic_parts(topic: &str) -> (&str, &str) {
    let mut parts = topic.rsplit('.');
    let table = parts.next().unwrap_or(topic);
    let schema = parts.next().filter(|_| topic.matches('.').count() >= 2).unwrap_or("");
    (schema, table)
}

/// Source commit time, else envelope processing time, else the transport timestamp.
fn timestamp(
    source: &Map<String, Value>,
    envelope: &Map<String, Value>,
    transport_ms: Option<i64>,
) -> DateTime<Utc> {
    source
        .get("ts_ms")
        .and_then(Value::as_i64)
        .or_else(|| envelope.get("ts_ms").and_then(Value::as_i64))
        .or(transport_ms)
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

fn position(source: &Map<String, Value>) -> Option<String> {
    let scalar = |key: &str| match source.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    // postgres
    if let Some(lsn) = scalar("lsn") {
        return Some(lsn);
    }
    // mysql
    if let (Some(file), Some(pos)) = (scalar("file"), scalar("pos")) {
        return Some(format!("{file}:{pos}"));
    }
    // sqlserver
    scalar("change_lsn").or_else(|| scalar("commit_lsn"))
}
