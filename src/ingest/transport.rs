//! Seams between the ingest loop, the message transport and persistence.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::error::IngestResult;
use super::event::ChangeEvent;

/// A raw record as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for tombstones.
    pub payload: Option<Bytes>,
    pub timestamp_ms: Option<i64>,
}

impl TransportMessage {
    pub fn new(topic: &str, partition: i32, offset: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset,
            payload: Some(payload.into()),
            timestamp_ms: None,
        }
    }

    pub fn tombstone(topic: &str, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset,
            payload: None,
            timestamp_ms: None,
        }
    }
}

/// Last processed offset of a topic partition; the transport commits `offset + 1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommitPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A live, subscribed consumer.
#[async_trait]
pub trait ChangeStream: Send {
    /// Next message, or `None` when nothing arrived within `timeout`.
    async fn poll(&mut self, timeout: Duration) -> IngestResult<Option<TransportMessage>>;

    /// Replace the subscription; an empty list unsubscribes.
    fn subscribe(&mut self, topics: &[String]) -> IngestResult<()>;

    async fn commit(&mut self, positions: &[CommitPosition]) -> IngestResult<()>;
}

/// Opens streams; called again after every transport failure.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, topics: &[String]) -> IngestResult<Box<dyn ChangeStream>>;
}

/// Durable sink for decoded events. Must be idempotent enough to tolerate redelivery.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn persist(&self, events: &[ChangeEvent]) -> anyhow::Result<()>;
}
