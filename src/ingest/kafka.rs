//! Kafka transport for the ingestor (manual commits only).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use rdkafka_wrap::config::RDKafkaLogLevel;
use rdkafka_wrap::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka_wrap::error::KafkaError;
use rdkafka_wrap::{ClientConfig, Message, Offset, TopicPartitionList};

use super::config::IngestConf;
use super::error::{IngestError, IngestResult};
use super::transport::{ChangeStream, CommitPosition, TransportConnector, TransportMessage};

pub struct KafkaTransport {
    conf: IngestConf,
}

impl KafkaTransport {
    pub fn new(conf: IngestConf) -> Self {
        Self { conf }
    }

    fn client_config(&self) -> ClientConfig {
        let mut cc = ClientConfig::new();
        cc.set("bootstrap.servers", &self.conf.brokers)
            .set("group.id", &self.conf.group_id)
            .set_log_level(RDKafkaLogLevel::Info);
        for (k, v) in self.conf.client_overrides() {
            cc.set(k, v);
        }
        // 提交只在落库成功后手动进行
        cc.set("enable.auto.commit", "false");
        cc
    }
}

#[async_trait]
impl TransportConnector for KafkaTransport {
    async fn connect(&self, topics: &[String]) -> IngestResult<Box<dyn ChangeStream>> {
        let consumer: StreamConsumer = self
            .client_config()
            .create()
            .map_err(|e| IngestError::Transport(e.to_string()))?;
        let mut stream = KafkaStream { consumer };
        stream.subscribe(topics)?;
        info!(
            "[kafka] consumer ready, brokers: {}, group_id: {}, topics: {:?}",
            self.conf.brokers, self.conf.group_id, topics
        );
        Ok(Box::new(stream))
    }
}

struct KafkaStream {
    consumer: StreamConsumer,
}

#[async_trait]
impl ChangeStream for KafkaStream {
    async fn poll(&mut self, timeout: Duration) -> IngestResult<Option<TransportMessage>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(KafkaError::NoMessageReceived)) => Ok(None),
            Ok(Err(e)) => Err(IngestError::Transport(e.to_string())),
            Ok(Ok(msg)) => Ok(Some(TransportMessage {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                payload: msg.payload().map(Bytes::copy_from_slice),
                timestamp_ms: msg.timestamp().to_millis(),
            })),
        }
    }

    fn subscribe(&mut self, topics: &[String]) -> IngestResult<()> {
        if topics.is_empty() {
            debug!("[kafka] no topics, unsubscribing");
            self.consumer.unsubscribe();
            return Ok(());
        }
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&refs)
            .map_err(|e| IngestError::Transport(e.to_string()))?;
        debug!("[kafka] subscribed to {:?}", topics);
        Ok(())
    }

    async fn commit(&mut self, positions: &[CommitPosition]) -> IngestResult<()> {
        if positions.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for p in positions {
            tpl.add_partition_offset(&p.topic, p.partition, Offset::Offset(p.offset + 1))
                .map_err(|e| IngestError::Commit(e.to_string()))?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| IngestError::Commit(e.to_string()))
    }
}
