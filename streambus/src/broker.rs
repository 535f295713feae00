use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Headers;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tokio::time::timeout;
use tracing::debug;

use crate::config::StreamConfig;

/// One consumed record, detached from the broker client.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Fatal to the affected consumer instance: its poll loop exits instead
    /// of retry-storming a dead cluster.
    #[error("all brokers unreachable: {0}")]
    AllBrokersDown(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::AllBrokersDown(_))
    }
}

impl From<KafkaError> for BrokerError {
    fn from(err: KafkaError) -> Self {
        match err.rdkafka_error_code() {
            Some(RDKafkaErrorCode::AllBrokersDown) => BrokerError::AllBrokersDown(err.to_string()),
            _ => BrokerError::Other(err.to_string()),
        }
    }
}

/// The broker primitives a consumer instance runs on. Implemented by
/// [`KafkaClient`] in production and by scripted fakes in tests.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Bounded poll. `Ok(None)` is a timeout with no record, which is not an
    /// error.
    async fn poll(&self, timeout: Duration) -> Result<Option<Record>, BrokerError>;

    /// Commit the record at `offset` as processed.
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Creates one connected, subscribed broker client per consumer instance.
pub trait BrokerFactory: Send + Sync {
    fn connect(
        &self,
        config: &StreamConfig,
        instance_id: &str,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}

pub struct KafkaClient {
    consumer: StreamConsumer,
}

impl KafkaClient {
    /// Create a consumer and subscribe it to the stream's topics under its
    /// group id. Offsets are committed explicitly after dispatch, never
    /// automatically.
    pub fn connect(config: &StreamConfig) -> Result<Self, BrokerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");

        let consumer: StreamConsumer = client_config.create().map_err(BrokerError::from)?;
        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|err| BrokerError::Subscribe(err.to_string()))?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl BrokerClient for KafkaClient {
    async fn poll(&self, poll_timeout: Duration) -> Result<Option<Record>, BrokerError> {
        let message = match timeout(poll_timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(message)) => message,
        };

        let mut headers = HashMap::new();
        if let Some(borrowed) = message.headers() {
            for header in borrowed.iter() {
                if let Some(value) = header.value {
                    headers.insert(
                        header.key.to_string(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
            }
        }

        Ok(Some(Record {
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().map(<[u8]>::to_vec),
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp_ms: message.timestamp().to_millis(),
            headers,
        }))
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(BrokerError::from)?;
        self.consumer
            .commit(&assignment, CommitMode::Async)
            .map_err(BrokerError::from)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // The consumer leaves the group on drop; unsubscribing here lets the
        // group rebalance without waiting for the session timeout.
        self.consumer.unsubscribe();
        Ok(())
    }
}

pub struct KafkaFactory;

impl BrokerFactory for KafkaFactory {
    fn connect(
        &self,
        config: &StreamConfig,
        instance_id: &str,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        debug!(
            instance_id,
            brokers = %config.brokers,
            group_id = %config.group_id,
            "creating kafka consumer"
        );
        Ok(Arc::new(KafkaClient::connect(config)?))
    }
}
