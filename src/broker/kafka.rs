//! Kafka broker implementation.
//!
//! Consumers are manually assigned to a single topic/partition (no group
//! rebalancing) and repositioned by re-assigning with an explicit offset.
//! Senders wrap a `FutureProducer` bound to one destination topic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{
    BrokerClient, BrokerConsumer, BrokerError, BrokerProperties, BrokerSender, ConsumerRecord,
    DeliveryReceipt, SeekPosition,
};

/// Records drained per poll once the first one has arrived.
const MAX_POLL_RECORDS: usize = 500;
/// Timeout for metadata calls (committed offsets, flush).
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates rdkafka consumers and producers from pass-through properties.
#[derive(Clone, Debug)]
pub struct KafkaBrokerClient {
    send_timeout: Duration,
}

impl KafkaBrokerClient {
    pub fn new(send_timeout: Duration) -> Self {
        Self { send_timeout }
    }

    fn client_config(properties: &BrokerProperties) -> ClientConfig {
        let mut config = ClientConfig::new();
        for (key, value) in properties {
            config.set(key, value);
        }
        config
    }
}

impl BrokerClient for KafkaBrokerClient {
    fn create_consumer(
        &self,
        topic: &str,
        properties: &BrokerProperties,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let consumer: StreamConsumer = Self::client_config(properties)
            .create()
            .map_err(|e| {
                BrokerError::Connection(format!("Failed to create Kafka consumer: {}", e))
            })?;

        info!(topic = %topic, "Kafka consumer created");
        Ok(Box::new(KafkaTopicConsumer { consumer }))
    }

    fn create_sender(
        &self,
        topic: &str,
        properties: &BrokerProperties,
    ) -> Result<Arc<dyn BrokerSender>, BrokerError> {
        let producer: FutureProducer = Self::client_config(properties)
            .create()
            .map_err(|e| {
                BrokerError::Connection(format!("Failed to create Kafka producer: {}", e))
            })?;

        info!(topic = %topic, "Kafka sender created");
        Ok(Arc::new(KafkaTopicSender {
            topic: topic.to_string(),
            producer,
            send_timeout: self.send_timeout,
        }))
    }
}

fn map_error(error: KafkaError) -> BrokerError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::OffsetOutOfRange) => BrokerError::InvalidOffset(error.to_string()),
        _ => match error {
            KafkaError::Seek(message) => BrokerError::InvalidOffset(message),
            other => BrokerError::Poll(other.to_string()),
        },
    }
}

fn to_record<M: KafkaMessage>(message: &M) -> ConsumerRecord {
    ConsumerRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec),
    }
}

struct KafkaTopicConsumer {
    consumer: StreamConsumer,
}

#[async_trait]
impl BrokerConsumer for KafkaTopicConsumer {
    async fn assign(&mut self, topic: &str, partition: i32) -> Result<(), BrokerError> {
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition(topic, partition);
        self.consumer.assign(&assignment).map_err(map_error)
    }

    async fn committed(&mut self, topic: &str, partition: i32) -> Result<Option<i64>, BrokerError> {
        let mut query = TopicPartitionList::new();
        query.add_partition(topic, partition);
        let committed = self
            .consumer
            .committed_offsets(query, Timeout::After(METADATA_TIMEOUT))
            .map_err(map_error)?;

        Ok(committed
            .find_partition(topic, partition)
            .and_then(|element| match element.offset() {
                Offset::Offset(offset) => Some(offset),
                _ => None,
            }))
    }

    async fn seek(
        &mut self,
        topic: &str,
        partition: i32,
        position: SeekPosition,
    ) -> Result<(), BrokerError> {
        let offset = match position {
            SeekPosition::Beginning => Offset::Beginning,
            SeekPosition::End => Offset::End,
            SeekPosition::Offset(offset) => Offset::Offset(offset),
        };

        // Re-assigning with an explicit start offset avoids librdkafka's
        // "erroneous state" on seeks issued before the first fetch.
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, offset)
            .map_err(map_error)?;
        self.consumer.assign(&assignment).map_err(map_error)?;

        debug!(
            topic = %topic,
            partition = partition,
            position = ?position,
            "Kafka consumer repositioned"
        );
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>, BrokerError> {
        let first = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(result) => result.map_err(map_error)?,
        };

        let mut records = vec![to_record(&first)];
        drop(first);

        // Drain whatever is already buffered without waiting again.
        while records.len() < MAX_POLL_RECORDS {
            match self.consumer.recv().now_or_never() {
                Some(Ok(message)) => records.push(to_record(&message)),
                Some(Err(e)) => {
                    warn!(error = %e, "Kafka consumer error while draining batch");
                    break;
                }
                None => break,
            }
        }

        Ok(records)
    }

    async fn close(&mut self) {
        self.consumer.unassign().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to unassign Kafka consumer");
        });
    }
}

struct KafkaTopicSender {
    topic: String,
    producer: FutureProducer,
    send_timeout: Duration,
}

#[async_trait]
impl BrokerSender for KafkaTopicSender {
    async fn send(&self, key: String, value: Vec<u8>) -> Result<DeliveryReceipt, BrokerError> {
        let record = FutureRecord::to(&self.topic).key(&key).payload(&value);

        let (partition, offset) = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| BrokerError::Send(format!("Failed to publish: {}", e)))?;

        Ok(DeliveryReceipt {
            topic: self.topic.clone(),
            partition,
            offset,
        })
    }

    async fn close(&self) {
        if let Err(e) = self.producer.flush(Timeout::After(METADATA_TIMEOUT)) {
            warn!(topic = %self.topic, error = %e, "Failed to flush Kafka sender");
        }
    }
}
