//! Broker protocol consumed by the messaging layer.
//!
//! This module contains:
//! - `BrokerClient` trait: factory for per-topic consumers and senders
//! - `BrokerConsumer` trait: assign/committed/seek/poll/close
//! - `BrokerSender` trait: keyed byte sends to one destination topic
//! - Implementations: in-memory, Kafka (rdkafka)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

// Implementation modules
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

// Re-exports
#[cfg(feature = "kafka")]
pub use kafka::KafkaBrokerClient;
pub use memory::InMemoryBroker;

/// Pass-through broker settings (bootstrap address, timeouts, batch sizes).
pub type BrokerProperties = HashMap<String, String>;

/// Errors reported by a broker implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid offset: {0}")]
    InvalidOffset(String),

    #[error("Poll failed: {0}")]
    Poll(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Broker client is closed")]
    Closed,
}

/// Read position requested from a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    /// First available record.
    Beginning,
    /// Position after the last record.
    End,
    /// Absolute offset of the next record to read.
    Offset(i64),
}

/// One record returned by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

/// Broker acknowledgement for a completed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A consumer bound to one topic/partition.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Manually assign the partition to this consumer.
    async fn assign(&mut self, topic: &str, partition: i32) -> Result<(), BrokerError>;

    /// Last committed offset for this consumer group, if any.
    async fn committed(&mut self, topic: &str, partition: i32) -> Result<Option<i64>, BrokerError>;

    /// Move the read position.
    async fn seek(
        &mut self,
        topic: &str,
        partition: i32,
        position: SeekPosition,
    ) -> Result<(), BrokerError>;

    /// Fetch the next batch of records, waiting at most `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>, BrokerError>;

    /// Release the underlying resources.
    async fn close(&mut self);
}

/// A sender bound to one destination topic.
#[async_trait]
pub trait BrokerSender: Send + Sync {
    async fn send(&self, key: String, value: Vec<u8>) -> Result<DeliveryReceipt, BrokerError>;

    async fn close(&self);
}

/// Factory for broker consumers and senders.
pub trait BrokerClient: Send + Sync {
    fn create_consumer(
        &self,
        topic: &str,
        properties: &BrokerProperties,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;

    fn create_sender(
        &self,
        topic: &str,
        properties: &BrokerProperties,
    ) -> Result<Arc<dyn BrokerSender>, BrokerError>;
}
