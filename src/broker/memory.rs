//! In-memory broker for standalone mode and tests.
//!
//! Keeps one ordered log per topic/partition inside the process. Consumers
//! auto-commit their position after every poll, mirroring the
//! `enable.auto.commit=true` default of the generated consumer properties.
//! Fault injection hooks (seek rejection, send failure) let tests drive the
//! error paths of offset negotiation and sending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::{
    BrokerClient, BrokerConsumer, BrokerError, BrokerProperties, BrokerSender, ConsumerRecord,
    DeliveryReceipt, SeekPosition,
};

/// Upper bound of records returned by one poll.
const MAX_POLL_RECORDS: usize = 500;
/// Sleep between log checks while a poll waits for data.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

type PartitionId = (String, i32);

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct BrokerState {
    logs: Mutex<HashMap<PartitionId, Vec<StoredRecord>>>,
    committed: Mutex<HashMap<PartitionId, i64>>,
    seeks: Mutex<Vec<(String, i32, SeekPosition)>>,
    senders_created: Mutex<Vec<String>>,
    rejected_seeks: AtomicU32,
    fail_on_send: AtomicBool,
    consumers_created: AtomicUsize,
    consumers_closed: AtomicUsize,
    senders_closed: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BrokerState {
    fn log_end(&self, id: &PartitionId) -> i64 {
        lock(&self.logs).get(id).map_or(0, |log| log.len() as i64)
    }

    fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> i64 {
        let mut logs = lock(&self.logs);
        let log = logs.entry((topic.to_string(), partition)).or_default();
        log.push(StoredRecord { key, value });
        log.len() as i64 - 1
    }

    fn read_from(&self, id: &PartitionId, position: i64) -> Vec<ConsumerRecord> {
        let logs = lock(&self.logs);
        let Some(log) = logs.get(id) else {
            return Vec::new();
        };
        let start = position.max(0) as usize;
        log.iter()
            .enumerate()
            .skip(start)
            .take(MAX_POLL_RECORDS)
            .map(|(offset, record)| ConsumerRecord {
                topic: id.0.clone(),
                partition: id.1,
                offset: offset as i64,
                key: record.key.clone(),
                value: record.value.clone(),
            })
            .collect()
    }
}

/// Process-local broker. Cloning shares the same logs.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw record, returning its offset.
    pub fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> i64 {
        self.state.append(topic, partition, key, value)
    }

    /// All records currently stored for a topic/partition.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<ConsumerRecord> {
        lock(&self.state.logs)
            .get(&(topic.to_string(), partition))
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, record)| ConsumerRecord {
                        topic: topic.to_string(),
                        partition,
                        offset: offset as i64,
                        key: record.key.clone(),
                        value: record.value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record a committed offset for the (single) consumer group.
    pub fn set_committed(&self, topic: &str, partition: i32, offset: i64) {
        lock(&self.state.committed).insert((topic.to_string(), partition), offset);
    }

    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        lock(&self.state.committed)
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Reject the next `count` seeks with [`BrokerError::InvalidOffset`].
    pub fn reject_next_seeks(&self, count: u32) {
        self.state.rejected_seeks.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_on_send(&self, fail: bool) {
        self.state.fail_on_send.store(fail, Ordering::SeqCst);
    }

    /// Every seek issued so far, in order.
    pub fn seek_history(&self) -> Vec<(String, i32, SeekPosition)> {
        lock(&self.state.seeks).clone()
    }

    /// Number of senders created for `topic`.
    pub fn sender_count(&self, topic: &str) -> usize {
        lock(&self.state.senders_created)
            .iter()
            .filter(|t| t.as_str() == topic)
            .count()
    }

    pub fn consumers_created(&self) -> usize {
        self.state.consumers_created.load(Ordering::SeqCst)
    }

    pub fn consumers_closed(&self) -> usize {
        self.state.consumers_closed.load(Ordering::SeqCst)
    }

    pub fn senders_closed(&self) -> usize {
        self.state.senders_closed.load(Ordering::SeqCst)
    }
}

impl BrokerClient for InMemoryBroker {
    fn create_consumer(
        &self,
        topic: &str,
        _properties: &BrokerProperties,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        self.state.consumers_created.fetch_add(1, Ordering::SeqCst);
        debug!(topic = %topic, "In-memory consumer created");
        Ok(Box::new(InMemoryConsumer {
            state: Arc::clone(&self.state),
            assignment: None,
            position: 0,
            closed: false,
        }))
    }

    fn create_sender(
        &self,
        topic: &str,
        _properties: &BrokerProperties,
    ) -> Result<Arc<dyn BrokerSender>, BrokerError> {
        lock(&self.state.senders_created).push(topic.to_string());
        debug!(topic = %topic, "In-memory sender created");
        Ok(Arc::new(InMemorySender {
            topic: topic.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct InMemoryConsumer {
    state: Arc<BrokerState>,
    assignment: Option<PartitionId>,
    position: i64,
    closed: bool,
}

impl InMemoryConsumer {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn assign(&mut self, topic: &str, partition: i32) -> Result<(), BrokerError> {
        self.check_open()?;
        let id = (topic.to_string(), partition);
        // auto.offset.reset=latest when nothing was committed
        self.position = lock(&self.state.committed)
            .get(&id)
            .copied()
            .unwrap_or_else(|| self.state.log_end(&id));
        self.assignment = Some(id);
        Ok(())
    }

    async fn committed(&mut self, topic: &str, partition: i32) -> Result<Option<i64>, BrokerError> {
        self.check_open()?;
        Ok(lock(&self.state.committed)
            .get(&(topic.to_string(), partition))
            .copied())
    }

    async fn seek(
        &mut self,
        topic: &str,
        partition: i32,
        position: SeekPosition,
    ) -> Result<(), BrokerError> {
        self.check_open()?;
        lock(&self.state.seeks).push((topic.to_string(), partition, position));

        let rejected = self
            .state
            .rejected_seeks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if rejected.is_ok() {
            return Err(BrokerError::InvalidOffset(format!(
                "seek to {:?} rejected for {}/{}",
                position, topic, partition
            )));
        }

        let id = (topic.to_string(), partition);
        self.position = match position {
            SeekPosition::Beginning => 0,
            SeekPosition::End => self.state.log_end(&id),
            SeekPosition::Offset(offset) if offset < 0 => {
                return Err(BrokerError::InvalidOffset(format!(
                    "negative offset {} for {}/{}",
                    offset, topic, partition
                )));
            }
            SeekPosition::Offset(offset) => offset,
        };
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>, BrokerError> {
        self.check_open()?;
        let id = self
            .assignment
            .clone()
            .ok_or_else(|| BrokerError::Poll("consumer has no assigned partition".to_string()))?;

        let deadline = Instant::now() + timeout;
        loop {
            let records = self.state.read_from(&id, self.position);
            if let Some(last) = records.last() {
                self.position = last.offset + 1;
                lock(&self.state.committed).insert(id.clone(), self.position);
                return Ok(records);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.consumers_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct InMemorySender {
    topic: String,
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerSender for InMemorySender {
    async fn send(&self, key: String, value: Vec<u8>) -> Result<DeliveryReceipt, BrokerError> {
        if self.state.fail_on_send.load(Ordering::SeqCst) {
            return Err(BrokerError::Send("Mock send failure".to_string()));
        }
        let offset = self
            .state
            .append(&self.topic, 0, Some(key.into_bytes()), Some(value));
        Ok(DeliveryReceipt {
            topic: self.topic.clone(),
            partition: 0,
            offset,
        })
    }

    async fn close(&self) {
        self.state.senders_closed.fetch_add(1, Ordering::SeqCst);
    }
}
