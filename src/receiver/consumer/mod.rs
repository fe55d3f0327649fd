//! Per-topic consumer task.
//!
//! Each consumer owns one broker consumer bound to a single topic/partition.
//! On start it negotiates the read position once, then polls until its own
//! stop signal is raised. Records are handed to the topic's
//! [`MessageProcessor`] strictly in broker order.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::processor::MessageProcessor;
use crate::broker::{BrokerConsumer, BrokerError, ConsumerRecord, SeekPosition};
use crate::error::{panic_message, MessagingError};
use crate::key::{KeyPolicy, MessageKey};
use crate::listener::InitialOffset;

/// Lifecycle of a topic consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicConsumerState {
    Created,
    ConsumerAssigned,
    Polling,
    Stopping,
    Closed,
}

/// Read loop settings shared by every consumer of a receiver.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    pub poll_timeout: Duration,
    pub key_policy: KeyPolicy,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1000),
            key_policy: KeyPolicy::Lenient,
        }
    }
}

/// Handle to a running per-topic consumer task.
pub struct TopicConsumer {
    topic: String,
    partition: i32,
    state: Arc<watch::Sender<TopicConsumerState>>,
    negotiated: Arc<Mutex<Option<InitialOffset>>>,
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TopicConsumer {
    /// Spawn the consumer task for `processor`'s topic.
    pub(crate) fn spawn(
        consumer: Box<dyn BrokerConsumer>,
        processor: Arc<MessageProcessor>,
        settings: ConsumerSettings,
    ) -> Self {
        let state = Arc::new(watch::Sender::new(TopicConsumerState::Created));
        let (stop_tx, stop_rx) = watch::channel(false);
        let negotiated = Arc::new(Mutex::new(None));

        let task = ReadLoop {
            topic: processor.topic().to_string(),
            partition: processor.partition(),
            consumer,
            processor: Arc::clone(&processor),
            settings,
            state: Arc::clone(&state),
            negotiated: Arc::clone(&negotiated),
            stop_rx,
        };
        let handle = tokio::spawn(task.run());

        Self {
            topic: processor.topic().to_string(),
            partition: processor.partition(),
            state,
            negotiated,
            stop_tx,
            task: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn state(&self) -> TopicConsumerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<TopicConsumerState> {
        self.state.subscribe()
    }

    /// Read position chosen by negotiation, once it has run.
    pub fn negotiated_offset(&self) -> Option<InitialOffset> {
        *self
            .negotiated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Request the read loop to stop after the current batch.
    pub fn stop(&self) {
        self.state.send_if_modified(|state| {
            if *state == TopicConsumerState::Closed || *state == TopicConsumerState::Stopping {
                return false;
            }
            *state = TopicConsumerState::Stopping;
            true
        });
        self.stop_tx.send_replace(true);
    }

    /// Wait for the read loop to exit. Returns immediately if already joined.
    pub async fn join(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(topic = %self.topic, error = %e, "Consumer task failed");
            }
        }
    }
}

struct ReadLoop {
    topic: String,
    partition: i32,
    consumer: Box<dyn BrokerConsumer>,
    processor: Arc<MessageProcessor>,
    settings: ConsumerSettings,
    state: Arc<watch::Sender<TopicConsumerState>>,
    negotiated: Arc<Mutex<Option<InitialOffset>>>,
    stop_rx: watch::Receiver<bool>,
}

impl ReadLoop {
    async fn run(mut self) {
        let outcome = AssertUnwindSafe(self.consume()).catch_unwind().await;
        if let Err(panic) = outcome {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(topic = %self.topic, panic = %message, "Consumer loop panicked");
        }

        self.consumer.close().await;
        self.state.send_replace(TopicConsumerState::Closed);
        info!(topic = %self.topic, partition = self.partition, "Consumer closed");
    }

    fn set_state(&self, next: TopicConsumerState) {
        // Never step back from Stopping once stop was requested.
        self.state.send_if_modified(|state| {
            if *state == TopicConsumerState::Stopping || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn consume(&mut self) {
        if let Err(e) = self.consumer.assign(&self.topic, self.partition).await {
            self.processor
                .report(format!("Failed to assign {}", self.topic), e.into());
            return;
        }

        let requested = self.processor.initial_offset().await;
        let effective = match self.negotiate(requested).await {
            Ok(effective) => effective,
            Err(e) => {
                self.processor
                    .report(format!("Offset negotiation failed for {}", self.topic), e);
                return;
            }
        };
        *self
            .negotiated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(effective);
        self.set_state(TopicConsumerState::ConsumerAssigned);

        info!(
            topic = %self.topic,
            partition = self.partition,
            requested = %requested,
            effective = %effective,
            "Consumer started"
        );
        self.set_state(TopicConsumerState::Polling);

        while !self.stop_requested() {
            let polled = tokio::select! {
                polled = self.consumer.poll(self.settings.poll_timeout) => polled,
                _ = self.stop_rx.changed() => break,
            };

            match polled {
                Ok(records) => {
                    for record in records {
                        Self::handle(&self.processor, self.settings.key_policy, record).await;
                    }
                }
                Err(e) => {
                    self.processor
                        .report(format!("Poll failed for {}", self.topic), e.into());
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.poll_timeout) => {}
                        _ = self.stop_rx.changed() => break,
                    }
                }
            }
        }

        debug!(topic = %self.topic, "Consumer loop exited");
    }

    async fn handle(processor: &MessageProcessor, key_policy: KeyPolicy, record: ConsumerRecord) {
        let key = match MessageKey::from_bytes(record.key.as_deref(), key_policy) {
            Ok(key) => key,
            Err(e) => {
                processor.report(
                    format!("Skipping record at offset {}: bad key", record.offset),
                    e,
                );
                return;
            }
        };

        let Some(value) = record.value.as_deref() else {
            processor.report(
                format!("Skipping record at offset {}: no value", record.offset),
                MessagingError::CorruptEnvelope("record carries no value".to_string()),
            );
            return;
        };

        let processed =
            AssertUnwindSafe(processor.process(value, &record.topic, key, record.offset))
                .catch_unwind()
                .await;
        if let Err(panic) = processed {
            processor.report(
                format!("Skipping record at offset {}: processing panicked", record.offset),
                MessagingError::ProcessingFailed {
                    topic: record.topic.clone(),
                    offset: record.offset,
                    message: panic_message(panic.as_ref()),
                },
            );
        }
    }

    /// Choose and apply the read position, retrying once from the beginning
    /// if the broker rejects the offset.
    async fn negotiate(
        &mut self,
        requested: InitialOffset,
    ) -> Result<InitialOffset, MessagingError> {
        match self.position(requested).await {
            Ok(effective) => Ok(effective),
            Err(BrokerError::InvalidOffset(message)) => {
                self.processor.report(
                    "Invalid offset provided, retrying from EARLIEST",
                    self.negotiation_failed(message),
                );
                self.position(InitialOffset::Earliest)
                    .await
                    .map_err(|e| self.negotiation_failed(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn position(&mut self, requested: InitialOffset) -> Result<InitialOffset, BrokerError> {
        let committed = self.consumer.committed(&self.topic, self.partition).await?;

        let mut effective = requested;
        if let InitialOffset::At(offset) = requested {
            if committed.map_or(true, |committed| committed < offset) {
                self.processor.report(
                    "Invalid offset provided",
                    self.negotiation_failed(format!(
                        "requested offset {} is beyond committed offset {}, falling back to LATEST",
                        offset,
                        committed.map_or_else(|| "none".to_string(), |c| c.to_string())
                    )),
                );
                effective = InitialOffset::Latest;
            }
        }

        match effective {
            InitialOffset::Latest => {
                self.consumer
                    .seek(&self.topic, self.partition, SeekPosition::End)
                    .await?;
                // Forces the broker to resolve the end position before the loop starts.
                let discarded = self.consumer.poll(self.settings.poll_timeout).await?;
                if !discarded.is_empty() {
                    warn!(
                        topic = %self.topic,
                        discarded = discarded.len(),
                        "Records discarded while positioning at LATEST"
                    );
                }
            }
            InitialOffset::Earliest => {
                self.consumer
                    .seek(&self.topic, self.partition, SeekPosition::Beginning)
                    .await?;
            }
            InitialOffset::At(offset) => {
                self.consumer
                    .seek(&self.topic, self.partition, SeekPosition::Offset(offset + 1))
                    .await?;
            }
            InitialOffset::Stored => {}
        }

        debug!(
            topic = %self.topic,
            partition = self.partition,
            committed = ?committed,
            effective = %effective,
            "Offset negotiated"
        );
        Ok(effective)
    }

    fn negotiation_failed(&self, message: String) -> MessagingError {
        MessagingError::OffsetNegotiationFailed {
            topic: self.topic.clone(),
            partition: self.partition,
            message,
        }
    }
}
