//! Send side: envelope wrapping, routing keys and the per-topic sender cache.
//!
//! `send` never blocks on I/O. Each destination gets its own
//! [`SendHandle`], a future resolving to the broker's delivery receipt. A
//! failure before the send is issued (no sender, no runtime) surfaces as a
//! failed handle rather than an error from `send` itself.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerError, BrokerSender, DeliveryReceipt};
use crate::codec::{encode_envelope, wrap, Payload};
use crate::config::MessagingConfig;
use crate::error::{MessagingError, Result};
use crate::filter::FilterChain;
use crate::key;

type SenderSlot = Arc<Mutex<Option<Arc<dyn BrokerSender>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-call send options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Routing key; generated as `<destination>|<type>` when absent.
    pub key: Option<String>,
    pub traceability_id: Option<String>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn traceability_id(mut self, id: impl Into<String>) -> Self {
        self.traceability_id = Some(id.into());
        self
    }
}

enum SendState {
    Pending(JoinHandle<Result<DeliveryReceipt>>),
    Failed(Option<MessagingError>),
}

/// Outcome of one send to one destination topic.
pub struct SendHandle {
    topic: String,
    state: SendState,
}

impl SendHandle {
    fn pending(topic: String, handle: JoinHandle<Result<DeliveryReceipt>>) -> Self {
        Self {
            topic,
            state: SendState::Pending(handle),
        }
    }

    fn failed(topic: String, error: MessagingError) -> Self {
        Self {
            topic,
            state: SendState::Failed(Some(error)),
        }
    }

    /// Destination topic of this send.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            SendState::Pending(_) => "pending",
            SendState::Failed(_) => "failed",
        };
        f.debug_struct("SendHandle")
            .field("topic", &self.topic)
            .field("state", &state)
            .finish()
    }
}

impl Future for SendHandle {
    type Output = Result<DeliveryReceipt>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            SendState::Pending(handle) => Pin::new(handle).poll(cx).map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(MessagingError::Broker(BrokerError::Send(format!(
                    "send task for '{}' did not complete: {}",
                    this.topic, e
                )))),
            }),
            SendState::Failed(error) => Poll::Ready(Err(error.take().unwrap_or_else(|| {
                MessagingError::SendConstructionFailed {
                    topic: this.topic.clone(),
                    message: "send handle polled after completion".to_string(),
                }
            }))),
        }
    }
}

/// Wraps payloads and sends them to one or more topics.
pub struct MessageProducer {
    key: String,
    source_topic: String,
    client: Arc<dyn BrokerClient>,
    config: Arc<MessagingConfig>,
    filters: FilterChain,
    senders: Mutex<HashMap<String, SenderSlot>>,
}

impl MessageProducer {
    pub(crate) fn new(
        key: impl Into<String>,
        source_topic: impl Into<String>,
        client: Arc<dyn BrokerClient>,
        config: Arc<MessagingConfig>,
        filters: FilterChain,
    ) -> Self {
        Self {
            key: key.into(),
            source_topic: source_topic.into(),
            client,
            config,
            filters,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Registry key this producer was created under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Topic stamped as `origin_topic` on every envelope.
    pub fn source_topic(&self) -> &str {
        &self.source_topic
    }

    /// Send `payload` to every destination not blocked by a filter.
    ///
    /// Returns one handle per destination actually addressed, in input order.
    pub fn send<M: Payload>(
        &self,
        payload: &M,
        options: SendOptions,
        topics: &[&str],
    ) -> Vec<SendHandle> {
        let type_name = M::full_name();
        let envelope = wrap(payload, &self.source_topic, options.traceability_id.as_deref());
        let value = encode_envelope(&envelope);

        let mut handles = Vec::with_capacity(topics.len());
        for &topic in topics {
            match self.filters.try_blocks(topic, &type_name) {
                Ok(false) => {}
                Ok(true) => {
                    debug!(topic = %topic, payload_type = %type_name, "Send filtered");
                    continue;
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Send filter failed");
                    handles.push(SendHandle::failed(topic.to_string(), e));
                    continue;
                }
            }

            let key = options
                .key
                .clone()
                .unwrap_or_else(|| key::encode(topic, &type_name));
            handles.push(self.dispatch(topic, key, value.clone()));
        }
        handles
    }

    fn dispatch(&self, topic: &str, key: String, value: Vec<u8>) -> SendHandle {
        let sender = match self.sender(topic) {
            Ok(sender) => sender,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to create sender");
                return SendHandle::failed(
                    topic.to_string(),
                    MessagingError::SendConstructionFailed {
                        topic: topic.to_string(),
                        message: e.to_string(),
                    },
                );
            }
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                return SendHandle::failed(
                    topic.to_string(),
                    MessagingError::SendConstructionFailed {
                        topic: topic.to_string(),
                        message: e.to_string(),
                    },
                );
            }
        };

        let handle = runtime.spawn(async move {
            sender
                .send(key, value)
                .await
                .map_err(MessagingError::from)
        });
        SendHandle::pending(topic.to_string(), handle)
    }

    /// Cached sender for `topic`, created on first use.
    ///
    /// The map lock only guards slot lookup; construction happens under the
    /// topic's own slot lock so first sends to different topics do not wait
    /// on each other.
    fn sender(&self, topic: &str) -> std::result::Result<Arc<dyn BrokerSender>, BrokerError> {
        let slot = Arc::clone(lock(&self.senders).entry(topic.to_string()).or_default());

        let mut slot = lock(&slot);
        if let Some(sender) = slot.as_ref() {
            return Ok(Arc::clone(sender));
        }

        let properties = self.config.sender_properties(topic);
        let sender = self.client.create_sender(topic, &properties)?;
        info!(producer = %self.key, topic = %topic, "Sender created");
        *slot = Some(Arc::clone(&sender));
        Ok(sender)
    }

    /// Number of destination topics with a live sender.
    pub fn sender_count(&self) -> usize {
        let slots: Vec<SenderSlot> = lock(&self.senders).values().cloned().collect();
        slots.iter().filter(|slot| lock(slot).is_some()).count()
    }

    /// Close and drop every cached sender.
    pub async fn close(&self) {
        let slots: Vec<SenderSlot> = lock(&self.senders).drain().map(|(_, slot)| slot).collect();
        let senders: Vec<Arc<dyn BrokerSender>> =
            slots.iter().filter_map(|slot| lock(slot).take()).collect();

        for sender in &senders {
            sender.close().await;
        }
        debug!(producer = %self.key, senders = senders.len(), "Producer closed");
    }
}
