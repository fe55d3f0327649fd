//! Process-wide messaging entry point.
//!
//! Owns the receiver (all topic consumers) and every producer created for
//! the process, and tears both down on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::broker::BrokerClient;
use crate::codec::TypeRegistry;
use crate::config::MessagingConfig;
use crate::configuration::{ListenerConfiguration, ReceiverConfiguration};
use crate::error::{MessagingError, Result};
use crate::filter::FilterChain;
use crate::listener::InitialOffset;
use crate::producer::MessageProducer;
use crate::receiver::{shutdown_consumers, MessageReceiver, TopicConsumerState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of the receiver and producers of one process.
pub struct MessagingContext {
    client: Arc<dyn BrokerClient>,
    config: Arc<MessagingConfig>,
    types: Arc<TypeRegistry>,
    receiver: AsyncMutex<Option<MessageReceiver>>,
    producers: Mutex<HashMap<String, Arc<MessageProducer>>>,
}

impl MessagingContext {
    pub fn new(client: Arc<dyn BrokerClient>, config: MessagingConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
            types: Arc::new(TypeRegistry::new()),
            receiver: AsyncMutex::new(None),
            producers: Mutex::new(HashMap::new()),
        }
    }

    /// Context backed by Kafka.
    #[cfg(feature = "kafka")]
    pub fn kafka(config: MessagingConfig) -> Self {
        let client = crate::broker::KafkaBrokerClient::new(config.send_timeout());
        Self::new(Arc::new(client), config)
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Register every listener and start one consumer per topic.
    ///
    /// Only one receiver may exist per context.
    pub async fn create_receiver(&self, configuration: ReceiverConfiguration) -> Result<()> {
        let mut receiver = self.receiver.lock().await;
        if receiver.is_some() {
            return Err(MessagingError::AlreadyInitialized("Receiver"));
        }

        let started = MessageReceiver::start(
            Arc::clone(&self.client),
            Arc::clone(&self.config),
            Arc::clone(&self.types),
            configuration,
        )
        .await?;
        *receiver = Some(started);
        Ok(())
    }

    /// Add a listener configuration to the running receiver.
    ///
    /// Topics that are already being consumed keep their negotiated position.
    pub async fn register(&self, configuration: ListenerConfiguration) -> Result<()> {
        let mut receiver = self.receiver.lock().await;
        let receiver = receiver.as_mut().ok_or_else(|| {
            MessagingError::InvalidConfiguration("Receiver has not been created".to_string())
        })?;
        receiver.register(&configuration).await
    }

    /// Producer registered under `key`, created on first request.
    ///
    /// Later calls with the same key return the existing producer; their
    /// `source_topic` and `filters` are ignored.
    pub fn create_producer(
        &self,
        key: &str,
        source_topic: &str,
        filters: FilterChain,
    ) -> Arc<MessageProducer> {
        let mut producers = lock(&self.producers);
        let producer = producers.entry(key.to_string()).or_insert_with(|| {
            info!(producer = %key, source_topic = %source_topic, "Producer created");
            Arc::new(MessageProducer::new(
                key,
                source_topic,
                Arc::clone(&self.client),
                Arc::clone(&self.config),
                filters,
            ))
        });
        Arc::clone(producer)
    }

    pub fn producer(&self, key: &str) -> Option<Arc<MessageProducer>> {
        lock(&self.producers).get(key).cloned()
    }

    /// Topics with a running or finished consumer.
    pub async fn topics(&self) -> Vec<String> {
        self.receiver
            .lock()
            .await
            .as_ref()
            .map(|receiver| receiver.topics().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub async fn consumer_state(&self, topic: &str) -> Option<TopicConsumerState> {
        self.receiver
            .lock()
            .await
            .as_ref()
            .and_then(|receiver| receiver.consumer(topic))
            .map(|consumer| consumer.state())
    }

    /// Read position chosen for `topic`, once negotiation has run.
    pub async fn negotiated_offset(&self, topic: &str) -> Option<InitialOffset> {
        self.receiver
            .lock()
            .await
            .as_ref()
            .and_then(|receiver| receiver.consumer(topic))
            .and_then(|consumer| consumer.negotiated_offset())
    }

    /// Stop every consumer, wait for them to exit, then close every sender.
    pub async fn shutdown(&self) {
        // Listeners may call back into the context while their consumer drains.
        let consumers = self
            .receiver
            .lock()
            .await
            .as_ref()
            .map(MessageReceiver::consumer_handles)
            .unwrap_or_default();
        shutdown_consumers(&consumers).await;

        let producers: Vec<Arc<MessageProducer>> =
            lock(&self.producers).values().cloned().collect();
        for producer in &producers {
            producer.close().await;
        }
        info!(producers = producers.len(), "Messaging context shut down");
    }
}
