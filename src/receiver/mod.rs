//! Receive side: one dispatcher and one consumer task per topic.
//!
//! This module contains:
//! - `MessageProcessor`: per-topic dispatch tables (types, listeners, filters)
//! - `TopicConsumer`: per-topic read loop with offset negotiation
//! - `MessageReceiver`: owner of both for every registered topic

mod consumer;
mod processor;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

pub use consumer::{ConsumerSettings, TopicConsumer, TopicConsumerState};
pub use processor::{Dispatch, MessageProcessor};

use crate::broker::{BrokerClient, BrokerConsumer};
use crate::codec::TypeRegistry;
use crate::config::MessagingConfig;
use crate::configuration::{ListenerConfiguration, ReceiverConfiguration};
use crate::error::{PlatformErrorListener, Result};

/// All topic consumers of a process.
pub struct MessageReceiver {
    client: Arc<dyn BrokerClient>,
    config: Arc<MessagingConfig>,
    types: Arc<TypeRegistry>,
    error_listener: Arc<dyn PlatformErrorListener>,
    processors: HashMap<String, Arc<MessageProcessor>>,
    consumers: HashMap<String, Arc<TopicConsumer>>,
}

impl MessageReceiver {
    /// Register every listener configuration, then start one consumer per topic.
    ///
    /// Broker consumers for all topics are created before any task starts, so
    /// a construction failure leaves nothing running.
    pub(crate) async fn start(
        client: Arc<dyn BrokerClient>,
        config: Arc<MessagingConfig>,
        types: Arc<TypeRegistry>,
        receiver: ReceiverConfiguration,
    ) -> Result<Self> {
        let mut this = Self {
            client,
            config,
            types,
            error_listener: Arc::clone(receiver.error_listener()),
            processors: HashMap::new(),
            consumers: HashMap::new(),
        };

        for listener in receiver.listener_configurations() {
            this.register_topics(listener).await;
        }

        let mut pending = Vec::with_capacity(this.processors.len());
        for (topic, processor) in &this.processors {
            pending.push((Arc::clone(processor), this.create_consumer(topic)?));
        }
        for (processor, consumer) in pending {
            this.spawn(processor, consumer);
        }

        info!(topics = this.consumers.len(), "Receiver started");
        Ok(this)
    }

    /// Merge a configuration into a running receiver.
    ///
    /// Topics already consumed only gain types, listeners and filters; their
    /// read position is not renegotiated. New topics get a fresh consumer.
    pub(crate) async fn register(&mut self, listener: &ListenerConfiguration) -> Result<()> {
        let added = self.register_topics(listener).await;

        let mut pending = Vec::with_capacity(added.len());
        for topic in &added {
            pending.push(self.create_consumer(topic)?);
        }
        for (topic, consumer) in added.into_iter().zip(pending) {
            if let Some(processor) = self.processors.get(&topic).cloned() {
                self.spawn(processor, consumer);
            }
        }
        Ok(())
    }

    /// Register `listener` on each of its topics, returning the topics without a consumer.
    async fn register_topics(&mut self, listener: &ListenerConfiguration) -> Vec<String> {
        let mut added = Vec::new();
        for topic in listener.topics() {
            let processor = match self.processors.get(topic) {
                Some(existing) => {
                    if existing.partition() != listener.partition() {
                        warn!(
                            topic = %topic,
                            partition = existing.partition(),
                            requested = listener.partition(),
                            "Topic already bound to another partition, keeping the first"
                        );
                    }
                    Arc::clone(existing)
                }
                None => {
                    let processor = Arc::new(MessageProcessor::new(
                        topic.clone(),
                        listener.partition(),
                        Arc::clone(&self.types),
                        Arc::clone(&self.error_listener),
                    ));
                    self.processors.insert(topic.clone(), Arc::clone(&processor));
                    processor
                }
            };

            processor.register_additional(listener).await;
            if !self.consumers.contains_key(topic) && !added.contains(topic) {
                added.push(topic.clone());
            }
        }
        added
    }

    fn create_consumer(&self, topic: &str) -> Result<Box<dyn BrokerConsumer>> {
        let properties = self.config.consumer_properties(topic);
        Ok(self.client.create_consumer(topic, &properties)?)
    }

    fn spawn(&mut self, processor: Arc<MessageProcessor>, consumer: Box<dyn BrokerConsumer>) {
        let topic = processor.topic().to_string();
        let consumer = TopicConsumer::spawn(consumer, processor, self.config.consumer_settings());
        self.consumers.insert(topic, Arc::new(consumer));
    }

    pub fn consumer(&self, topic: &str) -> Option<&TopicConsumer> {
        self.consumers.get(topic).map(Arc::as_ref)
    }

    /// Shared handles to every consumer, usable once the receiver is released.
    pub fn consumer_handles(&self) -> Vec<Arc<TopicConsumer>> {
        self.consumers.values().cloned().collect()
    }

    pub fn processor(&self, topic: &str) -> Option<&Arc<MessageProcessor>> {
        self.processors.get(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.consumers.keys().map(String::as_str)
    }
}

/// Signal every consumer, then wait for their tasks to finish.
pub async fn shutdown_consumers(consumers: &[Arc<TopicConsumer>]) {
    for consumer in consumers {
        consumer.stop();
    }
    futures::future::join_all(consumers.iter().map(|consumer| consumer.join())).await;
    info!(consumers = consumers.len(), "Receiver stopped");
}
