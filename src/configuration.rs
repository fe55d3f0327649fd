//! Receiver configuration objects.
//!
//! A [`ListenerConfiguration`] binds one payload type to a set of topics,
//! listeners and filters. A [`ReceiverConfiguration`] groups them with the
//! error listener shared by every topic of the receiver.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::codec::{template_for, ExtensionRegistry, Payload, PayloadTemplate};
use crate::error::{LoggingErrorListener, MessagingError, PlatformErrorListener, Result};
use crate::filter::{FilterChain, MessageFilter};
use crate::listener::{ErasedListener, InitialOffset, MessageListener, TypedListener};

/// Validated registration of one payload type.
#[derive(Clone)]
pub struct ListenerConfiguration {
    topics: Vec<String>,
    template: Arc<dyn PayloadTemplate>,
    listeners: Vec<Arc<dyn ErasedListener>>,
    filters: FilterChain,
    offsets: HashMap<String, InitialOffset>,
    partition: i32,
    extensions: ExtensionRegistry,
}

impl ListenerConfiguration {
    pub fn builder<M: Payload>() -> ListenerConfigurationBuilder<M> {
        ListenerConfigurationBuilder::new()
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Fully-qualified payload type name.
    pub fn type_name(&self) -> &str {
        self.template.type_name()
    }

    /// Requested start position for `topic`.
    pub fn initial_offset(&self, topic: &str) -> InitialOffset {
        self.offsets.get(topic).copied().unwrap_or_default()
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn extension_registry(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn template(&self) -> &Arc<dyn PayloadTemplate> {
        &self.template
    }

    pub(crate) fn listeners(&self) -> &[Arc<dyn ErasedListener>] {
        &self.listeners
    }
}

impl fmt::Debug for ListenerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfiguration")
            .field("type_name", &self.type_name())
            .field("topics", &self.topics)
            .field("listeners", &self.listeners.len())
            .field("filters", &self.filters)
            .field("offsets", &self.offsets)
            .field("partition", &self.partition)
            .finish()
    }
}

/// Builder for [`ListenerConfiguration`].
pub struct ListenerConfigurationBuilder<M> {
    topics: Vec<String>,
    listeners: Vec<Arc<dyn ErasedListener>>,
    filters: FilterChain,
    initial_offset: Option<InitialOffset>,
    partition: i32,
    extensions: ExtensionRegistry,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Payload> ListenerConfigurationBuilder<M> {
    fn new() -> Self {
        Self {
            topics: Vec::new(),
            listeners: Vec::new(),
            filters: FilterChain::new(),
            initial_offset: None,
            partition: 0,
            extensions: ExtensionRegistry::empty(),
            _marker: PhantomData,
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn listener<L: MessageListener<M> + 'static>(mut self, listener: Arc<L>) -> Self {
        let listener = TypedListener::<M, L>::erase(listener);
        if !self.listeners.iter().any(|l| l.id() == listener.id()) {
            self.listeners.push(listener);
        }
        self
    }

    pub fn filter(mut self, filter: Arc<dyn MessageFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Explicit start position for every topic, overriding the listeners' requests.
    pub fn initial_offset(mut self, offset: InitialOffset) -> Self {
        self.initial_offset = Some(offset);
        self
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    pub fn extension_registry(mut self, registry: ExtensionRegistry) -> Self {
        self.extensions = registry;
        self
    }

    pub fn build(self) -> Result<ListenerConfiguration> {
        let type_name = M::full_name();
        let invalid = |reason: String| {
            Err(MessagingError::InvalidConfiguration(format!(
                "{} for {}",
                reason, type_name
            )))
        };

        if self.topics.is_empty() {
            return invalid("at least one topic is required".to_string());
        }
        let mut seen = HashSet::new();
        for topic in &self.topics {
            if topic.trim().is_empty() {
                return invalid("topic names must not be empty".to_string());
            }
            if !seen.insert(topic.clone()) {
                return invalid(format!("duplicate topic '{}'", topic));
            }
        }
        if self.listeners.is_empty() {
            return invalid("at least one listener is required".to_string());
        }
        if self.partition < 0 {
            return invalid(format!("invalid partition {}", self.partition));
        }

        let offsets = self
            .topics
            .iter()
            .map(|topic| {
                let offset = self.initial_offset.unwrap_or_else(|| {
                    self.listeners
                        .iter()
                        .map(|l| l.initial_offset(topic))
                        .max()
                        .unwrap_or_default()
                });
                (topic.clone(), offset)
            })
            .collect();

        Ok(ListenerConfiguration {
            template: template_for::<M>(),
            topics: self.topics,
            listeners: self.listeners,
            filters: self.filters,
            offsets,
            partition: self.partition,
            extensions: self.extensions,
        })
    }
}

/// Everything a receiver needs: listener registrations plus the error sink.
#[derive(Clone)]
pub struct ReceiverConfiguration {
    error_listener: Arc<dyn PlatformErrorListener>,
    listeners: Vec<ListenerConfiguration>,
}

impl ReceiverConfiguration {
    pub fn new(error_listener: Arc<dyn PlatformErrorListener>) -> Self {
        Self {
            error_listener,
            listeners: Vec::new(),
        }
    }

    pub fn listener(mut self, configuration: ListenerConfiguration) -> Self {
        self.listeners.push(configuration);
        self
    }

    pub fn error_listener(&self) -> &Arc<dyn PlatformErrorListener> {
        &self.error_listener
    }

    pub fn listener_configurations(&self) -> &[ListenerConfiguration] {
        &self.listeners
    }
}

impl Default for ReceiverConfiguration {
    fn default() -> Self {
        Self::new(Arc::new(LoggingErrorListener))
    }
}
