//! Per-topic dispatcher.
//!
//! Decodes envelopes read from one topic, resolves the payload type against
//! the types registered for that topic, applies the type's filters and
//! delivers the parsed payload to every listener of that type. Failures are
//! isolated to the message and reported to the error listener.

use std::collections::HashMap;
use std::sync::Arc;

use prost::Name;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::codec::{
    decode_envelope, parse_payload, DecodedPayload, ExtensionRegistry, ExtensionSet,
    PayloadTemplate, TypeRegistry,
};
use crate::configuration::ListenerConfiguration;
use crate::error::{MessagingError, PlatformError, PlatformErrorListener};
use crate::filter::FilterChain;
use crate::key::MessageKey;
use crate::listener::{ErasedListener, InitialOffset, MessageMetadata};
use crate::proto::Envelope;

/// Parse template and extension registry of a supported type.
#[derive(Clone)]
struct SupportedType {
    template: Arc<dyn PayloadTemplate>,
    extensions: ExtensionRegistry,
}

/// Result of processing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to every listener; `failures` of them reported an error.
    Delivered { listeners: usize, failures: usize },
    /// Dropped by an enabled filter.
    Filtered,
    /// Not delivered; the reason was reported to the error listener.
    Rejected,
}

/// Dispatch tables for one topic.
pub struct MessageProcessor {
    topic: String,
    partition: i32,
    types: Arc<TypeRegistry>,
    supported_types: RwLock<HashMap<String, SupportedType>>,
    listeners: RwLock<HashMap<String, Vec<Arc<dyn ErasedListener>>>>,
    filters: RwLock<HashMap<String, FilterChain>>,
    initial_offset: RwLock<InitialOffset>,
    error_listener: Arc<dyn PlatformErrorListener>,
}

impl MessageProcessor {
    pub(crate) fn new(
        topic: impl Into<String>,
        partition: i32,
        types: Arc<TypeRegistry>,
        error_listener: Arc<dyn PlatformErrorListener>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            types,
            supported_types: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            filters: RwLock::new(HashMap::new()),
            initial_offset: RwLock::new(InitialOffset::Earliest),
            error_listener,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Effective start offset across all registrations (largest wins).
    pub async fn initial_offset(&self) -> InitialOffset {
        *self.initial_offset.read().await
    }

    /// Merge a payload type, its listeners and filters into this topic.
    ///
    /// Raising the offset only affects a consumer that has not negotiated yet;
    /// a running consumer is never re-sought.
    pub(crate) async fn register_additional(&self, configuration: &ListenerConfiguration) {
        let type_name = configuration.type_name().to_string();
        let template = self.types.register(Arc::clone(configuration.template()));

        self.supported_types
            .write()
            .await
            .entry(type_name.clone())
            .or_insert_with(|| SupportedType {
                template,
                extensions: configuration.extension_registry().clone(),
            });

        {
            let mut listeners = self.listeners.write().await;
            let registered = listeners.entry(type_name.clone()).or_default();
            for listener in configuration.listeners() {
                if !registered.iter().any(|l| l.id() == listener.id()) {
                    registered.push(Arc::clone(listener));
                }
            }
        }

        self.filters
            .write()
            .await
            .entry(type_name.clone())
            .or_default()
            .extend(configuration.filters());

        let requested = configuration.initial_offset(&self.topic);
        let mut offset = self.initial_offset.write().await;
        if requested > *offset {
            *offset = requested;
        }

        debug!(
            topic = %self.topic,
            payload_type = %type_name,
            initial_offset = %*offset,
            "Registered payload type"
        );
    }

    /// Number of payload types registered for this topic.
    pub async fn supported_type_count(&self) -> usize {
        self.supported_types.read().await.len()
    }

    pub(crate) fn report(&self, description: impl Into<String>, error: MessagingError) {
        let error = PlatformError::new(description, error);
        warn!(
            topic = %self.topic,
            kind = ?error.kind(),
            error = %error.cause(),
            "{}",
            error.description()
        );
        self.error_listener.on_error(error);
    }

    /// Decode, filter, parse and deliver one record.
    pub async fn process(
        &self,
        value: &[u8],
        src_topic: &str,
        key: MessageKey,
        offset: i64,
    ) -> Dispatch {
        let envelope = match decode_envelope(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report(format!("Failed to decode envelope at offset {}", offset), e);
                return Dispatch::Rejected;
            }
        };

        let payload_type = envelope.payload_type_name.clone();
        let lookup = {
            let supported_types = self.supported_types.read().await;
            match supported_types.get(&payload_type) {
                Some(supported) => Some((payload_type.clone(), Some(supported.clone()))),
                None => {
                    let fallback = Envelope::full_name();
                    supported_types
                        .contains_key(&fallback)
                        .then_some((fallback, None))
                }
            }
        };
        let Some((resolved, supported)) = lookup else {
            let error = MessagingError::UnsupportedPayload {
                topic: src_topic.to_string(),
                type_name: payload_type,
            };
            self.report(error.to_string(), error);
            return Dispatch::Rejected;
        };

        let filtered = match self.filters.read().await.get(&resolved) {
            Some(chain) => chain.try_blocks(src_topic, &payload_type),
            None => Ok(false),
        };
        let filtered = match filtered {
            Ok(filtered) => filtered,
            Err(e) => {
                self.report(
                    format!("Filter failed on {} at offset {}", payload_type, offset),
                    e,
                );
                return Dispatch::Rejected;
            }
        };
        if filtered {
            debug!(
                topic = %src_topic,
                payload_type = %payload_type,
                offset = offset,
                "Message filtered"
            );
            return Dispatch::Filtered;
        }

        let (payload, extensions): (DecodedPayload, ExtensionSet) = match supported {
            Some(supported) => match parse_payload(
                &envelope,
                supported.template.as_ref(),
                &supported.extensions,
            ) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.report(
                        format!("Failed to parse {} at offset {}", payload_type, offset),
                        e,
                    );
                    return Dispatch::Rejected;
                }
            },
            // Generic fallback receives the envelope itself.
            None => (
                Arc::new(envelope.clone()) as DecodedPayload,
                ExtensionSet::default(),
            ),
        };

        let listeners = self
            .listeners
            .read()
            .await
            .get(&resolved)
            .cloned()
            .unwrap_or_default();

        let metadata = MessageMetadata {
            src_topic: src_topic.to_string(),
            key,
            offset,
            traceability_id: envelope.traceability_id,
            origin_topic: envelope.origin_topic,
            extensions,
        };

        let mut failures = 0;
        for listener in &listeners {
            if let Err(e) = listener.deliver(&metadata, &payload).await {
                failures += 1;
                self.report(
                    format!(
                        "Listener {} failed on {} at offset {}",
                        listener.name(),
                        payload_type,
                        offset
                    ),
                    e,
                );
            }
        }

        debug!(
            topic = %src_topic,
            payload_type = %payload_type,
            offset = offset,
            listeners = listeners.len(),
            failures = failures,
            "Message dispatched"
        );
        Dispatch::Delivered {
            listeners: listeners.len(),
            failures,
        }
    }
}

#[cfg(test)]
mod tests;
