//! Envelope codec and payload type registry.
//!
//! Outgoing payloads are packed into an [`Envelope`] carrying their
//! fully-qualified type name. On receipt the type name is resolved against a
//! [`TypeRegistry`] populated at registration time, and the matching
//! [`PayloadTemplate`] parses the packed bytes into the concrete type.
//! There is no runtime type lookup by name outside the registry.

mod extensions;

use std::any::Any as StdAny;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use prost::{Message, Name};
use prost_types::Any;

pub use extensions::{extract, ExtensionRegistry, ExtensionSet, ExtensionValue};

use crate::error::{MessagingError, Result};
use crate::proto::Envelope;

/// Prefix of the `type_url` of packed payloads.
const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// A protobuf message usable as a payload.
pub trait Payload: Message + Name + Default + Send + Sync + 'static {}

impl<T> Payload for T where T: Message + Name + Default + Send + Sync + 'static {}

/// A parsed payload, erased so listeners of different types share one table.
pub type DecodedPayload = Arc<dyn StdAny + Send + Sync>;

/// Parses packed payload bytes of one type.
pub trait PayloadTemplate: Send + Sync {
    /// Fully-qualified protobuf name handled by this template.
    fn type_name(&self) -> &str;

    fn parse(&self, bytes: &[u8]) -> Result<DecodedPayload>;
}

struct ProstTemplate<M> {
    type_name: String,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Payload> PayloadTemplate for ProstTemplate<M> {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn parse(&self, bytes: &[u8]) -> Result<DecodedPayload> {
        let message = M::decode(bytes).map_err(|e| {
            MessagingError::CorruptEnvelope(format!("{} for payload type: {}", e, self.type_name))
        })?;
        Ok(Arc::new(message))
    }
}

/// Template for a prost payload type.
pub fn template_for<M: Payload>() -> Arc<dyn PayloadTemplate> {
    Arc::new(ProstTemplate::<M> {
        type_name: M::full_name(),
        _marker: PhantomData,
    })
}

/// Type name → parse template, populated at registration time.
#[derive(Default)]
pub struct TypeRegistry {
    templates: RwLock<HashMap<String, Arc<dyn PayloadTemplate>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template, returning the canonical instance for its type name.
    ///
    /// A type registered for several topics ends up sharing one template.
    pub fn register(&self, template: Arc<dyn PayloadTemplate>) -> Arc<dyn PayloadTemplate> {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            templates
                .entry(template.type_name().to_string())
                .or_insert(template),
        )
    }

    pub fn register_type<M: Payload>(&self) -> Arc<dyn PayloadTemplate> {
        self.register(template_for::<M>())
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn PayloadTemplate>> {
        self.templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(type_name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wrap a payload in an envelope.
pub fn wrap<M: Payload>(
    payload: &M,
    origin_topic: &str,
    traceability_id: Option<&str>,
) -> Envelope {
    let type_name = M::full_name();
    Envelope {
        payload: Some(Any {
            type_url: format!("{}{}", TYPE_URL_PREFIX, type_name),
            value: payload.encode_to_vec(),
        }),
        payload_type_name: type_name,
        origin_topic: origin_topic.to_string(),
        traceability_id: traceability_id.unwrap_or_default().to_string(),
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    envelope.encode_to_vec()
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    Envelope::decode(bytes)
        .map_err(|e| MessagingError::CorruptEnvelope(format!("undecodable envelope: {}", e)))
}

/// Parse the packed payload with `template`, lifting registered extensions.
pub fn parse_payload(
    envelope: &Envelope,
    template: &dyn PayloadTemplate,
    registry: &ExtensionRegistry,
) -> Result<(DecodedPayload, ExtensionSet)> {
    let packed = envelope.payload.as_ref().ok_or_else(|| {
        MessagingError::CorruptEnvelope(format!(
            "envelope for {} carries no payload",
            envelope.payload_type_name
        ))
    })?;

    let payload = template.parse(&packed.value)?;
    let extensions = extract(&packed.value, registry)?;
    Ok((payload, extensions))
}
