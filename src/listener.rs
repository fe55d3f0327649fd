//! Typed listener contract and delivery metadata.

use std::any::type_name;
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::codec::{DecodedPayload, ExtensionSet, Payload};
use crate::error::{panic_message, MessagingError, Result};
use crate::key::MessageKey;

/// Error a listener returns to reject a message.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Requested start position for a topic.
///
/// Ordered by raw value (`Earliest < Stored < Latest < At(0) < At(1) ...`),
/// so merging several requests for one topic keeps the largest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum InitialOffset {
    /// Next record written after negotiation.
    #[default]
    Latest,
    /// Replay from the start of the partition.
    Earliest,
    /// Resume from the consumer group's committed offset, no explicit seek.
    Stored,
    /// Resume strictly after the given offset.
    At(i64),
}

impl InitialOffset {
    pub const LATEST_RAW: i64 = -1;
    pub const STORED_RAW: i64 = -2;
    pub const EARLIEST_RAW: i64 = -3;

    pub fn raw(self) -> i64 {
        match self {
            Self::Latest => Self::LATEST_RAW,
            Self::Stored => Self::STORED_RAW,
            Self::Earliest => Self::EARLIEST_RAW,
            Self::At(offset) => offset,
        }
    }

    /// Decode a raw value; unknown negative values are rejected.
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            Self::LATEST_RAW => Some(Self::Latest),
            Self::STORED_RAW => Some(Self::Stored),
            Self::EARLIEST_RAW => Some(Self::Earliest),
            n if n >= 0 => Some(Self::At(n)),
            _ => None,
        }
    }
}

impl Ord for InitialOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw().cmp(&other.raw())
    }
}

impl PartialOrd for InitialOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for InitialOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("LATEST"),
            Self::Earliest => f.write_str("EARLIEST"),
            Self::Stored => f.write_str("STORED"),
            Self::At(offset) => write!(f, "{}", offset),
        }
    }
}

/// Per-message context handed to listeners.
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the record was read from.
    pub src_topic: String,
    pub key: MessageKey,
    pub offset: i64,
    /// Trace id set by the sender; empty if none.
    pub traceability_id: String,
    /// Source topic declared by the sending producer; empty if none.
    pub origin_topic: String,
    /// Registered extension fields found in the payload.
    pub extensions: ExtensionSet,
}

/// Receives payloads of one type.
#[async_trait]
pub trait MessageListener<M: Payload>: Send + Sync {
    async fn on_message(&self, metadata: &MessageMetadata, payload: &M)
        -> std::result::Result<(), ListenerError>;

    /// Start position this listener wants for `topic`.
    fn initial_offset(&self, _topic: &str) -> InitialOffset {
        InitialOffset::Latest
    }
}

/// Type-erased listener stored in the dispatch tables.
#[async_trait]
pub(crate) trait ErasedListener: Send + Sync {
    /// Type name of the concrete listener, used in delivery errors.
    fn name(&self) -> &'static str;

    /// Identity of the underlying listener instance.
    fn id(&self) -> usize;

    fn initial_offset(&self, topic: &str) -> InitialOffset;

    async fn deliver(&self, metadata: &MessageMetadata, payload: &DecodedPayload) -> Result<()>;
}

pub(crate) struct TypedListener<M, L> {
    listener: Arc<L>,
    _marker: PhantomData<fn(M)>,
}

impl<M, L> TypedListener<M, L>
where
    M: Payload,
    L: MessageListener<M> + 'static,
{
    pub(crate) fn erase(listener: Arc<L>) -> Arc<dyn ErasedListener> {
        Arc::new(Self {
            listener,
            _marker: PhantomData,
        })
    }
}

#[async_trait]
impl<M, L> ErasedListener for TypedListener<M, L>
where
    M: Payload,
    L: MessageListener<M> + 'static,
{
    fn name(&self) -> &'static str {
        type_name::<L>()
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.listener) as *const () as usize
    }

    fn initial_offset(&self, topic: &str) -> InitialOffset {
        self.listener.initial_offset(topic)
    }

    async fn deliver(&self, metadata: &MessageMetadata, payload: &DecodedPayload) -> Result<()> {
        let payload = payload
            .downcast_ref::<M>()
            .ok_or_else(|| MessagingError::DeliveryFailed {
                listener: self.name().to_string(),
                message: format!("payload is not a {}", M::full_name()),
            })?;

        match AssertUnwindSafe(self.listener.on_message(metadata, payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MessagingError::DeliveryFailed {
                listener: self.name().to_string(),
                message: e.to_string(),
            }),
            Err(panic) => Err(MessagingError::DeliveryFailed {
                listener: self.name().to_string(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}
