//! Error taxonomy and the platform error collaborator.
//!
//! Message-processing failures never escape the read loop. They are wrapped
//! in a [`PlatformError`] and handed to the registered
//! [`PlatformErrorListener`]. Configuration-time failures (`AlreadyInitialized`,
//! `InvalidConfiguration`) are returned directly to the caller.

use std::fmt;

use crate::broker::BrokerError;

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by the messaging layer.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("Malformed message key: {0}")]
    MalformedKey(String),

    #[error("Received unsupported payload. Source: {topic}, Type: {type_name}")]
    UnsupportedPayload { topic: String, type_name: String },

    #[error("Corrupt envelope: {0}")]
    CorruptEnvelope(String),

    #[error("Offset negotiation failed for {topic}/{partition}: {message}")]
    OffsetNegotiationFailed {
        topic: String,
        partition: i32,
        message: String,
    },

    #[error("Listener '{listener}' failed: {message}")]
    DeliveryFailed { listener: String, message: String },

    #[error("Processing {topic} at offset {offset} failed: {message}")]
    ProcessingFailed {
        topic: String,
        offset: i64,
        message: String,
    },

    #[error("Filter failed on {topic}/{type_name}: {message}")]
    FilterFailed {
        topic: String,
        type_name: String,
        message: String,
    },

    #[error("{0} has been created already")]
    AlreadyInitialized(&'static str),

    #[error("Failed to construct send to '{topic}': {message}")]
    SendConstructionFailed { topic: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl MessagingError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedKey(_) => ErrorKind::MalformedKey,
            Self::UnsupportedPayload { .. } => ErrorKind::UnsupportedPayload,
            Self::CorruptEnvelope(_) => ErrorKind::CorruptEnvelope,
            Self::OffsetNegotiationFailed { .. } => ErrorKind::OffsetNegotiationFailed,
            Self::DeliveryFailed { .. } => ErrorKind::DeliveryFailed,
            Self::FilterFailed { .. } => ErrorKind::FilterFailed,
            Self::ProcessingFailed { .. } => ErrorKind::ProcessingFailed,
            Self::AlreadyInitialized(_) => ErrorKind::AlreadyInitialized,
            Self::SendConstructionFailed { .. } => ErrorKind::SendConstructionFailed,
            Self::InvalidConfiguration(_) | Self::Config(_) => ErrorKind::Configuration,
            Self::Broker(_) => ErrorKind::Broker,
        }
    }
}

/// Discriminant of [`MessagingError`], convenient for assertions and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedKey,
    UnsupportedPayload,
    CorruptEnvelope,
    OffsetNegotiationFailed,
    DeliveryFailed,
    FilterFailed,
    ProcessingFailed,
    AlreadyInitialized,
    SendConstructionFailed,
    Configuration,
    Broker,
}

/// Render a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

/// A recovered, reported-not-thrown failure.
#[derive(Debug)]
pub struct PlatformError {
    description: String,
    source: MessagingError,
}

impl PlatformError {
    pub fn new(description: impl Into<String>, source: MessagingError) -> Self {
        Self {
            description: description.into(),
            source,
        }
    }

    /// Brief description of what went wrong.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The originating failure.
    pub fn cause(&self) -> &MessagingError {
        &self.source
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

impl From<MessagingError> for PlatformError {
    fn from(source: MessagingError) -> Self {
        Self {
            description: source.to_string(),
            source,
        }
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlatformError{{description='{}'}}", self.description)
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Receives every recovered processing failure.
///
/// Never invoked for messages dropped by a filter.
pub trait PlatformErrorListener: Send + Sync {
    fn on_error(&self, error: PlatformError);
}

/// Error listener that only logs. Used when no listener is configured.
#[derive(Debug, Default)]
pub struct LoggingErrorListener;

impl PlatformErrorListener for LoggingErrorListener {
    fn on_error(&self, error: PlatformError) {
        tracing::error!(kind = ?error.kind(), error = %error.cause(), "{}", error.description());
    }
}
