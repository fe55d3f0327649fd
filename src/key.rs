//! Routing key codec.
//!
//! Keys have the shape `<topic>|<fully-qualified payload type name>`.
//! Producers generate them when the caller supplies none; receivers decode
//! them into [`MessageKey`] for the listener metadata.

use serde::Deserialize;
use tracing::debug;

use crate::error::{MessagingError, Result};

/// Delimiter between the topic and type segments.
pub const KEY_DELIMITER: char = '|';

/// How non-conforming keys are treated on the receive side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    /// Accept any UTF-8 key; segments stay unset when the shape is unexpected.
    #[default]
    Lenient,
    /// Reject keys that do not split into exactly two segments.
    Strict,
}

/// A decoded routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    raw: String,
    src_topic: Option<String>,
    message_type: Option<String>,
}

impl MessageKey {
    /// Build an outgoing key.
    pub fn new(src_topic: impl Into<String>, message_type: impl Into<String>) -> Self {
        let src_topic = src_topic.into();
        let message_type = message_type.into();
        Self {
            raw: encode(&src_topic, &message_type),
            src_topic: Some(src_topic),
            message_type: Some(message_type),
        }
    }

    /// Decode a key under the given policy.
    pub fn parse(raw: &str, policy: KeyPolicy) -> Result<Self> {
        let mut segments = raw.split(KEY_DELIMITER);
        match (segments.next(), segments.next(), segments.next()) {
            (Some(topic), Some(message_type), None) => Ok(Self {
                raw: raw.to_string(),
                src_topic: Some(topic.to_string()),
                message_type: Some(message_type.to_string()),
            }),
            _ if policy == KeyPolicy::Strict => Err(MessagingError::MalformedKey(format!(
                "expected <topic>{}<type>, got '{}'",
                KEY_DELIMITER, raw
            ))),
            _ => {
                debug!(key = %raw, "unknown message key format");
                Ok(Self {
                    raw: raw.to_string(),
                    src_topic: None,
                    message_type: None,
                })
            }
        }
    }

    /// Decode raw record key bytes. Absent or non-UTF-8 keys are always malformed.
    pub fn from_bytes(raw: Option<&[u8]>, policy: KeyPolicy) -> Result<Self> {
        let raw = raw
            .ok_or_else(|| MessagingError::MalformedKey("Received null message key".to_string()))?;
        let raw = std::str::from_utf8(raw)
            .map_err(|e| MessagingError::MalformedKey(format!("key is not valid UTF-8: {}", e)))?;
        Self::parse(raw, policy)
    }

    /// The key exactly as carried on the wire.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn src_topic(&self) -> Option<&str> {
        self.src_topic.as_deref()
    }

    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn into_string(self) -> String {
        self.raw
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// `<topic>|<type>`
pub fn encode(src_topic: &str, message_type: &str) -> String {
    format!("{}{}{}", src_topic, KEY_DELIMITER, message_type)
}
