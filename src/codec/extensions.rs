//! Schema extension fields.
//!
//! prost drops fields it does not know about, so extension fields carried
//! by a payload are lifted out of the raw bytes separately. An
//! [`ExtensionRegistry`] names the field numbers of interest for one payload
//! type; [`extract`] scans the payload and collects their values into an
//! [`ExtensionSet`] delivered alongside the typed message.

use std::collections::{BTreeMap, HashMap};

use bytes::{Buf, Bytes};
use prost::encoding::{decode_key, decode_varint, skip_field, DecodeContext, WireType};

use crate::error::{MessagingError, Result};

/// Per-payload-type table of extension field numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionRegistry {
    fields: HashMap<u32, String>,
}

impl ExtensionRegistry {
    /// A registry with no extensions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register an extension field.
    pub fn with(mut self, number: u32, name: impl Into<String>) -> Self {
        self.register(number, name);
        self
    }

    pub fn register(&mut self, number: u32, name: impl Into<String>) {
        self.fields.insert(number, name.into());
    }

    pub fn name(&self, number: u32) -> Option<&str> {
        self.fields.get(&number).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// Raw value of one occurrence of an extension field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionValue {
    Varint(u64),
    Fixed64(u64),
    Fixed32(u32),
    LengthDelimited(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExtensionField {
    name: String,
    values: Vec<ExtensionValue>,
}

/// Extension values found in one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionSet {
    fields: BTreeMap<u32, ExtensionField>,
}

impl ExtensionSet {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field numbers present in this set, ascending.
    pub fn numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.fields.keys().copied()
    }

    /// All occurrences of a field, in wire order.
    pub fn values(&self, number: u32) -> &[ExtensionValue] {
        self.fields
            .get(&number)
            .map(|field| field.values.as_slice())
            .unwrap_or(&[])
    }

    /// Field number registered under `name`.
    pub fn number_of(&self, name: &str) -> Option<u32> {
        self.fields
            .iter()
            .find(|(_, field)| field.name == name)
            .map(|(number, _)| *number)
    }

    /// Last varint occurrence of a field (protobuf "last one wins").
    pub fn varint(&self, number: u32) -> Option<u64> {
        self.values(number).iter().rev().find_map(|value| match value {
            ExtensionValue::Varint(v) => Some(*v),
            _ => None,
        })
    }

    /// Decode a length-delimited extension as a message, merging all occurrences.
    pub fn message<E: prost::Message + Default>(&self, number: u32) -> Option<Result<E>> {
        let chunks: Vec<&Bytes> = self
            .values(number)
            .iter()
            .filter_map(|value| match value {
                ExtensionValue::LengthDelimited(bytes) => Some(bytes),
                _ => None,
            })
            .collect();
        if chunks.is_empty() {
            return None;
        }

        let mut message = E::default();
        for chunk in chunks {
            if let Err(e) = message.merge(chunk.as_ref()) {
                return Some(Err(MessagingError::CorruptEnvelope(format!(
                    "extension field {}: {}",
                    number, e
                ))));
            }
        }
        Some(Ok(message))
    }

    fn push(&mut self, number: u32, name: &str, value: ExtensionValue) {
        self.fields
            .entry(number)
            .or_insert_with(|| ExtensionField {
                name: name.to_string(),
                values: Vec::new(),
            })
            .values
            .push(value);
    }
}

fn corrupt(message: impl std::fmt::Display) -> MessagingError {
    MessagingError::CorruptEnvelope(format!("extension scan: {}", message))
}

/// Collect the registered extension fields from raw payload bytes.
pub fn extract(payload: &[u8], registry: &ExtensionRegistry) -> Result<ExtensionSet> {
    let mut set = ExtensionSet::default();
    if registry.is_empty() {
        return Ok(set);
    }

    let mut buf = payload;
    while buf.has_remaining() {
        let (number, wire_type) = decode_key(&mut buf).map_err(corrupt)?;
        let value = match wire_type {
            WireType::Varint => ExtensionValue::Varint(decode_varint(&mut buf).map_err(corrupt)?),
            WireType::SixtyFourBit => {
                if buf.remaining() < 8 {
                    return Err(corrupt("truncated fixed64"));
                }
                ExtensionValue::Fixed64(buf.get_u64_le())
            }
            WireType::ThirtyTwoBit => {
                if buf.remaining() < 4 {
                    return Err(corrupt("truncated fixed32"));
                }
                ExtensionValue::Fixed32(buf.get_u32_le())
            }
            WireType::LengthDelimited => {
                let len = decode_varint(&mut buf).map_err(corrupt)? as usize;
                if buf.remaining() < len {
                    return Err(corrupt("truncated length-delimited field"));
                }
                ExtensionValue::LengthDelimited(buf.copy_to_bytes(len))
            }
            WireType::StartGroup => {
                // Groups are never extensions; skip through the matching end tag.
                skip_field(wire_type, number, &mut buf, DecodeContext::default())
                    .map_err(corrupt)?;
                continue;
            }
            WireType::EndGroup => return Err(corrupt("unmatched end group")),
        };

        if let Some(name) = registry.name(number) {
            set.push(number, name, value);
        }
    }

    Ok(set)
}
