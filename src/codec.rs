//! Payload decoding for the LWM2M content formats
//!
//! `decode` turns a reply payload plus its content format into a [`Content`]
//! value. Writes are pass-through: the caller supplies the payload bytes and the
//! configured write format, so there is no structured encode path here beyond
//! [`crate::tlv::encode`].

use crate::coap_types::ContentFormat;
use crate::tlv::{self, TlvMap, TlvNode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Payload decoding failures
#[derive(Debug, Error)]
pub enum CodecError {
    /// A TLV field or value runs past the end of its buffer
    #[error("TLV truncated at offset {offset}: needs {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A TLV header whose fields contradict each other
    #[error("Inconsistent TLV header 0x{header:02x} at offset {offset}")]
    InconsistentHeader { offset: usize, header: u8 },

    /// Malformed JSON payload
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed CBOR payload
    #[error("CBOR decode error: {0}")]
    Cbor(String),
}

/// Decoded payload data
#[derive(Debug, Clone, PartialEq)]
pub enum ContentData {
    /// No payload
    Empty,
    /// Plain text or link-format
    Text(String),
    /// Raw bytes, never stringified
    Opaque(Vec<u8>),
    /// Parsed JSON document
    Json(Value),
    /// Decoded TLV tree
    Tlv(TlvMap),
    /// Parsed CBOR value
    Cbor(ciborium::Value),
}

/// A decoded payload together with its content format
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub format: ContentFormat,
    pub data: ContentData,
}

impl Content {
    /// Content of a reply that carried no payload
    pub fn empty() -> Self {
        Self {
            format: ContentFormat::Text,
            data: ContentData::Empty,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self {
            format: ContentFormat::Text,
            data: ContentData::Text(value.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.data, ContentData::Empty)
    }

    /// Text content, if this is a text or link-format payload
    pub fn as_text(&self) -> Option<&str> {
        match &self.data {
            ContentData::Text(text) => Some(text),
            _ => None,
        }
    }

    /// TLV tree, if this is a TLV payload
    pub fn as_tlv(&self) -> Option<&TlvMap> {
        match &self.data {
            ContentData::Tlv(map) => Some(map),
            _ => None,
        }
    }

    /// Render as JSON
    ///
    /// TLV trees become `{"<id>": {"type": "...", "data": ...}}`, opaque data
    /// and non-UTF-8 TLV values are base64 strings.
    pub fn to_json(&self) -> Value {
        match &self.data {
            ContentData::Empty => Value::Null,
            ContentData::Text(text) => Value::String(text.clone()),
            ContentData::Opaque(bytes) => Value::String(BASE64.encode(bytes)),
            ContentData::Json(value) => value.clone(),
            ContentData::Tlv(map) => tlv_to_json(map),
            ContentData::Cbor(value) => cbor_to_json(value),
        }
    }
}

/// Decode `bytes` according to `format`
///
/// An empty payload decodes to [`Content::empty`] whatever the format.
pub fn decode(format: ContentFormat, bytes: &[u8]) -> Result<Content, CodecError> {
    if bytes.is_empty() {
        return Ok(Content {
            format,
            data: ContentData::Empty,
        });
    }

    let data = match format {
        ContentFormat::Text | ContentFormat::LinkFormat => {
            ContentData::Text(String::from_utf8_lossy(bytes).into_owned())
        }
        ContentFormat::Opaque => ContentData::Opaque(bytes.to_vec()),
        ContentFormat::Json => ContentData::Json(serde_json::from_slice(bytes)?),
        ContentFormat::Tlv => ContentData::Tlv(tlv::decode(bytes)?),
        ContentFormat::Cbor => ContentData::Cbor(
            ciborium::from_reader(bytes).map_err(|e| CodecError::Cbor(e.to_string()))?,
        ),
    };

    Ok(Content { format, data })
}

fn tlv_to_json(map: &TlvMap) -> Value {
    let mut out = Map::new();
    for (id, node) in map {
        let data = match node {
            TlvNode::ObjectInstance(children) | TlvNode::MultipleResource(children) => {
                tlv_to_json(children)
            }
            TlvNode::Value(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => Value::String(text.to_string()),
                Err(_) => Value::String(BASE64.encode(bytes)),
            },
        };
        out.insert(
            id.to_string(),
            json!({ "type": node.type_name(), "data": data }),
        );
    }
    Value::Object(out)
}

fn cbor_to_json(value: &ciborium::Value) -> Value {
    use ciborium::Value as Cbor;
    match value {
        Cbor::Null => Value::Null,
        Cbor::Bool(b) => Value::Bool(*b),
        Cbor::Integer(i) => {
            let n: i128 = (*i).into();
            i64::try_from(n)
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(n.to_string()))
        }
        Cbor::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Cbor::Text(s) => Value::String(s.clone()),
        Cbor::Bytes(b) => Value::String(BASE64.encode(b)),
        Cbor::Array(items) => Value::Array(items.iter().map(cbor_to_json).collect()),
        Cbor::Map(entries) => {
            let mut out = Map::new();
            for (k, v) in entries {
                let key = match k {
                    Cbor::Text(s) => s.clone(),
                    other => cbor_to_json(other).to_string(),
                };
                out.insert(key, cbor_to_json(v));
            }
            Value::Object(out)
        }
        Cbor::Tag(_, inner) => cbor_to_json(inner),
        _ => Value::Null,
    }
}
