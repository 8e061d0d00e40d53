//! LWM2M TLV encoding/decoding
//!
//! Every TLV entry starts with a one-byte header:
//!
//! | bits | meaning |
//! |------|---------|
//! | 7-6  | identifier type (0 object instance, 1 resource instance, 2 multiple resource, 3 resource value) |
//! | 5    | identifier length (0: 8-bit, 1: 16-bit) |
//! | 4-3  | length type (0: inline, 1/2/3: 8/16/32-bit length field follows the identifier) |
//! | 2-0  | inline value length, only meaningful when the length type is 0 |
//!
//! followed by the identifier, the optional length field and the value bytes.
//! Object instance and multiple resource values are themselves TLV sequences.

use crate::codec::CodecError;
use std::collections::BTreeMap;

/// Decoded TLV level: identifier to node
pub type TlvMap = BTreeMap<u16, TlvNode>;

/// TLV identifier type (header bits 7-6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierType {
    ObjectInstance,
    ResourceInstance,
    MultipleResource,
    Resource,
}

impl IdentifierType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::ObjectInstance,
            1 => Self::ResourceInstance,
            2 => Self::MultipleResource,
            _ => Self::Resource,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::ObjectInstance => 0,
            Self::ResourceInstance => 1,
            Self::MultipleResource => 2,
            Self::Resource => 3,
        }
    }
}

/// A node of the decoded value tree
#[derive(Debug, Clone, PartialEq)]
pub enum TlvNode {
    /// Object instance holding resources
    ObjectInstance(TlvMap),
    /// Multiple resource holding resource instances
    MultipleResource(TlvMap),
    /// Raw value of a resource or resource instance
    Value(Vec<u8>),
}

impl TlvNode {
    /// Value node holding UTF-8 text
    pub fn text(value: &str) -> Self {
        Self::Value(value.as_bytes().to_vec())
    }

    /// Value node holding a big-endian integer in the narrowest of 1/2/4/8 bytes
    pub fn integer(value: i64) -> Self {
        let bytes = if let Ok(v) = i8::try_from(value) {
            v.to_be_bytes().to_vec()
        } else if let Ok(v) = i16::try_from(value) {
            v.to_be_bytes().to_vec()
        } else if let Ok(v) = i32::try_from(value) {
            v.to_be_bytes().to_vec()
        } else {
            value.to_be_bytes().to_vec()
        };
        Self::Value(bytes)
    }

    /// Type name as rendered in JSON output
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ObjectInstance(_) => "ObjectInstance",
            Self::MultipleResource(_) => "MultipleResource",
            Self::Value(_) => "Value",
        }
    }

    /// Raw bytes of a value node
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Value(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Children of an object instance or multiple resource
    pub fn children(&self) -> Option<&TlvMap> {
        match self {
            Self::ObjectInstance(map) | Self::MultipleResource(map) => Some(map),
            Self::Value(_) => None,
        }
    }

    /// Value as UTF-8 text
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Value as a signed big-endian integer (1, 2, 4 or 8 bytes)
    pub fn as_integer(&self) -> Option<i64> {
        let bytes = self.as_bytes()?;
        match bytes.len() {
            1 => Some(i8::from_be_bytes([bytes[0]]) as i64),
            2 => Some(i16::from_be_bytes([bytes[0], bytes[1]]) as i64),
            4 => Some(i32::from_be_bytes(bytes.try_into().ok()?) as i64),
            8 => Some(i64::from_be_bytes(bytes.try_into().ok()?)),
            _ => None,
        }
    }

    /// Value as an IEEE-754 float (4 or 8 bytes)
    pub fn as_float(&self) -> Option<f64> {
        let bytes = self.as_bytes()?;
        match bytes.len() {
            4 => Some(f32::from_be_bytes(bytes.try_into().ok()?) as f64),
            8 => Some(f64::from_be_bytes(bytes.try_into().ok()?)),
            _ => None,
        }
    }

    /// Value as a boolean (single byte 0 or 1)
    pub fn as_bool(&self) -> Option<bool> {
        match self.as_bytes()? {
            [0] => Some(false),
            [1] => Some(true),
            _ => None,
        }
    }
}

/// Where a TLV sequence sits in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    TopLevel,
    ObjectInstance,
    MultipleResource,
}

/// One raw entry, borrowed from the input
struct Entry<'a> {
    kind: IdentifierType,
    identifier: u16,
    value: &'a [u8],
}

/// Decode a TLV payload into a value tree
///
/// A zero-length payload decodes to an empty tree. Object instance and
/// multiple resource entries are decoded recursively wherever they appear;
/// resource and resource instance entries are values at any level.
pub fn decode(bytes: &[u8]) -> Result<TlvMap, CodecError> {
    let mut map = TlvMap::new();
    let mut cursor = 0;

    while cursor < bytes.len() {
        let (entry, next) = read_entry(bytes, cursor)?;
        let node = match entry.kind {
            IdentifierType::ObjectInstance => TlvNode::ObjectInstance(decode(entry.value)?),
            IdentifierType::MultipleResource => TlvNode::MultipleResource(decode(entry.value)?),
            IdentifierType::ResourceInstance | IdentifierType::Resource => {
                TlvNode::Value(entry.value.to_vec())
            }
        };
        map.insert(entry.identifier, node);
        cursor = next;
    }

    Ok(map)
}

/// Read the entry starting at `cursor`, returning it and the cursor past its value
fn read_entry(bytes: &[u8], cursor: usize) -> Result<(Entry<'_>, usize), CodecError> {
    let header = read_uint(bytes, cursor, 1)? as u8;
    let kind = IdentifierType::from_bits(header >> 6);
    let identifier_width = if header & 0x20 != 0 { 2 } else { 1 };
    let length_type = (header >> 3) & 0x03;
    let inline_length = header & 0x07;

    if length_type != 0 && inline_length != 0 {
        return Err(CodecError::InconsistentHeader {
            offset: cursor,
            header,
        });
    }

    let mut pos = cursor + 1;
    let identifier = read_uint(bytes, pos, identifier_width)? as u16;
    pos += identifier_width;

    let length = match length_type {
        0 => inline_length as usize,
        1 => read_uint(bytes, pos, 1)? as usize,
        2 => read_uint(bytes, pos, 2)? as usize,
        _ => read_uint(bytes, pos, 4)? as usize,
    };
    pos += match length_type {
        0 => 0,
        1 => 1,
        2 => 2,
        _ => 4,
    };

    let value = bytes
        .get(pos..pos.saturating_add(length))
        .ok_or(CodecError::Truncated {
            offset: pos,
            needed: length,
            available: bytes.len().saturating_sub(pos),
        })?;

    Ok((
        Entry {
            kind,
            identifier,
            value,
        },
        pos + length,
    ))
}

fn read_uint(bytes: &[u8], pos: usize, width: usize) -> Result<u32, CodecError> {
    let field = bytes
        .get(pos..pos + width)
        .ok_or(CodecError::Truncated {
            offset: pos,
            needed: width,
            available: bytes.len().saturating_sub(pos),
        })?;
    Ok(field.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

/// Encode a value tree, choosing the narrowest identifier and length fields
///
/// Top-level values are written as resources; values under a multiple
/// resource are written as resource instances.
pub fn encode(map: &TlvMap) -> Vec<u8> {
    let mut out = Vec::new();
    encode_sequence(map, Scope::TopLevel, &mut out);
    out
}

fn encode_sequence(map: &TlvMap, scope: Scope, out: &mut Vec<u8>) {
    for (identifier, node) in map {
        match node {
            TlvNode::ObjectInstance(children) => {
                let mut inner = Vec::new();
                encode_sequence(children, Scope::ObjectInstance, &mut inner);
                write_entry(out, IdentifierType::ObjectInstance, *identifier, &inner);
            }
            TlvNode::MultipleResource(children) => {
                let mut inner = Vec::new();
                encode_sequence(children, Scope::MultipleResource, &mut inner);
                write_entry(out, IdentifierType::MultipleResource, *identifier, &inner);
            }
            TlvNode::Value(value) => {
                let kind = if scope == Scope::MultipleResource {
                    IdentifierType::ResourceInstance
                } else {
                    IdentifierType::Resource
                };
                write_entry(out, kind, *identifier, value);
            }
        }
    }
}

fn write_entry(out: &mut Vec<u8>, kind: IdentifierType, identifier: u16, value: &[u8]) {
    let mut header = kind.bits() << 6;
    if identifier > 0xFF {
        header |= 0x20;
    }

    let length = value.len() as u32;
    let length_width = match length {
        0..=7 => {
            header |= length as u8;
            0
        }
        8..=0xFF => 1,
        0x100..=0xFFFF => 2,
        _ => 4,
    };
    header |= match length_width {
        0 => 0,
        1 => 1 << 3,
        2 => 2 << 3,
        _ => 3 << 3,
    };

    out.push(header);
    if identifier > 0xFF {
        out.extend_from_slice(&identifier.to_be_bytes());
    } else {
        out.push(identifier as u8);
    }
    out.extend_from_slice(&length.to_be_bytes()[4 - length_width..]);
    out.extend_from_slice(value);
}
