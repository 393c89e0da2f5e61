//! Entry values and their type tags.

use serde::{Deserialize, Serialize};

/// Entry value. Immutable once stored; replace rather than mutate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Boolean(bool),
    Double(f64),
    String(String),
    Raw(Vec<u8>),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    /// RPC definition blob.
    Rpc(Vec<u8>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Raw(_) => ValueType::Raw,
            Value::BooleanArray(_) => ValueType::BooleanArray,
            Value::DoubleArray(_) => ValueType::DoubleArray,
            Value::StringArray(_) => ValueType::StringArray,
            Value::Rpc(_) => ValueType::Rpc,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// In-memory type of an entry. Bit values so a set of types can be used as a
/// filter mask; these are not the wire tags (see [`ValueType::wire_tag`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Unassigned = 0x00,
    Boolean = 0x01,
    Double = 0x02,
    String = 0x04,
    Raw = 0x08,
    BooleanArray = 0x10,
    DoubleArray = 0x20,
    StringArray = 0x40,
    Rpc = 0x80,
}

impl ValueType {
    /// Mask bit for type filters. Unassigned has none.
    pub fn mask(self) -> u8 {
        self as u8
    }

    /// True if `mask` is 0 (any type) or contains this type.
    pub fn matches_mask(self, mask: u8) -> bool {
        mask == 0 || self.mask() & mask != 0
    }

    /// Tag used on the wire, or None for Unassigned.
    pub fn wire_tag(self) -> Option<u8> {
        Some(match self {
            ValueType::Unassigned => return None,
            ValueType::Boolean => 0x00,
            ValueType::Double => 0x01,
            ValueType::String => 0x02,
            ValueType::Raw => 0x03,
            ValueType::BooleanArray => 0x10,
            ValueType::DoubleArray => 0x11,
            ValueType::StringArray => 0x12,
            ValueType::Rpc => 0x20,
        })
    }

    pub fn from_wire_tag(tag: u8) -> Option<ValueType> {
        Some(match tag {
            0x00 => ValueType::Boolean,
            0x01 => ValueType::Double,
            0x02 => ValueType::String,
            0x03 => ValueType::Raw,
            0x10 => ValueType::BooleanArray,
            0x11 => ValueType::DoubleArray,
            0x12 => ValueType::StringArray,
            0x20 => ValueType::Rpc,
            _ => return None,
        })
    }
}
