//! Telemetry records and the bounded output buffer
//!
//! Every analyzer emits [`TelemetryRecord`]s: a name, a timestamp and a short
//! ordered list of typed attributes. Records are pushed into a caller-owned
//! [`TelemetryBuffer`] whose capacity bounds a single poll.

use serde::Serialize;

/// Upper bound on attributes per record, fixed by the external event struct
pub const MAX_ATTRIBUTES: usize = 10;

/// Type tag of an attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueType {
    #[serde(rename = "UINT16")]
    Uint16,
    #[serde(rename = "UINT32")]
    Uint32,
    #[serde(rename = "UINT64")]
    Uint64,
    #[serde(rename = "INT32")]
    Int32,
    #[serde(rename = "INT64")]
    Int64,
    #[serde(rename = "BOOL")]
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    Bool(bool),
}

impl AttributeValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            AttributeValue::U16(_) => ValueType::Uint16,
            AttributeValue::U32(_) => ValueType::Uint32,
            AttributeValue::U64(_) => ValueType::Uint64,
            AttributeValue::I32(_) => ValueType::Int32,
            AttributeValue::I64(_) => ValueType::Int64,
            AttributeValue::Bool(_) => ValueType::Bool,
        }
    }

    /// Byte length of the value in the external struct
    pub fn byte_len(&self) -> usize {
        match self {
            AttributeValue::U16(_) => 2,
            AttributeValue::U32(_) | AttributeValue::I32(_) => 4,
            AttributeValue::U64(_) | AttributeValue::I64(_) => 8,
            AttributeValue::Bool(_) => 1,
        }
    }

    /// Raw value bytes in the host's little-endian layout
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            AttributeValue::U16(v) => v.to_le_bytes().to_vec(),
            AttributeValue::U32(v) => v.to_le_bytes().to_vec(),
            AttributeValue::U64(v) => v.to_le_bytes().to_vec(),
            AttributeValue::I32(v) => v.to_le_bytes().to_vec(),
            AttributeValue::I64(v) => v.to_le_bytes().to_vec(),
            AttributeValue::Bool(v) => vec![v as u8],
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            AttributeValue::U16(v) => Some(v as u64),
            AttributeValue::U32(v) => Some(v as u64),
            AttributeValue::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            AttributeValue::I32(v) => Some(v as i64),
            AttributeValue::I64(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    pub key: &'static str,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(key: &'static str, value: AttributeValue) -> Self {
        Self {
            key,
            value_type: value.value_type(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub name: &'static str,
    pub timestamp: u64,
    pub attributes: Vec<Attribute>,
}

impl TelemetryRecord {
    pub fn new(name: &'static str, timestamp: u64) -> Self {
        Self {
            name,
            timestamp,
            attributes: Vec::with_capacity(MAX_ATTRIBUTES),
        }
    }

    /// Append an attribute. Attributes beyond [`MAX_ATTRIBUTES`] are dropped.
    pub fn with(mut self, key: &'static str, value: AttributeValue) -> Self {
        debug_assert!(
            self.attributes.len() < MAX_ATTRIBUTES,
            "record {} exceeds {} attributes",
            self.name,
            MAX_ATTRIBUTES
        );
        if self.attributes.len() < MAX_ATTRIBUTES {
            self.attributes.push(Attribute::new(key, value));
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| &a.value)
    }
}

/// Caller-owned, fixed-capacity output for a poll
///
/// `len()` is the running count; pushes beyond `capacity` are refused.
#[derive(Debug)]
pub struct TelemetryBuffer {
    records: Vec<TelemetryRecord>,
    capacity: usize,
}

impl TelemetryBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a record, returning false when the buffer is full
    pub fn push(&mut self, record: TelemetryRecord) -> bool {
        if self.is_full() {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    /// Take every buffered record, leaving the buffer empty
    pub fn drain(&mut self) -> std::vec::Drain<'_, TelemetryRecord> {
        self.records.drain(..)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
