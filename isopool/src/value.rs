//! Structured values exchanged with execution units.
//!
//! `Value` covers plain JSON data plus the rich types the transport has to
//! tag explicitly: dates, maps, sets, regular expressions, errors, numeric
//! arrays and raw buffers. `Shared` is the only way to build a
//! self-referential structure; the serializer guards against cycles through it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio_util::bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    Date(DateTime<Utc>),
    /// Key/value pairs in insertion order. Keys may be any value.
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    RegExp {
        source: String,
        flags: String,
    },
    Error(ErrorValue),
    NumericArray(NumericArray),
    Buffer(Bytes),
    Shared(SharedValue),
}

impl Value {
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Field lookup on plain objects.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats have no JSON number form and become `Null`.
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<ErrorValue> for Value {
    fn from(e: ErrorValue) -> Self {
        Value::Error(e)
    }
}

impl From<NumericArray> for Value {
    fn from(a: NumericArray) -> Self {
        Value::NumericArray(a)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Buffer(b)
    }
}

impl From<serde_json::Value> for Value {
    /// Plain conversion: objects are taken as-is, tags are not interpreted.
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// An error carried as data: name, message and optional stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Reference-counted mutable node. Equality is identity.
#[derive(Clone)]
pub struct SharedValue(Arc<Mutex<Value>>);

impl SharedValue {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    /// Lock the node, recovering from poisoning.
    pub fn lock(&self) -> MutexGuard<'_, Value> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, value: Value) {
        *self.lock() = value;
    }

    pub fn ptr_eq(&self, other: &SharedValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for SharedValue {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for SharedValue {
    // Never prints the contents: they may refer back to this node.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared({:#x})", self.addr())
    }
}

// ---------------------------------------------------------------------------
// Numeric arrays
// ---------------------------------------------------------------------------

/// Element type of a fixed-width numeric array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl NumericKind {
    pub const ALL: [NumericKind; 11] = [
        NumericKind::Int8,
        NumericKind::Uint8,
        NumericKind::Uint8Clamped,
        NumericKind::Int16,
        NumericKind::Uint16,
        NumericKind::Int32,
        NumericKind::Uint32,
        NumericKind::Float32,
        NumericKind::Float64,
        NumericKind::BigInt64,
        NumericKind::BigUint64,
    ];

    /// Element width in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::Uint8Clamped => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 | Self::BigInt64 | Self::BigUint64 => 8,
        }
    }

    /// Wire name, matching the typed-array constructor names script runtimes use.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Int8 => "Int8Array",
            Self::Uint8 => "Uint8Array",
            Self::Uint8Clamped => "Uint8ClampedArray",
            Self::Int16 => "Int16Array",
            Self::Uint16 => "Uint16Array",
            Self::Int32 => "Int32Array",
            Self::Uint32 => "Uint32Array",
            Self::Float32 => "Float32Array",
            Self::Float64 => "Float64Array",
            Self::BigInt64 => "BigInt64Array",
            Self::BigUint64 => "BigUint64Array",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.type_name() == name)
    }
}

/// Fixed-width numeric array stored as little-endian bytes.
///
/// The backing `Bytes` is what gets handed off zero-copy to thread units.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    kind: NumericKind,
    bytes: Bytes,
}

macro_rules! numeric_constructors {
    ($($ctor:ident, $to_vec:ident, $ty:ty, $kind:expr;)*) => {
        $(
            pub fn $ctor(values: &[$ty]) -> Self {
                let mut buf = Vec::with_capacity(values.len() * std::mem::size_of::<$ty>());
                for v in values {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                Self { kind: $kind, bytes: Bytes::from(buf) }
            }

            pub fn $to_vec(&self) -> Option<Vec<$ty>> {
                if self.kind.width() != std::mem::size_of::<$ty>() {
                    return None;
                }
                Some(
                    self.bytes
                        .chunks_exact(std::mem::size_of::<$ty>())
                        .map(|chunk| {
                            let mut raw = [0u8; std::mem::size_of::<$ty>()];
                            raw.copy_from_slice(chunk);
                            <$ty>::from_le_bytes(raw)
                        })
                        .collect(),
                )
            }
        )*
    };
}

impl NumericArray {
    numeric_constructors! {
        from_i8, to_i8_vec, i8, NumericKind::Int8;
        from_u8, to_u8_vec, u8, NumericKind::Uint8;
        from_i16, to_i16_vec, i16, NumericKind::Int16;
        from_u16, to_u16_vec, u16, NumericKind::Uint16;
        from_i32, to_i32_vec, i32, NumericKind::Int32;
        from_u32, to_u32_vec, u32, NumericKind::Uint32;
        from_f32, to_f32_vec, f32, NumericKind::Float32;
        from_f64, to_f64_vec, f64, NumericKind::Float64;
        from_i64, to_i64_vec, i64, NumericKind::BigInt64;
        from_u64, to_u64_vec, u64, NumericKind::BigUint64;
    }

    pub fn from_u8_clamped(values: &[u8]) -> Self {
        Self {
            kind: NumericKind::Uint8Clamped,
            bytes: Bytes::copy_from_slice(values),
        }
    }

    /// Wrap an existing buffer. Fails if the length is not a multiple of the element width.
    pub fn from_bytes(kind: NumericKind, bytes: Bytes) -> Option<Self> {
        (bytes.len() % kind.width() == 0).then_some(Self { kind, bytes })
    }

    pub fn kind(&self) -> NumericKind {
        self.kind
    }

    /// Backing buffer.
    pub fn buffer(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.kind.width()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_array_roundtrips_typed_values() {
        let arr = NumericArray::from_i32(&[-1, 0, i32::MAX]);
        assert_eq!(arr.kind(), NumericKind::Int32);
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.buffer().len(), 12);
        assert_eq!(arr.to_i32_vec(), Some(vec![-1, 0, i32::MAX]));
        assert_eq!(arr.to_u32_vec(), Some(vec![u32::MAX, 0, i32::MAX as u32]));
        assert_eq!(arr.to_i64_vec(), None);
    }

    #[test]
    fn from_bytes_checks_width() {
        assert!(NumericArray::from_bytes(NumericKind::Int16, Bytes::from_static(&[1, 2, 3])).is_none());
        assert!(NumericArray::from_bytes(NumericKind::Int16, Bytes::from_static(&[1, 2])).is_some());
    }

    #[test]
    fn kind_names_roundtrip() {
        for kind in NumericKind::ALL {
            assert_eq!(NumericKind::from_type_name(kind.type_name()), Some(kind));
        }
        assert_eq!(NumericKind::from_type_name("Float16Array"), None);
    }

    #[test]
    fn shared_equality_is_identity() {
        let a = SharedValue::new(Value::from(1));
        let b = SharedValue::new(Value::from(1));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn shared_debug_does_not_recurse() {
        let node = SharedValue::new(Value::Null);
        node.set(Value::Array(vec![Value::Shared(node.clone())]));
        let printed = format!("{:?}", Value::Shared(node));
        assert!(printed.starts_with("Shared("));
    }

    #[test]
    fn json_conversion_is_plain() {
        let v = Value::from(serde_json::json!({"a": [1, "x", null], "b": true}));
        assert_eq!(v.get("b"), Some(&Value::Bool(true)));
        assert_eq!(v.get("a").and_then(Value::as_array).map(|a| a.len()), Some(3));
    }
}
