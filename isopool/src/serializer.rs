//! Tagged JSON transport for [`Value`].
//!
//! Plain data (null, bools, numbers, strings, arrays, objects) passes through
//! unchanged. Every rich type becomes an object carrying a `"__type"` tag.
//! Buffers listed as transferables are replaced by an index into
//! [`Transport::transfer`] and handed across zero-copy; all other buffers are
//! inlined as base64.
//!
//! ```text
//! Date          {"__type":"Date","value":"2024-05-01T12:00:00.000Z"}
//! Map           {"__type":"Map","entries":[[k, v], ...]}
//! Set           {"__type":"Set","values":[...]}
//! RegExp        {"__type":"RegExp","source":"a+","flags":"gi"}
//! Error         {"__type":"Error","name":"TypeError","message":"...","stack":"..."}
//! TypedArray    {"__type":"TypedArray","kind":"Int32Array","values":[1,2]}
//!               {"__type":"TypedArray","kind":"Int32Array","transfer":0}
//! ArrayBuffer   {"__type":"ArrayBuffer","base64":"AAE="}
//!               {"__type":"ArrayBuffer","transfer":1}
//! Object        {"__type":"Object","entries":{...}}   (plain object whose keys include "__type")
//! ```

use std::collections::HashSet;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde_json::{Map, json};
use tokio_util::bytes::Bytes;

use crate::value::{ErrorValue, NumericArray, NumericKind, SharedValue, Value};

/// Key that marks a tagged object.
pub const TAG: &str = "__type";

/// Encoded payload plus the buffers handed off alongside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transport {
    pub data: serde_json::Value,
    pub transfer: Vec<Bytes>,
}

impl Transport {
    pub fn plain(data: serde_json::Value) -> Self {
        Self {
            data,
            transfer: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SerializeError {
    #[error("unknown type tag: {0}")]
    UnknownTag(String),

    #[error("malformed {tag} value: {reason}")]
    Malformed { tag: String, reason: String },

    #[error("transfer index {index} out of range ({available} buffers attached)")]
    MissingTransfer { index: usize, available: usize },
}

fn malformed(tag: &str, reason: impl Into<String>) -> SerializeError {
    SerializeError::Malformed {
        tag: tag.to_string(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub fn serialize(value: &Value) -> Transport {
    serialize_with_transfer(value, &[])
}

/// Encode `value`, referencing any buffer found in `transfer` by index instead
/// of copying it.
pub fn serialize_with_transfer(value: &Value, transfer: &[Bytes]) -> Transport {
    if transfer.is_empty() && !requires_tagging(value) {
        return Transport::plain(to_plain(value));
    }
    let mut encoder = Encoder {
        transfer,
        path: Vec::new(),
    };
    Transport {
        data: encoder.encode(value),
        transfer: transfer.to_vec(),
    }
}

/// Structural scan: does encoding `value` need any tag at all?
///
/// Shared nodes always count, since the plain fast path has no cycle guard.
pub fn requires_tagging(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => false,
        Value::Array(items) => items.iter().any(requires_tagging),
        Value::Object(map) => map.contains_key(TAG) || map.values().any(requires_tagging),
        Value::Date(_)
        | Value::Map(_)
        | Value::Set(_)
        | Value::RegExp { .. }
        | Value::Error(_)
        | Value::NumericArray(_)
        | Value::Buffer(_)
        | Value::Shared(_) => true,
    }
}

// Only reached for values that passed `requires_tagging`.
fn to_plain(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_plain).collect()),
        Value::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), to_plain(v))).collect(),
        ),
        _ => serde_json::Value::Null,
    }
}

struct Encoder<'a> {
    transfer: &'a [Bytes],
    /// Shared nodes on the current path, by address.
    path: Vec<usize>,
}

impl Encoder<'_> {
    fn transfer_index(&self, buf: &Bytes) -> Option<usize> {
        self.transfer
            .iter()
            .position(|t| t.as_ptr() == buf.as_ptr() && t.len() == buf.len())
    }

    fn encode(&mut self, value: &Value) -> serde_json::Value {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.encode(v)).collect())
            }
            Value::Object(map) => {
                let entries: Map<String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k.clone(), self.encode(v))).collect();
                if map.contains_key(TAG) {
                    json!({ TAG: "Object", "entries": entries })
                } else {
                    serde_json::Value::Object(entries)
                }
            }
            Value::Date(d) => json!({
                TAG: "Date",
                "value": d.to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
            Value::Map(entries) => {
                let entries: Vec<serde_json::Value> = entries
                    .iter()
                    .map(|(k, v)| json!([self.encode(k), self.encode(v)]))
                    .collect();
                json!({ TAG: "Map", "entries": entries })
            }
            Value::Set(values) => {
                let values: Vec<serde_json::Value> = values.iter().map(|v| self.encode(v)).collect();
                json!({ TAG: "Set", "values": values })
            }
            Value::RegExp { source, flags } => json!({
                TAG: "RegExp",
                "source": source,
                "flags": flags,
            }),
            Value::Error(e) => {
                let mut obj = json!({ TAG: "Error", "name": e.name, "message": e.message });
                if let (Some(stack), Some(map)) = (&e.stack, obj.as_object_mut()) {
                    map.insert("stack".to_string(), serde_json::Value::String(stack.clone()));
                }
                obj
            }
            Value::NumericArray(arr) => match self.transfer_index(arr.buffer()) {
                Some(index) => json!({
                    TAG: "TypedArray",
                    "kind": arr.kind().type_name(),
                    "transfer": index,
                }),
                None => json!({
                    TAG: "TypedArray",
                    "kind": arr.kind().type_name(),
                    "values": numeric_elements(arr),
                }),
            },
            Value::Buffer(buf) => match self.transfer_index(buf) {
                Some(index) => json!({ TAG: "ArrayBuffer", "transfer": index }),
                None => json!({ TAG: "ArrayBuffer", "base64": BASE64.encode(buf) }),
            },
            Value::Shared(node) => self.encode_shared(node),
        }
    }

    fn encode_shared(&mut self, node: &SharedValue) -> serde_json::Value {
        let addr = node.addr();
        if self.path.contains(&addr) {
            // Back-edge: the cycle is cut here.
            return serde_json::Value::Null;
        }
        self.path.push(addr);
        let encoded = {
            let inner = node.lock();
            self.encode(&inner)
        };
        self.path.pop();
        encoded
    }
}

fn float_element(f: f64) -> serde_json::Value {
    match serde_json::Number::from_f64(f) {
        Some(n) => serde_json::Value::Number(n),
        None if f.is_nan() => json!("NaN"),
        None if f > 0.0 => json!("Infinity"),
        None => json!("-Infinity"),
    }
}

fn numeric_elements(arr: &NumericArray) -> Vec<serde_json::Value> {
    match arr.kind() {
        NumericKind::Int8 => to_json(arr.to_i8_vec()),
        NumericKind::Uint8 | NumericKind::Uint8Clamped => to_json(arr.to_u8_vec()),
        NumericKind::Int16 => to_json(arr.to_i16_vec()),
        NumericKind::Uint16 => to_json(arr.to_u16_vec()),
        NumericKind::Int32 => to_json(arr.to_i32_vec()),
        NumericKind::Uint32 => to_json(arr.to_u32_vec()),
        NumericKind::Float32 => arr
            .to_f32_vec()
            .unwrap_or_default()
            .into_iter()
            .map(|f| float_element(f64::from(f)))
            .collect(),
        NumericKind::Float64 => arr
            .to_f64_vec()
            .unwrap_or_default()
            .into_iter()
            .map(float_element)
            .collect(),
        NumericKind::BigInt64 => to_decimal(arr.to_i64_vec()),
        NumericKind::BigUint64 => to_decimal(arr.to_u64_vec()),
    }
}

fn to_json<T: Into<serde_json::Value>>(values: Option<Vec<T>>) -> Vec<serde_json::Value> {
    values.unwrap_or_default().into_iter().map(Into::into).collect()
}

fn to_decimal<T: ToString>(values: Option<Vec<T>>) -> Vec<serde_json::Value> {
    values
        .unwrap_or_default()
        .into_iter()
        .map(|v| serde_json::Value::String(v.to_string()))
        .collect()
}

// ---------------------------------------------------------------------------
// Transferables
// ---------------------------------------------------------------------------

/// Collect every buffer reachable from `value`, deduplicated by identity.
pub fn extract_transferables(value: &Value) -> Vec<Bytes> {
    let mut found = Vec::new();
    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    let mut visited: HashSet<usize> = HashSet::new();
    collect_buffers(value, &mut found, &mut seen, &mut visited);
    found
}

fn collect_buffers(
    value: &Value,
    found: &mut Vec<Bytes>,
    seen: &mut HashSet<(usize, usize)>,
    visited: &mut HashSet<usize>,
) {
    match value {
        Value::Buffer(buf) => remember(buf, found, seen),
        Value::NumericArray(arr) => remember(arr.buffer(), found, seen),
        Value::Array(items) | Value::Set(items) => {
            for item in items {
                collect_buffers(item, found, seen, visited);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_buffers(item, found, seen, visited);
            }
        }
        Value::Map(entries) => {
            for (k, v) in entries {
                collect_buffers(k, found, seen, visited);
                collect_buffers(v, found, seen, visited);
            }
        }
        Value::Shared(node) => {
            if visited.insert(node.addr()) {
                let inner = node.lock();
                collect_buffers(&inner, found, seen, visited);
            }
        }
        Value::Null
        | Value::Bool(_)
        | Value::Number(_)
        | Value::String(_)
        | Value::Date(_)
        | Value::RegExp { .. }
        | Value::Error(_) => {}
    }
}

fn remember(buf: &Bytes, found: &mut Vec<Bytes>, seen: &mut HashSet<(usize, usize)>) {
    if seen.insert((buf.as_ptr() as usize, buf.len())) {
        found.push(buf.clone());
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub fn deserialize(transport: Transport) -> Result<Value, SerializeError> {
    let Transport { data, transfer } = transport;
    if !contains_tag(&data) {
        return Ok(Value::from(data));
    }
    Decoder {
        transfer: &transfer,
    }
    .decode(data)
}

fn contains_tag(data: &serde_json::Value) -> bool {
    match data {
        serde_json::Value::Array(items) => items.iter().any(contains_tag),
        serde_json::Value::Object(map) => map.contains_key(TAG) || map.values().any(contains_tag),
        _ => false,
    }
}

struct Decoder<'a> {
    transfer: &'a [Bytes],
}

impl Decoder<'_> {
    fn decode(&self, data: serde_json::Value) -> Result<Value, SerializeError> {
        match data {
            serde_json::Value::Array(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|v| self.decode(v))
                    .collect::<Result<_, _>>()?,
            )),
            serde_json::Value::Object(mut map) => match map.remove(TAG) {
                Some(serde_json::Value::String(tag)) => self.decode_tagged(&tag, map),
                Some(other) => Err(malformed("tagged", format!("tag must be a string, got {other}"))),
                None => Ok(Value::Object(self.decode_entries(map)?)),
            },
            other => Ok(Value::from(other)),
        }
    }

    fn decode_entries(
        &self,
        map: Map<String, serde_json::Value>,
    ) -> Result<IndexMap<String, Value>, SerializeError> {
        map.into_iter()
            .map(|(k, v)| Ok((k, self.decode(v)?)))
            .collect()
    }

    fn buffer_at(&self, index: &serde_json::Value) -> Result<Bytes, SerializeError> {
        let index = index
            .as_u64()
            .ok_or_else(|| malformed("transfer", "index must be a non-negative integer"))?
            as usize;
        self.transfer
            .get(index)
            .cloned()
            .ok_or(SerializeError::MissingTransfer {
                index,
                available: self.transfer.len(),
            })
    }

    fn decode_tagged(
        &self,
        tag: &str,
        mut map: Map<String, serde_json::Value>,
    ) -> Result<Value, SerializeError> {
        match tag {
            "Object" => match map.remove("entries") {
                Some(serde_json::Value::Object(entries)) => {
                    Ok(Value::Object(self.decode_entries(entries)?))
                }
                _ => Err(malformed(tag, "missing entries object")),
            },
            "Date" => {
                let raw = take_string(&mut map, tag, "value")?;
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| malformed(tag, format!("{raw:?}: {e}")))?;
                Ok(Value::Date(parsed.with_timezone(&Utc)))
            }
            "Map" => {
                let Some(serde_json::Value::Array(entries)) = map.remove("entries") else {
                    return Err(malformed(tag, "missing entries array"));
                };
                let mut pairs = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry {
                        serde_json::Value::Array(pair) if pair.len() == 2 => {
                            let mut pair = pair.into_iter();
                            let (Some(k), Some(v)) = (pair.next(), pair.next()) else {
                                return Err(malformed(tag, "entry must be a [key, value] pair"));
                            };
                            pairs.push((self.decode(k)?, self.decode(v)?));
                        }
                        _ => return Err(malformed(tag, "entry must be a [key, value] pair")),
                    }
                }
                Ok(Value::Map(pairs))
            }
            "Set" => {
                let Some(serde_json::Value::Array(values)) = map.remove("values") else {
                    return Err(malformed(tag, "missing values array"));
                };
                Ok(Value::Set(
                    values
                        .into_iter()
                        .map(|v| self.decode(v))
                        .collect::<Result<_, _>>()?,
                ))
            }
            "RegExp" => Ok(Value::RegExp {
                source: take_string(&mut map, tag, "source")?,
                flags: take_string(&mut map, tag, "flags").unwrap_or_default(),
            }),
            "Error" => {
                let mut err = ErrorValue::new(
                    take_string(&mut map, tag, "name").unwrap_or_else(|_| "Error".to_string()),
                    take_string(&mut map, tag, "message")?,
                );
                err.stack = take_string(&mut map, tag, "stack").ok();
                Ok(Value::Error(err))
            }
            "TypedArray" => {
                let kind_name = take_string(&mut map, tag, "kind")?;
                let kind = NumericKind::from_type_name(&kind_name)
                    .ok_or_else(|| malformed(tag, format!("unknown kind {kind_name}")))?;
                if let Some(index) = map.get("transfer") {
                    let bytes = self.buffer_at(index)?;
                    return NumericArray::from_bytes(kind, bytes)
                        .map(Value::NumericArray)
                        .ok_or_else(|| malformed(tag, "buffer length is not a multiple of the element width"));
                }
                let Some(serde_json::Value::Array(values)) = map.remove("values") else {
                    return Err(malformed(tag, "missing values or transfer"));
                };
                decode_numeric(kind, &values).map(Value::NumericArray)
            }
            "ArrayBuffer" => {
                if let Some(index) = map.get("transfer") {
                    return self.buffer_at(index).map(Value::Buffer);
                }
                let raw = take_string(&mut map, tag, "base64")?;
                BASE64
                    .decode(raw.as_bytes())
                    .map(|b| Value::Buffer(Bytes::from(b)))
                    .map_err(|e| malformed(tag, e.to_string()))
            }
            other => Err(SerializeError::UnknownTag(other.to_string())),
        }
    }
}

fn take_string(
    map: &mut Map<String, serde_json::Value>,
    tag: &str,
    field: &str,
) -> Result<String, SerializeError> {
    match map.remove(field) {
        Some(serde_json::Value::String(s)) => Ok(s),
        _ => Err(malformed(tag, format!("missing string field {field}"))),
    }
}

fn decode_numeric(
    kind: NumericKind,
    values: &[serde_json::Value],
) -> Result<NumericArray, SerializeError> {
    fn ints<T: TryFrom<i64>>(
        kind: NumericKind,
        values: &[serde_json::Value],
    ) -> Result<Vec<T>, SerializeError> {
        values
            .iter()
            .map(|v| {
                v.as_i64()
                    .and_then(|n| T::try_from(n).ok())
                    .ok_or_else(|| malformed(kind.type_name(), format!("element {v} out of range")))
            })
            .collect()
    }

    fn floats(kind: NumericKind, values: &[serde_json::Value]) -> Result<Vec<f64>, SerializeError> {
        values
            .iter()
            .map(|v| {
                let parsed = match v {
                    serde_json::Value::Number(n) => n.as_f64(),
                    serde_json::Value::String(s) => match s.as_str() {
                        "NaN" => Some(f64::NAN),
                        "Infinity" => Some(f64::INFINITY),
                        "-Infinity" => Some(f64::NEG_INFINITY),
                        _ => None,
                    },
                    _ => None,
                };
                parsed.ok_or_else(|| malformed(kind.type_name(), format!("element {v} is not a number")))
            })
            .collect()
    }

    fn wide<T: std::str::FromStr>(
        kind: NumericKind,
        values: &[serde_json::Value],
    ) -> Result<Vec<T>, SerializeError> {
        values
            .iter()
            .map(|v| {
                v.as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| malformed(kind.type_name(), format!("element {v} is not a decimal string")))
            })
            .collect()
    }

    Ok(match kind {
        NumericKind::Int8 => NumericArray::from_i8(&ints(kind, values)?),
        NumericKind::Uint8 => NumericArray::from_u8(&ints(kind, values)?),
        NumericKind::Uint8Clamped => NumericArray::from_u8_clamped(&ints(kind, values)?),
        NumericKind::Int16 => NumericArray::from_i16(&ints(kind, values)?),
        NumericKind::Uint16 => NumericArray::from_u16(&ints(kind, values)?),
        NumericKind::Int32 => NumericArray::from_i32(&ints(kind, values)?),
        NumericKind::Uint32 => NumericArray::from_u32(&ints(kind, values)?),
        NumericKind::Float32 => {
            let floats: Vec<f32> = floats(kind, values)?.into_iter().map(|f| f as f32).collect();
            NumericArray::from_f32(&floats)
        }
        NumericKind::Float64 => NumericArray::from_f64(&floats(kind, values)?),
        NumericKind::BigInt64 => NumericArray::from_i64(&wide(kind, values)?),
        NumericKind::BigUint64 => NumericArray::from_u64(&wide(kind, values)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn roundtrip(value: &Value) -> Value {
        deserialize(serialize(value)).unwrap()
    }

    #[test]
    fn plain_data_is_untouched() {
        let value = Value::from(json!({"a": [1, 2.5, "x"], "b": {"c": null}}));
        assert!(!requires_tagging(&value));
        let transport = serialize(&value);
        assert_eq!(transport.data, json!({"a": [1, 2.5, "x"], "b": {"c": null}}));
        assert!(transport.transfer.is_empty());
        assert_eq!(deserialize(transport).unwrap(), value);
    }

    #[test]
    fn tagged_encoding_shape() {
        let value = Value::object([
            (
                "when",
                Value::Date(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            ),
            ("tags", Value::Set(vec!["a".into(), "b".into()])),
            (
                "pattern",
                Value::RegExp {
                    source: "a+".into(),
                    flags: "gi".into(),
                },
            ),
            ("raw", Value::Buffer(Bytes::from_static(&[0, 1]))),
        ]);
        insta::assert_json_snapshot!(serialize(&value).data, @r#"
        {
          "when": {
            "__type": "Date",
            "value": "2024-05-01T12:00:00.000Z"
          },
          "tags": {
            "__type": "Set",
            "values": [
              "a",
              "b"
            ]
          },
          "pattern": {
            "__type": "RegExp",
            "source": "a+",
            "flags": "gi"
          },
          "raw": {
            "__type": "ArrayBuffer",
            "base64": "AAE="
          }
        }
        "#);
    }

    #[test]
    fn rich_types_roundtrip() {
        let value = Value::Array(vec![
            Value::Map(vec![
                (Value::from(1), "one".into()),
                (Value::Set(vec![Value::Null]), Value::from(true)),
            ]),
            Value::Error(ErrorValue::new("TypeError", "bad input").with_stack("at f (x.js:1)")),
            NumericArray::from_f64(&[1.5, -0.25]).into(),
            NumericArray::from_u64(&[u64::MAX, 0]).into(),
            NumericArray::from_u8_clamped(&[0, 255]).into(),
        ]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn wide_integers_travel_as_decimal_strings() {
        let arr: Value = NumericArray::from_i64(&[i64::MIN, 42]).into();
        let data = serialize(&arr).data;
        assert_eq!(data["values"], json!(["-9223372036854775808", "42"]));
    }

    #[test]
    fn non_finite_floats_survive() {
        let arr = NumericArray::from_f64(&[f64::INFINITY, f64::NEG_INFINITY, 1.0]);
        let back = roundtrip(&arr.clone().into());
        assert_eq!(back, Value::NumericArray(arr));

        let nan = roundtrip(&NumericArray::from_f32(&[f32::NAN]).into());
        let Value::NumericArray(nan) = nan else { panic!("expected numeric array") };
        assert!(nan.to_f32_vec().unwrap()[0].is_nan());
    }

    #[test]
    fn objects_with_tag_key_are_escaped() {
        let value = Value::object([(TAG, Value::from("Date")), ("x", Value::from(1))]);
        let data = serialize(&value).data;
        assert_eq!(data[TAG], json!("Object"));
        assert_eq!(data["entries"][TAG], json!("Date"));
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn cycles_are_cut_not_followed() {
        let node = SharedValue::new(Value::Null);
        node.set(Value::object([
            ("name", Value::from("root")),
            ("self", Value::Shared(node.clone())),
        ]));
        let data = serialize(&Value::Shared(node)).data;
        assert_eq!(data, json!({"name": "root", "self": null}));
    }

    #[test]
    fn shared_nodes_seen_twice_are_encoded_twice() {
        let leaf = SharedValue::new(Value::from(7));
        let value = Value::Array(vec![Value::Shared(leaf.clone()), Value::Shared(leaf)]);
        assert_eq!(serialize(&value).data, json!([7, 7]));
    }

    fn every_numeric_kind() -> Vec<NumericArray> {
        vec![
            NumericArray::from_i8(&[i8::MIN, -1, 0, i8::MAX]),
            NumericArray::from_u8(&[0, 1, u8::MAX]),
            NumericArray::from_u8_clamped(&[0, 128, 255]),
            NumericArray::from_i16(&[i16::MIN, -300, i16::MAX]),
            NumericArray::from_u16(&[0, 40_000, u16::MAX]),
            NumericArray::from_i32(&[i32::MIN, 7, i32::MAX]),
            NumericArray::from_u32(&[0, 3_000_000_000, u32::MAX]),
            NumericArray::from_f32(&[0.25, -3.5, f32::INFINITY]),
            NumericArray::from_f64(&[0.5, -1024.0, f64::NEG_INFINITY]),
            NumericArray::from_i64(&[i64::MIN, -1, i64::MAX]),
            NumericArray::from_u64(&[0, u64::MAX]),
        ]
    }

    #[test]
    fn every_numeric_kind_roundtrips_when_nested() {
        let arrays = every_numeric_kind();
        let kinds: Vec<NumericKind> = arrays.iter().map(|a| a.kind()).collect();
        assert_eq!(kinds, NumericKind::ALL);

        let value = Value::object([(
            "batches",
            Value::Array(
                arrays
                    .into_iter()
                    .map(|arr| {
                        let name = arr.kind().type_name();
                        Value::Map(vec![(
                            Value::from(name),
                            Value::Set(vec![Value::object([("data", Value::from(arr))])]),
                        )])
                    })
                    .collect(),
            ),
        )]);
        assert!(requires_tagging(&value));
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn dates_and_patterns_roundtrip() {
        let when = Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap()
            + chrono::Duration::milliseconds(123);
        let value = Value::Array(vec![
            Value::Date(when),
            Value::RegExp {
                source: r"^\d{3}-[a-z]+$".into(),
                flags: "imu".into(),
            },
            Value::RegExp {
                source: "plain".into(),
                flags: String::new(),
            },
        ]);
        let back = roundtrip(&value);
        assert_eq!(back, value);
        assert!(matches!(back.as_array(), Some([Value::Date(d), ..]) if *d == when));
    }

    #[test]
    fn transferables_in_cycles_are_found_once() {
        let buf = Bytes::from(vec![5u8; 8]);
        let node = SharedValue::new(Value::Null);
        node.set(Value::object([
            ("buf", Value::Buffer(buf.clone())),
            ("again", Value::Shared(node.clone())),
            ("nested", Value::Array(vec![Value::Shared(node.clone())])),
        ]));
        let transfer = extract_transferables(&Value::Shared(node));
        assert_eq!(transfer.len(), 1);
        assert_eq!(transfer[0].as_ptr(), buf.as_ptr());
    }

    #[test]
    fn transferables_are_referenced_by_index() {
        let buf = Bytes::from(vec![1u8, 2, 3, 4]);
        let arr = NumericArray::from_u16(&[9, 10]);
        let value = Value::object([
            ("a", Value::Buffer(buf.clone())),
            ("b", arr.clone().into()),
            ("c", Value::Buffer(buf.clone())),
        ]);

        let transfer = extract_transferables(&value);
        assert_eq!(transfer.len(), 2);

        let transport = serialize_with_transfer(&value, &transfer);
        assert_eq!(transport.data["a"], json!({TAG: "ArrayBuffer", "transfer": 0}));
        assert_eq!(
            transport.data["b"],
            json!({TAG: "TypedArray", "kind": "Uint16Array", "transfer": 1})
        );

        let back = deserialize(transport).unwrap();
        let Some(Value::Buffer(a)) = back.get("a") else { panic!("expected buffer") };
        assert_eq!(a.as_ptr(), buf.as_ptr());
        assert_eq!(back.get("b"), Some(&Value::NumericArray(arr)));
    }

    #[test]
    fn decode_errors() {
        let unknown = deserialize(Transport::plain(json!({TAG: "Symbol"}))).unwrap_err();
        assert_eq!(unknown, SerializeError::UnknownTag("Symbol".into()));

        let missing = deserialize(Transport::plain(json!({TAG: "ArrayBuffer", "transfer": 3})))
            .unwrap_err();
        assert_eq!(
            missing,
            SerializeError::MissingTransfer {
                index: 3,
                available: 0
            }
        );

        let bad_date = deserialize(Transport::plain(json!({TAG: "Date", "value": "yesterday"})));
        assert!(matches!(bad_date, Err(SerializeError::Malformed { .. })));
    }
}
