//! Text persistence of box results.
//!
//! JSON has no tuple, so a tuple is written as a tagged record
//! `{"__tuple__": true, "items": [...]}` and rebuilt on the way back. Arrays
//! are flattened into nested lists and come back as lists. A mapping that
//! itself has a `__tuple__` or `__map__` key is wrapped as `{"__map__": {...}}`
//! so it never reads back as a tuple.

use serde_json::{Map, Number};

use crate::error::CodecError;
use crate::value::Value;

pub const TUPLE_TAG: &str = "__tuple__";
const TUPLE_ITEMS: &str = "items";
pub const MAP_TAG: &str = "__map__";

pub fn encode(value: &Value) -> Result<serde_json::Value, CodecError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(x) => {
            let number = Number::from_f64(*x).ok_or(CodecError::NonFinite(*x))?;
            serde_json::Value::Number(number)
        }
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(encode_all(items)?),
        Value::Tuple(items) => {
            let mut record = Map::new();
            record.insert(TUPLE_TAG.into(), serde_json::Value::Bool(true));
            record.insert(TUPLE_ITEMS.into(), serde_json::Value::Array(encode_all(items)?));
            serde_json::Value::Object(record)
        }
        Value::Map(map) => {
            let mut object = Map::new();
            for (key, value) in map {
                object.insert(key.clone(), encode(value)?);
            }
            if map.contains_key(TUPLE_TAG) || map.contains_key(MAP_TAG) {
                let mut escaped = Map::new();
                escaped.insert(MAP_TAG.into(), serde_json::Value::Object(object));
                object = escaped;
            }
            serde_json::Value::Object(object)
        }
        Value::Array(array) => encode(&array.to_nested())?,
    })
}

fn encode_all(items: &[Value]) -> Result<Vec<serde_json::Value>, CodecError> {
    items.iter().map(encode).collect()
}

pub fn decode(json: serde_json::Value) -> Result<Value, CodecError> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::List(decode_all(items)?),
        serde_json::Value::Object(mut object) => {
            if object.len() == 1
                && let Some(inner) = object
                    .get_mut(MAP_TAG)
                    .and_then(serde_json::Value::as_object_mut)
            {
                decode_map(std::mem::take(inner))?
            } else if object.contains_key(TUPLE_TAG) {
                match object.remove(TUPLE_ITEMS) {
                    Some(serde_json::Value::Array(items)) => Value::Tuple(decode_all(items)?),
                    other => {
                        return Err(CodecError::MalformedTuple(format!(
                            "expected an '{TUPLE_ITEMS}' list, found {other:?}"
                        )));
                    }
                }
            } else {
                decode_map(object)?
            }
        }
    })
}

fn decode_map(object: Map<String, serde_json::Value>) -> Result<Value, CodecError> {
    let mut map = std::collections::BTreeMap::new();
    for (key, value) in object {
        map.insert(key, decode(value)?);
    }
    Ok(Value::Map(map))
}

fn decode_all(items: Vec<serde_json::Value>) -> Result<Vec<Value>, CodecError> {
    items.into_iter().map(decode).collect()
}

/// Indented, key-sorted text form used for `result.json`.
pub fn to_string_pretty(value: &Value) -> Result<String, CodecError> {
    Ok(serde_json::to_string_pretty(&encode(value)?)?)
}

/// Compact, key-sorted text form. Equal values always give equal text.
pub fn to_canonical_string(value: &Value) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&encode(value)?)?)
}

pub fn from_str(text: &str) -> Result<Value, CodecError> {
    decode(serde_json::from_str(text)?)
}
