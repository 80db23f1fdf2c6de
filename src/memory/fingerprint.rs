//! Cache keys.
//!
//! The key of a call is a digest over the resolved inputs that take part in
//! hashing. Strings naming an existing file are replaced by a fingerprint of
//! that file (path, size and modification time), so an edited file changes
//! the key without its content ever being read.

use std::collections::BTreeMap;
use std::fs;
use std::time::UNIX_EPOCH;

use camino::Utf8Path;

use crate::codec;
use crate::control::Controls;
use crate::error::CodecError;
use crate::hash::Hash32;
use crate::value::Value;

/// `{path, size, mtime}` record of a regular file, `None` for anything else.
pub fn file_fingerprint(path: &Utf8Path) -> Option<Value> {
    let meta = fs::metadata(path).ok().filter(|m| m.is_file())?;

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(Value::Null, |d| Value::Str(d.as_nanos().to_string()));

    Some(Value::map([
        ("path", Value::from(path)),
        ("size", Value::Str(meta.len().to_string())),
        ("mtime", mtime),
    ]))
}

/// Copy of `value` with file paths fingerprinted and nulls dropped.
pub fn fingerprint(value: &Value) -> Value {
    match value {
        Value::Map(map) => Value::Map(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), fingerprint(v)))
                .collect(),
        ),
        Value::List(items) => Value::List(fingerprint_all(items)),
        Value::Tuple(items) => Value::Tuple(fingerprint_all(items)),
        Value::Str(s) => file_fingerprint(Utf8Path::new(s)).unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

fn fingerprint_all(items: &[Value]) -> Vec<Value> {
    items
        .iter()
        .filter(|v| !v.is_null())
        .map(fingerprint)
        .collect()
}

/// The value a set of inputs is hashed as.
pub fn hashed_inputs(inputs: &Controls) -> Value {
    let hashed: BTreeMap<String, Value> = inputs
        .iter()
        .filter_map(|(name, control)| control.hashed_value().map(|v| (name.to_string(), v)))
        .collect();

    fingerprint(&Value::Map(hashed))
}

pub(crate) fn input_hash(inputs: &Controls) -> Result<Hash32, CodecError> {
    let text = codec::to_canonical_string(&hashed_inputs(inputs))?;
    Ok(Hash32::hash(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Control;
    use camino::Utf8PathBuf;

    #[test]
    fn test_fingerprint_replaces_files() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        let file = dir.join("data.txt");
        fs::write(&file, "12345").unwrap();

        let value = Value::map([
            ("1", Value::list([Value::from(file.as_str()), Value::Int(156)])),
            ("2", Value::tuple([Value::from(dir.as_str())])),
            ("3", Value::Null),
        ]);

        let out = fingerprint(&value);
        let map = out.as_map().unwrap();

        let record = map["1"].as_seq().unwrap()[0].as_map().unwrap();
        assert_eq!(record["path"], Value::from(file.as_str()));
        assert_eq!(record["size"], Value::from("5"));
        // directories are left alone
        assert_eq!(map["2"], Value::tuple([Value::from(dir.as_str())]));
        assert!(!map.contains_key("3"));
    }

    #[test]
    fn test_excluded_input_not_hashed() {
        let mut inputs = Controls::new()
            .with("a", Control::scalar().with_value(1))
            .with("b", Control::scalar().exclude_from_hash().with_value(2));

        let before = input_hash(&inputs).unwrap();
        inputs.set("b", 3);
        assert_eq!(before, input_hash(&inputs).unwrap());
        inputs.set("a", 4);
        assert_ne!(before, input_hash(&inputs).unwrap());
    }
}
