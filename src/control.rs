//! Declared input and output slots of a box.
//!
//! A [`Control`] holds one value plus the flags the cache cares about. Its
//! [`Shape`] tells how flags propagate into the value: through the single
//! inner control of a list, or through the named children of a nested
//! record.

use std::collections::BTreeMap;

use crate::value::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// The slot may be left unset.
    pub optional: bool,
    /// The slot never takes part in the cache key.
    pub exclude_from_hash: bool,
    /// Files referenced by the slot are copied into the cache entry.
    pub copy_to_cache: bool,
}

#[derive(Debug, Clone)]
pub enum Shape {
    Scalar,
    /// Iterable slot, every item is described by the inner control.
    List(Box<Control>),
    /// Record slot with one control per field.
    Nested(BTreeMap<String, Control>),
}

#[derive(Debug, Clone)]
pub struct Control {
    pub value: Value,
    pub flags: Flags,
    pub shape: Shape,
}

impl Control {
    pub fn scalar() -> Self {
        Self {
            value: Value::Null,
            flags: Flags::default(),
            shape: Shape::Scalar,
        }
    }

    pub fn list(inner: Control) -> Self {
        Self {
            value: Value::List(Vec::new()),
            flags: Flags::default(),
            shape: Shape::List(Box::new(inner)),
        }
    }

    pub fn nested<K: Into<String>>(fields: impl IntoIterator<Item = (K, Control)>) -> Self {
        Self {
            value: Value::Map(BTreeMap::new()),
            flags: Flags::default(),
            shape: Shape::Nested(fields.into_iter().map(|(k, c)| (k.into(), c)).collect()),
        }
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = value.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.flags.optional = true;
        self
    }

    pub fn exclude_from_hash(mut self) -> Self {
        self.flags.exclude_from_hash = true;
        self
    }

    pub fn copy_to_cache(mut self) -> Self {
        self.flags.copy_to_cache = true;
        self
    }

    pub fn set(&mut self, value: impl Into<Value>) {
        self.value = value.into();
    }

    /// Inner control of a list slot.
    pub fn inner(&self) -> Option<&Control> {
        match &self.shape {
            Shape::List(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn inner_mut(&mut self) -> Option<&mut Control> {
        match &mut self.shape {
            Shape::List(inner) => Some(inner),
            _ => None,
        }
    }

    /// Whether this slot is kept out of the cache key, either directly or
    /// because the items of a list slot are.
    pub fn excluded_from_hash(&self) -> bool {
        if self.flags.exclude_from_hash {
            return true;
        }

        match &self.shape {
            Shape::List(inner) => inner.excluded_from_hash(),
            Shape::Scalar | Shape::Nested(_) => false,
        }
    }

    /// The part of the current value that takes part in the cache key.
    pub fn hashed_value(&self) -> Option<Value> {
        self.filter_hashed(&self.value)
    }

    fn filter_hashed(&self, value: &Value) -> Option<Value> {
        if self.excluded_from_hash() {
            return None;
        }

        Some(match (&self.shape, value) {
            (Shape::List(inner), Value::List(items)) => Value::List(
                items
                    .iter()
                    .filter_map(|item| inner.filter_hashed(item))
                    .collect(),
            ),
            (Shape::Nested(fields), Value::Map(map)) => Value::Map(
                map.iter()
                    .filter_map(|(key, item)| match fields.get(key) {
                        Some(field) => field.filter_hashed(item).map(|v| (key.clone(), v)),
                        None => Some((key.clone(), item.clone())),
                    })
                    .collect(),
            ),
            _ => value.clone(),
        })
    }

    /// Parts of the current value flagged for copying into the cache.
    pub fn copied_values(&self) -> Vec<&Value> {
        let mut acc = Vec::new();
        self.collect_copied(&self.value, &mut acc);
        acc
    }

    fn collect_copied<'a>(&self, value: &'a Value, acc: &mut Vec<&'a Value>) {
        if self.flags.copy_to_cache {
            acc.push(value);
            return;
        }

        match (&self.shape, value) {
            (Shape::List(inner), Value::List(items)) => {
                for item in items {
                    inner.collect_copied(item, acc);
                }
            }
            (Shape::Nested(fields), Value::Map(map)) => {
                for (key, item) in map {
                    if let Some(field) = fields.get(key) {
                        field.collect_copied(item, acc);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Named slots of one side (inputs or outputs) of a box.
#[derive(Debug, Clone, Default)]
pub struct Controls(BTreeMap<String, Control>);

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, control: Control) -> Self {
        self.0.insert(name.into(), control);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, control: Control) {
        self.0.insert(name.into(), control);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Control> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Control> {
        self.0.get_mut(name)
    }

    /// Current value of slot `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.0.get(name).map(|c| &c.value)
    }

    /// Sets slot `name`, returns `false` if there is no such slot.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> bool {
        match self.0.get_mut(name) {
            Some(control) => {
                control.set(value);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Control)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Every slot name with its current value.
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.0
            .iter()
            .map(|(k, c)| (k.clone(), c.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclude_follows_list_inner() {
        let mut control = Control::list(Control::scalar());
        assert!(!control.excluded_from_hash());

        control.inner_mut().unwrap().flags.exclude_from_hash = true;
        assert!(control.excluded_from_hash());
        assert!(control.hashed_value().is_none());
    }

    #[test]
    fn test_nested_fields_filtered() {
        let control = Control::nested([
            ("keep", Control::scalar()),
            ("drop", Control::scalar().exclude_from_hash()),
        ])
        .with_value(Value::map([
            ("keep", Value::Int(1)),
            ("drop", Value::Int(2)),
            ("free", Value::Int(3)),
        ]));

        assert_eq!(
            control.hashed_value(),
            Some(Value::map([("keep", Value::Int(1)), ("free", Value::Int(3))]))
        );
    }

    #[test]
    fn test_list_of_records_filtered() {
        let record = Control::nested([("seed", Control::scalar().exclude_from_hash())]);
        let control = Control::list(record).with_value(Value::list([
            Value::map([("seed", Value::Int(1)), ("x", Value::Int(10))]),
            Value::map([("seed", Value::Int(2)), ("x", Value::Int(20))]),
        ]));

        assert_eq!(
            control.hashed_value(),
            Some(Value::list([
                Value::map([("x", Value::Int(10))]),
                Value::map([("x", Value::Int(20))]),
            ]))
        );
    }

    #[test]
    fn test_copied_values() {
        let plain = Control::scalar().with_value("a.txt");
        assert!(plain.copied_values().is_empty());

        let flagged = Control::scalar().copy_to_cache().with_value("a.txt");
        assert_eq!(flagged.copied_values(), [&Value::from("a.txt")]);

        let list = Control::list(Control::scalar().copy_to_cache())
            .with_value(Value::list([Value::from("a"), Value::from("b")]));
        assert_eq!(list.copied_values().len(), 2);
    }

    #[test]
    fn test_controls_set() {
        let mut controls = Controls::new().with("inp", Control::scalar());
        assert!(controls.set("inp", "slip"));
        assert!(!controls.set("missing", 1));
        assert_eq!(controls.value("inp"), Some(&Value::from("slip")));
        assert_eq!(controls.values().len(), 1);
    }
}
