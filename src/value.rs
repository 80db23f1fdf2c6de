use std::collections::BTreeMap;
use std::fmt::Display;

/// Dynamic value held by a box slot.
///
/// Tuples are kept apart from lists so that fixed-arity records survive a
/// trip through the cache. Numeric arrays compare equal to their nested list
/// form.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Array(NdArray),
}

/// Dense row-major array of floats.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl NdArray {
    /// Returns `None` when `data` doesn't hold exactly as many elements as
    /// `shape` describes.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Option<Self> {
        if shape.iter().product::<usize>() != data.len() {
            return None;
        }
        Some(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Nested lists of floats, one nesting level per dimension.
    pub fn to_nested(&self) -> Value {
        fn nest(shape: &[usize], data: &[f64]) -> Value {
            match shape {
                [] => data.first().map_or(Value::Null, |x| Value::Float(*x)),
                [_] => Value::List(data.iter().map(|x| Value::Float(*x)).collect()),
                [n, rest @ ..] => {
                    let stride = rest.iter().product::<usize>();
                    Value::List(
                        (0..*n)
                            .map(|i| nest(rest, &data[i * stride..(i + 1) * stride]))
                            .collect(),
                    )
                }
            }
        }

        nest(&self.shape, &self.data)
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Items of a list or a tuple.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(items.into_iter().collect())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn map<K: Into<String>>(items: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(items.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Array(a), b) => &a.to_nested() == b,
            (a, Value::Array(b)) => a == &b.to_nested(),
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<&camino::Utf8Path> for Value {
    fn from(value: &camino::Utf8Path) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<camino::Utf8PathBuf> for Value {
    fn from(value: camino::Utf8PathBuf) -> Self {
        Value::Str(value.into_string())
    }
}

impl From<NdArray> for Value {
    fn from(value: NdArray) -> Self {
        Value::Array(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join(f: &mut std::fmt::Formatter<'_>, items: &[Value]) -> std::fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                join(f, items)?;
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                join(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key:?}: {value}")?;
                }
                write!(f, "}}")
            }
            Value::Array(array) => write!(f, "{}", array.to_nested()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_shape_checked() {
        assert!(NdArray::new(vec![2, 3], vec![0.0; 5]).is_none());
        assert!(NdArray::new(vec![2, 3], vec![0.0; 6]).is_some());
    }

    #[test]
    fn test_array_equals_nested_list() {
        let array = NdArray::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let nested = Value::list([
            Value::list([Value::Float(1.0), Value::Float(2.0)]),
            Value::list([Value::Float(3.0), Value::Float(4.0)]),
        ]);
        assert_eq!(Value::Array(array.clone()), nested);
        assert_eq!(nested, Value::Array(array));
    }

    #[test]
    fn test_tuple_is_not_list() {
        let items = [Value::Int(1), Value::Int(2)];
        assert_ne!(Value::tuple(items.clone()), Value::list(items));
    }

    #[test]
    fn test_display() {
        let value = Value::map([
            ("a", Value::tuple([Value::Int(1)])),
            ("b", Value::from("x")),
        ]);
        assert_eq!(value.to_string(), r#"{"a": (1,), "b": "x"}"#);
    }
}
