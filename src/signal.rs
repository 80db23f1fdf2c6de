//! Publish/subscribe primitives used to announce state changes.
//!
//! An [`Observable`] declares the signal names it may emit up front.
//! Observers register against one of those names and are invoked
//! synchronously, in registration order, every time the signal is notified.
//! A locked bus swallows notifications and reports that nothing was
//! delivered.

use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::Deref;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::SignalError;

/// Callback registered against a signal.
pub type Observer = Arc<dyn Fn(&Signal) + Send + Sync>;

/// What an observer receives: the signal name and the payload fields given
/// to [`Observable::notify_observers`].
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub signal: String,
    pub payload: Map<String, Value>,
}

impl Signal {
    /// Payload field by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }
}

pub struct Observable {
    allowed: Vec<String>,
    observers: HashMap<String, Vec<Observer>>,
    locked: bool,
}

impl Observable {
    pub fn new<I, S>(signals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: signals.into_iter().map(Into::into).collect(),
            observers: HashMap::new(),
            locked: false,
        }
    }

    pub fn allowed_signals(&self) -> &[String] {
        &self.allowed
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// While locked, notifications are not delivered.
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    fn check_allowed(&self, signal: &str) -> Result<(), SignalError> {
        if self.allowed.iter().any(|s| s == signal) {
            Ok(())
        } else {
            Err(SignalError::NotAllowed {
                signal: signal.to_string(),
                allowed: self.allowed.join(", "),
            })
        }
    }

    /// Registers `observer` for `signal`. Registering the same observer twice
    /// is a no-op.
    pub fn add_observer(&mut self, signal: &str, observer: Observer) -> Result<(), SignalError> {
        self.check_allowed(signal)?;

        let list = self.observers.entry(signal.to_string()).or_default();
        if !list.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            list.push(observer);
        }

        Ok(())
    }

    /// Unregisters `observer` from `signal`, returns whether it was present.
    pub fn remove_observer(&mut self, signal: &str, observer: &Observer) -> Result<bool, SignalError> {
        self.check_allowed(signal)?;

        let Some(list) = self.observers.get_mut(signal) else {
            return Ok(false);
        };

        let before = list.len();
        list.retain(|o| !Arc::ptr_eq(o, observer));
        Ok(list.len() != before)
    }

    /// Invokes every observer of `signal` with the given payload.
    ///
    /// Returns `Ok(false)` without invoking anything when the bus is locked.
    /// An undeclared signal is an error whether or not the bus is locked.
    pub fn notify_observers<I, K>(&self, signal: &str, payload: I) -> Result<bool, SignalError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.check_allowed(signal)?;

        if self.locked {
            return Ok(false);
        }

        let event = Signal {
            signal: signal.to_string(),
            payload: payload.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        };

        if let Some(list) = self.observers.get(signal) {
            for observer in list {
                observer(&event);
            }
        }

        Ok(true)
    }
}

impl Debug for Observable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("allowed", &self.allowed)
            .field(
                "observers",
                &self
                    .observers
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.len()))
                    .collect::<HashMap<_, _>>(),
            )
            .field("locked", &self.locked)
            .finish()
    }
}

/// Signals emitted by every [`ObservableList`].
pub const LIST_SIGNALS: [&str; 4] = ["append", "insert", "pop", "remove"];

/// An ordered sequence that emits `append`, `insert`, `pop` and `remove`
/// after each structural mutation.
///
/// The mutation is applied before observers run, so they always see the
/// post-mutation list through whatever handle they hold.
pub struct ObservableList<T> {
    items: Vec<T>,
    observable: Observable,
}

impl<T> ObservableList<T>
where
    T: Serialize,
{
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            observable: Observable::new(LIST_SIGNALS),
        }
    }

    pub fn add_observer(&mut self, signal: &str, observer: Observer) -> Result<(), SignalError> {
        self.observable.add_observer(signal, observer)
    }

    pub fn remove_observer(&mut self, signal: &str, observer: &Observer) -> Result<bool, SignalError> {
        self.observable.remove_observer(signal, observer)
    }

    pub fn observable(&self) -> &Observable {
        &self.observable
    }

    pub fn observable_mut(&mut self) -> &mut Observable {
        &mut self.observable
    }

    fn emit(&self, signal: &str, index: Option<usize>, value: &T) -> Result<bool, SignalError> {
        let value = serde_json::to_value(value)
            .map_err(|e| SignalError::Payload(signal.to_string(), e))?;

        let mut payload = vec![("value", value)];
        if let Some(index) = index {
            payload.push(("index", Value::from(index)));
        }

        self.observable.notify_observers(signal, payload)
    }

    pub fn append(&mut self, value: T) -> Result<(), SignalError> {
        self.items.push(value);
        let value = &self.items[self.items.len() - 1];
        self.emit("append", None, value)?;
        Ok(())
    }

    /// Inserts `value` before `index`; an index past the end appends.
    pub fn insert(&mut self, index: usize, value: T) -> Result<(), SignalError> {
        let index = index.min(self.items.len());
        self.items.insert(index, value);
        self.emit("insert", Some(index), &self.items[index])?;
        Ok(())
    }

    /// Removes the item at `index`, or the last one when `index` is `None`.
    /// Nothing is emitted when there is no such item.
    pub fn pop(&mut self, index: Option<usize>) -> Result<Option<T>, SignalError> {
        let index = match index {
            Some(index) if index < self.items.len() => index,
            Some(_) => return Ok(None),
            None if self.items.is_empty() => return Ok(None),
            None => self.items.len() - 1,
        };

        let value = self.items.remove(index);
        self.emit("pop", Some(index), &value)?;
        Ok(Some(value))
    }

    /// Removes the first item equal to `value`.
    pub fn remove(&mut self, value: &T) -> Result<Option<T>, SignalError>
    where
        T: PartialEq,
    {
        let Some(index) = self.items.iter().position(|item| item == value) else {
            return Ok(None);
        };

        let value = self.items.remove(index);
        self.emit("remove", None, &value)?;
        Ok(Some(value))
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items
    }
}

impl<T> Deref for ObservableList<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

impl<T: PartialEq> PartialEq<Vec<T>> for ObservableList<T> {
    fn eq(&self, other: &Vec<T>) -> bool {
        &self.items == other
    }
}

impl<T: PartialEq> PartialEq<[T]> for ObservableList<T> {
    fn eq(&self, other: &[T]) -> bool {
        self.items == other
    }
}

impl<'a, T> IntoIterator for &'a ObservableList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Debug> Debug for ObservableList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.items).finish()
    }
}
