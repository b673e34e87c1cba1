//! Dynamic value model observed by watchers.
//!
//! Scope state records store `Value`s and watch getters return them.
//! Collections are `Rc`-shared so reference-mode comparison can use pointer
//! identity and `watch_collection` can hand listeners the live collection.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::collections::map::HashMap;

/// How a watcher compares the freshly evaluated value against the last one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EqualityMode {
    /// Pointer identity for collections, value comparison for primitives.
    /// `NaN` compares equal to `NaN` so a stable NaN never reads as dirty.
    Reference,
    /// Structural comparison, element/key-wise, `NaN == NaN`.
    ///
    /// Dirty watchers in this mode store a deep copy of the new value, which
    /// is O(n) per dirty watcher per digest. That cost is part of the
    /// observable contract (in-place mutation is detected) and is kept as-is.
    Deep,
}

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<HashMap<String, Value>>>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn num(n: f64) -> Self {
        Value::Num(n)
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn map() -> Self {
        Value::Map(Rc::new(RefCell::new(HashMap::default())))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<Rc<str>> {
        match self {
            Value::Str(s) => Some(Rc::clone(s)),
            _ => None,
        }
    }

    /// Appends to a `List` value in place. Returns false for non-lists.
    pub fn push(&self, item: Value) -> bool {
        match self {
            Value::List(items) => {
                items.borrow_mut().push(item);
                true
            }
            _ => false,
        }
    }

    /// Inserts into a `Map` value in place. Returns false for non-maps.
    pub fn insert(&self, key: impl Into<String>, item: Value) -> bool {
        match self {
            Value::Map(entries) => {
                entries.borrow_mut().insert(key.into(), item);
                true
            }
            _ => false,
        }
    }

    /// Removes a key from a `Map` value in place.
    pub fn remove(&self, key: &str) -> Option<Value> {
        match self {
            Value::Map(entries) => entries.borrow_mut().remove(key),
            _ => None,
        }
    }

    /// Map lookup by key; `None` for non-maps or absent keys.
    pub fn get_item(&self, key: &str) -> Option<Value> {
        match self {
            Value::Map(entries) => entries.borrow().get(key).cloned(),
            _ => None,
        }
    }

    /// Recursive copy into fresh `Rc`s. Primitives are plain clones.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::List(items) => Value::List(Rc::new(RefCell::new(
                items.borrow().iter().map(Value::deep_copy).collect(),
            ))),
            Value::Map(entries) => Value::Map(Rc::new(RefCell::new(
                entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            ))),
            other => other.clone(),
        }
    }
}

/// One-level copy: collections get a fresh outer `Rc`, elements stay shared.
pub fn shallow_copy(value: &Value) -> Value {
    match value {
        Value::List(items) => Value::List(Rc::new(RefCell::new(items.borrow().clone()))),
        Value::Map(entries) => Value::Map(Rc::new(RefCell::new(entries.borrow().clone()))),
        other => other.clone(),
    }
}

#[inline]
fn nums_equal(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// Identity comparison: primitives by value, collections by pointer.
pub fn reference_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => nums_equal(*x, *y),
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Map(x), Value::Map(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Structural comparison, element/key-wise, `NaN == NaN`.
pub fn deep_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let x = x.borrow();
            let y = y.borrow();
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| deep_equals(a, b))
        }
        (Value::Map(x), Value::Map(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let x = x.borrow();
            let y = y.borrow();
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| deep_equals(v, w)).unwrap_or(false))
        }
        _ => reference_equals(a, b),
    }
}

pub fn values_equal(a: &Value, b: &Value, mode: EqualityMode) -> bool {
    match mode {
        EqualityMode::Reference => reference_equals(a, b),
        EqualityMode::Deep => deep_equals(a, b),
    }
}

/// `==` is structural (`deep_equals`); use [`reference_equals`] for identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        deep_equals(self, other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Num(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_stable_in_both_modes() {
        let a = Value::num(f64::NAN);
        let b = Value::num(f64::NAN);
        assert!(reference_equals(&a, &b));
        assert!(deep_equals(&a, &b));
        assert!(!reference_equals(&a, &Value::num(1.0)));
    }

    #[test]
    fn reference_mode_uses_pointer_identity_for_collections() {
        let list = Value::list(vec![Value::num(1.0)]);
        let same = list.clone();
        let other = Value::list(vec![Value::num(1.0)]);
        assert!(reference_equals(&list, &same));
        assert!(!reference_equals(&list, &other));
        assert!(deep_equals(&list, &other));
    }

    #[test]
    fn deep_equals_compares_map_key_sets() {
        let a = Value::map();
        a.insert("x", Value::num(1.0));
        let b = Value::map();
        b.insert("x", Value::num(1.0));
        assert!(deep_equals(&a, &b));
        b.insert("y", Value::Null);
        assert!(!deep_equals(&a, &b));
    }

    #[test]
    fn deep_copy_is_independent() {
        let list = Value::list(vec![Value::num(1.0)]);
        let copy = list.deep_copy();
        list.push(Value::num(2.0));
        assert!(!deep_equals(&list, &copy));
    }

    #[test]
    fn shallow_copy_shares_elements() {
        let inner = Value::list(vec![Value::num(1.0)]);
        let outer = Value::list(vec![inner.clone()]);
        let copy = shallow_copy(&outer);
        assert!(!reference_equals(&outer, &copy));
        // mutating the shared inner list is visible through the copy
        inner.push(Value::num(2.0));
        assert!(deep_equals(&outer, &copy));
    }
}
