//! Values stored on scopes and the comparator used to detect changes.
//!
//! Scalars are compared by value. [`List`] and [`Map`] are shared containers:
//! cloning a [`Value`] that holds one aliases the same storage, so a container
//! can be mutated in place and every holder observes it. Whether a watcher
//! notices such an in-place mutation depends on its [`CompareMode`]:
//!
//! - [`CompareMode::Reference`] compares containers by identity (and treats two
//!   NaNs as equal).
//! - [`CompareMode::Deep`] compares structurally; the digest stores a detached
//!   deep copy so later mutations of the live container are visible.

use crate::hash::FastHashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

/// How a watcher decides whether its value changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareMode {
    /// Identity for containers, value equality for scalars, NaN equals NaN.
    #[default]
    Reference,
    /// Structural equality; the stored copy is a deep clone.
    Deep,
}

impl CompareMode {
    /// Returns true if `new` should be considered unchanged relative to `old`.
    pub fn are_equal(self, new: &Value, old: &Value) -> bool {
        match self {
            CompareMode::Reference => new.identical(old),
            CompareMode::Deep => new.deep_eq(old),
        }
    }

    /// Produces the copy a watcher keeps for its next comparison.
    pub(crate) fn snapshot(self, value: &Value) -> Value {
        match self {
            CompareMode::Reference => value.clone(),
            CompareMode::Deep => value.deep_clone(),
        }
    }
}

/// A dynamically typed value held in a scope's state bag.
#[derive(Clone, Default)]
pub enum Value {
    /// Absent value; what a lookup of an unknown key returns.
    #[default]
    Undefined,
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Double precision number (NaN allowed).
    Number(f64),
    /// Immutable string.
    String(Arc<str>),
    /// Shared, mutable list.
    List(List),
    /// Shared, mutable string-keyed map.
    Map(Map),
}

impl Value {
    /// Creates a list value holding `items`.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::List(List::from_iter(items.into_iter().map(Into::into)))
    }

    /// Creates a map value holding `entries`, in iteration order.
    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Map(Map::from_iter(
            entries.into_iter().map(|(k, v)| (k.into(), v.into())),
        ))
    }

    /// Reference-mode equality.
    ///
    /// Scalars compare by value, containers by identity. Two NaN numbers are
    /// considered identical.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a.ptr_eq(b),
            (Value::Map(a), Value::Map(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Structural equality. Map key order is ignored and NaN equals NaN.
    ///
    /// Self-containing values are supported: a pair of containers met again
    /// while still being compared counts as equal.
    pub fn deep_eq(&self, other: &Value) -> bool {
        deep_eq_in(self, other, &mut Vec::new())
    }

    /// Copies the value recursively; the result shares no container with `self`.
    ///
    /// A container reached twice is copied once, so shared and cyclic
    /// structure is reproduced in the copy. Like the original, a cyclic copy
    /// keeps itself alive until one of its cycles is broken.
    pub fn deep_clone(&self) -> Value {
        deep_clone_in(self, &mut FastHashMap::default())
    }

    /// Copies the outer container only; elements are aliased.
    pub fn shallow_clone(&self) -> Value {
        match self {
            Value::List(list) => Value::List(List::from_iter(list.to_vec())),
            Value::Map(map) => Value::Map(Map::from_iter(map.entries())),
            other => other.clone(),
        }
    }

    /// True for [`Value::Undefined`].
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// True for a NaN number.
    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Number(n) if n.is_nan())
    }

    /// The number, if this is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The string slice, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// A handle to the list, if this is one.
    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// A handle to the map, if this is one.
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// Deep equality, so tests and callers can use `==` on snapshots.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.deep_eq(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = RefCell::new(Vec::new());
        fmt::Debug::fmt(&Tracked { value: self, path: &path }, f)
    }
}

// Recursion helpers. Container locks are released before descending, and the
// addresses of the containers on the current path (or already copied) stop
// the walk on cycles.

fn deep_eq_in(a: &Value, b: &Value, comparing: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::List(a), Value::List(b)) => {
            if a.ptr_eq(b) {
                return true;
            }
            let pair = (a.addr(), b.addr());
            if comparing.contains(&pair) {
                return true;
            }
            let (a, b) = (a.to_vec(), b.to_vec());
            if a.len() != b.len() {
                return false;
            }
            comparing.push(pair);
            let equal = a.iter().zip(&b).all(|(x, y)| deep_eq_in(x, y, comparing));
            comparing.pop();
            equal
        }
        (Value::Map(a), Value::Map(b)) => {
            if a.ptr_eq(b) {
                return true;
            }
            let pair = (a.addr(), b.addr());
            if comparing.contains(&pair) {
                return true;
            }
            let a_entries = a.entries();
            let b_entries = b.0.read().clone();
            if a_entries.len() != b_entries.len() {
                return false;
            }
            comparing.push(pair);
            let equal = a_entries.iter().all(|(key, x)| {
                b_entries
                    .get(key)
                    .is_some_and(|y| deep_eq_in(x, y, comparing))
            });
            comparing.pop();
            equal
        }
        _ => a.identical(b),
    }
}

fn deep_clone_in(value: &Value, copies: &mut FastHashMap<usize, Value>) -> Value {
    match value {
        Value::List(list) => {
            if let Some(copy) = copies.get(&list.addr()) {
                return copy.clone();
            }
            let copy = List::new();
            copies.insert(list.addr(), Value::List(copy.clone()));
            for item in list.to_vec() {
                let item = deep_clone_in(&item, copies);
                copy.push(item);
            }
            Value::List(copy)
        }
        Value::Map(map) => {
            if let Some(copy) = copies.get(&map.addr()) {
                return copy.clone();
            }
            let copy = Map::new();
            copies.insert(map.addr(), Value::Map(copy.clone()));
            for (key, item) in map.entries() {
                let item = deep_clone_in(&item, copies);
                copy.insert(key, item);
            }
            Value::Map(copy)
        }
        other => other.clone(),
    }
}

/// Debug view that prints `[...]`/`{...}` for a container already being
/// printed further up.
struct Tracked<'a> {
    value: &'a Value,
    path: &'a RefCell<Vec<usize>>,
}

impl Tracked<'_> {
    fn enter(&self, addr: usize) -> bool {
        let mut path = self.path.borrow_mut();
        if path.contains(&addr) {
            return false;
        }
        path.push(addr);
        true
    }

    fn leave(&self) {
        self.path.borrow_mut().pop();
    }
}

impl fmt::Debug for Tracked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(list) => {
                if !self.enter(list.addr()) {
                    return f.write_str("[...]");
                }
                let items = list.to_vec();
                let result = f
                    .debug_list()
                    .entries(items.iter().map(|value| Tracked {
                        value,
                        path: self.path,
                    }))
                    .finish();
                self.leave();
                result
            }
            Value::Map(map) => {
                if !self.enter(map.addr()) {
                    return f.write_str("{...}");
                }
                let entries = map.entries();
                let result = f
                    .debug_map()
                    .entries(entries.iter().map(|(key, value)| {
                        (
                            key,
                            Tracked {
                                value,
                                path: self.path,
                            },
                        )
                    }))
                    .finish();
                self.leave();
                result
            }
        }
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Undefined
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<List> for Value {
    fn from(list: List) -> Self {
        Value::List(list)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Shared, interior-mutable list. Clones alias the same storage.
#[derive(Clone, Default)]
pub struct List(Arc<RwLock<Vec<Value>>>);

impl List {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if both handles point at the same storage.
    pub fn ptr_eq(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Appends a value in place.
    pub fn push(&self, value: impl Into<Value>) {
        self.0.write().push(value.into());
    }

    /// Replaces the element at `index`; returns false if out of bounds.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> bool {
        match self.0.write().get_mut(index) {
            Some(slot) => {
                *slot = value.into();
                true
            }
            None => false,
        }
    }

    /// Removes and returns the last element.
    pub fn pop(&self) -> Option<Value> {
        self.0.write().pop()
    }

    /// The element at `index`.
    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.read().get(index).cloned()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// True if the list has no elements.
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// A copy of the current elements (containers inside are aliased).
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.read().clone()
    }
}

impl FromIterator<Value> for List {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        List(Arc::new(RwLock::new(iter.into_iter().collect())))
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::List(self.clone()), f)
    }
}

/// Shared, interior-mutable map preserving insertion order.
#[derive(Clone, Default)]
pub struct Map(Arc<RwLock<IndexMap<String, Value>>>);

impl Map {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if both handles point at the same storage.
    pub fn ptr_eq(&self, other: &Map) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.write().insert(key.into(), value.into())
    }

    /// Removes `key`, preserving the order of the remaining entries.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.write().shift_remove(key)
    }

    /// The value under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.read().get(key).cloned()
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.read().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// True if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.0.read().keys().cloned().collect()
    }

    /// A copy of the entries in insertion order (containers inside are aliased).
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl FromIterator<(String, Value)> for Map {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Map(Arc::new(RwLock::new(iter.into_iter().collect())))
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::Map(self.clone()), f)
    }
}
