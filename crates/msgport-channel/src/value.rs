//! The value model carried by messages.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use crate::buffer::{ArrayBuffer, SharedArrayBuffer};
use crate::port::MessagePort;

/// A structured value.
///
/// `Object` and `Array` are reference types: cloning a `Value` that holds one
/// yields another handle to the same container, so graphs may share
/// sub-structure or contain cycles.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i64),
    String(String),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    Object(Object),
    Array(Array),
    ArrayBuffer(ArrayBuffer),
    SharedArrayBuffer(SharedArrayBuffer),
    Port(MessagePort),
}

/// A resource with ownership rules of its own.
///
/// Every transfer-list entry and every resource reached while encoding is
/// classified through this enum.
#[derive(Debug, Clone, Copy)]
pub enum HostObject<'a> {
    /// Single-owner buffer; neutered at the source when transferred.
    Exclusive(&'a ArrayBuffer),
    /// Refcounted shared memory; aliased, never copied or transferred.
    Shared(&'a SharedArrayBuffer),
    /// Channel endpoint; moves only when listed for transfer.
    Port(&'a MessagePort),
}

impl Value {
    /// Build an object from key/value pairs, keeping their order.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let object = Object::new();
        for (key, value) in entries {
            object.set(key, value);
        }
        Value::Object(object)
    }

    /// Build an array from its elements.
    pub fn array<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Value::Array(Array::from_vec(items.into_iter().collect()))
    }

    /// Classify resource values; plain data returns `None`.
    pub fn as_host_object(&self) -> Option<HostObject<'_>> {
        match self {
            Value::ArrayBuffer(buf) => Some(HostObject::Exclusive(buf)),
            Value::SharedArrayBuffer(shared) => Some(HostObject::Shared(shared)),
            Value::Port(port) => Some(HostObject::Port(port)),
            _ => None,
        }
    }

    /// Short name of the value's type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Date(_) => "Date",
            Value::Object(_) => "Object",
            Value::Array(_) => "Array",
            Value::ArrayBuffer(_) => "ArrayBuffer",
            Value::SharedArrayBuffer(_) => "SharedArrayBuffer",
            Value::Port(_) => "MessagePort",
        }
    }

    /// True for `Value::Undefined`.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// The boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The number, if this is one. Dates and bigints are not numbers.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The object handle, if this is an object.
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// The array handle, if this is an array.
    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    /// The buffer handle, if this is an `ArrayBuffer`.
    pub fn as_array_buffer(&self) -> Option<&ArrayBuffer> {
        match self {
            Value::ArrayBuffer(buf) => Some(buf),
            _ => None,
        }
    }

    /// The shared buffer handle, if this is a `SharedArrayBuffer`.
    pub fn as_shared_array_buffer(&self) -> Option<&SharedArrayBuffer> {
        match self {
            Value::SharedArrayBuffer(shared) => Some(shared),
            _ => None,
        }
    }

    /// The port handle, if this is a port.
    pub fn as_port(&self) -> Option<&MessagePort> {
        match self {
            Value::Port(port) => Some(port),
            _ => None,
        }
    }

    /// Convert a JSON document into a value tree.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) if i.unsigned_abs() > (1u64 << 53) => Value::BigInt(i),
                _ => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::array(items.iter().map(Value::from_json)),
            serde_json::Value::Object(map) => {
                Value::object(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))))
            }
        }
    }

    /// Render the value as JSON.
    ///
    /// Containers already being rendered are written as the string
    /// `"[Circular]"`; resources are summarised rather than dumped.
    pub fn to_json(&self) -> serde_json::Value {
        let mut active = HashSet::new();
        to_json_inner(self, &mut active)
    }
}

/// Largest integer an `f64` holds exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn to_json_inner(value: &Value, active: &mut HashSet<usize>) -> serde_json::Value {
    use serde_json::json;

    match value {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER => json!(*n as i64),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::BigInt(i) => json!(i),
        Value::String(s) => json!(s),
        Value::Date(ms) => json!({ "date": ms }),
        Value::Object(object) => {
            if !active.insert(object.identity()) {
                return json!("[Circular]");
            }
            let map = object
                .entries()
                .into_iter()
                .map(|(key, value)| (key, to_json_inner(&value, active)))
                .collect();
            active.remove(&object.identity());
            serde_json::Value::Object(map)
        }
        Value::Array(array) => {
            if !active.insert(array.identity()) {
                return json!("[Circular]");
            }
            let items = array
                .to_vec()
                .iter()
                .map(|item| to_json_inner(item, active))
                .collect();
            active.remove(&array.identity());
            serde_json::Value::Array(items)
        }
        Value::ArrayBuffer(buf) => json!({
            "arrayBuffer": buf.len(),
            "detached": buf.is_detached(),
        }),
        Value::SharedArrayBuffer(shared) => json!({
            "sharedArrayBuffer": shared.len(),
            "memory": shared.memory_id(),
        }),
        Value::Port(port) => json!({ "port": port.id() }),
    }
}

/// Ordered string-keyed property bag.
#[derive(Clone, Default)]
pub struct Object {
    entries: Rc<RefCell<Vec<(String, Value)>>>,
}

impl Object {
    /// An empty object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a property by key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert or replace a property. New keys are appended.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut entries = self.entries.borrow_mut();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => entries.push((key, value)),
        }
    }

    /// Number of own properties.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Property names in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.borrow().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Snapshot of the properties in insertion order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.entries.borrow().clone()
    }

    /// True if both handles refer to the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.entries, &other.entries)
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.entries) as *const () as usize
    }
}

/// Dense ordered list of values.
#[derive(Clone, Default)]
pub struct Array {
    items: Rc<RefCell<Vec<Value>>>,
}

impl Array {
    /// An empty array.
    pub fn new() -> Self {
        Self::default()
    }

    /// An array holding `items`.
    pub fn from_vec(items: Vec<Value>) -> Self {
        Self {
            items: Rc::new(RefCell::new(items)),
        }
    }

    /// Append `value`.
    pub fn push(&self, value: Value) {
        self.items.borrow_mut().push(value);
    }

    /// Element at `index`, or `None` when out of range.
    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.borrow().get(index).cloned()
    }

    /// Replace the element at `index`. Returns false when out of bounds.
    pub fn set(&self, index: usize, value: Value) -> bool {
        match self.items.borrow_mut().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// Snapshot of the elements.
    pub fn to_vec(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }

    /// True if both handles refer to the same array.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.items, &other.items)
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.items) as *const () as usize
    }
}

// Pairs of containers already assumed equal. Revisiting a pair means the walk
// went around a cycle on both sides at once.
type Visited = HashSet<(usize, usize)>;

fn values_eq(a: &Value, b: &Value, visited: &mut Visited) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) | (Value::Date(x), Value::Date(y)) => {
            x == y || (x.is_nan() && y.is_nan())
        }
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => {
            if x.ptr_eq(y) || !visited.insert((x.identity(), y.identity())) {
                return true;
            }
            let (left, right) = (x.entries(), y.entries());
            left.len() == right.len()
                && left
                    .iter()
                    .zip(&right)
                    .all(|((ka, va), (kb, vb))| ka == kb && values_eq(va, vb, visited))
        }
        (Value::Array(x), Value::Array(y)) => {
            if x.ptr_eq(y) || !visited.insert((x.identity(), y.identity())) {
                return true;
            }
            let (left, right) = (x.to_vec(), y.to_vec());
            left.len() == right.len()
                && left
                    .iter()
                    .zip(&right)
                    .all(|(va, vb)| values_eq(va, vb, visited))
        }
        (Value::ArrayBuffer(x), Value::ArrayBuffer(y)) => {
            x.ptr_eq(y) || (x.is_detached() == y.is_detached() && x.to_vec() == y.to_vec())
        }
        (Value::SharedArrayBuffer(x), Value::SharedArrayBuffer(y)) => x.same_memory(y),
        (Value::Port(x), Value::Port(y)) => x.ptr_eq(y),
        _ => false,
    }
}

impl PartialEq for Value {
    /// Structural equality. Containers compare by contents, cycles included;
    /// shared buffers compare by memory and ports by identity.
    fn eq(&self, other: &Self) -> bool {
        values_eq(self, other, &mut Visited::new())
    }
}

const DEBUG_DEPTH: usize = 6;

struct Nested<'a> {
    value: &'a Value,
    depth: usize,
}

impl fmt::Debug for Nested<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depth = self.depth;
        match self.value {
            Value::Object(_) | Value::Array(_) if depth >= DEBUG_DEPTH => f.write_str(".."),
            Value::Object(object) => f
                .debug_map()
                .entries(object.entries().iter().map(|(k, v)| {
                    (
                        k.clone(),
                        Nested {
                            value: v,
                            depth: depth + 1,
                        },
                    )
                }))
                .finish(),
            Value::Array(array) => f
                .debug_list()
                .entries(array.to_vec().iter().map(|v| Nested {
                    value: v,
                    depth: depth + 1,
                }))
                .finish(),
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::BigInt(i) => write!(f, "{i}n"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Date(ms) => write!(f, "Date({ms})"),
            Value::ArrayBuffer(buf) => fmt::Debug::fmt(buf, f),
            Value::SharedArrayBuffer(shared) => fmt::Debug::fmt(shared, f),
            Value::Port(port) => fmt::Debug::fmt(port, f),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nested = Nested {
            value: self,
            depth: 0,
        };
        fmt::Debug::fmt(&nested, f)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::Object(self.clone()), f)
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::Array(self.clone()), f)
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

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(object)
    }
}

impl From<Array> for Value {
    fn from(array: Array) -> Self {
        Value::Array(array)
    }
}

impl From<ArrayBuffer> for Value {
    fn from(buf: ArrayBuffer) -> Self {
        Value::ArrayBuffer(buf)
    }
}

impl From<SharedArrayBuffer> for Value {
    fn from(shared: SharedArrayBuffer) -> Self {
        Value::SharedArrayBuffer(shared)
    }
}

impl From<MessagePort> for Value {
    fn from(port: MessagePort) -> Self {
        Value::Port(port)
    }
}
