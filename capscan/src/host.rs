//! Host value model
//!
//! The host process exposes an opaque, dynamically shaped object graph. This
//! module models that graph with reference-counted handles so that shared
//! nodes and cycles keep their identity, which the walker and the resolver
//! rely on for cycle guarding and de-duplication.
//!
//! Everything here is single-threaded (`Rc` + `RefCell`): the host is driven
//! cooperatively from one thread and never shared across threads.

use futures::future::LocalBoxFuture;
use indexmap::IndexMap;
use serde_json::json;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

/// An error thrown by host code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn not_a_function(key: &str) -> Self {
        Self::new(format!("{} is not a function", key))
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// An asynchronous host return.
pub type LocalHostFuture = LocalBoxFuture<'static, HostResult<HostValue>>;

/// Result of calling a host function that did not throw synchronously.
pub enum Completion {
    /// The call returned a plain value.
    Ready(HostValue),
    /// The call returned something awaitable that may still reject.
    Pending(LocalHostFuture),
}

impl Completion {
    pub fn ready(value: impl Into<HostValue>) -> Self {
        Completion::Ready(value.into())
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = HostResult<HostValue>> + 'static,
    {
        Completion::Pending(Box::pin(future))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Completion::Pending(_))
    }

    /// Wait for the final value.
    pub async fn settle(self) -> HostResult<HostValue> {
        match self {
            Completion::Ready(value) => Ok(value),
            Completion::Pending(future) => future.await,
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Ready(v) => f.debug_tuple("Ready").field(v).finish(),
            Completion::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

type NativeBody = dyn Fn(&HostValue, &[HostValue]) -> HostResult<Completion>;

/// A callable exposed by the host.
pub struct HostFunction {
    name: String,
    arity: usize,
    source: String,
    props: RefCell<IndexMap<String, HostValue>>,
    body: Box<NativeBody>,
}

/// Shared handle to a [`HostFunction`]. Equality is identity.
#[derive(Clone)]
pub struct FunctionRef(Rc<HostFunction>);

impl FunctionRef {
    /// Create a function whose printed source is a synthetic signature.
    pub fn new<F>(name: impl Into<String>, arity: usize, body: F) -> Self
    where
        F: Fn(&HostValue, &[HostValue]) -> HostResult<Completion> + 'static,
    {
        let name = name.into();
        let params: Vec<String> = (0..arity).map(|i| format!("arg{}", i)).collect();
        let source = format!("function {}({}) {{ [native code] }}", name, params.join(", "));
        Self::with_source(name, arity, source, body)
    }

    pub fn with_source<F>(
        name: impl Into<String>,
        arity: usize,
        source: impl Into<String>,
        body: F,
    ) -> Self
    where
        F: Fn(&HostValue, &[HostValue]) -> HostResult<Completion> + 'static,
    {
        FunctionRef(Rc::new(HostFunction {
            name: name.into(),
            arity,
            source: source.into(),
            props: RefCell::new(IndexMap::new()),
            body: Box::new(body),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Declared positional parameter count.
    pub fn arity(&self) -> usize {
        self.0.arity
    }

    /// Printable representation of the function body.
    pub fn source(&self) -> &str {
        &self.0.source
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &FunctionRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.0.props.borrow().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<HostValue>) {
        self.0.props.borrow_mut().insert(key.into(), value.into());
    }

    pub fn entries(&self) -> Vec<(String, HostValue)> {
        self.0
            .props
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Invoke with `this` bound to `receiver`.
    pub fn call(&self, receiver: &HostValue, args: &[HostValue]) -> HostResult<Completion> {
        (self.0.body)(receiver, args)
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Function {}/{}]", self.name(), self.arity())
    }
}

impl PartialEq for FunctionRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

/// Shared, insertion-ordered property bag.
#[derive(Clone, Default)]
pub struct ObjectRef(Rc<RefCell<IndexMap<String, HostValue>>>);

impl ObjectRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<HostValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<IndexMap<_, _>>();
        ObjectRef(Rc::new(RefCell::new(map)))
    }

    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.0.borrow().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<HostValue>) {
        self.0.borrow_mut().insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(String, HostValue)> {
        self.0
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Object {{{}}}]", self.keys().join(", "))
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Shared, growable array.
#[derive(Clone, Default)]
pub struct ArrayRef(Rc<RefCell<Vec<HostValue>>>);

impl ArrayRef {
    pub fn new(items: Vec<HostValue>) -> Self {
        ArrayRef(Rc::new(RefCell::new(items)))
    }

    pub fn push(&self, value: impl Into<HostValue>) {
        self.0.borrow_mut().push(value.into());
    }

    pub fn items(&self) -> Vec<HostValue> {
        self.0.borrow().clone()
    }

    pub fn get(&self, index: usize) -> Option<HostValue> {
        self.0.borrow().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Array({})]", self.len())
    }
}

impl PartialEq for ArrayRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Any value reachable in the host graph.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(ArrayRef),
    Object(ObjectRef),
    Function(FunctionRef),
}

impl HostValue {
    pub fn object<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<HostValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        HostValue::Object(ObjectRef::from_pairs(pairs))
    }

    pub fn array(items: Vec<HostValue>) -> Self {
        HostValue::Array(ArrayRef::new(items))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::Str(_) => "string",
            HostValue::Array(_) => "array",
            HostValue::Object(_) => "object",
            HostValue::Function(_) => "function",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, HostValue::Function(_))
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            HostValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            HostValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            HostValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Identity of reference values; primitives have none.
    pub fn identity(&self) -> Option<usize> {
        match self {
            HostValue::Array(a) => Some(a.identity()),
            HostValue::Object(o) => Some(o.identity()),
            HostValue::Function(f) => Some(f.identity()),
            _ => None,
        }
    }

    /// Property lookup. Arrays accept decimal indices.
    pub fn get(&self, key: &str) -> Option<HostValue> {
        match self {
            HostValue::Object(o) => o.get(key),
            HostValue::Function(f) => f.get(key),
            HostValue::Array(a) => key.parse::<usize>().ok().and_then(|i| a.get(i)),
            _ => None,
        }
    }

    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<HostValue> {
        let mut current = self.clone();
        for segment in path {
            current = current.get(segment.as_ref())?;
        }
        Some(current)
    }

    /// Own enumerable edges of this node.
    pub fn entries(&self) -> Vec<(String, HostValue)> {
        match self {
            HostValue::Object(o) => o.entries(),
            HostValue::Function(f) => f.entries(),
            HostValue::Array(a) => a
                .items()
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Shallow key list used by cheap pre-filters.
    pub fn keys(&self) -> Vec<String> {
        match self {
            HostValue::Object(o) => o.keys(),
            HostValue::Function(f) => f.entries().into_iter().map(|(k, _)| k).collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_function(&self, key: &str) -> bool {
        self.get(key).map(|v| v.is_callable()).unwrap_or(false)
    }

    /// Call the method stored under `key` with `self` as receiver.
    pub fn call_method(&self, key: &str, args: &[HostValue]) -> HostResult<Completion> {
        match self.get(key) {
            Some(HostValue::Function(f)) => f.call(self, args),
            _ => Err(HostError::not_a_function(key)),
        }
    }

    /// Bounded JSON rendering for logs and diagnostics.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_bounded(3)
    }

    fn to_json_bounded(&self, depth: usize) -> serde_json::Value {
        match self {
            HostValue::Undefined | HostValue::Null => serde_json::Value::Null,
            HostValue::Bool(b) => json!(b),
            HostValue::Number(n) => json!(n),
            HostValue::Str(s) => json!(s),
            HostValue::Function(f) => json!(format!("[Function {}]", f.name())),
            _ if depth == 0 => json!(format!("[{}]", self.type_name())),
            HostValue::Array(a) => serde_json::Value::Array(
                a.items()
                    .iter()
                    .map(|v| v.to_json_bounded(depth - 1))
                    .collect(),
            ),
            HostValue::Object(o) => {
                let map = o
                    .entries()
                    .into_iter()
                    .map(|(k, v)| (k, v.to_json_bounded(depth - 1)))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(map)
            }
        }
    }

    /// Build a fresh host value tree from JSON data.
    pub fn from_json(value: &serde_json::Value) -> HostValue {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(*b),
            serde_json::Value::Number(n) => HostValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => HostValue::Str(s.clone()),
            serde_json::Value::Array(items) => {
                HostValue::array(items.iter().map(HostValue::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                HostValue::object(map.iter().map(|(k, v)| (k.clone(), HostValue::from_json(v))))
            }
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => write!(f, "undefined"),
            HostValue::Null => write!(f, "null"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Number(n) => write!(f, "{}", n),
            HostValue::Str(s) => write!(f, "{}", s),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::Str(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::Str(s)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<i64> for HostValue {
    fn from(n: i64) -> Self {
        HostValue::Number(n as f64)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<ObjectRef> for HostValue {
    fn from(o: ObjectRef) -> Self {
        HostValue::Object(o)
    }
}

impl From<ArrayRef> for HostValue {
    fn from(a: ArrayRef) -> Self {
        HostValue::Array(a)
    }
}

impl From<FunctionRef> for HostValue {
    fn from(f: FunctionRef) -> Self {
        HostValue::Function(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_survives_clone() {
        let obj = ObjectRef::new();
        let a = HostValue::Object(obj.clone());
        let b = a.clone();
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), HostValue::Object(ObjectRef::new()).identity());
        assert_eq!(HostValue::Number(1.0).identity(), None);
    }

    #[test]
    fn test_call_method_binds_receiver() {
        let obj = ObjectRef::from_pairs([("tag", HostValue::from("inbox"))]);
        obj.set(
            "readTag",
            FunctionRef::new("readTag", 0, |this, _| {
                Ok(Completion::ready(this.get("tag").unwrap_or_default()))
            }),
        );
        let value = HostValue::Object(obj);
        match value.call_method("readTag", &[]).unwrap() {
            Completion::Ready(v) => assert_eq!(v.as_str(), Some("inbox")),
            other => panic!("unexpected completion: {:?}", other),
        }
        assert!(value.call_method("missing", &[]).is_err());
    }

    #[test]
    fn test_cyclic_json_rendering_is_bounded() {
        let obj = ObjectRef::new();
        obj.set("self", obj.clone());
        let rendered = HostValue::Object(obj).to_json();
        assert!(rendered.get("self").is_some());
    }

    #[test]
    fn test_array_index_lookup() {
        let arr = HostValue::array(vec![HostValue::from("a"), HostValue::from("b")]);
        assert_eq!(arr.get("1").and_then(|v| v.as_str().map(String::from)), Some("b".into()));
        assert_eq!(arr.entries().len(), 2);
    }
}
