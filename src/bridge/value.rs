//! Values on either side of the sandbox bridge.

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use super::protocol::{self, CYCLE_MARKER, UNSERIALIZABLE_MARKER};

pub type HostResult = Result<HostValue, String>;
pub type HostFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HostResult> + Send + Sync>;

/// A node of the host object graph reachable through the bridge.
///
/// `Data` is sent by value. `Object` and `Function` are only ever handed out as
/// `(root, path)` descriptors.
#[derive(Clone)]
pub enum HostValue {
    Data(Value),
    Object(Arc<BTreeMap<String, HostValue>>),
    Function(HostFn),
}

impl HostValue {
    pub fn object(entries: impl IntoIterator<Item = (String, HostValue)>) -> Self {
        HostValue::Object(Arc::new(entries.into_iter().collect()))
    }

    /// Property lookup. `None` plays the part of `undefined`.
    pub fn child(&self, segment: &str) -> Option<HostValue> {
        match self {
            HostValue::Object(map) => map.get(segment).cloned(),
            HostValue::Data(Value::Object(map)) => map.get(segment).cloned().map(HostValue::Data),
            HostValue::Data(Value::Array(items)) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .map(HostValue::Data),
            HostValue::Data(_) | HostValue::Function(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Data(Value::Null))
    }

    /// Wire form of a result reached at `root.path`.
    pub fn into_wire(self, root: &str, path: &[String]) -> Value {
        match self {
            HostValue::Data(v) => v,
            HostValue::Function(_) => {
                protocol::reference_descriptor(protocol::FUNCTION_MARKER, root, path)
            }
            HostValue::Object(_) => protocol::reference_descriptor(protocol::OBJECT_MARKER, root, path),
        }
    }
}

impl From<Value> for HostValue {
    fn from(v: Value) -> Self {
        HostValue::Data(v)
    }
}

impl std::fmt::Debug for HostValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostValue::Data(v) => f.debug_tuple("Data").field(v).finish(),
            HostValue::Object(map) => f.debug_tuple("Object").field(&map.keys().collect::<Vec<_>>()).finish(),
            HostValue::Function(_) => f.write_str("Function"),
        }
    }
}

/// Wrap an async closure as a callable host value.
pub fn host_fn<F, Fut>(f: F) -> HostValue
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HostResult> + Send + 'static,
{
    HostValue::Function(Arc::new(move |args| Box::pin(f(args))))
}

pub type SharedValue = Arc<Mutex<LocalValue>>;

/// A caller-side argument before it is made serializable.
#[derive(Debug, Clone)]
pub enum LocalValue {
    Json(Value),
    Array(Vec<LocalValue>),
    Object(Vec<(String, LocalValue)>),
    /// A node with identity; may be referenced from several places, itself included.
    Shared(SharedValue),
    Function,
    Window,
    Document,
    Element { tag: String },
}

impl LocalValue {
    pub fn shared(value: LocalValue) -> SharedValue {
        Arc::new(Mutex::new(value))
    }
}

impl From<Value> for LocalValue {
    fn from(v: Value) -> Self {
        LocalValue::Json(v)
    }
}

/// Make one argument serializable. Non-data values become markers; a node seen
/// before in this argument becomes a cycle marker.
pub fn sanitize(value: &LocalValue) -> Value {
    sanitize_inner(value, &mut HashSet::new())
}

fn sanitize_inner(value: &LocalValue, seen: &mut HashSet<usize>) -> Value {
    match value {
        LocalValue::Json(v) => v.clone(),
        LocalValue::Array(items) => Value::Array(items.iter().map(|v| sanitize_inner(v, seen)).collect()),
        LocalValue::Object(entries) => {
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), sanitize_inner(v, seen));
            }
            Value::Object(out)
        }
        LocalValue::Shared(node) => {
            let key = Arc::as_ptr(node) as usize;
            if !seen.insert(key) {
                return json!({ CYCLE_MARKER: true });
            }
            let inner = node.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            sanitize_inner(&inner, seen)
        }
        LocalValue::Function => json!({ UNSERIALIZABLE_MARKER: "function" }),
        LocalValue::Window => json!({ UNSERIALIZABLE_MARKER: "window" }),
        LocalValue::Document => json!({ UNSERIALIZABLE_MARKER: "document" }),
        LocalValue::Element { tag } => {
            json!({ UNSERIALIZABLE_MARKER: "element", "tag": tag.to_ascii_lowercase() })
        }
    }
}

pub fn sanitize_args(args: &[LocalValue]) -> Vec<Value> {
    args.iter().map(sanitize).collect()
}
