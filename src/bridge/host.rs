//! Host end of the sandbox bridge.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::dedup::HandledIds;
use super::protocol::{RpcResponse, RPC_CHANNEL, RPC_REQ};
use super::transport::{BroadcastChannel, ChannelHub};
use super::value::{host_fn, HostValue};
use crate::registry::Registry;

pub const GLOBAL_ROOT: &str = "__HB_GLOBAL__";
pub const INTERNAL_ROOT: &str = "__HB_INTERNAL__";

const UNSAFE_SEGMENTS: [&str; 3] = ["__proto__", "prototype", "constructor"];

/// Every segment is a non-empty string that is not a prototype accessor.
pub fn is_safe_path(path: &Value) -> bool {
    let Some(segments) = path.as_array() else {
        return false;
    };
    segments.iter().all(|seg| {
        seg.as_str()
            .is_some_and(|s| !s.is_empty() && !UNSAFE_SEGMENTS.contains(&s))
    })
}

pub struct RpcHost {
    registry: Arc<Registry>,
    handled: HandledIds,
    installed: AtomicBool,
}

impl RpcHost {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            handled: HandledIds::default(),
            installed: AtomicBool::new(false),
        }
    }

    fn internal_api(&self) -> HostValue {
        let list_registry = Arc::clone(&self.registry);
        let has_registry = Arc::clone(&self.registry);
        HostValue::object([
            (
                "listGlobals".to_string(),
                host_fn(move |_| {
                    let keys = list_registry.keys();
                    async move { Ok(HostValue::Data(Value::from(keys))) }
                }),
            ),
            (
                "hasGlobal".to_string(),
                host_fn(move |args| {
                    let key = match args.first() {
                        Some(Value::String(s)) => s.trim().to_string(),
                        Some(Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    };
                    let found = !key.is_empty() && has_registry.contains(&key);
                    async move { Ok(HostValue::Data(Value::Bool(found))) }
                }),
            ),
        ])
    }

    /// Resolve an allow-listed root name.
    fn root(&self, root: &str) -> Option<HostValue> {
        match root {
            "ST_API" | "SillyTavern" => self.registry.get(root),
            "Higanbana" => self
                .registry
                .get("Higanbana")
                .or_else(|| self.registry.get("higanbana")),
            "higanbana" => self
                .registry
                .get("higanbana")
                .or_else(|| self.registry.get("Higanbana")),
            GLOBAL_ROOT => Some(self.registry.snapshot()),
            INTERNAL_ROOT => Some(self.internal_api()),
            _ => None,
        }
    }

    /// Walk `root.path`; call it if it is a function, otherwise read it.
    pub async fn invoke(&self, root: &str, path: &[String], args: Vec<Value>) -> Result<Value, String> {
        let base = self
            .root(root)
            .filter(|v| !v.is_null())
            .ok_or_else(|| format!("RPC root not found: {root}"))?;
        let dotted = || format!("{root}.{}", path.join("."));

        let mut target = Some(base);
        for seg in path {
            target = match target {
                Some(v) if !v.is_null() => v.child(seg),
                _ => return Err(format!("RPC path not found: {}", dotted())),
            };
        }

        let result = match target {
            Some(HostValue::Function(f)) => f(args).await?,
            _ if !args.is_empty() => return Err(format!("RPC target is not a function: {}", dotted())),
            Some(other) => other,
            None => HostValue::Data(Value::Null),
        };
        Ok(result.into_wire(root, path))
    }

    /// Answer one raw channel message. `None` for non-requests and repeated ids.
    pub async fn handle_message(&self, data: &Value) -> Option<RpcResponse> {
        if data.get("type").and_then(Value::as_str) != Some(RPC_REQ) {
            return None;
        }
        let text = |key: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };
        let id = text("id");
        let root = text("root");
        let client_id = data
            .get("clientId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let path_value = data.get("path").cloned().unwrap_or(Value::Null);

        if id.is_empty() || root.is_empty() || !is_safe_path(&path_value) {
            log::warn!("rejecting malformed bridge request {id:?} for root {root:?}");
            let id = if id.is_empty() { "invalid".to_string() } else { id };
            return Some(RpcResponse::failure(id, client_id, "invalid RPC request"));
        }
        if !self.handled.first_delivery(&id) {
            log::debug!("ignoring repeated bridge request {id}");
            return None;
        }

        let path: Vec<String> = path_value
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let args = match data.get("args") {
            Some(Value::Array(a)) => a.clone(),
            _ => Vec::new(),
        };

        Some(match self.invoke(&root, &path, args).await {
            Ok(result) => RpcResponse::success(id, client_id, result),
            Err(e) => {
                log::warn!("bridge call {root}.{} failed: {e}", path.join("."));
                RpcResponse::failure(id, client_id, e)
            }
        })
    }

    /// Start answering requests on the bridge channel. Only the first call installs.
    pub fn install(self: &Arc<Self>, hub: &ChannelHub) -> Option<JoinHandle<()>> {
        if self.installed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let channel = hub.open(RPC_CHANNEL);
        let mut rx = channel.subscribe();
        let host = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(data) => {
                        let host = Arc::clone(&host);
                        let channel = channel.clone();
                        tokio::spawn(async move { host.answer(&channel, data).await });
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("bridge host lagged, {n} messages dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    async fn answer(&self, channel: &BroadcastChannel, data: Value) {
        let Some(response) = self.handle_message(&data).await else {
            return;
        };
        let message = match serde_json::to_value(&response) {
            Ok(v) => v,
            Err(e) => {
                let fallback = RpcResponse::failure(
                    response.id.clone(),
                    response.client_id.clone(),
                    format!("RPC response serialization failed: {e}"),
                );
                match serde_json::to_value(&fallback) {
                    Ok(v) => v,
                    Err(_) => return,
                }
            }
        };
        channel.post_message(message);
    }
}
