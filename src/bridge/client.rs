//! Caller end of the sandbox bridge, with lazy remote references.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::host::{GLOBAL_ROOT, INTERNAL_ROOT};
use super::protocol::{parse_reference_descriptor, RpcRequest, RpcResponse, RPC_CHANNEL, RPC_REQ, RPC_RES};
use super::transport::{BroadcastChannel, ChannelHub};
use super::value::{sanitize_args, LocalValue};
use crate::error::RpcError;
use crate::util;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Outstanding calls by id. An entry is removed by whichever comes first: its
/// response or its timeout.
pub struct PendingCalls<T> {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<T>>>>,
}

impl<T> Clone for PendingCalls<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for PendingCalls<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> PendingCalls<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<T>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, id: &str) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), tx);
        rx
    }

    /// Hand a response to its waiter. Unknown or expired ids are dropped.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        match self.lock().remove(id) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct BridgeClient {
    client_id: String,
    seq: AtomicU64,
    pending: PendingCalls<RpcResponse>,
    channel: BroadcastChannel,
    timeout: Duration,
    listener: JoinHandle<()>,
}

impl BridgeClient {
    /// Join the bridge channel on `hub`. Must be called inside a tokio runtime.
    pub fn connect(hub: &ChannelHub, timeout: Duration) -> Arc<Self> {
        let client_id = util::random_client_id("hb-client-", "-");
        let channel = hub.open(RPC_CHANNEL);
        let pending = PendingCalls::default();
        let listener = tokio::spawn(listen(
            channel.subscribe(),
            client_id.clone(),
            pending.clone(),
        ));
        Arc::new(Self {
            client_id,
            seq: AtomicU64::new(0),
            pending,
            channel,
            timeout,
            listener,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}:{seq}", self.client_id)
    }

    /// Raw call: resolve `root.path` on the host and call it with `args`.
    pub async fn call_raw(&self, root: &str, path: &[String], args: Vec<Value>) -> Result<Value, RpcError> {
        let id = self.next_id();
        let request = RpcRequest {
            kind: RPC_REQ.to_string(),
            id: id.clone(),
            client_id: Some(self.client_id.clone()),
            root: root.to_string(),
            path: path.to_vec(),
            args,
        };
        let message = serde_json::to_value(&request).map_err(|e| RpcError::InvalidRequest(e.to_string()))?;

        let rx = self.pending.register(&id);
        if !self.channel.post_message(message) {
            log::warn!("bridge request {id} has no listener; waiting for timeout");
        }
        let outcome = tokio::time::timeout(self.timeout, rx).await;
        self.pending.forget(&id);
        match outcome {
            Err(_) => Err(RpcError::Timeout),
            Ok(Err(_)) => Err(RpcError::Closed),
            Ok(Ok(response)) if response.ok => Ok(response.result.unwrap_or(Value::Null)),
            Ok(Ok(response)) => Err(RpcError::Remote(
                response.error.unwrap_or_else(|| "RPC call failed".to_string()),
            )),
        }
    }

    /// Call with caller-side arguments; descriptors in the result become [`RemoteRef`]s.
    pub async fn call(
        self: &Arc<Self>,
        root: &str,
        path: &[String],
        args: &[LocalValue],
    ) -> Result<RemoteValue, RpcError> {
        let result = self.call_raw(root, path, sanitize_args(args)).await?;
        Ok(RemoteValue::decode(self, result))
    }

    pub fn root(self: &Arc<Self>, root: &str) -> RemoteRef {
        RemoteRef {
            client: Arc::clone(self),
            root: root.to_string(),
            path: Vec::new(),
        }
    }

    /// Handle on one installed host global, through the all-globals root.
    pub fn global(self: &Arc<Self>, name: &str) -> RemoteRef {
        self.root(GLOBAL_ROOT).get(name)
    }

    pub async fn list_globals(self: &Arc<Self>) -> Result<Vec<String>, RpcError> {
        let value = self
            .call_raw(INTERNAL_ROOT, &["listGlobals".to_string()], Vec::new())
            .await?;
        Ok(value
            .as_array()
            .map(|keys| keys.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default())
    }

    pub async fn has_global(self: &Arc<Self>, name: &str) -> Result<bool, RpcError> {
        let value = self
            .call_raw(INTERNAL_ROOT, &["hasGlobal".to_string()], vec![Value::from(name)])
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(mut rx: broadcast::Receiver<Value>, client_id: String, pending: PendingCalls<RpcResponse>) {
    loop {
        let data = match rx.recv().await {
            Ok(data) => data,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("bridge client {client_id} lagged, {n} messages dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if data.get("type").and_then(Value::as_str) != Some(RPC_RES) {
            continue;
        }
        let Ok(response) = serde_json::from_value::<RpcResponse>(data) else {
            continue;
        };
        if response.client_id.as_deref().is_some_and(|c| c != client_id) {
            continue;
        }
        let id = response.id.clone();
        pending.resolve(&id, response);
    }
}

/// What a bridge call produced.
#[derive(Debug, Clone)]
pub enum RemoteValue {
    Data(Value),
    Ref(RemoteRef),
}

impl RemoteValue {
    fn decode(client: &Arc<BridgeClient>, value: Value) -> Self {
        match parse_reference_descriptor(&value) {
            Some((root, path)) => RemoteValue::Ref(RemoteRef {
                client: Arc::clone(client),
                root,
                path,
            }),
            None => RemoteValue::Data(value),
        }
    }

    pub fn into_data(self) -> Option<Value> {
        match self {
            RemoteValue::Data(v) => Some(v),
            RemoteValue::Ref(_) => None,
        }
    }
}

/// `(root, path)` handle on the host's object graph. Nothing is sent until
/// [`RemoteRef::call`] or [`RemoteRef::value`].
#[derive(Clone)]
pub struct RemoteRef {
    client: Arc<BridgeClient>,
    root: String,
    path: Vec<String>,
}

impl RemoteRef {
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn get(&self, prop: &str) -> RemoteRef {
        let mut path = self.path.clone();
        path.push(prop.to_string());
        RemoteRef {
            client: Arc::clone(&self.client),
            root: self.root.clone(),
            path,
        }
    }

    pub async fn call(&self, args: &[LocalValue]) -> Result<RemoteValue, RpcError> {
        self.client.call(&self.root, &self.path, args).await
    }

    /// Read the value without calling it.
    pub async fn value(&self) -> Result<RemoteValue, RpcError> {
        self.client.call(&self.root, &self.path, &[]).await
    }
}

impl std::fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRef")
            .field("root", &self.root)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::RpcResponse;
    use serde_json::json;

    #[test]
    fn test_pending_resolves_once() {
        let pending: PendingCalls<RpcResponse> = PendingCalls::default();
        let mut rx = pending.register("c:1");
        let response = RpcResponse::success("c:1".into(), Some("c".into()), json!(1));
        assert!(pending.resolve("c:1", response.clone()));
        assert!(!pending.resolve("c:1", response));
        assert!(pending.is_empty());
        assert_eq!(rx.try_recv().unwrap().result, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_ids_are_sequential_and_prefixed() {
        let hub = ChannelHub::new();
        let client = BridgeClient::connect(&hub, DEFAULT_RPC_TIMEOUT);
        let a = client.next_id();
        let b = client.next_id();
        assert_eq!(a, format!("{}:1", client.client_id()));
        assert_eq!(b, format!("{}:2", client.client_id()));
    }

    #[tokio::test]
    async fn test_times_out_without_host() {
        let hub = ChannelHub::new();
        let client = BridgeClient::connect(&hub, Duration::from_millis(50));
        let err = client.call_raw("ST_API", &[], Vec::new()).await.unwrap_err();
        assert_eq!(err, RpcError::Timeout);
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_ignores_other_clients_responses() {
        let hub = ChannelHub::new();
        let client = BridgeClient::connect(&hub, Duration::from_millis(200));
        let channel = hub.open(RPC_CHANNEL);
        let mut requests = channel.subscribe();
        let own = client.client_id().to_string();

        let responder = tokio::spawn(async move {
            let req = requests.recv().await.unwrap();
            let id = req["id"].as_str().unwrap().to_string();
            channel.post_message(
                serde_json::to_value(RpcResponse::success(id.clone(), Some("someone-else".into()), json!("wrong")))
                    .unwrap(),
            );
            channel.post_message(
                serde_json::to_value(RpcResponse::success(id, Some(own), json!("right"))).unwrap(),
            );
        });

        let out = client.call_raw("ST_API", &[], Vec::new()).await.unwrap();
        assert_eq!(out, json!("right"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_descriptor_becomes_remote_ref() {
        let hub = ChannelHub::new();
        let client = BridgeClient::connect(&hub, DEFAULT_RPC_TIMEOUT);
        let value = RemoteValue::decode(
            &client,
            json!({"__hb_rpc_function__": true, "root": "ST_API", "path": ["chat", "send"]}),
        );
        match value {
            RemoteValue::Ref(r) => {
                assert_eq!(r.root(), "ST_API");
                assert_eq!(r.path(), ["chat", "send"]);
                assert_eq!(r.get("x").path(), ["chat", "send", "x"]);
            }
            RemoteValue::Data(v) => panic!("expected a reference, got {v}"),
        }
        assert!(RemoteValue::decode(&client, json!({"root": "x"})).into_data().is_some());
    }
}
