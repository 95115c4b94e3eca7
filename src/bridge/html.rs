//! Host-page bridge: enveloped project and CSRF operations for framed documents.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::client::PendingCalls;
use super::dedup::HandledIds;
use super::protocol::{
    is_envelope, BridgeOp, BridgeRequest, BridgeResponse, ENVELOPE_TAG, ENVELOPE_VERSION, HTML_BRIDGE_CHANNEL,
    IFRAME_HEIGHT,
};
use super::transport::{BroadcastChannel, ChannelHub, PortMessage, WindowHandle};
use crate::error::RpcError;
use crate::projects::{ProjectError, ProjectInput, ProjectService};
use crate::registry::Registry;
use crate::util;
use crate::vfs_format::zip_sha256_from_vfs_url;

pub const MIN_IFRAME_HEIGHT: f64 = 80.0;
pub const MAX_IFRAME_HEIGHT: f64 = 10_000.0;
pub const DEFAULT_HTML_BRIDGE_TIMEOUT: Duration = Duration::from_millis(120_000);
const MIN_HTML_BRIDGE_TIMEOUT: Duration = Duration::from_millis(1_000);
const CSRF_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Loose string coercion for envelope fields: strings as-is, numbers and booleans printed, else empty.
fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn to_json<T: serde::Serialize>(result: Result<T, ProjectError>) -> Result<Value, String> {
    result
        .map_err(|e| e.to_string())
        .and_then(|out| serde_json::to_value(out).map_err(|e| e.to_string()))
}

/// Where the CSRF token comes from: the host's request headers, else `GET <origin>/csrf-token`.
pub struct CsrfSource {
    headers: HashMap<String, String>,
    origin: Option<String>,
    client: reqwest::Client,
}

impl CsrfSource {
    pub fn new(headers: HashMap<String, String>, origin: Option<String>) -> Self {
        Self {
            headers,
            origin: origin.map(|o| o.trim_end_matches('/').to_string()),
            client: reqwest::Client::new(),
        }
    }

    pub async fn token(&self) -> Result<String, String> {
        let from_headers = self
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("x-csrf-token"))
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty());
        if let Some(token) = from_headers {
            return Ok(token);
        }
        let Some(origin) = &self.origin else {
            return Ok(String::new());
        };
        let response = self
            .client
            .get(format!("{origin}/csrf-token"))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let body: Option<Value> = response.json().await.ok();
        Ok(body
            .as_ref()
            .and_then(|b| b.get("token"))
            .map(|t| text(Some(t)))
            .unwrap_or_default())
    }
}

/// Project a message most likely concerns, derived from its sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectHint {
    pub project_id: String,
    pub zip_sha256: String,
}

impl ProjectHint {
    pub fn from_source(source: Option<&WindowHandle>) -> Self {
        let Some(window) = source else {
            return Self::default();
        };
        match window.frame() {
            Some(frame) => Self {
                project_id: frame.project_id.trim().to_string(),
                zip_sha256: zip_sha256_from_vfs_url(&frame.vfs_home_url).unwrap_or_default(),
            },
            None => Self {
                project_id: String::new(),
                zip_sha256: zip_sha256_from_vfs_url(window.href()).unwrap_or_default(),
            },
        }
    }

    /// Fill absent targets from the hint.
    fn apply(&self, input: &mut ProjectInput) {
        let pick = |given: &Option<String>, hint: &str| -> Option<String> {
            given
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .or(Some(hint).filter(|s| !s.is_empty()))
                .map(str::to_string)
        };
        input.target_project_id = pick(&input.target_project_id, &self.project_id);
        input.target_zip_sha256 = pick(&input.target_zip_sha256, &self.zip_sha256);
    }
}

pub struct HtmlBridgeServer {
    projects: Arc<ProjectService>,
    registry: Arc<Registry>,
    csrf: CsrfSource,
    handled: HandledIds,
    heights: Mutex<HashMap<String, f64>>,
    installed: AtomicBool,
}

impl HtmlBridgeServer {
    pub fn new(projects: Arc<ProjectService>, registry: Arc<Registry>, csrf: CsrfSource) -> Self {
        Self {
            projects,
            registry,
            csrf,
            handled: HandledIds::default(),
            heights: Mutex::new(HashMap::new()),
            installed: AtomicBool::new(false),
        }
    }

    /// Last height reported by the iframe named `name`.
    pub fn iframe_height(&self, name: &str) -> Option<f64> {
        self.heights
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .copied()
    }

    fn apply_iframe_height(&self, data: &Value) {
        let name = text(data.get("iframeName")).trim().to_string();
        if name.is_empty() {
            return;
        }
        let height = match data.get("height") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        let Some(height) = height.filter(|h| h.is_finite()) else {
            return;
        };
        let clamped = height.clamp(MIN_IFRAME_HEIGHT, MAX_IFRAME_HEIGHT);
        log::trace!("iframe {name} height {clamped}px");
        self.heights
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name, clamped);
    }

    async fn call_st_api(&self, payload: &Value) -> Result<Value, String> {
        let endpoint = text(payload.get("endpoint"));
        let params = match payload.get("params") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(v) => v.clone(),
        };
        if !endpoint.contains('.') {
            return Err("Invalid endpoint".to_string());
        }
        let api = self
            .registry
            .get("ST_API")
            .filter(|v| !v.is_null())
            .ok_or_else(|| "ST_API not available".to_string())?;
        let parts: Vec<&str> = endpoint.split('.').collect();
        let [ns, method] = parts.as_slice() else {
            return Err("Invalid endpoint format".to_string());
        };
        let target = api.child(ns).and_then(|n| n.child(method));
        let Some(super::value::HostValue::Function(f)) = target else {
            return Err(format!("ST_API.{ns}.{method} is not available"));
        };
        let result = f(vec![params]).await?;
        Ok(result.into_wire("ST_API", &[ns.to_string(), method.to_string()]))
    }

    async fn dispatch(&self, op: &str, payload: &Value, source: Option<&WindowHandle>) -> Result<Value, String> {
        let Some(op) = BridgeOp::parse(op) else {
            return Err(format!("Unsupported op: {op}"));
        };
        let input = || ProjectInput::from_value(payload.clone()).map_err(|e| e.to_string());
        match op {
            BridgeOp::GetCsrfToken => self.csrf.token().await.map(Value::String),
            BridgeOp::CallStApi => self.call_st_api(payload).await,
            BridgeOp::GetProject => {
                let mut input = input()?;
                if !input.include_all.unwrap_or(false) {
                    ProjectHint::from_source(source).apply(&mut input);
                }
                to_json(self.projects.get_project(&input))
            }
            BridgeOp::CreateProject => to_json(self.projects.create_project(input()?).await),
            BridgeOp::UpdateProject => {
                let mut input = input()?;
                ProjectHint::from_source(source).apply(&mut input);
                to_json(self.projects.update_project(input).await)
            }
            BridgeOp::DeleteProject => {
                let mut input = input()?;
                ProjectHint::from_source(source).apply(&mut input);
                to_json(self.projects.delete_project(input).await)
            }
        }
    }

    /// Answer one request envelope. Never fails; errors travel in the response.
    pub async fn handle_request(&self, req: &BridgeRequest, source: Option<&WindowHandle>) -> BridgeResponse {
        if req.id.is_empty() {
            return BridgeResponse::failure("", "Missing id");
        }
        match self.dispatch(&req.op, &req.payload, source).await {
            Ok(data) => BridgeResponse::success(&req.id, data),
            Err(e) => {
                log::warn!("html bridge op {} failed: {e}", req.op);
                BridgeResponse::failure(&req.id, e)
            }
        }
    }

    /// Filter and answer one raw message from either transport.
    pub async fn on_message(&self, data: &Value, source: Option<&WindowHandle>) -> Option<BridgeResponse> {
        if !data.is_object() {
            return None;
        }
        if data.get("type").and_then(Value::as_str) == Some(IFRAME_HEIGHT) {
            self.apply_iframe_height(data);
            return None;
        }
        if !is_envelope(data, "req") {
            return None;
        }
        let req = BridgeRequest {
            tag: ENVELOPE_TAG.to_string(),
            v: ENVELOPE_VERSION,
            kind: "req".to_string(),
            id: text(data.get("id")),
            op: text(data.get("op")),
            payload: match data.get("payload") {
                Some(p @ Value::Object(_)) => p.clone(),
                _ => Value::Object(Map::new()),
            },
        };

        // Broadcast copies of destructive ops carry no sender to infer the project
        // from; only act on them when they name their target.
        let destructive = BridgeOp::parse(&req.op).is_some_and(BridgeOp::is_destructive);
        if destructive && source.is_none() {
            let named_id = !text(req.payload.get("targetProjectId")).trim().is_empty();
            let named_zip = !text(req.payload.get("targetZipSha256")).trim().is_empty();
            let allow_zip = truthy(req.payload.get("__hbAllowBroadcastZipTarget"));
            if !named_id && !(allow_zip && named_zip) {
                log::debug!("waiting for direct copy of {} {}", req.op, req.id);
                return None;
            }
        }
        if req.id.is_empty() {
            return None;
        }
        if !self.handled.first_delivery(&req.id) {
            log::debug!("ignoring repeated html bridge request {}", req.id);
            return None;
        }
        Some(self.handle_request(&req, source).await)
    }

    /// Listen on the broadcast channel and on the host window's inbox. Only the first call installs.
    pub fn install(
        self: &Arc<Self>,
        hub: &ChannelHub,
        mut inbox: mpsc::UnboundedReceiver<PortMessage>,
    ) -> Option<JoinHandle<()>> {
        if self.installed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let channel = hub.open(HTML_BRIDGE_CHANNEL);
        let mut rx = channel.subscribe();
        let server = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                let (data, source) = tokio::select! {
                    msg = rx.recv() => match msg {
                        Ok(data) => (data, None),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("html bridge lagged, {n} messages dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    msg = inbox.recv() => match msg {
                        Some(PortMessage { data, source }) => (data, source),
                        None => break,
                    },
                };
                let server = Arc::clone(&server);
                let channel = channel.clone();
                tokio::spawn(async move {
                    let Some(response) = server.on_message(&data, source.as_ref()).await else {
                        return;
                    };
                    let Ok(message) = serde_json::to_value(&response) else {
                        return;
                    };
                    channel.post_message(message.clone());
                    if let Some(source) = source {
                        source.post_message(message, None);
                    }
                });
            }
        }))
    }
}

/// Transports a framed document can reach the host through.
pub struct HtmlTransports<'a> {
    pub hub: Option<&'a ChannelHub>,
    pub window: WindowHandle,
    pub inbox: mpsc::UnboundedReceiver<PortMessage>,
    pub parent: Option<WindowHandle>,
    pub opener: Option<WindowHandle>,
}

fn deliver(pending: &PendingCalls<BridgeResponse>, data: Value) {
    if !is_envelope(&data, "res") {
        return;
    }
    if let Ok(response) = serde_json::from_value::<BridgeResponse>(data) {
        let id = response.id.clone();
        pending.resolve(&id, response);
    }
}

/// Document-side client of the host-page bridge.
pub struct HtmlBridgeClient {
    ctx_id: String,
    seq: AtomicU64,
    pending: PendingCalls<BridgeResponse>,
    channel: Option<BroadcastChannel>,
    window: WindowHandle,
    parent: Option<WindowHandle>,
    opener: Option<WindowHandle>,
    default_timeout: Duration,
    listeners: Vec<JoinHandle<()>>,
}

impl HtmlBridgeClient {
    pub fn connect(transports: HtmlTransports<'_>, default_timeout: Duration) -> Self {
        let HtmlTransports {
            hub,
            window,
            mut inbox,
            parent,
            opener,
        } = transports;
        let pending = PendingCalls::default();
        let mut listeners = Vec::new();

        let channel = hub.map(|h| h.open(HTML_BRIDGE_CHANNEL));
        if let Some(channel) = &channel {
            let mut rx = channel.subscribe();
            let pending = pending.clone();
            listeners.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(data) => deliver(&pending, data),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        {
            let pending = pending.clone();
            listeners.push(tokio::spawn(async move {
                while let Some(msg) = inbox.recv().await {
                    deliver(&pending, msg.data);
                }
            }));
        }

        let other = |w: Option<WindowHandle>| w.filter(|w| !w.same_window(&window));
        let parent = other(parent);
        let opener = other(opener);
        Self {
            ctx_id: util::random_client_id("hb_", "_"),
            seq: AtomicU64::new(0),
            pending,
            channel,
            window,
            parent,
            opener,
            default_timeout,
            listeners,
        }
    }

    pub fn ctx_id(&self) -> &str {
        &self.ctx_id
    }

    /// Send `op` on every transport and wait for the first answer.
    pub async fn request(&self, op: &str, payload: Value, timeout: Option<Duration>) -> Result<Value, RpcError> {
        if self.channel.is_none() && self.parent.is_none() && self.opener.is_none() {
            return Err(RpcError::ChannelUnavailable("HB bridge unavailable".to_string()));
        }
        let id = format!("{}:{}", self.ctx_id, self.seq.fetch_add(1, Ordering::Relaxed) + 1);
        let message = json!({
            "__hb": ENVELOPE_TAG,
            "v": ENVELOPE_VERSION,
            "kind": "req",
            "id": id,
            "op": op,
            "payload": payload,
        });

        let rx = self.pending.register(&id);
        if let Some(channel) = &self.channel {
            channel.post_message(message.clone());
        }
        for target in [&self.parent, &self.opener].into_iter().flatten() {
            target.post_message(message.clone(), Some(self.window.clone()));
        }

        let timeout = timeout.unwrap_or(self.default_timeout).max(MIN_HTML_BRIDGE_TIMEOUT);
        let outcome = tokio::time::timeout(timeout, rx).await;
        self.pending.forget(&id);
        match outcome {
            Err(_) => Err(RpcError::BridgeTimeout(op.to_string())),
            Ok(Err(_)) => Err(RpcError::Closed),
            Ok(Ok(res)) if res.ok => Ok(res.data.unwrap_or(Value::Null)),
            Ok(Ok(res)) => Err(RpcError::Remote(
                res.error.unwrap_or_else(|| "HB bridge error".to_string()),
            )),
        }
    }

    async fn project_op(&self, op: BridgeOp, input: &ProjectInput) -> Result<Value, RpcError> {
        let payload = serde_json::to_value(input).map_err(|e| RpcError::InvalidRequest(e.to_string()))?;
        self.request(op.as_str(), payload, None).await
    }

    pub async fn get_csrf_token(&self) -> Result<String, RpcError> {
        let token = self
            .request(BridgeOp::GetCsrfToken.as_str(), json!({}), Some(CSRF_TIMEOUT))
            .await?;
        Ok(text(Some(&token)))
    }

    pub async fn call_st_api(&self, endpoint: &str, params: Value) -> Result<Value, RpcError> {
        self.request(
            BridgeOp::CallStApi.as_str(),
            json!({ "endpoint": endpoint, "params": params }),
            None,
        )
        .await
    }

    pub async fn get_project(&self, input: &ProjectInput) -> Result<Value, RpcError> {
        self.project_op(BridgeOp::GetProject, input).await
    }

    pub async fn create_project(&self, input: &ProjectInput) -> Result<Value, RpcError> {
        self.project_op(BridgeOp::CreateProject, input).await
    }

    pub async fn update_project(&self, input: &ProjectInput) -> Result<Value, RpcError> {
        self.project_op(BridgeOp::UpdateProject, input).await
    }

    pub async fn delete_project(&self, input: &ProjectInput) -> Result<Value, RpcError> {
        self.project_op(BridgeOp::DeleteProject, input).await
    }
}

impl Drop for HtmlBridgeClient {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::{window, FrameInfo};
    use crate::bridge::value::{host_fn, HostValue};
    use crate::projects::{CardData, CardStore, MemoryCardStore, Project, ProjectDefaults, ProjectSource};
    use crate::store::VfsStore;

    fn project(id: &str, placeholder: &str, sha: &str) -> Project {
        Project {
            id: id.into(),
            title: None,
            placeholder: placeholder.into(),
            home_page: "index.html".into(),
            show_title_in_chat: false,
            fix_root_relative_urls: true,
            zip_name: "webzip.zip".into(),
            zip_sha256: sha.into(),
            source: ProjectSource::Local,
        }
    }

    fn setup(headers: &[(&str, &str)]) -> (tempfile::TempDir, Arc<HtmlBridgeServer>, Arc<MemoryCardStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VfsStore::open(dir.path()).unwrap());
        let cards = Arc::new(MemoryCardStore::new(CardData {
            projects: vec![project("p1", "A", "sha1"), project("p2", "B", "sha2")],
        }));
        let projects = Arc::new(ProjectService::new(
            store,
            cards.clone(),
            "http://127.0.0.1:8787/",
            ProjectDefaults {
                placeholder: "{{WEB_HOME}}".into(),
                fix_root_relative_urls: true,
                embedded_zip_max_bytes: 1 << 20,
            },
        ));
        let registry = Arc::new(Registry::new());
        registry.install(
            "ST_API",
            HostValue::object([(
                "chat".to_string(),
                HostValue::object([(
                    "echo".to_string(),
                    host_fn(|args| async move { Ok(HostValue::Data(args.into_iter().next().unwrap_or_default())) }),
                )]),
            )]),
        );
        let headers = headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let csrf = CsrfSource::new(headers, None);
        (dir, Arc::new(HtmlBridgeServer::new(projects, registry, csrf)), cards)
    }

    fn req(id: &str, op: &str, payload: Value) -> Value {
        json!({"__hb": "higanbana", "v": 1, "kind": "req", "id": id, "op": op, "payload": payload})
    }

    #[tokio::test]
    async fn test_csrf_from_headers() {
        let (_d, server, _) = setup(&[("X-CSRF-Token", "tok")]);
        let res = server.on_message(&req("1", "getCsrfToken", json!({})), None).await.unwrap();
        assert_eq!(res.data, Some(json!("tok")));

        let (_d, server, _) = setup(&[]);
        let res = server.on_message(&req("1", "getCsrfToken", json!({})), None).await.unwrap();
        assert_eq!(res.data, Some(json!("")));
    }

    #[tokio::test]
    async fn test_call_st_api_rules() {
        let (_d, server, _) = setup(&[]);
        let call = |id: &str, endpoint: &str| req(id, "callSTAPI", json!({"endpoint": endpoint, "params": {"x": 1}}));

        let ok = server.on_message(&call("1", "chat.echo"), None).await.unwrap();
        assert_eq!(ok.data, Some(json!({"x": 1})));
        let bad = server.on_message(&call("2", "chat"), None).await.unwrap();
        assert_eq!(bad.error.as_deref(), Some("Invalid endpoint"));
        let bad = server.on_message(&call("3", "a.b.c"), None).await.unwrap();
        assert_eq!(bad.error.as_deref(), Some("Invalid endpoint format"));
        let bad = server.on_message(&call("4", "chat.nope"), None).await.unwrap();
        assert_eq!(bad.error.as_deref(), Some("ST_API.chat.nope is not available"));
    }

    #[tokio::test]
    async fn test_unsupported_and_non_envelopes() {
        let (_d, server, _) = setup(&[]);
        let res = server.on_message(&req("1", "format", json!({})), None).await.unwrap();
        assert_eq!(res.error.as_deref(), Some("Unsupported op: format"));
        assert!(server.on_message(&json!({"kind": "req"}), None).await.is_none());
        assert!(server.on_message(&req("", "getProject", json!({})), None).await.is_none());
        assert!(server.on_message(&json!("text"), None).await.is_none());
    }

    #[tokio::test]
    async fn test_iframe_height_clamped() {
        let (_d, server, _) = setup(&[]);
        let h = |name: &str, height: Value| json!({"type": "HB_IFRAME_HEIGHT", "iframeName": name, "height": height});
        assert!(server.on_message(&h("f1", json!(20)), None).await.is_none());
        assert_eq!(server.iframe_height("f1"), Some(80.0));
        server.on_message(&h("f1", json!(50_000)), None).await;
        assert_eq!(server.iframe_height("f1"), Some(10_000.0));
        server.on_message(&h("f1", json!("640")), None).await;
        assert_eq!(server.iframe_height("f1"), Some(640.0));
        server.on_message(&h("f1", json!(null)), None).await;
        assert_eq!(server.iframe_height("f1"), Some(640.0));
        server.on_message(&h(" ", json!(300)), None).await;
        assert!(server.iframe_height(" ").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_destructive_ops_need_explicit_target() {
        let (_d, server, cards) = setup(&[]);
        assert!(server
            .on_message(&req("d1", "deleteProject", json!({"targetZipSha256": "sha1"})), None)
            .await
            .is_none());
        // Not consumed by the ignored broadcast copy: the direct copy still runs.
        let (frame, _inbox) = window("http://127.0.0.1:8787/vfs/sha1/index.html", "f", None);
        let res = server
            .on_message(&req("d1", "deleteProject", json!({"targetZipSha256": "sha1"})), Some(&frame))
            .await
            .unwrap();
        assert!(res.ok, "{:?}", res.error);
        assert_eq!(cards.load().unwrap().projects.len(), 1);

        let res = server
            .on_message(
                &req("d2", "deleteProject", json!({"targetZipSha256": "sha2", "__hbAllowBroadcastZipTarget": true})),
                None,
            )
            .await
            .unwrap();
        assert!(res.ok);
        assert!(cards.load().unwrap().projects.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applies_once() {
        let (_d, server, cards) = setup(&[]);
        let (frame, _inbox) = window("about:srcdoc", "f", None);
        let msg = req("u1", "updateProject", json!({"targetProjectId": "p1", "title": "First"}));
        assert!(server.on_message(&msg, None).await.unwrap().ok);
        assert!(server.on_message(&msg, Some(&frame)).await.is_none());
        assert_eq!(cards.load().unwrap().projects[0].title.as_deref(), Some("First"));
    }

    #[tokio::test]
    async fn test_get_project_uses_frame_hint() {
        let (_d, server, _) = setup(&[]);
        let frame_info = FrameInfo {
            project_id: "p2".into(),
            vfs_home_url: "http://127.0.0.1:8787/vfs/sha2/index.html".into(),
        };
        let (frame, _inbox) = window("about:srcdoc", "f", Some(frame_info));
        let res = server
            .on_message(&req("g1", "getProject", json!({})), Some(&frame))
            .await
            .unwrap();
        assert_eq!(res.data.as_ref().unwrap()["project"]["id"], "p2");

        let res = server
            .on_message(&req("g2", "getProject", json!({"includeAll": true})), Some(&frame))
            .await
            .unwrap();
        let data = res.data.unwrap();
        assert!(data.get("project").is_none());
        assert_eq!(data["projects"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_text_coercion() {
        assert_eq!(text(Some(&json!("id-1"))), "id-1");
        assert_eq!(text(Some(&json!(42))), "42");
        assert_eq!(text(Some(&json!(true))), "true");
        assert_eq!(text(Some(&json!(false))), "false");
        assert_eq!(text(Some(&Value::Null)), "");
        assert_eq!(text(Some(&json!({"a": 1}))), "");
        assert_eq!(text(None), "");
    }

    #[test]
    fn test_hint_from_href() {
        let (tab, _inbox) = window("http://127.0.0.1:8787/vfs/abc%20d/page.html", "", None);
        let hint = ProjectHint::from_source(Some(&tab));
        assert_eq!(hint.project_id, "");
        assert_eq!(hint.zip_sha256, "abc d");
        assert_eq!(ProjectHint::from_source(None), ProjectHint::default());
    }

    #[tokio::test]
    async fn test_client_without_transport_fails_fast() {
        let (own, inbox) = window("about:blank", "", None);
        let client = HtmlBridgeClient::connect(
            HtmlTransports {
                hub: None,
                window: own.clone(),
                inbox,
                parent: Some(own),
                opener: None,
            },
            DEFAULT_HTML_BRIDGE_TIMEOUT,
        );
        let err = client.get_csrf_token().await.unwrap_err();
        assert_eq!(err.to_string(), "HB bridge unavailable");
        assert!(client.ctx_id().starts_with("hb_"));
    }

    #[tokio::test]
    async fn test_client_timeout_names_op() {
        let hub = ChannelHub::new();
        let (own, inbox) = window("about:blank", "", None);
        let client = HtmlBridgeClient::connect(
            HtmlTransports {
                hub: Some(&hub),
                window: own,
                inbox,
                parent: None,
                opener: None,
            },
            Duration::from_millis(10),
        );
        let err = client.request("getProject", json!({}), None).await.unwrap_err();
        assert_eq!(err.to_string(), "HB bridge timeout: getProject");
    }
}
