//! The VFS worker: a lifecycle state machine plus the fetch handler that serves
//! cached project files, exposed over HTTP through an axum router.

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use reqwest::Url;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use crate::archive;
use crate::bridge::protocol::SKIP_WAITING;
use crate::bridge::HtmlBridgeServer;
use crate::runtime::{self, RuntimeOptions};
use crate::store::VfsStore;
use crate::util;
use crate::vfs_format::{self, CachedEntry};

const HTML_UTF8: &str = "text/html; charset=utf-8";
const TEXT_UTF8: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Installing,
    Activated,
    Serving,
}

/// The parts of an incoming request the worker looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    /// Pathname only; query and fragment never take part in the lookup.
    pub path: String,
    pub accept: String,
    /// `Sec-Fetch-Mode: navigate`.
    pub navigate: bool,
}

impl FetchRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
            accept: String::new(),
            navigate: false,
        }
    }

    pub fn navigation(mut self) -> Self {
        self.navigate = true;
        self
    }

    pub fn accepting(mut self, accept: &str) -> Self {
        self.accept = accept.to_string();
        self
    }

    pub fn from_parts(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let header_text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        Self {
            method: method.as_str().to_string(),
            path: uri.path().to_string(),
            accept: header_text("accept"),
            navigate: header_text("sec-fetch-mode").eq_ignore_ascii_case("navigate"),
        }
    }

    fn wants_html(&self) -> bool {
        self.navigate || self.accept.contains("text/html")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl VfsResponse {
    fn hit(entry: CachedEntry) -> Self {
        Self {
            status: 200,
            content_type: entry.content_type,
            body: entry.body,
        }
    }

    fn not_found(req: &FetchRequest) -> Self {
        if req.wants_html() {
            Self {
                status: 404,
                content_type: HTML_UTF8.to_string(),
                body: not_found_page(&req.path).into_bytes(),
            }
        } else {
            Self {
                status: 404,
                content_type: TEXT_UTF8.to_string(),
                body: b"Not Found".to_vec(),
            }
        }
    }

    fn error(message: &str) -> Self {
        Self {
            status: 500,
            content_type: TEXT_UTF8.to_string(),
            body: message.as_bytes().to_vec(),
        }
    }
}

/// What the worker does with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not ours; normal network handling applies.
    Passthrough,
    Respond(VfsResponse),
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn not_found_page(pathname: &str) -> String {
    format!(
        r#"<!doctype html>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width,initial-scale=1">
<title>Higanbana VFS 404</title>
<style>
  body{{font-family:system-ui,-apple-system,Segoe UI,Roboto,Helvetica,Arial;line-height:1.4;margin:20px}}
  code{{background:rgba(127,127,127,.15);padding:2px 6px;border-radius:6px}}
</style>
<h2>Resource not found (VFS)</h2>
<p>The requested file is not in the cache: <code>{}</code></p>
<p>Go back to the host page and re-import or allow this card's WebZip, or check that the entry page references its assets correctly (relative paths are recommended).</p>"#,
        escape_html(pathname)
    )
}

pub struct VfsWorker {
    store: Arc<VfsStore>,
    extension_base: String,
    scope_path: String,
    runtime: Option<RuntimeOptions>,
    state: Mutex<WorkerState>,
}

impl VfsWorker {
    /// A worker registered at `extension_base`. `runtime` enables the compat
    /// script on HTML navigations.
    pub fn new(
        store: Arc<VfsStore>,
        extension_base: &str,
        runtime: Option<RuntimeOptions>,
    ) -> Result<Self> {
        let extension_base = util::with_trailing_slash(extension_base);
        let scope = Url::parse(&extension_base)
            .with_context(|| format!("Invalid extension base URL: {extension_base}"))?;
        Ok(Self {
            store,
            scope_path: util::with_trailing_slash(scope.path()),
            extension_base,
            runtime,
            state: Mutex::new(WorkerState::Installing),
        })
    }

    pub fn scope_path(&self) -> &str {
        &self.scope_path
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != next {
            log::debug!("vfs worker {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Nothing to precache; the worker goes straight past the waiting phase.
    pub fn install(&self) {
        log::info!("vfs worker installing at scope {}", self.scope_path);
        self.skip_waiting();
    }

    pub fn skip_waiting(&self) {
        if self.state() == WorkerState::Installing {
            self.activate();
        }
    }

    /// Claim clients. Idempotent once serving.
    pub fn activate(&self) {
        if self.state() != WorkerState::Serving {
            self.set_state(WorkerState::Activated);
        }
    }

    /// Control messages. Returns whether the message was understood.
    pub fn on_message(&self, data: &Value) -> bool {
        match data.get("type").and_then(Value::as_str) {
            Some(SKIP_WAITING) => {
                self.skip_waiting();
                true
            }
            _ => false,
        }
    }

    /// Handle one request. Only GETs under `<scope>vfs/` are intercepted, and only
    /// once the worker is active.
    pub async fn fetch(&self, req: &FetchRequest) -> FetchOutcome {
        if !req.method.eq_ignore_ascii_case("GET") {
            return FetchOutcome::Passthrough;
        }
        let Some(vfs) = vfs_format::parse_vfs_request(&self.scope_path, &req.path) else {
            return FetchOutcome::Passthrough;
        };
        match self.state() {
            WorkerState::Installing => return FetchOutcome::Passthrough,
            WorkerState::Activated => self.set_state(WorkerState::Serving),
            WorkerState::Serving => {}
        }

        // Entries are keyed by pathname; `?v=2` cache busters hit the same file.
        let raw_inner = archive::strip_query_and_hash(&vfs.inner_path);
        if raw_inner.is_empty() {
            return FetchOutcome::Passthrough;
        }
        let inner = util::decode_uri_component(raw_inner).unwrap_or_else(|| raw_inner.to_string());
        let url = vfs_format::build_vfs_url(&self.extension_base, &vfs.project_id, &inner);
        let cache_name = vfs_format::cache_name(&vfs.project_id);
        let store = Arc::clone(&self.store);
        let lookup = tokio::task::spawn_blocking(move || store.open_namespace(&cache_name)?.get(&url)).await;

        let entry = match lookup {
            Ok(Ok(entry)) => entry,
            Ok(Err(e)) => {
                log::warn!("vfs lookup failed for {}: {e:#}", req.path);
                return FetchOutcome::Respond(VfsResponse::error("VFS lookup failed"));
            }
            Err(e) => {
                log::warn!("vfs lookup task failed for {}: {e}", req.path);
                return FetchOutcome::Respond(VfsResponse::error("VFS lookup failed"));
            }
        };

        let Some(mut entry) = entry else {
            log::debug!("vfs miss: {} ({inner})", vfs.project_id);
            return FetchOutcome::Respond(VfsResponse::not_found(req));
        };
        if req.navigate && entry.content_type.starts_with("text/html") {
            if let Some(opts) = &self.runtime {
                let html = String::from_utf8_lossy(&entry.body);
                entry.body = runtime::inject_compat_runtime(&html, opts).into_bytes();
            }
        }
        FetchOutcome::Respond(VfsResponse::hit(entry))
    }
}

#[derive(Clone)]
struct AppState {
    worker: Arc<VfsWorker>,
    bridge: Option<Arc<HtmlBridgeServer>>,
}

fn plain_not_found() -> Response {
    (StatusCode::NOT_FOUND, [(header::CONTENT_TYPE, TEXT_UTF8)], "Not Found").into_response()
}

impl IntoResponse for VfsResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let content_type = HeaderValue::from_str(&self.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
        let mut response = (status, Bytes::from(self.body)).into_response();
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        if status != StatusCode::OK {
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        }
        response
    }
}

async fn vfs_handler(State(app): State<AppState>, method: Method, uri: Uri, headers: HeaderMap) -> Response {
    let req = FetchRequest::from_parts(&method, &uri, &headers);
    match app.worker.fetch(&req).await {
        FetchOutcome::Respond(res) => res.into_response(),
        FetchOutcome::Passthrough => plain_not_found(),
    }
}

async fn worker_message(State(app): State<AppState>, Json(data): Json<Value>) -> Response {
    let handled = app.worker.on_message(&data);
    Json(json!({ "handled": handled, "state": app.worker.state() })).into_response()
}

async fn bridge_message(State(app): State<AppState>, Json(data): Json<Value>) -> Response {
    let Some(bridge) = &app.bridge else {
        return plain_not_found();
    };
    // No sender window over HTTP: treated like a broadcast copy.
    match bridge.on_message(&data, None).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// `POST <scope>sw` takes worker control messages, `POST <scope>bridge` takes
/// host-page bridge envelopes; everything else goes to the worker's fetch handler.
pub fn router(worker: Arc<VfsWorker>, bridge: Option<Arc<HtmlBridgeServer>>) -> Router {
    let scope = worker.scope_path().to_string();
    Router::new()
        .route(&format!("{scope}sw"), post(worker_message))
        .route(&format!("{scope}bridge"), post(bridge_message))
        .fallback(vfs_handler)
        .with_state(AppState { worker, bridge })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{import_zip, ImportOptions};
    use std::io::Write;

    const BASE: &str = "http://127.0.0.1:8787/dist/";

    fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let opts = zip::write::SimpleFileOptions::default();
        for (name, data) in files {
            writer.start_file(*name, opts).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    async fn setup(runtime: Option<RuntimeOptions>) -> (tempfile::TempDir, VfsWorker, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VfsStore::open(dir.path()).unwrap());
        let bytes = zip_bytes(&[
            ("site/index.html", b"<html><head></head><body>home</body></html>"),
            ("site/img/a b.png", &[0x89, 0x50, 0x4e, 0x47, 0x00, 0xff]),
        ]);
        let result = import_zip(&store, BASE, bytes, &ImportOptions::default()).await.unwrap();
        let worker = VfsWorker::new(store, BASE, runtime).unwrap();
        worker.install();
        (dir, worker, result.project_id)
    }

    fn body_of(outcome: FetchOutcome) -> VfsResponse {
        match outcome {
            FetchOutcome::Respond(res) => res,
            FetchOutcome::Passthrough => panic!("expected a response"),
        }
    }

    #[test]
    fn test_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VfsStore::open(dir.path()).unwrap());
        let worker = VfsWorker::new(store, "http://127.0.0.1:8787/dist", None).unwrap();
        assert_eq!(worker.scope_path(), "/dist/");
        assert_eq!(worker.state(), WorkerState::Installing);
        assert!(!worker.on_message(&json!({ "type": "OTHER" })));
        assert_eq!(worker.state(), WorkerState::Installing);
        assert!(worker.on_message(&json!({ "type": "HB_SKIP_WAITING" })));
        assert_eq!(worker.state(), WorkerState::Activated);
        worker.install();
        assert_eq!(worker.state(), WorkerState::Activated);
    }

    #[test]
    fn test_invalid_base_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VfsStore::open(dir.path()).unwrap());
        assert!(VfsWorker::new(store, "not a url", None).is_err());
    }

    #[tokio::test]
    async fn test_serves_cached_files_byte_for_byte() {
        let (_dir, worker, id) = setup(None).await;
        let res = body_of(worker.fetch(&FetchRequest::get(&format!("/dist/vfs/{id}/img/a%20b.png"))).await);
        assert_eq!(res.status, 200);
        assert_eq!(res.content_type, "image/png");
        assert_eq!(res.body, vec![0x89, 0x50, 0x4e, 0x47, 0x00, 0xff]);
        assert_eq!(worker.state(), WorkerState::Serving);
    }

    #[tokio::test]
    async fn test_passthrough_outside_scope_or_non_get() {
        let (_dir, worker, id) = setup(None).await;
        assert_eq!(worker.fetch(&FetchRequest::get("/other/index.html")).await, FetchOutcome::Passthrough);
        assert_eq!(worker.fetch(&FetchRequest::get(&format!("/dist/vfs/{id}/"))).await, FetchOutcome::Passthrough);
        let mut post = FetchRequest::get(&format!("/dist/vfs/{id}/index.html"));
        post.method = "POST".into();
        assert_eq!(worker.fetch(&post).await, FetchOutcome::Passthrough);
    }

    #[tokio::test]
    async fn test_not_active_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VfsStore::open(dir.path()).unwrap());
        let worker = VfsWorker::new(store, BASE, None).unwrap();
        assert_eq!(worker.fetch(&FetchRequest::get("/dist/vfs/x/index.html")).await, FetchOutcome::Passthrough);
    }

    #[tokio::test]
    async fn test_misses_are_404() {
        let (_dir, worker, id) = setup(None).await;
        let res = body_of(worker.fetch(&FetchRequest::get(&format!("/dist/vfs/{id}/missing.js"))).await);
        assert_eq!((res.status, res.content_type.as_str()), (404, TEXT_UTF8));
        assert_eq!(res.body, b"Not Found");

        let req = FetchRequest::get("/dist/vfs/unknown/<b>.html").accepting("text/html,*/*");
        let res = body_of(worker.fetch(&req).await);
        assert_eq!((res.status, res.content_type.as_str()), (404, HTML_UTF8));
        let html = String::from_utf8(res.body).unwrap();
        assert!(html.contains("<code>/dist/vfs/unknown/&lt;b&gt;.html</code>"));

        let res = body_of(worker.fetch(&FetchRequest::get("/dist/vfs/unknown/x").navigation()).await);
        assert_eq!(res.content_type, HTML_UTF8);
    }

    #[tokio::test]
    async fn test_runtime_only_on_navigations() {
        let opts = RuntimeOptions {
            origin: "http://127.0.0.1:8000".into(),
            force_base_href: false,
        };
        let (_dir, worker, id) = setup(Some(opts)).await;
        let path = format!("/dist/vfs/{id}/index.html");

        let asset = body_of(worker.fetch(&FetchRequest::get(&path)).await);
        assert!(!String::from_utf8_lossy(&asset.body).contains(runtime::COMPAT_MARKER));

        let page = body_of(worker.fetch(&FetchRequest::get(&path).navigation()).await);
        assert!(String::from_utf8_lossy(&page.body).contains(runtime::COMPAT_MARKER));
    }

    #[tokio::test]
    async fn test_query_and_fragment_ignored_on_lookup() {
        let (_dir, worker, id) = setup(None).await;
        let plain = body_of(worker.fetch(&FetchRequest::get(&format!("/dist/vfs/{id}/index.html"))).await);
        for suffix in ["?v=2", "?v=2#top", "#top"] {
            let res = body_of(worker.fetch(&FetchRequest::get(&format!("/dist/vfs/{id}/index.html{suffix}"))).await);
            assert_eq!(res, plain, "suffix {suffix}");
        }
        let res = body_of(worker.fetch(&FetchRequest::get(&format!("/dist/vfs/{id}/img/a%20b.png?x=1"))).await);
        assert_eq!(res.status, 200);
        assert_eq!(res.content_type, "image/png");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }
}
