//! Streaming WebZip download with throttled progress and cancellation.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub const DEFAULT_PROGRESS_THROTTLE_MS: u64 = 120;
pub const MIN_PROGRESS_THROTTLE_MS: u64 = 30;
/// Largest body accepted when the caller sets no limit.
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 512 * 1024 * 1024;
/// Upper bound on the buffer reserved from `Content-Length` before any byte arrives.
const PREALLOC_CAP: u64 = 8 * 1024 * 1024;

/// Owner side of a cancellation flag.
#[derive(Clone)]
pub struct AbortController {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once aborted. Never resolves if the controller is dropped first.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub loaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<f64>,
    pub speed_bps: Option<f64>,
    pub elapsed_ms: u64,
}

impl DownloadProgress {
    /// One status line: `loaded / total (percent) | speed`.
    pub fn render(&self) -> String {
        let total = self.total_bytes.map(|t| format_bytes(t as f64));
        let percent = match total {
            Some(_) => format_percent(self.percent),
            None => "—".to_string(),
        };
        format!(
            "{} / {} ({percent}) | {}",
            format_bytes(self.loaded_bytes as f64),
            total.as_deref().unwrap_or("?"),
            format_speed(self.speed_bps)
        )
    }
}

pub type ProgressCallback = Box<dyn FnMut(&DownloadProgress) + Send>;

#[derive(Default)]
pub struct DownloadOptions {
    pub progress_throttle_ms: Option<u64>,
    pub on_progress: Option<ProgressCallback>,
    pub signal: Option<AbortSignal>,
    /// Reject bodies larger than this. Defaults to [`DEFAULT_MAX_DOWNLOAD_BYTES`].
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub bytes: Vec<u8>,
    pub total_bytes: u64,
    pub content_type: Option<String>,
    pub final_url: String,
}

struct ProgressEmitter {
    callback: Option<ProgressCallback>,
    throttle: Duration,
    start: Instant,
    last_emit: Option<Instant>,
    loaded_at_last_emit: u64,
    speed_bps: Option<f64>,
    total: Option<u64>,
}

impl ProgressEmitter {
    fn emit(&mut self, loaded: u64, force: bool) {
        let Some(callback) = self.callback.as_mut() else {
            return;
        };
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            let dt = now.duration_since(last);
            if !force && dt < self.throttle {
                return;
            }
            if !dt.is_zero() {
                let delta = loaded.saturating_sub(self.loaded_at_last_emit) as f64;
                self.speed_bps = Some(delta / dt.as_secs_f64());
            }
        }
        self.last_emit = Some(now);
        self.loaded_at_last_emit = loaded;

        let progress = DownloadProgress {
            loaded_bytes: loaded,
            total_bytes: self.total,
            percent: self.total.map(|t| loaded as f64 / t as f64 * 100.0),
            speed_bps: self.speed_bps,
            elapsed_ms: now.duration_since(self.start).as_millis() as u64,
        };
        callback(&progress);
    }
}

async fn wait_aborted(signal: &mut Option<AbortSignal>) {
    match signal {
        Some(s) => s.aborted().await,
        None => std::future::pending().await,
    }
}

/// Fetch `url` into memory, reporting progress as chunks arrive.
pub async fn download_zip(url: &str, options: DownloadOptions) -> Result<DownloadResult> {
    let DownloadOptions {
        progress_throttle_ms,
        on_progress,
        mut signal,
        max_bytes,
    } = options;
    let limit = max_bytes.unwrap_or(DEFAULT_MAX_DOWNLOAD_BYTES);
    let throttle = progress_throttle_ms
        .unwrap_or(DEFAULT_PROGRESS_THROTTLE_MS)
        .max(MIN_PROGRESS_THROTTLE_MS);
    let start = Instant::now();

    if signal.as_ref().is_some_and(AbortSignal::is_aborted) {
        bail!("Download aborted: {url}");
    }

    let client = reqwest::Client::new();
    let response = tokio::select! {
        r = client.get(url).send() => r.with_context(|| format!("Failed to fetch {url}"))?,
        _ = wait_aborted(&mut signal) => bail!("Download aborted: {url}"),
    };
    let status = response.status();
    if !status.is_success() {
        bail!(
            "Download failed: {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let final_url = response.url().to_string();
    let total = response.content_length().filter(|n| *n > 0);
    if let Some(declared) = total.filter(|n| *n > limit) {
        bail!("Download too large: {url} declares {declared} bytes, limit is {limit}");
    }

    let mut emitter = ProgressEmitter {
        callback: on_progress,
        throttle: Duration::from_millis(throttle),
        start,
        last_emit: None,
        loaded_at_last_emit: 0,
        speed_bps: None,
        total,
    };
    emitter.emit(0, true);

    let mut bytes = Vec::with_capacity(total.map_or(0, |n| n.min(PREALLOC_CAP) as usize));
    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            chunk = stream.next() => chunk,
            _ = wait_aborted(&mut signal) => bail!("Download aborted: {url}"),
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.with_context(|| format!("Failed while reading {url}"))?;
        if (bytes.len() + chunk.len()) as u64 > limit {
            bail!("Download too large: {url} exceeds {limit} bytes");
        }
        bytes.extend_from_slice(&chunk);
        emitter.emit(bytes.len() as u64, false);
    }
    emitter.emit(bytes.len() as u64, true);

    log::info!(
        "downloaded {} from {final_url} in {:?}",
        format_bytes(bytes.len() as f64),
        start.elapsed()
    );
    Ok(DownloadResult {
        total_bytes: total.unwrap_or(bytes.len() as u64),
        bytes,
        content_type,
        final_url,
    })
}

/// `1.50 KB`, `12.0 MB`, `512 B`. Invalid input renders as `0 B`.
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if !bytes.is_finite() || bytes < 0.0 {
        return "0 B".to_string();
    }
    let mut v = bytes;
    let mut i = 0;
    while v >= 1024.0 && i < UNITS.len() - 1 {
        v /= 1024.0;
        i += 1;
    }
    let decimals = if v >= 100.0 {
        0
    } else if v >= 10.0 {
        1
    } else {
        2
    };
    format!("{v:.decimals$} {}", UNITS[i])
}

pub fn format_speed(bytes_per_second: Option<f64>) -> String {
    match bytes_per_second {
        Some(v) if v.is_finite() && v > 0.0 => format!("{}/s", format_bytes(v)),
        _ => "—".to_string(),
    }
}

pub fn format_percent(percent: Option<f64>) -> String {
    match percent {
        Some(p) if p.is_finite() => format!("{:.1}%", p.clamp(0.0, 100.0)),
        _ => "—".to_string(),
    }
}
