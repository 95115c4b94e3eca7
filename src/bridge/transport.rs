//! In-process stand-ins for BroadcastChannel and window.postMessage.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

const CHANNEL_CAPACITY: usize = 256;

/// Named broadcast channels. Every subscriber of a name sees every message posted to it.
#[derive(Default)]
pub struct ChannelHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: &str) -> BroadcastChannel {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        BroadcastChannel {
            name: name.to_string(),
            tx,
        }
    }
}

#[derive(Clone)]
pub struct BroadcastChannel {
    name: String,
    tx: broadcast::Sender<Value>,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    /// Returns false when nobody is listening.
    pub fn post_message(&self, message: Value) -> bool {
        match self.tx.send(message) {
            Ok(_) => true,
            Err(_) => {
                log::debug!("no listeners on channel {}", self.name);
                false
            }
        }
    }
}

/// A message delivered through a window's inbox.
#[derive(Clone)]
pub struct PortMessage {
    pub data: Value,
    /// Window to answer directly, like `event.source`.
    pub source: Option<WindowHandle>,
}

/// The embedding a framed document lives in, when it was opened from a chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub project_id: String,
    pub vfs_home_url: String,
}

struct WindowInner {
    href: String,
    name: String,
    frame: Option<FrameInfo>,
    inbox: mpsc::UnboundedSender<PortMessage>,
}

/// Addressable browsing context. Cloning shares identity.
#[derive(Clone)]
pub struct WindowHandle {
    inner: Arc<WindowInner>,
}

impl WindowHandle {
    pub fn href(&self) -> &str {
        &self.inner.href
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn frame(&self) -> Option<&FrameInfo> {
        self.inner.frame.as_ref()
    }

    /// Deliver `data` to this window's inbox. Returns false once the window is gone.
    pub fn post_message(&self, data: Value, source: Option<WindowHandle>) -> bool {
        self.inner.inbox.send(PortMessage { data, source }).is_ok()
    }

    pub fn same_window(&self, other: &WindowHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowHandle")
            .field("href", &self.inner.href)
            .field("name", &self.inner.name)
            .field("frame", &self.inner.frame)
            .finish()
    }
}

/// Create a window and the receiving end of its inbox.
pub fn window(
    href: impl Into<String>,
    name: impl Into<String>,
    frame: Option<FrameInfo>,
) -> (WindowHandle, mpsc::UnboundedReceiver<PortMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = WindowHandle {
        inner: Arc::new(WindowInner {
            href: href.into(),
            name: name.into(),
            frame,
            inbox: tx,
        }),
    };
    (handle, rx)
}
