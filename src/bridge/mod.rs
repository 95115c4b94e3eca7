//! Message bridges between framed documents and the host.
//!
//! Two protocols share the in-process transports in [`transport`]:
//! the sandbox bridge ([`host`], [`client`]) gives deep access to allow-listed
//! host globals, and the host-page bridge ([`html`]) carries enveloped project
//! and CSRF operations.

pub mod client;
pub mod dedup;
pub mod host;
pub mod html;
pub mod protocol;
pub mod transport;
pub mod value;

pub use client::{BridgeClient, RemoteRef, RemoteValue};
pub use host::RpcHost;
pub use html::{CsrfSource, HtmlBridgeClient, HtmlBridgeServer, HtmlTransports};
pub use transport::{ChannelHub, FrameInfo, WindowHandle};
