//! Higanbana: zipped static sites served from a content-addressed virtual file
//! system, plus the message bridges that let framed pages reach host services.
//!
//! An archive is imported once ([`import::import_zip`]) into a namespace named
//! after the SHA-256 of its bytes, then served under `<base>vfs/<sha256>/...`
//! by [`server::VfsWorker`].

pub mod archive;
pub mod bridge;
pub mod config;
pub mod download;
pub mod error;
pub mod import;
pub mod projects;
pub mod registry;
pub mod rewrite;
pub mod runtime;
pub mod server;
pub mod store;
pub mod util;
pub mod vfs_format;
