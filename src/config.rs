use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::util;

pub const DEFAULT_EMBEDDED_ZIP_MAX_BYTES: u64 = 20 * 1024 * 1024;

fn default_store_dir() -> PathBuf {
    PathBuf::from("./higanbana-store")
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8787))
}

fn default_extension_base() -> String {
    "http://127.0.0.1:8787/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_embedded_zip_max_bytes() -> u64 {
    DEFAULT_EMBEDDED_ZIP_MAX_BYTES
}

fn default_placeholder() -> String {
    "{{WEB_HOME}}".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// URL the VFS is served under; entries live at `<extension_base>vfs/<id>/...`.
    #[serde(default = "default_extension_base")]
    pub extension_base: String,
    #[serde(default = "default_true")]
    pub fix_root_relative_urls: bool,
    #[serde(default = "default_true")]
    pub inject_runtime: bool,
    /// Host origin baked into the injected runtime.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default = "default_embedded_zip_max_bytes")]
    pub embedded_zip_max_bytes: u64,
    /// Placeholder offered to new projects that do not ask for one.
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    /// JSON file holding the project cards. In-memory when unset.
    #[serde(default)]
    pub cards_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            bind: default_bind(),
            extension_base: default_extension_base(),
            fix_root_relative_urls: true,
            inject_runtime: true,
            origin: None,
            embedded_zip_max_bytes: default_embedded_zip_max_bytes(),
            placeholder: default_placeholder(),
            cards_file: None,
        }
    }
}

impl Config {
    /// Load a TOML file. Relative paths inside it resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut cfg: Config = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        cfg.rebase_paths(path);
        cfg.normalize();
        Ok(cfg)
    }

    /// `--config` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let mut cfg = Self::default();
                cfg.normalize();
                Ok(cfg)
            }
        }
    }

    pub fn normalize(&mut self) {
        self.extension_base = util::with_trailing_slash(self.extension_base.trim());
        if let Some(origin) = &self.origin {
            let trimmed = origin.trim().trim_end_matches('/');
            self.origin = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
    }

    fn rebase_paths(&mut self, path: &Path) {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        self.store_dir = Self::join_base(base, &self.store_dir);
        if let Some(cards) = &mut self.cards_file {
            *cards = Self::join_base(base, cards);
        }
    }

    fn join_base(base: &Path, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            base.join(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::load_or_default(None).unwrap();
        assert_eq!(cfg.extension_base, "http://127.0.0.1:8787/");
        assert_eq!(cfg.bind.port(), 8787);
        assert!(cfg.fix_root_relative_urls);
        assert!(cfg.inject_runtime);
        assert_eq!(cfg.embedded_zip_max_bytes, 20 * 1024 * 1024);
        assert_eq!(cfg.placeholder, "{{WEB_HOME}}");
        assert!(cfg.cards_file.is_none());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("higanbana.toml");
        std::fs::write(
            &path,
            r#"
store_dir = "store"
extension_base = "http://localhost:9000/dist"
origin = "http://localhost:8000/"
fix_root_relative_urls = false
cards_file = "/abs/cards.json"
"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.store_dir, dir.path().join("store"));
        assert_eq!(cfg.extension_base, "http://localhost:9000/dist/");
        assert_eq!(cfg.origin.as_deref(), Some("http://localhost:8000"));
        assert!(!cfg.fix_root_relative_urls);
        assert!(cfg.inject_runtime);
        assert_eq!(cfg.cards_file, Some(PathBuf::from("/abs/cards.json")));
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "bind = 12").unwrap();
        assert!(Config::load(&path).is_err());
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }
}
