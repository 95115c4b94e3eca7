use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::util;

pub const MAGIC: &[u8; 8] = b"HBVFSV01";
pub const FORMAT_VERSION: u32 = 1;

/// Every project namespace directory is named `<CACHE_PREFIX><projectId>`.
pub const CACHE_PREFIX: &str = "st-higanbana-vfs-";

/// One cached request/response pair, stored as `MAGIC + zstd(bincode(CachedEntry))`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub version: u32,
    /// The synthetic request URL, `<extensionBase>vfs/<projectId>/<encoded path>`.
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub blake3_hash: [u8; 32],
}

/// Outcome of a WebZip import. `project_id` is always the SHA-256 of the archive bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub project_id: String,
    pub home_page: String,
    pub html_files: Vec<String>,
    pub file_count: usize,
    pub cache_name: String,
}

pub fn cache_name(project_id: &str) -> String {
    format!("{CACHE_PREFIX}{project_id}")
}

/// Inverse of [`cache_name`]; `None` for names outside the VFS prefix.
pub fn project_id_from_cache_name(name: &str) -> Option<&str> {
    name.strip_prefix(CACHE_PREFIX).filter(|id| !id.is_empty())
}

/// Request URL of one VFS entry: `<extension_base>vfs/<projectId>/<encoded path>`.
pub fn build_vfs_url(extension_base: &str, project_id: &str, inner_path: &str) -> String {
    format!(
        "{}vfs/{}/{}",
        util::with_trailing_slash(extension_base),
        util::encode_uri_component(project_id),
        util::encode_path_segments(inner_path)
    )
}

/// Pathname every rewritten root-relative reference is re-rooted on.
pub fn vfs_base_pathname(extension_base: &str, project_id: &str) -> Result<String> {
    let base = Url::parse(&util::with_trailing_slash(extension_base))
        .with_context(|| format!("Invalid extension base URL: {extension_base}"))?;
    Ok(format!(
        "{}vfs/{}/",
        util::with_trailing_slash(base.path()),
        util::encode_uri_component(project_id)
    ))
}

/// A request under the VFS scope, split into its project id and raw inner path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsRequest {
    pub project_id: String,
    /// Still percent-encoded, exactly as it appeared in the request.
    pub inner_path: String,
}

/// Split `<scope>vfs/<projectId>/<innerPath>`. `None` when the pathname is outside
/// the scope or either part is empty.
pub fn parse_vfs_request(scope_path: &str, pathname: &str) -> Option<VfsRequest> {
    let vfs_base = format!("{}vfs/", util::with_trailing_slash(scope_path));
    let rest = pathname.strip_prefix(&vfs_base)?;
    let idx = rest.find('/').filter(|&i| i > 0)?;
    let project_id = util::decode_uri_component(&rest[..idx])?;
    let inner_path = &rest[idx + 1..];
    if project_id.is_empty() || inner_path.is_empty() {
        return None;
    }
    Some(VfsRequest {
        project_id,
        inner_path: inner_path.to_string(),
    })
}

/// Project id embedded in any URL (absolute or root-relative) containing `/vfs/<id>/`.
pub fn zip_sha256_from_vfs_url(url: &str) -> Option<String> {
    let text = url.trim();
    if text.is_empty() {
        return None;
    }
    let parsed = Url::parse(text)
        .or_else(|_| Url::parse("http://localhost/").and_then(|base| base.join(text)))
        .ok()?;
    let path = parsed.path();
    let start = path.find("/vfs/")? + "/vfs/".len();
    let rest = &path[start..];
    let end = rest.find('/').filter(|&i| i > 0)?;
    util::decode_uri_component(&rest[..end]).filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "http://127.0.0.1:8787/dist/";

    #[test]
    fn test_cache_name_round_trip() {
        let name = cache_name("abc123");
        assert_eq!(name, "st-higanbana-vfs-abc123");
        assert_eq!(project_id_from_cache_name(&name), Some("abc123"));
        assert_eq!(project_id_from_cache_name("st-higanbana-vfs-"), None);
        assert_eq!(project_id_from_cache_name("other-cache"), None);
    }

    #[test]
    fn test_build_vfs_url_encodes_segments() {
        assert_eq!(
            build_vfs_url(BASE, "abc", "assets/my file.js"),
            "http://127.0.0.1:8787/dist/vfs/abc/assets/my%20file.js"
        );
        assert_eq!(
            build_vfs_url("http://h/dist", "abc", "index.html"),
            "http://h/dist/vfs/abc/index.html"
        );
    }

    #[test]
    fn test_vfs_base_pathname() {
        assert_eq!(vfs_base_pathname(BASE, "abc").unwrap(), "/dist/vfs/abc/");
        assert_eq!(vfs_base_pathname("http://h", "abc").unwrap(), "/vfs/abc/");
        assert!(vfs_base_pathname("not a url", "abc").is_err());
    }

    #[test]
    fn test_parse_vfs_request() {
        let req = parse_vfs_request("/dist/", "/dist/vfs/abc/assets/app.js").unwrap();
        assert_eq!(req.project_id, "abc");
        assert_eq!(req.inner_path, "assets/app.js");

        assert!(parse_vfs_request("/dist/", "/dist/vfs/abc/").is_none());
        assert!(parse_vfs_request("/dist/", "/dist/vfs//index.html").is_none());
        assert!(parse_vfs_request("/dist/", "/dist/vfs/abc").is_none());
        assert!(parse_vfs_request("/dist/", "/other/vfs/abc/index.html").is_none());
    }

    #[test]
    fn test_zip_sha256_from_vfs_url() {
        assert_eq!(
            zip_sha256_from_vfs_url("http://h/dist/vfs/deadbeef/index.html").as_deref(),
            Some("deadbeef")
        );
        assert_eq!(
            zip_sha256_from_vfs_url("/dist/vfs/dead%20beef/x/y.html").as_deref(),
            Some("dead beef")
        );
        assert_eq!(zip_sha256_from_vfs_url("http://h/dist/vfs/deadbeef"), None);
        assert_eq!(zip_sha256_from_vfs_url(""), None);
    }
}
