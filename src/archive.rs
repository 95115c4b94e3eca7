use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::io::{Cursor, Read};

/// Homepage used when an archive contains no HTML at all.
pub const DEFAULT_HOME_PAGE: &str = "index.html";

/// Total decompressed bytes [`unpack`] accepts from one archive.
pub const MAX_UNPACKED_BYTES: u64 = 1024 * 1024 * 1024;
/// Upper bound on the buffer reserved from an entry's declared size.
const ENTRY_PREALLOC_CAP: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    /// Normalized, forward-slash path relative to the site root.
    pub path: String,
    pub data: Vec<u8>,
}

/// Normalize a raw zip entry name.
///
/// Backslashes become slashes, one leading `./` and any leading slashes are
/// removed, empty segments collapse. Any `..` segment rejects the entry.
pub fn normalize_zip_path(raw: &str) -> Option<String> {
    let mut p = raw.replace('\\', "/");
    if let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    let p = p.trim_start_matches('/');

    let parts: Vec<&str> = p.split('/').filter(|s| !s.is_empty()).collect();
    if parts.iter().any(|seg| *seg == "..") {
        return None;
    }
    let joined = parts.join("/");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Strip a single wrapper directory shared by every path.
///
/// Returns the stripped prefix (empty when nothing was stripped) and the new paths.
/// Stripping needs every path to share the first segment and at least one path
/// to be nested below it.
pub fn strip_single_top_level_folder(paths: &[String]) -> (String, Vec<String>) {
    let list: Vec<String> = paths.iter().filter(|p| !p.is_empty()).cloned().collect();
    if list.is_empty() {
        return (String::new(), Vec::new());
    }

    let first_segments: HashSet<&str> = list
        .iter()
        .filter_map(|p| p.split('/').next())
        .filter(|s| !s.is_empty())
        .collect();
    if first_segments.len() != 1 {
        return (String::new(), list);
    }

    let Some(segment) = first_segments.into_iter().next() else {
        return (String::new(), list);
    };
    let prefix = format!("{segment}/");
    if !list.iter().any(|p| p.starts_with(&prefix)) {
        return (String::new(), list);
    }

    let stripped = list
        .iter()
        .map(|p| p.strip_prefix(&prefix).unwrap_or(p).to_string())
        .collect();
    (prefix, stripped)
}

/// Decode a zip archive into normalized `(path, bytes)` entries.
///
/// Directory entries and traversal paths are dropped, then a single wrapper
/// folder is stripped. Fails when nothing importable remains.
pub fn unpack(bytes: &[u8]) -> Result<Vec<ArchiveFile>> {
    unpack_limited(bytes, MAX_UNPACKED_BYTES)
}

/// [`unpack`] with a cap on the total decompressed size. Declared entry sizes
/// are only a hint; the limit is enforced on the bytes actually read.
pub fn unpack_limited(bytes: &[u8], max_total: u64) -> Result<Vec<ArchiveFile>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("Failed to open zip archive")?;

    let mut normalized: Vec<ArchiveFile> = Vec::new();
    let mut total: u64 = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry #{i}"))?;
        if entry.is_dir() {
            continue;
        }
        let Some(path) = normalize_zip_path(entry.name()) else {
            log::debug!("dropping zip entry {:?}", entry.name());
            continue;
        };
        let remaining = max_total - total;
        let mut data = Vec::with_capacity(entry.size().min(ENTRY_PREALLOC_CAP).min(remaining) as usize);
        (&mut entry)
            .take(remaining.saturating_add(1))
            .read_to_end(&mut data)
            .with_context(|| format!("Failed to decompress zip entry: {path}"))?;
        if data.len() as u64 > remaining {
            bail!("archive expands past {max_total} bytes at {path}");
        }
        total += data.len() as u64;
        normalized.push(ArchiveFile { path, data });
    }

    if normalized.is_empty() {
        bail!("archive has no importable files");
    }

    let paths: Vec<String> = normalized.iter().map(|f| f.path.clone()).collect();
    let (prefix, stripped) = strip_single_top_level_folder(&paths);
    if !prefix.is_empty() {
        log::debug!("stripping wrapper folder {prefix:?}");
    }

    let files: Vec<ArchiveFile> = normalized
        .into_iter()
        .zip(stripped)
        .filter(|(_, path)| !path.is_empty())
        .map(|(file, path)| ArchiveFile { path, data: file.data })
        .collect();

    if files.is_empty() {
        bail!("archive has no importable files");
    }
    Ok(files)
}

/// In-archive file and directory listing used to gate URL rewriting.
#[derive(Debug, Default, Clone)]
pub struct PathIndex {
    files: HashSet<String>,
    /// Directory prefixes with a trailing slash, e.g. `assets/`, `assets/sub/`.
    dirs: HashSet<String>,
}

impl PathIndex {
    pub fn build<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut index = PathIndex::default();
        for p in paths {
            index.files.insert(p.to_string());
            let parts: Vec<&str> = p.split('/').filter(|s| !s.is_empty()).collect();
            for i in 1..parts.len() {
                index.dirs.insert(format!("{}/", parts[..i].join("/")));
            }
        }
        index
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.contains(path)
    }

    pub fn has_dir(&self, path: &str) -> bool {
        if path.ends_with('/') {
            self.dirs.contains(path)
        } else {
            self.dirs.contains(&format!("{path}/"))
        }
    }

    /// Whether the root-relative reference `rest` (without its leading slash)
    /// names something inside the archive. Query and fragment are ignored.
    pub fn contains_reference(&self, rest: &str) -> bool {
        let path_only = strip_query_and_hash(rest);
        if path_only.is_empty() {
            return false;
        }
        self.has_file(path_only) || self.has_dir(path_only)
    }
}

pub fn strip_query_and_hash(path: &str) -> &str {
    match path.find(['?', '#']) {
        Some(idx) => &path[..idx],
        None => path,
    }
}

pub fn is_html_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".htm")
}

/// Every HTML file in lexicographic order.
pub fn html_files<'a>(paths: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = paths
        .into_iter()
        .filter(|p| is_html_path(p))
        .map(str::to_string)
        .collect();
    out.sort();
    out
}

/// Pick the entry page: an existing preferred page, else `index.html`
/// (case-insensitive), else the first HTML file, else the literal `index.html`.
pub fn select_home_page(html_files: &[String], preferred: Option<&str>) -> String {
    if let Some(preferred) = preferred.map(str::trim).filter(|p| !p.is_empty()) {
        if html_files.iter().any(|p| p == preferred) {
            return preferred.to_string();
        }
    }

    let mut sorted: Vec<&String> = html_files.iter().collect();
    sorted.sort();

    if let Some(index) = sorted
        .iter()
        .find(|p| p.eq_ignore_ascii_case(DEFAULT_HOME_PAGE))
    {
        return (*index).clone();
    }
    match sorted.first() {
        Some(first) => (*first).clone(),
        None => DEFAULT_HOME_PAGE.to_string(),
    }
}

pub fn guess_content_type(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" | "cjs" => "application/javascript; charset=utf-8",
        "json" | "map" => "application/json; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "woff2" => "font/woff2",
        "woff" => "font/woff",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Text assets are decoded and run through the rewriter; everything else is stored verbatim.
pub fn is_text_like(path: &str) -> bool {
    let ct = guess_content_type(path);
    ct.starts_with("text/") || ct.contains("javascript") || ct.contains("json") || ct.contains("svg+xml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap().into_inner()
    }

    fn paths(files: &[ArchiveFile]) -> Vec<&str> {
        files.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn test_normalize_zip_path() {
        assert_eq!(normalize_zip_path("a\\b\\c.js").as_deref(), Some("a/b/c.js"));
        assert_eq!(normalize_zip_path("./index.html").as_deref(), Some("index.html"));
        assert_eq!(normalize_zip_path("///x//y.css").as_deref(), Some("x/y.css"));
        assert_eq!(normalize_zip_path("a/../b"), None);
        assert_eq!(normalize_zip_path("../evil.sh"), None);
        assert_eq!(normalize_zip_path("/"), None);
    }

    #[test]
    fn test_strip_single_top_level_folder() {
        let input = vec!["site/index.html".to_string(), "site/a/b.js".to_string()];
        let (prefix, stripped) = strip_single_top_level_folder(&input);
        assert_eq!(prefix, "site/");
        assert_eq!(stripped, vec!["index.html", "a/b.js"]);
    }

    #[test]
    fn test_no_strip_with_multiple_roots() {
        let input = vec!["site/index.html".to_string(), "other.js".to_string()];
        let (prefix, stripped) = strip_single_top_level_folder(&input);
        assert_eq!(prefix, "");
        assert_eq!(stripped, input);
    }

    #[test]
    fn test_no_strip_for_single_flat_file() {
        let input = vec!["index.html".to_string()];
        let (prefix, stripped) = strip_single_top_level_folder(&input);
        assert_eq!(prefix, "");
        assert_eq!(stripped, input);
    }

    #[test]
    fn test_unpack_strips_wrapper_and_drops_dirs() {
        let bytes = build_zip(&[
            ("dist/", b""),
            ("dist/index.html", b"<html></html>"),
            ("dist/assets/app.js", b"console.log(1)"),
            ("dist/../escape.txt", b"nope"),
        ]);
        let files = unpack(&bytes).unwrap();
        let mut got = paths(&files);
        got.sort();
        assert_eq!(got, vec!["assets/app.js", "index.html"]);
        let app = files.iter().find(|f| f.path == "assets/app.js").unwrap();
        assert_eq!(app.data, b"console.log(1)");
    }

    #[test]
    fn test_unpack_rejects_empty_archive() {
        let bytes = build_zip(&[("only-dir/", b"")]);
        let err = unpack(&bytes).unwrap_err();
        assert!(err.to_string().contains("no importable files"));
    }

    /// Overwrite the uncompressed size in every zip64 extra field that carries `real`.
    fn forge_zip64_size(bytes: &mut [u8], real: u64, forged: u64) -> usize {
        let needle = real.to_le_bytes();
        let mut patched = 0;
        let mut i = 0;
        while i + 12 <= bytes.len() {
            if bytes[i] == 0x01 && bytes[i + 1] == 0x00 && bytes[i + 4..i + 12] == needle {
                bytes[i + 4..i + 12].copy_from_slice(&forged.to_le_bytes());
                patched += 1;
                i += 12;
            } else {
                i += 1;
            }
        }
        patched
    }

    #[test]
    fn test_unpack_ignores_forged_entry_size() {
        let data = b"hello zip64";
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .large_file(true);
        zip.start_file("index.html", options).unwrap();
        zip.write_all(data).unwrap();
        let mut bytes = zip.finish().unwrap().into_inner();
        assert!(forge_zip64_size(&mut bytes, data.len() as u64, u64::MAX / 2 + 10) >= 1);

        let files = unpack(&bytes).unwrap();
        assert_eq!(paths(&files), vec!["index.html"]);
        assert_eq!(files[0].data, data);
    }

    #[test]
    fn test_unpack_enforces_total_size() {
        let bytes = build_zip(&[("a.txt", &[b'a'; 600]), ("b.txt", &[b'b'; 600])]);
        assert_eq!(unpack_limited(&bytes, 1200).unwrap().len(), 2);
        let err = unpack_limited(&bytes, 1000).unwrap_err();
        assert!(err.to_string().contains("expands past 1000 bytes"), "{err:#}");
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(unpack(b"definitely not a zip").is_err());
    }

    #[test]
    fn test_path_index_files_and_dirs() {
        let index = PathIndex::build(["assets/x.js", "assets/sub/y.png", "index.html"]);
        assert!(index.contains_reference("assets/x.js"));
        assert!(index.contains_reference("assets/x.js?v=3#top"));
        assert!(index.contains_reference("assets/"));
        assert!(index.contains_reference("assets/sub"));
        assert!(!index.contains_reference("api/data"));
        assert!(!index.contains_reference(""));
        assert!(!index.contains_reference("?q"));
    }

    #[test]
    fn test_home_page_prefers_index() {
        let html = html_files(["b.html", "a.html", "index.html"]);
        assert_eq!(select_home_page(&html, None), "index.html");
    }

    #[test]
    fn test_home_page_preferred_must_exist() {
        let html = html_files(["b.html", "a.html", "index.html"]);
        assert_eq!(select_home_page(&html, Some("b.html")), "b.html");
        assert_eq!(select_home_page(&html, Some("missing.html")), "index.html");
    }

    #[test]
    fn test_home_page_case_insensitive_index() {
        let html = html_files(["zeta.html", "INDEX.HTML"]);
        assert_eq!(select_home_page(&html, None), "INDEX.HTML");
    }

    #[test]
    fn test_home_page_falls_back_to_first_html() {
        let html = html_files(["pages/b.htm", "pages/a.html", "style.css"]);
        assert_eq!(select_home_page(&html, None), "pages/a.html");
    }

    #[test]
    fn test_home_page_without_html() {
        let html = html_files(["style.css", "app.js"]);
        assert!(html.is_empty());
        assert_eq!(select_home_page(&html, None), "index.html");
    }

    #[test]
    fn test_content_types() {
        assert_eq!(guess_content_type("INDEX.HTM"), "text/html; charset=utf-8");
        assert_eq!(guess_content_type("a/b.mjs"), "application/javascript; charset=utf-8");
        assert_eq!(guess_content_type("x.js.map"), "application/json; charset=utf-8");
        assert_eq!(guess_content_type("font.woff2"), "font/woff2");
        assert_eq!(guess_content_type("noext"), "application/octet-stream");
        assert!(is_text_like("logo.svg"));
        assert!(!is_text_like("logo.png"));
    }
}
