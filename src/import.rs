use anyhow::{Context, Result};
use base64::Engine;
use rayon::prelude::*;
use std::sync::Arc;

use crate::archive::{self, ArchiveFile, PathIndex};
use crate::rewrite;
use crate::runtime;
use crate::store::{StagedNamespace, VfsStore};
use crate::util;
use crate::vfs_format::{self, ImportResult};

/// Files written per blocking batch before yielding back to the runtime.
pub const YIELD_EVERY: usize = 75;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Rewrite root-relative references (`/assets/x.js`) that point into the archive.
    pub fix_root_relative_urls: bool,
    /// Used as the homepage when it names an HTML file in the archive.
    pub preferred_home_page: Option<String>,
    /// Bake the iframe height reporter into every stored HTML file.
    pub inject_resizer: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            fix_root_relative_urls: true,
            preferred_home_page: None,
            inject_resizer: false,
        }
    }
}

struct PreparedFile {
    url: String,
    content_type: &'static str,
    body: Vec<u8>,
}

fn prepare_file(
    file: ArchiveFile,
    index: &PathIndex,
    extension_base: &str,
    project_id: &str,
    vfs_base: &str,
    options: &ImportOptions,
) -> PreparedFile {
    let content_type = archive::guess_content_type(&file.path);
    let url = vfs_format::build_vfs_url(extension_base, project_id, &file.path);

    let is_html = content_type.starts_with("text/html");
    let rewritable = is_html
        || content_type.starts_with("text/css")
        || content_type.contains("javascript");

    // Binary and non-rewritable text keep their exact bytes.
    if !archive::is_text_like(&file.path) || !rewritable {
        return PreparedFile {
            url,
            content_type,
            body: file.data,
        };
    }

    let text = String::from_utf8_lossy(&file.data);
    let mut out = rewrite::rewrite(
        &file.path,
        &text,
        content_type,
        index,
        vfs_base,
        options.fix_root_relative_urls,
    );
    if is_html && options.inject_resizer {
        out = runtime::inject_resizer(&out);
    }
    PreparedFile {
        url,
        content_type,
        body: out.into_bytes(),
    }
}

/// Import a WebZip into the store under its content address.
///
/// Pipeline: hash, unpack, rewrite text assets (Rayon), write entries in batches of
/// [`YIELD_EVERY`] on the blocking pool, then atomically commit the namespace. Nothing
/// becomes addressable unless every entry was written.
pub async fn import_zip(
    store: &Arc<VfsStore>,
    extension_base: &str,
    bytes: Vec<u8>,
    options: &ImportOptions,
) -> Result<ImportResult> {
    let bytes: Arc<[u8]> = bytes.into();

    // Stage 1: content address
    let hash_input = Arc::clone(&bytes);
    let project_id = tokio::task::spawn_blocking(move || util::sha256_hex(&hash_input)).await?;
    let cache_name = vfs_format::cache_name(&project_id);
    let vfs_base = vfs_format::vfs_base_pathname(extension_base, &project_id)?;

    let _guard = store.lock_project(&project_id).await;
    log::info!("importing {} bytes as project {project_id}", bytes.len());

    // Stage 2: unpack
    let zip_input = Arc::clone(&bytes);
    let files = tokio::task::spawn_blocking(move || archive::unpack(&zip_input))
        .await?
        .context("Failed to unpack WebZip")?;

    let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
    let index = PathIndex::build(paths.iter().map(String::as_str));
    let html_files = archive::html_files(paths.iter().map(String::as_str));
    let home_page = archive::select_home_page(&html_files, options.preferred_home_page.as_deref());
    let file_count = files.len();

    // Stage 3: rewrite (Rayon par_iter inside spawn_blocking)
    let prepared: Vec<PreparedFile> = {
        let base = extension_base.to_string();
        let id = project_id.clone();
        let options = options.clone();
        tokio::task::spawn_blocking(move || {
            files
                .into_par_iter()
                .map(|f| prepare_file(f, &index, &base, &id, &vfs_base, &options))
                .collect()
        })
        .await?
    };

    // Stage 4: write in batches, yielding between them
    let mut staged = store.stage(&cache_name)?;
    let mut remaining = prepared.into_iter();
    loop {
        let batch: Vec<PreparedFile> = remaining.by_ref().take(YIELD_EVERY).collect();
        if batch.is_empty() {
            break;
        }
        staged = tokio::task::spawn_blocking(move || -> Result<StagedNamespace> {
            for file in batch {
                staged
                    .put(&file.url, file.content_type, file.body)
                    .with_context(|| format!("Failed to cache {}", file.url))?;
            }
            Ok(staged)
        })
        .await??;
        tokio::task::yield_now().await;
    }

    // Stage 5: publish
    let replaced = tokio::task::spawn_blocking(move || staged.commit()).await??;
    if replaced {
        log::info!("project {project_id} was already cached, namespace replaced");
    }
    log::info!("imported project {project_id}: {file_count} files, home {home_page}");

    Ok(ImportResult {
        project_id,
        home_page,
        html_files,
        file_count,
        cache_name,
    })
}

/// Same as [`import_zip`] for a base64-encoded archive.
pub async fn import_zip_base64(
    store: &Arc<VfsStore>,
    extension_base: &str,
    zip_base64: &str,
    options: &ImportOptions,
) -> Result<ImportResult> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(zip_base64.trim())
        .context("Invalid base64 zip data")?;
    import_zip(store, extension_base, bytes, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const BASE: &str = "http://127.0.0.1:8787/dist/";

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn open_store() -> (tempfile::TempDir, Arc<VfsStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VfsStore::open(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn test_import_round_trip() {
        let (_dir, store) = open_store();
        let png = [0x89u8, b'P', b'N', b'G', 0, 1, 2, 3];
        let zip = build_zip(&[
            ("site/index.html", br#"<script src="/assets/app.js"></script>"#),
            ("site/assets/app.js", b"fetch('/api/data')"),
            ("site/img/logo.png", &png),
        ]);
        let expected_id = util::sha256_hex(&zip);

        let result = import_zip(&store, BASE, zip, &ImportOptions::default()).await.unwrap();
        assert_eq!(result.project_id, expected_id);
        assert_eq!(result.home_page, "index.html");
        assert_eq!(result.html_files, vec!["index.html"]);
        assert_eq!(result.file_count, 3);
        assert_eq!(result.cache_name, format!("st-higanbana-vfs-{expected_id}"));

        let ns = store.open_namespace(&result.cache_name).unwrap();
        let html = ns
            .get(&vfs_format::build_vfs_url(BASE, &expected_id, "index.html"))
            .unwrap()
            .unwrap();
        assert_eq!(html.content_type, "text/html; charset=utf-8");
        let html = String::from_utf8(html.body).unwrap();
        assert!(html.contains(&format!("/dist/vfs/{expected_id}/assets/app.js")));

        let logo = ns
            .get(&vfs_format::build_vfs_url(BASE, &expected_id, "img/logo.png"))
            .unwrap()
            .unwrap();
        assert_eq!(logo.body, png);
        assert_eq!(logo.content_type, "image/png");

        let js = ns
            .get(&vfs_format::build_vfs_url(BASE, &expected_id, "assets/app.js"))
            .unwrap()
            .unwrap();
        assert_eq!(js.body, b"fetch('/api/data')");
    }

    #[tokio::test]
    async fn test_reimport_is_idempotent() {
        let (_dir, store) = open_store();
        let zip = build_zip(&[("index.html", b"<p>x</p>")]);
        let first = import_zip(&store, BASE, zip.clone(), &ImportOptions::default()).await.unwrap();
        let second = import_zip(&store, BASE, zip, &ImportOptions::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.keys().unwrap(), vec![first.cache_name]);
    }

    #[tokio::test]
    async fn test_concurrent_imports_of_same_archive() {
        let (_dir, store) = open_store();
        let zip = build_zip(&[("index.html", b"<p>x</p>"), ("a.css", b"body{}")]);
        let opts = ImportOptions::default();
        let (a, b) = tokio::join!(
            import_zip(&store, BASE, zip.clone(), &opts),
            import_zip(&store, BASE, zip, &opts),
        );
        assert_eq!(a.unwrap().project_id, b.unwrap().project_id);
        assert_eq!(store.keys().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_archive_creates_nothing() {
        let (dir, store) = open_store();
        let zip = build_zip(&[("../evil.txt", b"x")]);
        let err = import_zip(&store, BASE, zip, &ImportOptions::default()).await.unwrap_err();
        assert!(format!("{err:#}").contains("archive has no importable files"));
        assert!(store.keys().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_many_files_span_batches() {
        let (_dir, store) = open_store();
        let names: Vec<String> = (0..(YIELD_EVERY * 2 + 3)).map(|i| format!("f{i:03}.txt")).collect();
        let entries: Vec<(&str, &[u8])> = names.iter().map(|n| (n.as_str(), b"x" as &[u8])).collect();
        let zip = build_zip(&entries);
        let result = import_zip(&store, BASE, zip, &ImportOptions::default()).await.unwrap();
        assert_eq!(result.file_count, names.len());
        assert_eq!(result.home_page, "index.html");
        let ns = store.open_namespace(&result.cache_name).unwrap();
        assert_eq!(ns.urls().unwrap().len(), names.len());
    }

    #[tokio::test]
    async fn test_rewrite_disabled_and_preferred_home() {
        let (_dir, store) = open_store();
        let src: &[u8] = br#"<img src="/img/a.png">"#;
        let zip = build_zip(&[("index.html", src), ("other.html", b""), ("img/a.png", b"p")]);
        let options = ImportOptions {
            fix_root_relative_urls: false,
            preferred_home_page: Some("other.html".into()),
            inject_resizer: false,
        };
        let result = import_zip(&store, BASE, zip, &options).await.unwrap();
        assert_eq!(result.home_page, "other.html");
        let ns = store.open_namespace(&result.cache_name).unwrap();
        let html = ns
            .get(&vfs_format::build_vfs_url(BASE, &result.project_id, "index.html"))
            .unwrap()
            .unwrap();
        assert_eq!(html.body, src);
    }

    #[tokio::test]
    async fn test_resizer_baked_into_html() {
        let (_dir, store) = open_store();
        let zip = build_zip(&[("index.html", b"<body></body>")]);
        let options = ImportOptions {
            inject_resizer: true,
            ..ImportOptions::default()
        };
        let result = import_zip(&store, BASE, zip, &options).await.unwrap();
        let ns = store.open_namespace(&result.cache_name).unwrap();
        let html = ns
            .get(&vfs_format::build_vfs_url(BASE, &result.project_id, "index.html"))
            .unwrap()
            .unwrap();
        assert!(String::from_utf8(html.body).unwrap().contains(runtime::RESIZER_MARKER));
    }

    #[tokio::test]
    async fn test_import_base64() {
        let (_dir, store) = open_store();
        let zip = build_zip(&[("index.html", b"<p>x</p>")]);
        let id = util::sha256_hex(&zip);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&zip);
        let result = import_zip_base64(&store, BASE, &encoded, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(result.project_id, id);
        assert!(import_zip_base64(&store, BASE, "!!!", &ImportOptions::default()).await.is_err());
    }
}
