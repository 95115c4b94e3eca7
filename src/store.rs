use anyhow::{bail, Context, Result};
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::util;
use crate::vfs_format::{self, CachedEntry, FORMAT_VERSION, MAGIC};

const RECORD_EXT: &str = "rec";
const STAGING_MARKER: &str = ".staging-";
const TRASH_MARKER: &str = ".trash-";

/// Disk-backed cache storage: one directory per namespace, one record per request URL.
pub struct VfsStore {
    root: PathBuf,
    import_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl VfsStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create store directory: {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            import_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, cache_name: &str) -> Result<PathBuf> {
        if cache_name.is_empty()
            || cache_name.starts_with('.')
            || cache_name.contains(['/', '\\'])
        {
            bail!("Invalid cache name: {cache_name:?}");
        }
        Ok(self.root.join(cache_name))
    }

    /// Committed namespace names, like `caches.keys()`.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(util::list_subdirectories(&self.root)?
            .into_iter()
            .filter(|name| !name.starts_with('.'))
            .collect())
    }

    pub fn has(&self, cache_name: &str) -> Result<bool> {
        Ok(self.namespace_dir(cache_name)?.is_dir())
    }

    /// Handle to a namespace. Lookups in a namespace that does not exist miss.
    pub fn open_namespace(&self, cache_name: &str) -> Result<Namespace> {
        Ok(Namespace {
            dir: self.namespace_dir(cache_name)?,
        })
    }

    /// Evict a whole namespace. Returns whether it existed.
    pub fn delete(&self, cache_name: &str) -> Result<bool> {
        let dir = self.namespace_dir(cache_name)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(anyhow::Error::from(e))
                .with_context(|| format!("Failed to remove namespace: {}", dir.display())),
        }
    }

    pub fn cached_project_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .keys()?
            .iter()
            .filter_map(|name| vfs_format::project_id_from_cache_name(name))
            .map(str::to_string)
            .collect())
    }

    pub fn is_project_cached(&self, project_id: &str) -> bool {
        !project_id.is_empty()
            && self
                .has(&vfs_format::cache_name(project_id))
                .unwrap_or(false)
    }

    pub fn clear_project_cache(&self, project_id: &str) -> Result<bool> {
        self.delete(&vfs_format::cache_name(project_id))
    }

    /// Start writing a namespace. Nothing is visible until [`StagedNamespace::commit`].
    pub fn stage(&self, cache_name: &str) -> Result<StagedNamespace> {
        let target = self.namespace_dir(cache_name)?;
        let suffix: u64 = rand::thread_rng().gen();
        let staging = self
            .root
            .join(format!(".{cache_name}{STAGING_MARKER}{suffix:016x}"));
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("Failed to create staging directory: {}", staging.display()))?;
        Ok(StagedNamespace {
            root: self.root.clone(),
            staging,
            target,
            written: 0,
            committed: false,
        })
    }

    /// Serialise imports of the same project id. The lock entry is dropped with
    /// the last guard or waiter.
    pub async fn lock_project(&self, project_id: &str) -> ProjectLock<'_> {
        let lock = {
            let mut locks = self
                .import_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        ProjectLock {
            store: self,
            project_id: project_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.import_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Held for the duration of an import or eviction of one project.
pub struct ProjectLock<'a> {
    store: &'a VfsStore,
    project_id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for ProjectLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .store
            .import_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(&self.project_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.project_id);
        }
    }
}

fn record_file_name(url: &str) -> String {
    format!("{}.{RECORD_EXT}", hex::encode(util::hash_bytes(url.as_bytes())))
}

fn encode_record(entry: &CachedEntry) -> Result<Vec<u8>> {
    let encoded = bincode::serialize(entry).context("Failed to serialize cache record")?;
    let compressed = zstd::bulk::compress(&encoded, 3).context("Failed to compress cache record")?;
    let mut out = Vec::with_capacity(MAGIC.len() + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn decode_record(path: &Path) -> Result<CachedEntry> {
    let raw = util::mmap_file(path)?;
    if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
        bail!("Invalid cache record: missing magic header: {}", path.display());
    }
    let decoder =
        zstd::Decoder::new(&raw[MAGIC.len()..]).context("Failed to create zstd decoder")?;
    let entry: CachedEntry =
        bincode::deserialize_from(decoder).context("Failed to deserialize cache record")?;
    if entry.version != FORMAT_VERSION {
        bail!(
            "Unsupported cache record version: {} (expected {})",
            entry.version,
            FORMAT_VERSION
        );
    }
    if util::hash_bytes(&entry.body) != entry.blake3_hash {
        bail!("Hash mismatch for cached body: {}", entry.url);
    }
    Ok(entry)
}

pub struct Namespace {
    dir: PathBuf,
}

impl Namespace {
    /// Exact-URL lookup, like `cache.match(request)`.
    pub fn get(&self, url: &str) -> Result<Option<CachedEntry>> {
        let path = self.dir.join(record_file_name(url));
        if !path.is_file() {
            return Ok(None);
        }
        let entry = decode_record(&path)?;
        // A different URL under the same digest is a miss, not a hit.
        if entry.url != url {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    pub fn urls(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut urls = util::list_files_with_extension(&self.dir, RECORD_EXT)?
            .iter()
            .map(|p| decode_record(p).map(|e| e.url))
            .collect::<Result<Vec<_>>>()?;
        urls.sort();
        Ok(urls)
    }
}

/// A namespace being written. Dropped without commit, it is removed.
pub struct StagedNamespace {
    root: PathBuf,
    staging: PathBuf,
    target: PathBuf,
    written: usize,
    committed: bool,
}

impl StagedNamespace {
    pub fn put(&mut self, url: &str, content_type: &str, body: Vec<u8>) -> Result<()> {
        let entry = CachedEntry {
            version: FORMAT_VERSION,
            url: url.to_string(),
            content_type: content_type.to_string(),
            blake3_hash: util::hash_bytes(&body),
            body,
        };
        let bytes = encode_record(&entry)?;
        let path = self.staging.join(record_file_name(url));
        let mut file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create cache record: {}", path.display()))?;
        file.write_all(&bytes)?;
        file.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Publish the namespace. An existing namespace of the same name is replaced.
    /// Returns whether a previous namespace was replaced.
    pub fn commit(mut self) -> Result<bool> {
        let mut replaced = false;
        let mut trash: Option<PathBuf> = None;
        if self.target.is_dir() {
            let suffix: u64 = rand::thread_rng().gen();
            let name = self
                .target
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("namespace");
            let moved = self.root.join(format!(".{name}{TRASH_MARKER}{suffix:016x}"));
            std::fs::rename(&self.target, &moved).with_context(|| {
                format!("Failed to move aside namespace: {}", self.target.display())
            })?;
            trash = Some(moved);
            replaced = true;
        }

        std::fs::rename(&self.staging, &self.target).with_context(|| {
            format!("Failed to commit namespace: {}", self.target.display())
        })?;
        self.committed = true;

        if let Some(trash) = trash {
            if let Err(e) = std::fs::remove_dir_all(&trash) {
                log::warn!("failed to remove replaced namespace {}: {e}", trash.display());
            }
        }
        Ok(replaced)
    }
}

impl Drop for StagedNamespace {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_dir_all(&self.staging);
        }
    }
}
