//! DocumentStore: versioned JSON documents with atomic replace-on-write
//!
//! Documents live at `<root>/<key>.json`. A save only commits when the on-disk
//! version still equals the version the caller loaded; the check and the rename
//! run under a per-key lock inside the process and an advisory file lock across
//! processes, so concurrent writers observe a total order at the commit point.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StoreSettings;
use crate::error::{GatehouseError, Result, ResultExt};

/// A document carrying its own optimistic-concurrency version
pub trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

/// Consistent view of a document as it was on disk
#[derive(Debug, Clone)]
pub struct Snapshot<D> {
    pub document: D,
    /// 0 for a document that does not exist yet
    pub version: u64,
    /// BLAKE3 of the bytes read; `None` when the document was missing
    pub digest: Option<String>,
}

/// File-backed store for queue, registry and manifest documents
#[derive(Debug)]
pub struct DocumentStore {
    root: PathBuf,
    max_commit_retries: usize,
    lock_timeout: Duration,
    retry_backoff: Duration,
    commit_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DocumentStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>, settings: &StoreSettings) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(GatehouseError::from)
            .with_context(|| format!("creating store root {}", root.display()))?;
        Ok(Self {
            root,
            max_commit_retries: settings.max_commit_retries.max(1),
            lock_timeout: Duration::from_millis(settings.lock_timeout_ms),
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            commit_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_commit_retries(&self) -> usize {
        self.max_commit_retries
    }

    /// Jittered pause before conflict retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let base = self.retry_backoff.as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }
        let step = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(5));
        let jitter = rand::thread_rng().gen_range(0..=step);
        Duration::from_millis(step + jitter)
    }

    /// Backing file of a document key
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.exists())
    }

    /// Load a document; a missing one is its `Default` at version 0
    pub fn load<D>(&self, key: &str) -> Result<Snapshot<D>>
    where
        D: DeserializeOwned + Default + Versioned,
    {
        let path = self.path_for(key)?;
        read_snapshot(&path).with_context(|| format!("loading document '{key}'"))
    }

    /// Commit `document` if the stored version is still `expected`.
    ///
    /// On success the document's version becomes `expected + 1` and is returned.
    pub fn save<D>(&self, key: &str, document: &mut D, expected: u64) -> Result<u64>
    where
        D: Serialize + DeserializeOwned + Default + Versioned,
    {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let local = self.commit_lock(key);
        let _guard = local.lock();
        let _lease = CommitLease::acquire(&lease_path(&path), self.lock_timeout)?;

        let found = read_snapshot::<D>(&path)?.version;
        if found != expected {
            debug!(key, expected, found, "version check failed");
            return Err(GatehouseError::ConcurrentModification {
                key: key.to_string(),
                expected,
                found,
            });
        }

        let next = expected + 1;
        document.set_version(next);
        let bytes = serde_json::to_vec_pretty(document)?;
        write_atomic(&path, &bytes).with_context(|| format!("committing document '{key}'"))?;
        debug!(key, version = next, bytes = bytes.len(), "document committed");
        Ok(next)
    }

    /// Load, mutate and save, reloading on version conflicts.
    ///
    /// `mutate` may run several times and must derive its result from the
    /// document it is given. Conflicts beyond the retry bound are surfaced.
    pub fn update<D, T, F>(&self, key: &str, mut mutate: F) -> Result<(T, u64)>
    where
        D: Serialize + DeserializeOwned + Default + Versioned,
        F: FnMut(&mut D) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut snapshot = self.load::<D>(key)?;
            let value = mutate(&mut snapshot.document)?;
            match self.save(key, &mut snapshot.document, snapshot.version) {
                Ok(version) => return Ok((value, version)),
                Err(GatehouseError::ConcurrentModification { .. })
                    if attempt < self.max_commit_retries =>
                {
                    warn!(key, attempt, "concurrent modification, retrying");
                    std::thread::sleep(self.retry_delay(attempt));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-read a document and check that it parses and carries a version
    pub fn verify<D>(&self, key: &str) -> Result<u64>
    where
        D: DeserializeOwned + Default + Versioned,
    {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(0);
        }
        let bytes = std::fs::read(&path)?;
        let document: D = serde_json::from_slice(&bytes).map_err(|e| {
            GatehouseError::IntegrityViolation(format!("document '{key}' does not parse: {e}"))
        })?;
        if document.version() == 0 {
            return Err(GatehouseError::IntegrityViolation(format!(
                "document '{key}' exists but carries version 0"
            )));
        }
        Ok(document.version())
    }

    fn commit_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.commit_locks
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

fn read_snapshot<D>(path: &Path) -> Result<Snapshot<D>>
where
    D: DeserializeOwned + Default + Versioned,
{
    match std::fs::read(path) {
        Ok(bytes) => {
            let document: D = serde_json::from_slice(&bytes)?;
            Ok(Snapshot {
                version: document.version(),
                document,
                digest: Some(digest(&bytes)),
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Snapshot {
            document: D::default(),
            version: 0,
            digest: None,
        }),
        Err(e) => Err(e.into()),
    }
}

/// BLAKE3 hex digest
pub fn digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Keys are relative, `/`-separated, and may not climb out of the root
fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if bad {
        return Err(GatehouseError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn lease_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Write `bytes` to `path` so readers see either the old or the new content.
///
/// The temporary file sits next to the target, is synced before the rename,
/// and the parent directory is synced after it.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let tmp = parent.join(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));

    let written = (|| -> std::io::Result<()> {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }

    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Advisory lock on `<document>.json.lock`, held for one commit.
///
/// The lock file stays on disk between commits. The kernel releases the lock
/// when the handle closes, so a crashed holder never leaves a stale lease.
#[derive(Debug)]
struct CommitLease {
    file: File,
}

impl CommitLease {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= timeout {
                        return Err(std::io::Error::new(
                            ErrorKind::TimedOut,
                            format!("timed out waiting for commit lease {}", path.display()),
                        )
                        .into());
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for CommitLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Run blocking store or filesystem work off the async worker threads
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?
}

/// Lexically normalise a path, without touching the filesystem
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
