//! Durable content store for the vault document tree.
//!
//! Paths on the wire are forward-slash relative paths; on disk they map
//! to native separators under a single storage root. The store keeps an
//! in-memory hash cache (path → SHA-256 hex) that is rebuilt from a
//! full walk on startup and updated on every write/delete.
//!
//! Lock discipline: the hash cache is the only shared mutable
//! structure. Disk I/O happens without the lock held; only the cache
//! update itself takes the write lock.

pub mod tombstones;

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// Metadata for one synchronized file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Forward-slash relative path.
    pub path: String,
    /// Lowercase hex SHA-256 of the content.
    pub hash: String,
    /// Content size in bytes.
    pub size: u64,
    /// Modification time, Unix epoch milliseconds.
    pub mtime: i64,
}

/// Canonicalize a wire path into its safe relative form.
///
/// Rejects empty paths, absolute paths, and any `..` component. `.` and
/// empty segments are dropped. The result uses `/` separators.
pub fn clean_wire_path(path: &str) -> SyncResult<String> {
    if path.is_empty() {
        return Err(SyncError::path_rejected(path));
    }
    if path.starts_with('/') || path.contains('\\') || path.contains(':') {
        return Err(SyncError::path_rejected(path));
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(SyncError::path_rejected(path)),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(SyncError::path_rejected(path));
    }
    Ok(segments.join("/"))
}

/// True when any segment of a relative path begins with a dot.
pub fn is_hidden(rel_path: &str) -> bool {
    rel_path.split('/').any(|s| s.starts_with('.'))
}

/// Path-safe persistence with a hash cache.
pub struct ContentStore {
    root: PathBuf,
    max_file_size: u64,
    hashes: RwLock<HashMap<String, String>>,
}

impl ContentStore {
    /// Open the store rooted at `path`, creating the directory if
    /// needed, and rebuild the hash cache from disk.
    pub fn open(path: &Path, max_file_size_mb: u64) -> SyncResult<Self> {
        fs::create_dir_all(path)?;
        let root = path.canonicalize()?;

        let store = Self {
            root,
            max_file_size: max_file_size_mb * 1024 * 1024,
            hashes: RwLock::new(HashMap::new()),
        };
        store.rebuild_cache();
        Ok(store)
    }

    /// Storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a wire path to its absolute on-disk location.
    fn resolve(&self, path: &str) -> SyncResult<(String, PathBuf)> {
        let rel = clean_wire_path(path)?;
        let full = self.root.join(&rel);
        // The cleaned path has no `..`, so the join cannot escape; the
        // prefix check guards against future changes to the cleaner.
        if !full.starts_with(&self.root) {
            return Err(SyncError::path_rejected(path));
        }
        Ok((rel, full))
    }

    /// Write content atomically and update the hash cache.
    ///
    /// The bytes land in a temp file in the destination directory and
    /// are renamed over the target, so readers never observe a partial
    /// file. The client-supplied mtime is applied afterwards.
    pub fn write(&self, path: &str, content: &[u8], mtime_ms: i64) -> SyncResult<()> {
        let (rel, full) = self.resolve(path)?;

        if content.len() as u64 > self.max_file_size {
            return Err(SyncError::TooLarge {
                size: content.len() as u64,
                max: self.max_file_size,
            });
        }

        let parent = full.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(content)?;
        tmp.flush()?;
        tmp.persist(&full).map_err(|e| e.error)?;

        if mtime_ms > 0 {
            let ft = filetime::FileTime::from_unix_time(
                mtime_ms / 1000,
                ((mtime_ms % 1000) * 1_000_000) as u32,
            );
            if let Err(e) = filetime::set_file_mtime(&full, ft) {
                tracing::warn!(path = %rel, "failed to set mtime: {e}");
            }
        }

        let hash = hash_bytes(content);
        self.hashes.write().insert(rel, hash);
        Ok(())
    }

    /// Validated read of the full content.
    pub fn read(&self, path: &str) -> SyncResult<Vec<u8>> {
        let (_, full) = self.resolve(path)?;
        Ok(fs::read(full)?)
    }

    /// Remove a file. A missing file counts as success. Empty parent
    /// directories are swept up to (but not including) the root.
    pub fn delete(&self, path: &str) -> SyncResult<()> {
        let (rel, full) = self.resolve(path)?;

        match fs::remove_file(&full) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.hashes.write().remove(&rel);

        if let Some(parent) = full.parent() {
            self.sweep_empty_dirs(parent);
        }
        Ok(())
    }

    /// Cached hash for a path, if known. Never touches the disk.
    pub fn hash_of(&self, path: &str) -> Option<String> {
        self.hashes.read().get(path).cloned()
    }

    /// Hash, size, and mtime of a stored file.
    pub fn info(&self, path: &str) -> SyncResult<FileRecord> {
        let (rel, full) = self.resolve(path)?;
        let meta = fs::metadata(&full)?;
        let hash = self.hashes.read().get(&rel).cloned().unwrap_or_default();
        Ok(FileRecord {
            path: rel,
            hash,
            size: meta.len(),
            mtime: mtime_millis(&meta),
        })
    }

    /// Walk the root and list every non-hidden file.
    pub fn list(&self) -> SyncResult<Vec<FileRecord>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !file_name_hidden(e.path()))
        {
            let entry = entry.map_err(|e| SyncError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(r) => path_to_wire(r),
                Err(_) => continue,
            };

            let meta = entry.metadata().map_err(|e| SyncError::Io(e.into()))?;
            let hash = self.hashes.read().get(&rel).cloned().unwrap_or_default();
            files.push(FileRecord {
                path: rel,
                hash,
                size: meta.len(),
                mtime: mtime_millis(&meta),
            });
        }

        Ok(files)
    }

    /// Walk and hash every non-hidden file. Unreadable files are logged
    /// and skipped; a startup rebuild must not fail on one bad entry.
    pub fn rebuild_cache(&self) {
        let mut rebuilt = HashMap::new();

        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !file_name_hidden(e.path()))
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(r) => path_to_wire(r),
                Err(_) => continue,
            };
            match fs::read(entry.path()) {
                Ok(content) => {
                    rebuilt.insert(rel, hash_bytes(&content));
                }
                Err(e) => {
                    tracing::warn!(path = %rel, "skipping unreadable file: {e}");
                }
            }
        }

        let count = rebuilt.len();
        *self.hashes.write() = rebuilt;
        tracing::info!(files = count, "hash cache rebuilt");
    }

    /// Remove empty directories from `dir` upward, stopping at the root.
    fn sweep_empty_dirs(&self, mut dir: &Path) {
        while dir != self.root && dir.starts_with(&self.root) {
            let empty = match fs::read_dir(dir) {
                Ok(mut entries) => entries.next().is_none(),
                Err(_) => break,
            };
            if !empty || fs::remove_dir(dir).is_err() {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn hash_bytes(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn mtime_millis(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn file_name_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn path_to_wire(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
