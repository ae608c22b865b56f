//! Seam between the sync client and the host's file API.
//!
//! The host application owns local filesystem access; the coordinator
//! only talks to this trait. `DiskVault` is the plain-filesystem
//! implementation used by headless hosts and tests. Hidden entries
//! (any segment starting with `.`) never appear in listings, matching
//! the server walk.

use crate::error::SyncResult;
use crate::storage::{clean_wire_path, is_hidden};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One local file as seen by a vault listing.
#[derive(Debug, Clone)]
pub struct LocalFile {
    /// Forward-slash relative path.
    pub path: String,
    /// Modification time, Unix epoch milliseconds.
    pub mtime: i64,
}

/// Host file API used by the client coordinator.
#[async_trait]
pub trait LocalVault: Send + Sync {
    /// Read the full content of a file.
    async fn read(&self, path: &str) -> SyncResult<Vec<u8>>;

    /// Write content, creating parent directories as needed.
    async fn write(&self, path: &str, content: &[u8], mtime_ms: i64) -> SyncResult<()>;

    /// Delete a file. Missing files count as success.
    async fn delete(&self, path: &str) -> SyncResult<()>;

    /// Modification time of a file, Unix epoch milliseconds.
    async fn mtime(&self, path: &str) -> SyncResult<i64>;

    /// True when the file exists.
    async fn exists(&self, path: &str) -> bool;

    /// Every non-hidden file in the vault.
    async fn list(&self) -> SyncResult<Vec<LocalFile>>;
}

/// Filesystem-backed vault rooted at a directory.
pub struct DiskVault {
    root: PathBuf,
}

impl DiskVault {
    pub fn open(root: &Path) -> SyncResult<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    fn resolve(&self, path: &str) -> SyncResult<PathBuf> {
        Ok(self.root.join(clean_wire_path(path)?))
    }
}

#[async_trait]
impl LocalVault for DiskVault {
    async fn read(&self, path: &str) -> SyncResult<Vec<u8>> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::read(full).await?)
    }

    async fn write(&self, path: &str, content: &[u8], mtime_ms: i64) -> SyncResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;

        if mtime_ms > 0 {
            let ft = filetime::FileTime::from_unix_time(
                mtime_ms / 1000,
                ((mtime_ms % 1000) * 1_000_000) as u32,
            );
            if let Err(e) = filetime::set_file_mtime(&full, ft) {
                tracing::debug!(path, "failed to set mtime: {e}");
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> SyncResult<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn mtime(&self, path: &str) -> SyncResult<i64> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(full).await?;
        Ok(meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0))
    }

    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(full) => tokio::fs::try_exists(full).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn list(&self) -> SyncResult<Vec<LocalFile>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(&self.root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(r) => r
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                Err(_) => continue,
            };
            if is_hidden(&rel) {
                continue;
            }

            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            files.push(LocalFile { path: rel, mtime });
        }

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_read_delete_cycle() {
        let tmp = TempDir::new().unwrap();
        let vault = DiskVault::open(tmp.path()).unwrap();

        vault.write("notes/a.md", b"hello", 1_000_000).await.unwrap();
        assert!(vault.exists("notes/a.md").await);
        assert_eq!(vault.read("notes/a.md").await.unwrap(), b"hello");

        vault.delete("notes/a.md").await.unwrap();
        assert!(!vault.exists("notes/a.md").await);
        // Deleting again is still success.
        vault.delete("notes/a.md").await.unwrap();
    }

    #[tokio::test]
    async fn list_skips_hidden() {
        let tmp = TempDir::new().unwrap();
        let vault = DiskVault::open(tmp.path()).unwrap();

        vault.write("a.md", b"a", 0).await.unwrap();
        vault.write("sub/b.md", b"b", 0).await.unwrap();
        std::fs::create_dir_all(tmp.path().join(".obsidian")).unwrap();
        std::fs::write(tmp.path().join(".obsidian/app.json"), b"{}").unwrap();

        let mut paths: Vec<_> = vault
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["a.md", "sub/b.md"]);
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let vault = DiskVault::open(tmp.path()).unwrap();
        assert!(vault.read("../outside.md").await.is_err());
        assert!(vault.write("../outside.md", b"x", 0).await.is_err());
    }

    #[tokio::test]
    async fn mtime_is_preserved() {
        let tmp = TempDir::new().unwrap();
        let vault = DiskVault::open(tmp.path()).unwrap();
        vault.write("a.md", b"x", 1_700_000_000_000).await.unwrap();
        let mtime = vault.mtime("a.md").await.unwrap();
        assert!((mtime - 1_700_000_000_000).abs() < 1000);
    }
}
