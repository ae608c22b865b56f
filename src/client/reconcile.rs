//! Full-sync reconciliation: a three-way merge between the local file
//! set, the server file set, and the server's tombstones.
//!
//! The plan is computed as pure data and executed separately, so every
//! rule is unit-testable without sockets or timers. The one invariant
//! that must never break: a local file is only deleted when the server
//! presents an explicit tombstone for its path. A wiped or rolled-back
//! server therefore re-learns content from clients instead of
//! destroying it.

use crate::client::vault::LocalVault;
use crate::error::SyncResult;
use crate::protocol::FullSyncPayload;
use crate::storage::hash_bytes;
use std::collections::{HashMap, HashSet};

/// Hash this many local files between cooperative yields, so a large
/// vault does not starve the host's event loop.
const YIELD_EVERY: usize = 50;

/// One local file with its freshly computed hash.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub path: String,
    pub hash: String,
    pub mtime: i64,
}

/// Actions reconciliation decided on.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Fetch these paths from the server (server copy is newer or
    /// missing locally).
    pub request: Vec<String>,
    /// Upload these local paths (local copy is newer or unknown to the
    /// server).
    pub upload: Vec<String>,
    /// Ask the server to delete these stale paths (a move was already
    /// applied locally).
    pub delete_remote: Vec<String>,
    /// Delete these local paths (explicit server tombstone).
    pub delete_local: Vec<String>,
}

impl ReconcilePlan {
    /// True when local and server state already agree.
    pub fn is_empty(&self) -> bool {
        self.request.is_empty()
            && self.upload.is_empty()
            && self.delete_remote.is_empty()
            && self.delete_local.is_empty()
    }
}

/// Enumerate and hash every local file, yielding to the host
/// periodically.
pub async fn hash_local_files(vault: &dyn LocalVault) -> SyncResult<Vec<LocalEntry>> {
    let mut entries = Vec::new();

    for (i, file) in vault.list().await?.into_iter().enumerate() {
        let content = match vault.read(&file.path).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %file.path, "skipping unreadable local file: {e}");
                continue;
            }
        };
        entries.push(LocalEntry {
            path: file.path,
            hash: hash_bytes(&content),
            mtime: file.mtime,
        });

        if (i + 1) % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }

    Ok(entries)
}

/// Compute the reconciliation plan.
pub fn build_plan(local: &[LocalEntry], server: &FullSyncPayload) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    let local_by_path: HashMap<&str, &LocalEntry> =
        local.iter().map(|e| (e.path.as_str(), e)).collect();
    let mut local_by_hash: HashMap<&str, &str> = HashMap::new();
    for entry in local {
        local_by_hash
            .entry(entry.hash.as_str())
            .or_insert(entry.path.as_str());
    }

    let server_paths: HashSet<&str> = server.files.iter().map(|f| f.path.as_str()).collect();
    let tombstoned: HashSet<&str> = server
        .tombstones
        .iter()
        .map(|t| t.path.as_str())
        .collect();

    for server_file in &server.files {
        match local_by_path.get(server_file.path.as_str()) {
            Some(local_file) => {
                if local_file.mtime > server_file.mtime {
                    plan.upload.push(server_file.path.clone());
                } else if local_file.mtime < server_file.mtime {
                    plan.request.push(server_file.path.clone());
                }
                // Equal mtimes: already in sync.
            }
            None => {
                match local_by_hash.get(server_file.hash.as_str()) {
                    // Same bytes live at a different local path: the
                    // move already happened here, so the server-side
                    // path is stale. The content re-uploads from the
                    // new path in the local-only pass below.
                    Some(local_path) if *local_path != server_file.path => {
                        plan.delete_remote.push(server_file.path.clone());
                    }
                    _ => plan.request.push(server_file.path.clone()),
                }
            }
        }
    }

    for local_file in local {
        if server_paths.contains(local_file.path.as_str()) {
            continue;
        }
        if tombstoned.contains(local_file.path.as_str()) {
            // The only way reconciliation ever deletes local data.
            plan.delete_local.push(local_file.path.clone());
        } else {
            plan.upload.push(local_file.path.clone());
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::storage::tombstones::Tombstone;
    use crate::storage::FileRecord;

    fn local(path: &str, content: &[u8], mtime: i64) -> LocalEntry {
        LocalEntry {
            path: path.into(),
            hash: hash_bytes(content),
            mtime,
        }
    }

    fn remote(path: &str, content: &[u8], mtime: i64) -> FileRecord {
        FileRecord {
            path: path.into(),
            hash: hash_bytes(content),
            size: content.len() as u64,
            mtime,
        }
    }

    fn tombstone(path: &str) -> Tombstone {
        Tombstone {
            path: path.into(),
            deleted_at: 100,
            deleted_by: "d1".into(),
            vector_clock: VectorClock::new(),
            ttl: i64::MAX,
        }
    }

    fn payload(files: Vec<FileRecord>, tombstones: Vec<Tombstone>) -> FullSyncPayload {
        FullSyncPayload {
            files,
            tombstones,
            vector_clock: VectorClock::new(),
        }
    }

    #[test]
    fn identical_states_produce_empty_plan() {
        let locals = vec![local("a.md", b"a", 1000)];
        let server = payload(vec![remote("a.md", b"a", 1000)], vec![]);
        assert!(build_plan(&locals, &server).is_empty());
    }

    #[test]
    fn newer_local_uploads() {
        let locals = vec![local("a.md", b"edited", 2000)];
        let server = payload(vec![remote("a.md", b"old", 1000)], vec![]);
        let plan = build_plan(&locals, &server);
        assert_eq!(plan.upload, vec!["a.md"]);
        assert!(plan.request.is_empty());
    }

    #[test]
    fn newer_server_requests() {
        let locals = vec![local("a.md", b"old", 1000)];
        let server = payload(vec![remote("a.md", b"edited", 2000)], vec![]);
        let plan = build_plan(&locals, &server);
        assert_eq!(plan.request, vec!["a.md"]);
        assert!(plan.upload.is_empty());
    }

    #[test]
    fn missing_local_file_is_requested() {
        let server = payload(vec![remote("new.md", b"n", 1000)], vec![]);
        let plan = build_plan(&[], &server);
        assert_eq!(plan.request, vec!["new.md"]);
    }

    #[test]
    fn locally_applied_move_deletes_stale_server_path() {
        // The file moved old.md → new.md locally while offline; the
        // server still has old.md with identical content.
        let locals = vec![local("new.md", b"same bytes", 1000)];
        let server = payload(vec![remote("old.md", b"same bytes", 1000)], vec![]);

        let plan = build_plan(&locals, &server);
        assert_eq!(plan.delete_remote, vec!["old.md"]);
        // The content re-uploads from its new local path.
        assert_eq!(plan.upload, vec!["new.md"]);
        assert!(plan.delete_local.is_empty());
    }

    #[test]
    fn tombstoned_local_file_is_deleted() {
        let locals = vec![local("gone.md", b"g", 1000)];
        let server = payload(vec![], vec![tombstone("gone.md")]);
        let plan = build_plan(&locals, &server);
        assert_eq!(plan.delete_local, vec!["gone.md"]);
        assert!(plan.upload.is_empty());
    }

    #[test]
    fn server_wipe_uploads_everything_deletes_nothing() {
        let locals = vec![local("foo.md", b"f", 1000), local("bar.md", b"b", 1000)];
        let server = payload(vec![], vec![]);

        let plan = build_plan(&locals, &server);
        let mut uploads = plan.upload.clone();
        uploads.sort();
        assert_eq!(uploads, vec!["bar.md", "foo.md"]);
        assert!(plan.delete_local.is_empty());
        assert!(plan.delete_remote.is_empty());
    }

    #[test]
    fn never_deletes_local_without_tombstone() {
        // Whatever the server says, a path absent from its tombstone
        // set must never land in delete_local.
        let locals = vec![
            local("a.md", b"a", 1000),
            local("b.md", b"b", 1000),
            local("c.md", b"c", 1000),
        ];
        let server = payload(
            vec![remote("unrelated.md", b"u", 1000)],
            vec![tombstone("b.md")],
        );

        let plan = build_plan(&locals, &server);
        assert_eq!(plan.delete_local, vec!["b.md"]);
        assert!(!plan.delete_local.contains(&"a.md".to_string()));
        assert!(!plan.delete_local.contains(&"c.md".to_string()));
    }

    #[test]
    fn same_hash_at_same_path_is_in_sync() {
        // Hash match at the same path with equal mtimes: nothing to do,
        // not a move.
        let locals = vec![local("a.md", b"x", 1000)];
        let server = payload(vec![remote("a.md", b"x", 1000)], vec![]);
        assert!(build_plan(&locals, &server).is_empty());
    }

    #[tokio::test]
    async fn hash_local_files_covers_the_vault() {
        use crate::client::vault::{DiskVault, LocalVault};
        let tmp = tempfile::TempDir::new().unwrap();
        let vault = DiskVault::open(tmp.path()).unwrap();
        vault.write("a.md", b"hello", 0).await.unwrap();
        vault.write("sub/b.md", b"world", 0).await.unwrap();

        let mut entries = hash_local_files(&vault).await.unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "a.md");
        assert_eq!(entries[0].hash, hash_bytes(b"hello"));
        assert_eq!(entries[1].path, "sub/b.md");
    }
}
