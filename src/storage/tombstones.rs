//! Deletion tombstones with causal metadata and TTL.
//!
//! A tombstone records that a path was deleted, by whom, and at which
//! vector clock, so that a stale write from an offline device cannot
//! silently resurrect the file. Tombstones expire after 30 days and
//! are garbage-collected periodically.
//!
//! The registry is persisted as a single JSON file inside the storage
//! root. The file name starts with a dot, so it is invisible to
//! listings and full-sync assembly. A missing or corrupt file starts
//! an empty registry.

use crate::clock::VectorClock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tombstone lifetime: 30 days (seconds).
const TOMBSTONE_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Registry file name inside the storage root.
const REGISTRY_FILE: &str = ".tombstones.json";

/// Marker for a deleted path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    /// Forward-slash relative path that was deleted.
    pub path: String,
    /// Deletion time, Unix epoch seconds.
    #[serde(rename = "deletedAt")]
    pub deleted_at: i64,
    /// Device that performed the deletion.
    #[serde(rename = "deletedBy")]
    pub deleted_by: String,
    /// Server vector clock at deletion time.
    #[serde(rename = "vectorClock", default)]
    pub vector_clock: VectorClock,
    /// Absolute expiry time, Unix epoch seconds.
    pub ttl: i64,
}

/// In-memory tombstone map with JSON persistence.
pub struct TombstoneRegistry {
    file: PathBuf,
    entries: RwLock<HashMap<String, Tombstone>>,
}

impl TombstoneRegistry {
    /// Load the registry from the storage root.
    pub fn load(storage_root: &Path) -> Self {
        let file = storage_root.join(REGISTRY_FILE);

        let entries = match fs::read(&file) {
            Ok(raw) => match serde_json::from_slice::<Vec<Tombstone>>(&raw) {
                Ok(list) => {
                    let map: HashMap<String, Tombstone> =
                        list.into_iter().map(|t| (t.path.clone(), t)).collect();
                    tracing::info!(tombstones = map.len(), "tombstone registry loaded");
                    map
                }
                Err(e) => {
                    tracing::warn!("corrupt tombstone registry, starting empty: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            file,
            entries: RwLock::new(entries),
        }
    }

    /// Record a deletion. Replaces any existing tombstone for the path.
    pub fn create(&self, path: &str, device_id: &str, clock: VectorClock) -> Tombstone {
        let now = epoch_secs();
        let tombstone = Tombstone {
            path: path.to_string(),
            deleted_at: now,
            deleted_by: device_id.to_string(),
            vector_clock: clock,
            ttl: now + TOMBSTONE_TTL_SECS,
        };

        self.entries
            .write()
            .insert(path.to_string(), tombstone.clone());
        self.persist();
        tombstone
    }

    /// Tombstone for a path, if one exists.
    pub fn get(&self, path: &str) -> Option<Tombstone> {
        self.entries.read().get(path).cloned()
    }

    /// Remove the tombstone for a path (resurrection). Returns whether
    /// one existed.
    pub fn remove(&self, path: &str) -> bool {
        let removed = self.entries.write().remove(path).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    /// All live tombstones.
    pub fn list(&self) -> Vec<Tombstone> {
        self.entries.read().values().cloned().collect()
    }

    /// Drop entries whose TTL has expired. Returns the count removed.
    pub fn gc(&self) -> usize {
        let now = epoch_secs();
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, t| t.ttl >= now);
            before - entries.len()
        };

        if removed > 0 {
            tracing::info!(removed, "expired tombstones collected");
            self.persist();
        }
        removed
    }

    /// Number of live tombstones.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no tombstones are recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Rewrite the registry file from the current map.
    fn persist(&self) {
        let list: Vec<Tombstone> = self.entries.read().values().cloned().collect();
        let json = match serde_json::to_vec_pretty(&list) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!("failed to serialize tombstone registry: {e}");
                return;
            }
        };
        if let Err(e) = fs::write(&self.file, json) {
            tracing::warn!("failed to persist tombstone registry: {e}");
        }
    }
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_get_remove() {
        let tmp = TempDir::new().unwrap();
        let registry = TombstoneRegistry::load(tmp.path());

        let mut clock = VectorClock::new();
        clock.bump("d1");
        registry.create("notes/a.md", "d1", clock);

        let t = registry.get("notes/a.md").unwrap();
        assert_eq!(t.deleted_by, "d1");
        assert_eq!(t.vector_clock.get("d1"), 1);
        assert!(t.ttl > t.deleted_at);

        assert!(registry.remove("notes/a.md"));
        assert!(registry.get("notes/a.md").is_none());
        assert!(!registry.remove("notes/a.md"));
    }

    #[test]
    fn one_tombstone_per_path() {
        let tmp = TempDir::new().unwrap();
        let registry = TombstoneRegistry::load(tmp.path());

        registry.create("a.md", "d1", VectorClock::new());
        registry.create("a.md", "d2", VectorClock::new());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a.md").unwrap().deleted_by, "d2");
    }

    #[test]
    fn gc_removes_only_expired() {
        let tmp = TempDir::new().unwrap();
        let registry = TombstoneRegistry::load(tmp.path());

        registry.create("live.md", "d1", VectorClock::new());
        // Force one entry past its expiry.
        {
            let mut entries = registry.entries.write();
            let t = entries.get_mut("live.md").unwrap().clone();
            entries.insert(
                "expired.md".into(),
                Tombstone {
                    path: "expired.md".into(),
                    ttl: epoch_secs() - 1,
                    ..t
                },
            );
        }

        assert_eq!(registry.gc(), 1);
        assert!(registry.get("live.md").is_some());
        assert!(registry.get("expired.md").is_none());
    }

    #[test]
    fn survives_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let registry = TombstoneRegistry::load(tmp.path());
            registry.create("a.md", "d1", VectorClock::new());
        }

        let reloaded = TombstoneRegistry::load(tmp.path());
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("a.md").unwrap().deleted_by, "d1");
    }

    #[test]
    fn registry_file_is_hidden() {
        assert!(REGISTRY_FILE.starts_with('.'));
    }

    #[test]
    fn corrupt_registry_starts_empty() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(REGISTRY_FILE), b"not json at all").unwrap();

        let registry = TombstoneRegistry::load(tmp.path());
        assert!(registry.is_empty());
    }
}
