//! Server-side sync coordination: inbound dispatch, conflict
//! resolution, tombstone causality, full-sync assembly.
//!
//! One coordinator serves all sessions. Each inbound envelope merges
//! its vector clock into the server clock; each accepted mutation
//! bumps the server's own slot, persists through the content store,
//! updates the tombstone registry, and fans out to every other device.
//!
//! Frame-local failures (bad payloads, oversized writes, disk errors)
//! are logged and dropped; they never tear down the session.

use crate::clock::VectorClock;
use crate::config::ConflictResolution;
use crate::error::SyncError;
use crate::protocol::{
    decode_content, encode_content, ClientBody, ClientEnvelope, ConflictPayload,
    FileChangePayload, FileMovePayload, FullSyncPayload, PathPayload, ServerBody, ServerEnvelope,
};
use crate::server::hub::Fanout;
use crate::storage::tombstones::TombstoneRegistry;
use crate::storage::ContentStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

/// Clock slot owned by the server itself.
const SERVER_SLOT: &str = "server";

/// Inbound-dispatch capability handed to each session.
#[async_trait]
pub trait Inbound: Send + Sync {
    async fn handle(&self, device_id: &str, env: ClientEnvelope);
}

/// Coordinates all inbound mutations against storage and the hub.
pub struct SyncCoordinator {
    store: Arc<ContentStore>,
    tombstones: Arc<TombstoneRegistry>,
    fanout: Arc<dyn Fanout>,
    clock: RwLock<VectorClock>,
    conflict_resolution: ConflictResolution,
    reject_empty_overwrite: bool,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<ContentStore>,
        tombstones: Arc<TombstoneRegistry>,
        fanout: Arc<dyn Fanout>,
        conflict_resolution: ConflictResolution,
        reject_empty_overwrite: bool,
    ) -> Self {
        Self {
            store,
            tombstones,
            fanout,
            clock: RwLock::new(VectorClock::new()),
            conflict_resolution,
            reject_empty_overwrite,
        }
    }

    /// Independent copy of the server vector clock.
    pub fn clock_snapshot(&self) -> VectorClock {
        self.clock.read().clone()
    }

    /// Merge an inbound clock, then bump the server slot for an
    /// accepted mutation.
    fn bump_server_clock(&self) {
        self.clock.write().bump(SERVER_SLOT);
    }

    // ── file_change ─────────────────────────────────────────────

    fn handle_file_change(
        &self,
        device_id: &str,
        incoming_clock: &VectorClock,
        payload: FileChangePayload,
    ) {
        let content = match decode_content(&payload.content) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(device = %device_id, path = %payload.path, "bad content encoding: {e}");
                return;
            }
        };

        // A tombstone whose clock dominates the incoming write means
        // the sender has not yet seen the deletion: suppress the
        // resurrection and re-send the deletion to that device only.
        if let Some(tombstone) = self.tombstones.get(&payload.path) {
            if tombstone.vector_clock.dominates(incoming_clock) {
                tracing::info!(
                    device = %device_id,
                    path = %payload.path,
                    "stale resurrection suppressed by tombstone"
                );
                self.fanout.send_to(
                    device_id,
                    ServerEnvelope::from_server(ServerBody::FileDeleted(PathPayload {
                        path: payload.path,
                    })),
                );
                return;
            }
        }

        // A zero-byte write over non-empty content is almost always a
        // client-side read glitch; refuse it and restore the sender.
        if self.reject_empty_overwrite && content.is_empty() {
            if let Ok(info) = self.store.info(&payload.path) {
                if info.size > 0 {
                    tracing::warn!(
                        device = %device_id,
                        path = %payload.path,
                        "rejected empty overwrite of non-empty file"
                    );
                    self.echo_server_copy(device_id, &payload.path);
                    return;
                }
            }
        }

        if let Some(existing_hash) = self.store.hash_of(&payload.path) {
            if let Some(previous) = &payload.previous_hash {
                if existing_hash != *previous {
                    self.resolve_conflict(device_id, payload, content, existing_hash);
                    return;
                }
            }
        }

        if !self.persist(device_id, &payload.path, &content, payload.mtime) {
            return;
        }

        self.tombstones.remove(&payload.path);
        self.bump_server_clock();

        tracing::info!(device = %device_id, path = %payload.path, bytes = content.len(), "file saved");
        self.fanout.broadcast(
            device_id,
            ServerEnvelope::from_device(device_id, ServerBody::FileChanged(payload)),
        );
    }

    /// Write through the store, mapping each failure to a logged drop.
    fn persist(&self, device_id: &str, path: &str, content: &[u8], mtime: i64) -> bool {
        match self.store.write(path, content, mtime) {
            Ok(()) => true,
            Err(SyncError::TooLarge { size, max }) => {
                tracing::warn!(device = %device_id, path, size, max, "write rejected: too large");
                false
            }
            Err(e) => {
                tracing::warn!(device = %device_id, path, "write failed: {e}");
                false
            }
        }
    }

    // ── Conflict resolution ─────────────────────────────────────

    fn resolve_conflict(
        &self,
        device_id: &str,
        client_version: FileChangePayload,
        client_content: Vec<u8>,
        server_hash: String,
    ) {
        tracing::info!(device = %device_id, path = %client_version.path, "conflict detected");

        match self.conflict_resolution {
            ConflictResolution::LastWriteWins => {
                let server_info = match self.store.info(&client_version.path) {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::warn!(path = %client_version.path, "cannot stat server copy: {e}");
                        return;
                    }
                };

                // Strictly newer incoming wins; ties go to the server.
                if client_version.mtime > server_info.mtime {
                    if !self.persist(
                        device_id,
                        &client_version.path,
                        &client_content,
                        client_version.mtime,
                    ) {
                        return;
                    }
                    self.bump_server_clock();
                    tracing::info!(
                        path = %client_version.path,
                        "conflict resolved: client wins (newer mtime)"
                    );
                    self.fanout.broadcast(
                        device_id,
                        ServerEnvelope::from_device(
                            device_id,
                            ServerBody::FileChanged(client_version),
                        ),
                    );
                } else {
                    tracing::info!(
                        path = %client_version.path,
                        "conflict resolved: server wins (newer mtime)"
                    );
                    self.echo_server_copy(device_id, &client_version.path);
                }
            }

            ConflictResolution::Manual => {
                let Some(server_version) = self.read_server_version(&client_version.path) else {
                    return;
                };
                debug_assert_eq!(server_version.hash, server_hash);

                self.fanout.send_to(
                    device_id,
                    ServerEnvelope::from_server(ServerBody::Conflict(ConflictPayload {
                        path: client_version.path.clone(),
                        server_version,
                        client_version,
                        resolution: "manual".into(),
                    })),
                );
            }
        }
    }

    /// Send the server's current copy back to one device.
    fn echo_server_copy(&self, device_id: &str, path: &str) {
        if let Some(server_version) = self.read_server_version(path) {
            self.fanout.send_to(
                device_id,
                ServerEnvelope::from_server(ServerBody::FileChanged(server_version)),
            );
        }
    }

    fn read_server_version(&self, path: &str) -> Option<FileChangePayload> {
        let content = match self.store.read(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path, "cannot read server copy: {e}");
                return None;
            }
        };
        let info = match self.store.info(path) {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!(path, "cannot stat server copy: {e}");
                return None;
            }
        };
        Some(FileChangePayload {
            path: path.to_string(),
            content: encode_content(&content),
            mtime: info.mtime,
            hash: info.hash,
            previous_hash: None,
        })
    }

    // ── file_delete / file_move ─────────────────────────────────

    fn handle_file_delete(&self, device_id: &str, payload: PathPayload) {
        if let Err(e) = self.store.delete(&payload.path) {
            // The file may simply not exist on the server; the
            // tombstone still matters.
            tracing::warn!(device = %device_id, path = %payload.path, "delete failed: {e}");
        }

        self.bump_server_clock();
        let clock = self.clock_snapshot();
        self.tombstones.create(&payload.path, device_id, clock);

        tracing::info!(device = %device_id, path = %payload.path, "file deleted, tombstone created");
        self.fanout.broadcast(
            device_id,
            ServerEnvelope::from_device(device_id, ServerBody::FileDeleted(payload)),
        );
    }

    fn handle_file_move(&self, device_id: &str, payload: FileMovePayload) {
        let content = match decode_content(&payload.content) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(device = %device_id, path = %payload.new_path, "bad content encoding: {e}");
                return;
            }
        };

        if let Err(e) = self.store.delete(&payload.old_path) {
            tracing::warn!(device = %device_id, path = %payload.old_path, "move: old delete failed: {e}");
        }

        if !self.persist(device_id, &payload.new_path, &content, payload.mtime) {
            return;
        }

        // A move onto a previously deleted path is a resurrection.
        self.tombstones.remove(&payload.new_path);
        self.bump_server_clock();

        tracing::info!(
            device = %device_id,
            from = %payload.old_path,
            to = %payload.new_path,
            "file moved"
        );
        self.fanout.broadcast(
            device_id,
            ServerEnvelope::from_device(device_id, ServerBody::FileMoved(payload)),
        );
    }

    // ── full sync / file request / ping ─────────────────────────

    fn handle_full_sync_request(&self, device_id: &str) {
        let files = match self.store.list() {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(device = %device_id, "full sync listing failed: {e}");
                return;
            }
        };
        let tombstones = self.tombstones.list();

        tracing::info!(
            device = %device_id,
            files = files.len(),
            tombstones = tombstones.len(),
            "sending full sync"
        );

        self.fanout.send_to(
            device_id,
            ServerEnvelope::from_server(ServerBody::FullSync(FullSyncPayload {
                files,
                tombstones,
                vector_clock: self.clock_snapshot(),
            })),
        );
    }

    fn handle_request_file(&self, device_id: &str, payload: PathPayload) {
        let Some(server_version) = self.read_server_version(&payload.path) else {
            return;
        };
        tracing::info!(device = %device_id, path = %payload.path, "sending requested file");
        self.fanout.send_to(
            device_id,
            ServerEnvelope::from_server(ServerBody::FileChanged(server_version)),
        );
    }
}

#[async_trait]
impl Inbound for SyncCoordinator {
    async fn handle(&self, device_id: &str, env: ClientEnvelope) {
        if !env.vector_clock.is_empty() {
            self.clock.write().merge(&env.vector_clock);
        }

        match env.body {
            ClientBody::FileChange(payload) => {
                self.handle_file_change(device_id, &env.vector_clock, payload);
            }
            ClientBody::FileDelete(payload) => self.handle_file_delete(device_id, payload),
            ClientBody::FileMove(payload) => self.handle_file_move(device_id, payload),
            ClientBody::RequestFullSync => self.handle_full_sync_request(device_id),
            ClientBody::RequestFile(payload) => self.handle_request_file(device_id, payload),
            ClientBody::Ping => {
                self.fanout
                    .send_to(device_id, ServerEnvelope::from_server(ServerBody::Pong));
            }
        }
    }
}
