//! Client-side sync coordination.
//!
//! Outbound: host file events land in a per-path debounce map; when a
//! path's timer fires the current bytes are read and hashed, the local
//! clock bumps, and one frame goes out. Renames bypass the debounce
//! and ship a single atomic `file_move`.
//!
//! Inbound: remote frames are applied through the host's file API with
//! the `applying_remote` guard up, so the host's own change events for
//! those writes do not echo back to the server. Frames originating
//! from this device are dropped outright.

use crate::client::reconcile::{build_plan, hash_local_files};
use crate::client::vault::LocalVault;
use crate::clock::VectorClock;
use crate::protocol::{
    decode_content, encode_content, epoch_millis, ClientBody, ClientEnvelope, FileChangePayload,
    FileMovePayload, FullSyncPayload, PathPayload, ServerEnvelope, ServerBody,
};
use crate::storage::hash_bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outbound frame queue depth between coordinator and connection.
const OUTBOUND_QUEUE_CAP: usize = 256;

/// User-visible sync events, drained by the host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected,
    Disconnected,
    Reconnecting { delay_secs: u64 },
    SyncFailed { message: String },
    ConflictDetected { path: String },
    FullSyncComplete {
        uploaded: usize,
        requested: usize,
        deleted_local: usize,
        deleted_remote: usize,
    },
}

struct CoordinatorState {
    pending: HashMap<String, JoinHandle<()>>,
    local_hashes: HashMap<String, String>,
    clock: VectorClock,
}

/// Drives one device's half of the sync protocol.
pub struct ClientCoordinator {
    device_id: String,
    vault: Arc<dyn LocalVault>,
    outbound: mpsc::Sender<ClientEnvelope>,
    notices: mpsc::UnboundedSender<Notice>,
    debounce: Duration,
    applying_remote: AtomicBool,
    state: Mutex<CoordinatorState>,
}

impl ClientCoordinator {
    /// Returns the coordinator plus the outbound frame stream (consumed
    /// by the connection) and the notice stream (consumed by the host).
    pub fn new(
        device_id: impl Into<String>,
        vault: Arc<dyn LocalVault>,
        debounce_ms: u64,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<ClientEnvelope>,
        mpsc::UnboundedReceiver<Notice>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAP);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let coordinator = Arc::new(Self {
            device_id: device_id.into(),
            vault,
            outbound: outbound_tx,
            notices: notice_tx,
            debounce: Duration::from_millis(debounce_ms),
            applying_remote: AtomicBool::new(false),
            state: Mutex::new(CoordinatorState {
                pending: HashMap::new(),
                local_hashes: HashMap::new(),
                clock: VectorClock::new(),
            }),
        });

        (coordinator, outbound_rx, notice_rx)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Emit a notice; a host that dropped its receiver just misses it.
    pub fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    fn envelope(&self, body: ClientBody) -> ClientEnvelope {
        ClientEnvelope {
            device_id: self.device_id.clone(),
            timestamp: epoch_millis(),
            vector_clock: self.state.lock().clock.clone(),
            body,
        }
    }

    /// Liveness frame for the connection's ping timer.
    pub fn ping_envelope(&self) -> ClientEnvelope {
        self.envelope(ClientBody::Ping)
    }

    async fn send(&self, body: ClientBody) {
        let env = self.envelope(body);
        if self.outbound.send(env).await.is_err() {
            tracing::debug!("outbound channel closed, frame dropped");
        }
    }

    /// Ask the server for its complete state.
    pub async fn request_full_sync(&self) {
        self.send(ClientBody::RequestFullSync).await;
    }

    // ── Outbound (host events) ──────────────────────────────────

    /// Host reported a create/modify for `path`.
    pub fn queue_change(self: &Arc<Self>, path: &str) {
        if self.applying_remote.load(Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let path = path.to_string();
        self.schedule(path.clone(), async move {
            this.flush_change(&path).await;
        });
    }

    /// Host reported a deletion of `path`.
    pub fn queue_delete(self: &Arc<Self>, path: &str) {
        if self.applying_remote.load(Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let path = path.to_string();
        self.schedule(path.clone(), async move {
            this.flush_delete(&path).await;
        });
    }

    /// Host reported a rename. Ships one atomic `file_move` frame
    /// immediately; pending work for both paths is cancelled.
    pub fn queue_move(self: &Arc<Self>, old_path: &str, new_path: &str) {
        if self.applying_remote.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.state.lock();
            if let Some(task) = state.pending.remove(old_path) {
                task.abort();
            }
            if let Some(task) = state.pending.remove(new_path) {
                task.abort();
            }
        }

        let this = Arc::clone(self);
        let old_path = old_path.to_string();
        let new_path = new_path.to_string();
        tokio::spawn(async move {
            let content = match this.vault.read(&new_path).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %new_path, "move source unreadable: {e}");
                    return;
                }
            };
            let mtime = this.vault.mtime(&new_path).await.unwrap_or(0);
            let hash = hash_bytes(&content);

            {
                let mut state = this.state.lock();
                state.local_hashes.remove(&old_path);
                state.local_hashes.insert(new_path.clone(), hash.clone());
                let device = this.device_id.clone();
                state.clock.bump(&device);
            }

            this.send(ClientBody::FileMove(FileMovePayload {
                old_path,
                new_path,
                content: encode_content(&content),
                mtime,
                hash,
            }))
            .await;
        });
    }

    /// Replace any scheduled send for `path` with a fresh debounce
    /// timer running `work`.
    fn schedule(
        self: &Arc<Self>,
        path: String,
        work: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let this = Arc::clone(self);
        let debounce = self.debounce;
        let key = path.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            this.state.lock().pending.remove(&key);
            work.await;
        });

        let mut state = self.state.lock();
        if let Some(previous) = state.pending.insert(path, task) {
            previous.abort();
        }
    }

    async fn flush_change(&self, path: &str) {
        let content = match self.vault.read(path).await {
            Ok(c) => c,
            Err(e) => {
                // The file disappeared between the event and the timer.
                tracing::debug!(path, "change flush skipped: {e}");
                return;
            }
        };
        let mtime = self.vault.mtime(path).await.unwrap_or_else(|_| epoch_millis());
        let hash = hash_bytes(&content);

        let previous_hash = {
            let mut state = self.state.lock();
            let previous = state.local_hashes.insert(path.to_string(), hash.clone());
            let device = self.device_id.clone();
            state.clock.bump(&device);
            previous
        };

        self.send(ClientBody::FileChange(FileChangePayload {
            path: path.to_string(),
            content: encode_content(&content),
            mtime,
            hash,
            previous_hash,
        }))
        .await;
    }

    async fn flush_delete(&self, path: &str) {
        {
            let mut state = self.state.lock();
            state.local_hashes.remove(path);
            let device = self.device_id.clone();
            state.clock.bump(&device);
        }

        self.send(ClientBody::FileDelete(PathPayload {
            path: path.to_string(),
        }))
        .await;
    }

    // ── Inbound (server frames) ─────────────────────────────────

    /// Apply one server frame. Frames from this device are dropped.
    pub async fn apply(&self, env: ServerEnvelope) {
        if env.origin_device == self.device_id {
            return;
        }

        self.applying_remote.store(true, Ordering::SeqCst);
        self.apply_inner(env).await;
        self.applying_remote.store(false, Ordering::SeqCst);
    }

    async fn apply_inner(&self, env: ServerEnvelope) {
        match env.body {
            ServerBody::FileChanged(payload) => {
                let content = match decode_content(&payload.content) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(path = %payload.path, "bad content encoding: {e}");
                        return;
                    }
                };
                if let Err(e) = self.vault.write(&payload.path, &content, payload.mtime).await {
                    tracing::warn!(path = %payload.path, "remote write failed: {e}");
                    self.notify(Notice::SyncFailed {
                        message: format!("write {} failed", payload.path),
                    });
                    return;
                }
                self.state
                    .lock()
                    .local_hashes
                    .insert(payload.path, payload.hash);
            }

            ServerBody::FileDeleted(payload) => {
                if let Err(e) = self.vault.delete(&payload.path).await {
                    tracing::warn!(path = %payload.path, "remote delete failed: {e}");
                    return;
                }
                self.state.lock().local_hashes.remove(&payload.path);
            }

            ServerBody::FileMoved(payload) => {
                let content = match decode_content(&payload.content) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(path = %payload.new_path, "bad content encoding: {e}");
                        return;
                    }
                };
                if let Err(e) = self.vault.delete(&payload.old_path).await {
                    tracing::warn!(path = %payload.old_path, "move delete failed: {e}");
                }
                if let Err(e) = self
                    .vault
                    .write(&payload.new_path, &content, payload.mtime)
                    .await
                {
                    tracing::warn!(path = %payload.new_path, "move write failed: {e}");
                    return;
                }
                let mut state = self.state.lock();
                state.local_hashes.remove(&payload.old_path);
                state.local_hashes.insert(payload.new_path, payload.hash);
            }

            ServerBody::FullSync(payload) => self.full_sync(payload).await,

            ServerBody::Conflict(payload) => {
                tracing::info!(path = %payload.path, "server reported a conflict");
                self.notify(Notice::ConflictDetected { path: payload.path });
            }

            ServerBody::Pong => {}
        }
    }

    // ── Full-sync reconciliation ────────────────────────────────

    async fn full_sync(&self, payload: FullSyncPayload) {
        self.state.lock().clock.merge(&payload.vector_clock);

        let local = match hash_local_files(self.vault.as_ref()).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("full sync aborted, local scan failed: {e}");
                self.notify(Notice::SyncFailed {
                    message: "local scan failed".into(),
                });
                return;
            }
        };

        // The fresh scan is the new local truth.
        {
            let mut state = self.state.lock();
            state.local_hashes = local
                .iter()
                .map(|e| (e.path.clone(), e.hash.clone()))
                .collect();
        }

        let server_hashes: HashMap<&str, &str> = payload
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.hash.as_str()))
            .collect();

        let plan = build_plan(&local, &payload);
        tracing::info!(
            request = plan.request.len(),
            upload = plan.upload.len(),
            delete_local = plan.delete_local.len(),
            delete_remote = plan.delete_remote.len(),
            "full sync plan computed"
        );

        for path in &plan.delete_local {
            if let Err(e) = self.vault.delete(path).await {
                tracing::warn!(path, "tombstone delete failed: {e}");
                continue;
            }
            self.state.lock().local_hashes.remove(path);
        }

        for path in &plan.delete_remote {
            {
                let mut state = self.state.lock();
                let device = self.device_id.clone();
                state.clock.bump(&device);
            }
            self.send(ClientBody::FileDelete(PathPayload { path: path.clone() }))
                .await;
        }

        for path in &plan.upload {
            let content = match self.vault.read(path).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path, "upload read failed: {e}");
                    continue;
                }
            };
            let mtime = self.vault.mtime(path).await.unwrap_or(0);
            let hash = hash_bytes(&content);
            {
                let mut state = self.state.lock();
                let device = self.device_id.clone();
                state.clock.bump(&device);
            }
            self.send(ClientBody::FileChange(FileChangePayload {
                path: path.clone(),
                content: encode_content(&content),
                mtime,
                hash,
                previous_hash: server_hashes.get(path.as_str()).map(|h| h.to_string()),
            }))
            .await;
        }

        for path in &plan.request {
            self.send(ClientBody::RequestFile(PathPayload { path: path.clone() }))
                .await;
        }

        self.notify(Notice::FullSyncComplete {
            uploaded: plan.upload.len(),
            requested: plan.request.len(),
            deleted_local: plan.delete_local.len(),
            deleted_remote: plan.delete_remote.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::vault::DiskVault;
    use crate::storage::tombstones::Tombstone;
    use crate::storage::FileRecord;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        vault: Arc<DiskVault>,
        coordinator: Arc<ClientCoordinator>,
        outbound: mpsc::Receiver<ClientEnvelope>,
        notices: mpsc::UnboundedReceiver<Notice>,
    }

    fn fixture(debounce_ms: u64) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let vault = Arc::new(DiskVault::open(tmp.path()).unwrap());
        let (coordinator, outbound, notices) =
            ClientCoordinator::new("laptop", vault.clone() as Arc<dyn LocalVault>, debounce_ms);
        Fixture {
            _tmp: tmp,
            vault,
            coordinator,
            outbound,
            notices,
        }
    }

    fn changed(origin: &str, path: &str, content: &[u8], mtime: i64) -> ServerEnvelope {
        ServerEnvelope::from_device(
            origin,
            ServerBody::FileChanged(FileChangePayload {
                path: path.into(),
                content: encode_content(content),
                mtime,
                hash: hash_bytes(content),
                previous_hash: None,
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_collapses_rapid_edits() {
        let mut fx = fixture(500);
        fx.vault.write("a.md", b"final", 1_000).await.unwrap();

        fx.coordinator.queue_change("a.md");
        fx.coordinator.queue_change("a.md");
        fx.coordinator.queue_change("a.md");

        let env = fx.outbound.recv().await.unwrap();
        match env.body {
            ClientBody::FileChange(p) => {
                assert_eq!(p.path, "a.md");
                assert_eq!(decode_content(&p.content).unwrap(), b"final");
                assert!(p.previous_hash.is_none());
            }
            other => panic!("wrong body: {other:?}"),
        }

        // Only one frame went out.
        assert!(fx.outbound.try_recv().is_err());
        // Outbound mutations bump this device's clock slot once.
        assert_eq!(env.vector_clock.get("laptop"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_change_carries_previous_hash() {
        let mut fx = fixture(10);
        fx.vault.write("a.md", b"v1", 0).await.unwrap();
        fx.coordinator.queue_change("a.md");
        let first = fx.outbound.recv().await.unwrap();

        fx.vault.write("a.md", b"v2", 0).await.unwrap();
        fx.coordinator.queue_change("a.md");
        let second = fx.outbound.recv().await.unwrap();

        let ClientBody::FileChange(first) = first.body else {
            panic!()
        };
        let ClientBody::FileChange(second) = second.body else {
            panic!()
        };
        assert_eq!(second.previous_hash.as_deref(), Some(first.hash.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_after_change_cancels_the_change() {
        let mut fx = fixture(500);
        fx.vault.write("a.md", b"x", 0).await.unwrap();

        fx.coordinator.queue_change("a.md");
        fx.coordinator.queue_delete("a.md");

        let env = fx.outbound.recv().await.unwrap();
        assert!(matches!(env.body, ClientBody::FileDelete(_)));
        assert!(fx.outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn move_ships_single_atomic_frame() {
        let mut fx = fixture(500);
        fx.vault.write("b.md", b"x", 2_000).await.unwrap();

        // A pending change for the old path must not survive the move.
        fx.coordinator.queue_change("a.md");
        fx.coordinator.queue_move("a.md", "b.md");

        let env = fx.outbound.recv().await.unwrap();
        match env.body {
            ClientBody::FileMove(p) => {
                assert_eq!(p.old_path, "a.md");
                assert_eq!(p.new_path, "b.md");
                assert_eq!(decode_content(&p.content).unwrap(), b"x");
            }
            other => panic!("wrong body: {other:?}"),
        }
        assert!(fx.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn own_frames_are_dropped() {
        let fx = fixture(10);

        fx.coordinator
            .apply(changed("laptop", "a.md", b"echo", 1_000))
            .await;

        assert!(!fx.vault.exists("a.md").await);
    }

    #[tokio::test]
    async fn applying_remote_suppresses_outbound() {
        let mut fx = fixture(10);
        fx.coordinator
            .applying_remote
            .store(true, Ordering::SeqCst);

        fx.coordinator.queue_change("a.md");
        fx.coordinator.queue_delete("a.md");
        fx.coordinator.queue_move("a.md", "b.md");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_change_writes_through_vault() {
        let fx = fixture(10);

        fx.coordinator
            .apply(changed("phone", "notes/a.md", b"from phone", 1_000))
            .await;

        assert_eq!(fx.vault.read("notes/a.md").await.unwrap(), b"from phone");
        let state = fx.coordinator.state.lock();
        assert_eq!(
            state.local_hashes.get("notes/a.md").unwrap(),
            &hash_bytes(b"from phone")
        );
    }

    #[tokio::test]
    async fn remote_delete_removes_file_and_hash() {
        let fx = fixture(10);
        fx.vault.write("a.md", b"x", 0).await.unwrap();

        fx.coordinator
            .apply(ServerEnvelope::from_device(
                "phone",
                ServerBody::FileDeleted(PathPayload { path: "a.md".into() }),
            ))
            .await;

        assert!(!fx.vault.exists("a.md").await);
        assert!(fx.coordinator.state.lock().local_hashes.get("a.md").is_none());
    }

    #[tokio::test]
    async fn remote_move_is_idempotent() {
        let fx = fixture(10);
        fx.vault.write("a.md", b"x", 0).await.unwrap();

        let env = ServerEnvelope::from_device(
            "phone",
            ServerBody::FileMoved(FileMovePayload {
                old_path: "a.md".into(),
                new_path: "b.md".into(),
                content: encode_content(b"x"),
                mtime: 3_000,
                hash: hash_bytes(b"x"),
            }),
        );

        fx.coordinator.apply(env.clone()).await;
        fx.coordinator.apply(env).await;

        assert!(!fx.vault.exists("a.md").await);
        assert_eq!(fx.vault.read("b.md").await.unwrap(), b"x");
        let state = fx.coordinator.state.lock();
        assert!(state.local_hashes.get("a.md").is_none());
        assert_eq!(state.local_hashes.get("b.md").unwrap(), &hash_bytes(b"x"));
    }

    #[tokio::test]
    async fn conflict_surfaces_notice_without_mutation() {
        let mut fx = fixture(10);
        fx.vault.write("x.md", b"local", 0).await.unwrap();

        fx.coordinator
            .apply(ServerEnvelope::from_server(ServerBody::Conflict(
                crate::protocol::ConflictPayload {
                    path: "x.md".into(),
                    server_version: FileChangePayload {
                        path: "x.md".into(),
                        content: encode_content(b"server"),
                        mtime: 0,
                        hash: hash_bytes(b"server"),
                        previous_hash: None,
                    },
                    client_version: FileChangePayload {
                        path: "x.md".into(),
                        content: encode_content(b"local"),
                        mtime: 0,
                        hash: hash_bytes(b"local"),
                        previous_hash: None,
                    },
                    resolution: "manual".into(),
                },
            )))
            .await;

        assert_eq!(fx.vault.read("x.md").await.unwrap(), b"local");
        assert_eq!(
            fx.notices.recv().await.unwrap(),
            Notice::ConflictDetected { path: "x.md".into() }
        );
    }

    #[tokio::test]
    async fn full_sync_after_server_wipe_uploads_everything() {
        let mut fx = fixture(10);
        fx.vault.write("foo.md", b"f", 1_000).await.unwrap();
        fx.vault.write("bar.md", b"b", 1_000).await.unwrap();

        fx.coordinator
            .apply(ServerEnvelope::from_server(ServerBody::FullSync(
                FullSyncPayload {
                    files: vec![],
                    tombstones: vec![],
                    vector_clock: VectorClock::new(),
                },
            )))
            .await;

        let mut uploaded = Vec::new();
        while let Ok(env) = fx.outbound.try_recv() {
            match env.body {
                ClientBody::FileChange(p) => uploaded.push(p.path),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        uploaded.sort();
        assert_eq!(uploaded, vec!["bar.md", "foo.md"]);

        // Nothing was deleted locally.
        assert!(fx.vault.exists("foo.md").await);
        assert!(fx.vault.exists("bar.md").await);

        match fx.notices.recv().await.unwrap() {
            Notice::FullSyncComplete {
                uploaded: 2,
                deleted_local: 0,
                ..
            } => {}
            other => panic!("unexpected notice: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_sync_applies_tombstones_locally() {
        let mut fx = fixture(10);
        fx.vault.write("gone.md", b"g", 1_000).await.unwrap();

        fx.coordinator
            .apply(ServerEnvelope::from_server(ServerBody::FullSync(
                FullSyncPayload {
                    files: vec![],
                    tombstones: vec![Tombstone {
                        path: "gone.md".into(),
                        deleted_at: 100,
                        deleted_by: "phone".into(),
                        vector_clock: VectorClock::new(),
                        ttl: i64::MAX,
                    }],
                    vector_clock: VectorClock::new(),
                },
            )))
            .await;

        assert!(!fx.vault.exists("gone.md").await);
        assert!(fx.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_sync_requests_newer_server_files() {
        let mut fx = fixture(10);
        fx.vault.write("a.md", b"old", 1_000).await.unwrap();

        fx.coordinator
            .apply(ServerEnvelope::from_server(ServerBody::FullSync(
                FullSyncPayload {
                    files: vec![FileRecord {
                        path: "a.md".into(),
                        hash: hash_bytes(b"newer"),
                        size: 5,
                        mtime: i64::MAX,
                    }],
                    tombstones: vec![],
                    vector_clock: VectorClock::new(),
                },
            )))
            .await;

        let env = fx.outbound.recv().await.unwrap();
        match env.body {
            ClientBody::RequestFile(p) => assert_eq!(p.path, "a.md"),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_sync_merges_server_clock() {
        let fx = fixture(10);
        let mut server_clock = VectorClock::new();
        server_clock.bump("server");
        server_clock.bump("phone");

        fx.coordinator
            .apply(ServerEnvelope::from_server(ServerBody::FullSync(
                FullSyncPayload {
                    files: vec![],
                    tombstones: vec![],
                    vector_clock: server_clock,
                },
            )))
            .await;

        let state = fx.coordinator.state.lock();
        assert_eq!(state.clock.get("server"), 1);
        assert_eq!(state.clock.get("phone"), 1);
    }
}
