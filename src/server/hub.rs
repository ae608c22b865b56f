//! Connection hub: one live session per device, bounded fan-out.
//!
//! Each registered session owns a bounded send queue drained by its
//! writer task. Enqueueing never blocks: a full queue drops the frame
//! for that destination only (the slow consumer heals via full-sync).
//! FIFO order holds per destination; there is no cross-device order.

use crate::protocol::ServerEnvelope;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Per-session send queue capacity.
const SEND_QUEUE_CAP: usize = 256;

/// Fan-out capability handed to the sync coordinator.
pub trait Fanout: Send + Sync {
    /// Enqueue a frame to every device except the origin.
    fn broadcast(&self, origin_device: &str, env: ServerEnvelope);
    /// Enqueue a frame to one device. No-op if it is not connected.
    fn send_to(&self, device_id: &str, env: ServerEnvelope);
}

struct SessionHandle {
    generation: u64,
    tx: mpsc::Sender<ServerEnvelope>,
}

/// Registry of connected device sessions.
pub struct ConnectionHub {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    next_generation: AtomicU64,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Install a new session for a device, displacing any existing one.
    ///
    /// The displaced session's queue sender is dropped here; its writer
    /// task drains what was already enqueued, then observes the closed
    /// channel and shuts the transport down. Returns the generation tag
    /// the session must present on unregister, plus the queue receiver
    /// for the writer task.
    pub fn register(&self, device_id: &str) -> (u64, mpsc::Receiver<ServerEnvelope>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAP);

        let displaced = {
            let mut sessions = self.sessions.write();
            sessions.insert(device_id.to_string(), SessionHandle { generation, tx })
        };

        if displaced.is_some() {
            tracing::info!(device = %device_id, "replacing existing session");
        }
        tracing::info!(
            device = %device_id,
            total = self.sessions.read().len(),
            "device connected"
        );

        (generation, rx)
    }

    /// Remove a session, but only if the stored one carries the same
    /// generation. A displaced session calling this after replacement
    /// must not evict its successor.
    pub fn unregister(&self, device_id: &str, generation: u64) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            match sessions.get(device_id) {
                Some(handle) if handle.generation == generation => {
                    sessions.remove(device_id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            tracing::info!(
                device = %device_id,
                total = self.sessions.read().len(),
                "device disconnected"
            );
        }
        removed
    }

    /// Currently connected device ids.
    pub fn connected_devices(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// True when the device has a live session.
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.sessions.read().contains_key(device_id)
    }

    fn enqueue(&self, device_id: &str, tx: &mpsc::Sender<ServerEnvelope>, env: ServerEnvelope) {
        match tx.try_send(env) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(device = %device_id, "send queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(device = %device_id, "send queue closed, dropping frame");
            }
        }
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Fanout for ConnectionHub {
    fn broadcast(&self, origin_device: &str, env: ServerEnvelope) {
        let sessions = self.sessions.read();
        for (device_id, handle) in sessions.iter() {
            if device_id == origin_device {
                continue;
            }
            self.enqueue(device_id, &handle.tx, env.clone());
        }
    }

    fn send_to(&self, device_id: &str, env: ServerEnvelope) {
        let sessions = self.sessions.read();
        if let Some(handle) = sessions.get(device_id) {
            self.enqueue(device_id, &handle.tx, env);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PathPayload, ServerBody};

    fn deleted_frame(origin: &str, path: &str) -> ServerEnvelope {
        ServerEnvelope::from_device(
            origin,
            ServerBody::FileDeleted(PathPayload { path: path.into() }),
        )
    }

    #[tokio::test]
    async fn at_most_one_session_per_device() {
        let hub = ConnectionHub::new();

        let (_gen1, mut rx1) = hub.register("laptop");
        let (_gen2, mut rx2) = hub.register("laptop");

        assert_eq!(hub.connected_devices(), vec!["laptop".to_string()]);

        // The displaced session's queue is closed (sender dropped).
        assert!(rx1.recv().await.is_none());

        // The new session still receives.
        hub.send_to("laptop", deleted_frame("phone", "a.md"));
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn displaced_session_drains_before_close() {
        let hub = ConnectionHub::new();

        let (_gen1, mut rx1) = hub.register("laptop");
        hub.send_to("laptop", deleted_frame("phone", "queued.md"));
        let (_gen2, _rx2) = hub.register("laptop");

        // Already-enqueued frame is still delivered, then the queue ends.
        assert!(rx1.recv().await.is_some());
        assert!(rx1.recv().await.is_none());
    }

    #[tokio::test]
    async fn unregister_requires_matching_generation() {
        let hub = ConnectionHub::new();

        let (gen1, _rx1) = hub.register("laptop");
        let (gen2, _rx2) = hub.register("laptop");

        // The displaced session cannot evict its replacement.
        assert!(!hub.unregister("laptop", gen1));
        assert!(hub.is_connected("laptop"));

        assert!(hub.unregister("laptop", gen2));
        assert!(!hub.is_connected("laptop"));
    }

    #[tokio::test]
    async fn broadcast_excludes_origin() {
        let hub = ConnectionHub::new();

        let (_g1, mut rx_laptop) = hub.register("laptop");
        let (_g2, mut rx_phone) = hub.register("phone");

        hub.broadcast("laptop", deleted_frame("laptop", "a.md"));

        assert!(rx_phone.recv().await.is_some());
        assert!(rx_laptop.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let hub = ConnectionHub::new();

        let (_g1, mut rx_slow) = hub.register("slow");
        let (_g2, mut rx_fast) = hub.register("fast");

        // Overflow the slow consumer's queue; nothing blocks.
        for i in 0..SEND_QUEUE_CAP + 50 {
            hub.broadcast("origin", deleted_frame("origin", &format!("f{i}.md")));
        }

        // The slow consumer got exactly the queue capacity.
        let mut received = 0;
        while rx_slow.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SEND_QUEUE_CAP);

        // The fast consumer was unaffected by the slow one's overflow
        // (it also capped out, but independently).
        assert!(rx_fast.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_to_unknown_device_is_noop() {
        let hub = ConnectionHub::new();
        hub.send_to("ghost", deleted_frame("server", "a.md"));
        assert!(hub.connected_devices().is_empty());
    }

    #[tokio::test]
    async fn per_destination_fifo_order() {
        let hub = ConnectionHub::new();
        let (_g, mut rx) = hub.register("laptop");

        for i in 0..5 {
            hub.send_to("laptop", deleted_frame("server", &format!("f{i}.md")));
        }

        for i in 0..5 {
            let env = rx.recv().await.unwrap();
            match env.body {
                ServerBody::FileDeleted(p) => assert_eq!(p.path, format!("f{i}.md")),
                other => panic!("wrong body: {other:?}"),
            }
        }
    }
}
