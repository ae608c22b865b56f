//! Real-time multi-device vault synchronization.
//!
//! A central server persists a flat document tree (paths → bytes) and
//! fans every mutation out to all connected devices over WebSocket.
//! Clients debounce local file events into outbound frames and
//! reconcile their full state against the server after any offline
//! gap. Deletions leave vector-clocked tombstones so stale devices
//! cannot resurrect removed files.

pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod storage;

pub use clock::{ClockOrdering, VectorClock};
pub use config::Config;
pub use error::{SyncError, SyncResult};
