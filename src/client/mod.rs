//! Client-side sync: debounced outbound queue, remote application,
//! full-sync reconciliation, and the reconnecting WebSocket transport.
//!
//! The host application observes filesystem events and calls
//! [`ClientCoordinator::queue_change`] / `queue_delete` / `queue_move`;
//! everything else is driven by the connection task.

pub mod connection;
pub mod coordinator;
pub mod reconcile;
pub mod vault;

pub use connection::{ClientConnection, ConnectionHandle};
pub use coordinator::{ClientCoordinator, Notice};
pub use vault::{DiskVault, LocalVault};
