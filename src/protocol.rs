//! Wire protocol for the sync channel.
//!
//! Frames are UTF-8 JSON over WebSocket, one envelope per frame. The
//! `type` field discriminates the payload; file bytes travel base64
//! encoded (standard alphabet, padded) inside JSON strings. Unknown
//! types fail decode and are dropped by the session reader.

use crate::clock::VectorClock;
use crate::error::{SyncError, SyncResult};
use crate::storage::tombstones::Tombstone;
use crate::storage::FileRecord;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Origin marker for frames the server authored itself.
pub const SERVER_ORIGIN: &str = "server";

/// Maximum WebSocket frame size (50 MiB) — bounds file size on the wire.
pub const MAX_FRAME_BYTES: usize = 50 * 1024 * 1024;

// ── Payloads ─────────────────────────────────────────────────────

/// Content write, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangePayload {
    pub path: String,
    /// Base64-encoded file bytes.
    pub content: String,
    /// Modification time, Unix epoch milliseconds.
    pub mtime: i64,
    /// SHA-256 hex of the decoded bytes.
    pub hash: String,
    /// Hash the sender last saw for this path, for conflict detection.
    #[serde(rename = "previousHash", skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
}

/// Path-only payload, used by deletes and file requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathPayload {
    pub path: String,
}

/// Atomic rename with the full new content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMovePayload {
    #[serde(rename = "oldPath")]
    pub old_path: String,
    #[serde(rename = "newPath")]
    pub new_path: String,
    /// Base64-encoded file bytes.
    pub content: String,
    pub mtime: i64,
    pub hash: String,
}

/// Complete server state snapshot for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSyncPayload {
    pub files: Vec<FileRecord>,
    pub tombstones: Vec<Tombstone>,
    #[serde(rename = "vectorClock", default)]
    pub vector_clock: VectorClock,
}

/// Both versions of a conflicting write, for manual resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictPayload {
    pub path: String,
    #[serde(rename = "serverVersion")]
    pub server_version: FileChangePayload,
    #[serde(rename = "clientVersion")]
    pub client_version: FileChangePayload,
    pub resolution: String,
}

// ── Envelopes ────────────────────────────────────────────────────

/// Client → server frame body, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientBody {
    FileChange(FileChangePayload),
    FileDelete(PathPayload),
    FileMove(FileMovePayload),
    RequestFullSync,
    RequestFile(PathPayload),
    Ping,
}

/// Client → server envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    /// Send time, Unix epoch milliseconds.
    pub timestamp: i64,
    #[serde(rename = "vectorClock", default)]
    pub vector_clock: VectorClock,
    #[serde(flatten)]
    pub body: ClientBody,
}

/// Server → client frame body, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerBody {
    FileChanged(FileChangePayload),
    FileDeleted(PathPayload),
    FileMoved(FileMovePayload),
    FullSync(FullSyncPayload),
    Conflict(ConflictPayload),
    Pong,
}

/// Server → client envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(rename = "originDevice", default)]
    pub origin_device: String,
    #[serde(flatten)]
    pub body: ServerBody,
}

impl ServerEnvelope {
    /// Envelope attributed to a connected device.
    pub fn from_device(origin: &str, body: ServerBody) -> Self {
        Self {
            origin_device: origin.to_string(),
            body,
        }
    }

    /// Envelope the server authored itself.
    pub fn from_server(body: ServerBody) -> Self {
        Self {
            origin_device: SERVER_ORIGIN.to_string(),
            body,
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// Encode file bytes for transit.
pub fn encode_content(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode file bytes from a frame.
pub fn decode_content(encoded: &str) -> SyncResult<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|e| SyncError::payload_rejected(format!("bad base64 content: {e}")))
}

/// Current wall clock, Unix epoch milliseconds.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
