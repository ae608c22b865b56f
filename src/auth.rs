//! Token authentication for devices and the admin master token.
//!
//! Two token classes: the admin-issued master token (from config or
//! `VAULT_SYNC_TOKEN`) and per-device tokens issued over the admin
//! HTTP surface. All comparisons are constant-time.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Resolved identity of a presented token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// The admin master token; caller must name a device explicitly.
    Master,
    /// A device token bound to this device id.
    Device(String),
}

/// An issued device token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceToken {
    pub token: String,
    pub device_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Validates tokens and tracks issued device credentials.
pub struct AuthGate {
    master_token: String,
    devices: RwLock<HashMap<String, DeviceToken>>,
}

impl AuthGate {
    pub fn new(master_token: impl Into<String>) -> Self {
        Self {
            master_token: master_token.into(),
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a token to an identity, or `None` if it matches nothing.
    pub fn validate(&self, token: &str) -> Option<Identity> {
        if token.is_empty() {
            return None;
        }

        if !self.master_token.is_empty()
            && constant_time_eq(token.as_bytes(), self.master_token.as_bytes())
        {
            return Some(Identity::Master);
        }

        let devices = self.devices.read();
        for record in devices.values() {
            if constant_time_eq(token.as_bytes(), record.token.as_bytes()) {
                return Some(Identity::Device(record.device_id.clone()));
            }
        }
        None
    }

    /// True when the token is the master token.
    pub fn is_master(&self, token: &str) -> bool {
        matches!(self.validate(token), Some(Identity::Master))
    }

    /// Issue a fresh token for a device, replacing any previous one.
    pub fn issue(&self, device_id: &str, name: &str) -> DeviceToken {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);

        let now = Utc::now();
        let record = DeviceToken {
            token: hex::encode(bytes),
            device_id: device_id.to_string(),
            name: name.to_string(),
            created_at: now,
            last_seen: now,
        };

        self.devices
            .write()
            .insert(device_id.to_string(), record.clone());
        tracing::info!(device = %device_id, "device token issued");
        record
    }

    /// Revoke a device's token. Returns whether one existed.
    pub fn revoke(&self, device_id: &str) -> bool {
        let removed = self.devices.write().remove(device_id).is_some();
        if removed {
            tracing::info!(device = %device_id, "device token revoked");
        }
        removed
    }

    /// Record activity for a device.
    pub fn touch_last_seen(&self, device_id: &str) {
        if let Some(record) = self.devices.write().get_mut(device_id) {
            record.last_seen = Utc::now();
        }
    }

    /// Device records with tokens redacted, for the admin listing.
    pub fn list_devices(&self) -> Vec<DeviceToken> {
        self.devices
            .read()
            .values()
            .map(|record| DeviceToken {
                token: String::new(),
                ..record.clone()
            })
            .collect()
    }
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_token_resolves_to_master() {
        let gate = AuthGate::new("top-secret");
        assert_eq!(gate.validate("top-secret"), Some(Identity::Master));
        assert!(gate.is_master("top-secret"));
        assert_eq!(gate.validate("wrong"), None);
        assert_eq!(gate.validate(""), None);
    }

    #[test]
    fn empty_master_token_never_matches() {
        let gate = AuthGate::new("");
        assert_eq!(gate.validate(""), None);
    }

    #[test]
    fn issued_token_resolves_to_device() {
        let gate = AuthGate::new("master");
        let record = gate.issue("laptop", "Work laptop");

        assert_eq!(record.token.len(), TOKEN_BYTES * 2);
        assert_eq!(
            gate.validate(&record.token),
            Some(Identity::Device("laptop".into()))
        );
    }

    #[test]
    fn reissue_replaces_previous_token() {
        let gate = AuthGate::new("master");
        let first = gate.issue("laptop", "Laptop");
        let second = gate.issue("laptop", "Laptop");

        assert_eq!(gate.validate(&first.token), None);
        assert_eq!(
            gate.validate(&second.token),
            Some(Identity::Device("laptop".into()))
        );
    }

    #[test]
    fn revoke_invalidates_token() {
        let gate = AuthGate::new("master");
        let record = gate.issue("phone", "Phone");

        assert!(gate.revoke("phone"));
        assert_eq!(gate.validate(&record.token), None);
        assert!(!gate.revoke("phone"));
    }

    #[test]
    fn listing_redacts_tokens() {
        let gate = AuthGate::new("master");
        gate.issue("laptop", "Laptop");
        gate.issue("phone", "Phone");

        let listed = gate.list_devices();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|d| d.token.is_empty()));
    }

    #[test]
    fn touch_last_seen_advances() {
        let gate = AuthGate::new("master");
        let record = gate.issue("laptop", "Laptop");
        gate.touch_last_seen("laptop");

        let listed = gate.list_devices();
        assert!(listed[0].last_seen >= record.last_seen);
        // Unknown device is a no-op.
        gate.touch_last_seen("ghost");
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }
}
