//! Server configuration: YAML file plus environment overrides.
//!
//! Every field has a default, so an absent or partial config file is
//! fine. `VAULT_SYNC_TOKEN` always wins over the file for the master
//! token; setting `VAULT_SYNC_TLS_CERT` turns TLS on.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub master_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub conflict_resolution: ConflictResolution,
    pub debounce_ms: u64,
    pub max_file_size_mb: u64,
    pub reject_empty_overwrite: bool,
}

/// Policy applied when an incoming change races a server-side edit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    #[default]
    LastWriteWins,
    Manual,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            tls: TlsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./vault"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_resolution: ConflictResolution::default(),
            debounce_ms: 500,
            max_file_size_mb: 50,
            reject_empty_overwrite: true,
        }
    }
}

impl Config {
    /// Load from a YAML file (if given and present), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", p.display()))?
            }
            _ => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Environment overrides; called automatically by [`Config::load`].
    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("VAULT_SYNC_TOKEN") {
            if !token.is_empty() {
                self.auth.master_token = token;
            }
        }
        if let Ok(port) = std::env::var("VAULT_SYNC_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(path) = std::env::var("VAULT_SYNC_STORAGE") {
            if !path.is_empty() {
                self.storage.path = PathBuf::from(path);
            }
        }
        if let Ok(cert) = std::env::var("VAULT_SYNC_TLS_CERT") {
            if !cert.is_empty() {
                self.server.tls.cert = cert;
                self.server.tls.enabled = true;
            }
        }
        if let Ok(key) = std::env::var("VAULT_SYNC_TLS_KEY") {
            if !key.is_empty() {
                self.server.tls.key = key;
            }
        }
    }

    /// Maximum file size in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.sync.max_file_size_mb * 1024 * 1024
    }
}
