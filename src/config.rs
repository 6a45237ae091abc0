//! Runtime configuration for both binaries
//!
//! Values come from built-in defaults, then an optional TOML file, then CLI
//! flags applied by the binary.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::ConnectionOptions;
use crate::protocol::{
    pacing, timeouts, CHUNK_MAX, DEFAULT_CHUNK_SIZE, DEFAULT_HOST, DEFAULT_PORT, LINE_CAPACITY,
    MAX_CLIENTS, STORAGE_DIR,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub root: PathBuf,
    // relative paths resolve under root
    pub storage_dir: PathBuf,
    pub max_clients: usize, // 0 = unbounded
    pub chunk_size: u32,
    pub chunk_max: u32,
    pub line_capacity: usize,
    pub send_retries: u32,
    pub sniff_uploads: bool,
    pub journal: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            bind: "0.0.0.0".to_string(),
            root: PathBuf::from("."),
            storage_dir: PathBuf::from(STORAGE_DIR),
            max_clients: MAX_CLIENTS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_max: CHUNK_MAX,
            line_capacity: LINE_CAPACITY,
            send_retries: pacing::SEND_RETRIES,
            sniff_uploads: true,
            journal: None,
        }
    }
}

impl ServerConfig {
    pub fn storage_path(&self) -> PathBuf {
        self.root.join(&self.storage_dir)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            line_capacity: self.line_capacity,
            chunk_max: self.chunk_max.min(CHUNK_MAX),
            send_retries: self.send_retries,
            sniff: self.sniff_uploads,
            receive_dir: self.storage_path(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub download_dir: PathBuf,
    pub chunk_size: u32,
    pub chunk_max: u32,
    // legacy servers that never announce a download
    pub detect_headers: bool,
    pub wait_timeout_ms: u64,
    pub stall_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            download_dir: PathBuf::from("."),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_max: CHUNK_MAX,
            detect_headers: false,
            wait_timeout_ms: timeouts::DOWNLOAD_WAIT_MS,
            stall_limit: timeouts::STALL_LIMIT,
        }
    }
}

impl ClientConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.max(1))
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            line_capacity: LINE_CAPACITY,
            chunk_max: self.chunk_max.min(CHUNK_MAX),
            send_retries: pacing::SEND_RETRIES,
            sniff: false,
            receive_dir: self.download_dir.clone(),
        }
    }
}

/// Parse a TOML config file; missing keys keep their defaults.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file: {}", path.display()))
}
