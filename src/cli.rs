//! Clap option structs for both binaries
//!
//! Flags left unset keep whatever the config file (or the defaults) said.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::config::{self, ClientConfig, ServerConfig};
use crate::protocol::DEFAULT_PORT;

/// Chunked file-transfer server
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct ServerOpts {
    /// Port to listen on
    pub port: Option<String>,

    /// Bind address
    #[arg(long)]
    pub bind: Option<String>,

    /// Root directory served to clients
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Upload directory, relative to the root unless absolute
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Connection limit (0 = unbounded)
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Append transfer records to this JSONL file
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ServerOpts {
    pub fn into_config(self) -> Result<ServerConfig> {
        let mut cfg: ServerConfig = match &self.config {
            Some(path) => config::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(port) = &self.port {
            cfg.port = parse_port(port);
        }
        if let Some(bind) = self.bind {
            cfg.bind = bind;
        }
        if let Some(root) = self.root {
            cfg.root = root;
        }
        if let Some(storage) = self.storage {
            cfg.storage_dir = storage;
        }
        if let Some(max) = self.max_clients {
            cfg.max_clients = max;
        }
        if self.journal.is_some() {
            cfg.journal = self.journal;
        }
        Ok(cfg)
    }
}

/// Interactive chunked file-transfer client
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct ClientOpts {
    /// Server host
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Where downloaded files are written
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Recognise downloads by their first chunk header instead of waiting
    /// for the transfer announcement
    #[arg(long)]
    pub detect_headers: bool,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ClientOpts {
    pub fn into_config(self) -> Result<ClientConfig> {
        let mut cfg: ClientConfig = match &self.config {
            Some(path) => config::load(path)?,
            None => ClientConfig::default(),
        };
        if let Some(host) = self.host {
            cfg.host = host;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(dir) = self.download_dir {
            cfg.download_dir = dir;
        }
        if self.detect_headers {
            cfg.detect_headers = true;
        }
        Ok(cfg)
    }
}

/// Port from the command line; anything unusable falls back to the default.
pub fn parse_port(arg: &str) -> u16 {
    match arg.parse::<u16>() {
        Ok(port) if port > 0 => port,
        _ => {
            log::warn!("Invalid port {arg:?}, using default {DEFAULT_PORT}");
            DEFAULT_PORT
        }
    }
}
