//! Transfer journal
//!
//! Append-only JSON Lines record of transfers: one entry when a transfer
//! starts and one when it completes or fails, keyed by a transfer id.

use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};
use std::fs::{OpenOptions, File};
use std::io::{BufReader, BufWriter, Write, BufRead};
use anyhow::{Result, Context};
use chrono::Utc;
use uuid::Uuid;

use crate::connection::Direction;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub transfer_id: String,
    pub direction: Direction,
    pub file: String,
    pub peer: Option<String>,
    pub status: TransferStatus,
    pub chunks: u32,
    pub bytes: u64,
    pub digest: Option<String>,
    pub error: Option<String>,
}

impl TransferLogEntry {
    pub fn new(transfer_id: &str, direction: Direction, file: &str, status: TransferStatus) -> Self {
        TransferLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            transfer_id: transfer_id.to_string(),
            direction,
            file: file.to_string(),
            peer: None,
            status,
            chunks: 0,
            bytes: 0,
            digest: None,
            error: None,
        }
    }
}

/// Fresh id tying the entries of one transfer together.
pub fn new_transfer_id() -> String {
    Uuid::new_v4().to_string()
}

/// Append-only JSONL journal of transfer boundaries
pub struct TransferLog {
    log_file_path: PathBuf,
}

impl TransferLog {
    pub fn new(path: &Path) -> Self {
        TransferLog { log_file_path: path.to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer log file")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// All entries recorded so far, oldest first. A missing journal is empty.
    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer log file for reading")?;
        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TransferLogEntry = serde_json::from_str(&line)
                .with_context(|| format!("Malformed journal line {}", n + 1))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
