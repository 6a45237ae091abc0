//! Error taxonomy for the transfer core
//!
//! Transport errors (would-block, disconnect, socket failure), protocol errors
//! (overflow, malformed header, bad sequence) and resource errors (file
//! creation/write, registry capacity) each get a typed variant so callers can
//! decide between aborting one transfer and dropping the whole connection.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::TOTAL_CHUNKS_MAX;

/// A write into a [`crate::buffer::BoundedBuf`] would exceed its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer full: {len} + {extra} bytes exceeds capacity {capacity}")]
pub struct BufferFull {
    pub capacity: usize,
    pub len: usize,
    pub extra: usize,
}

/// A chunk header whose fields are out of range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("chunk size {size} outside 1..={max}")]
    ChunkSize { size: u32, max: u32 },

    #[error("total chunks {0} outside 1..={max}", max = TOTAL_CHUNKS_MAX)]
    TotalChunks(u32),

    #[error("chunk id {id} not below total chunks {total}")]
    ChunkId { id: u32, total: u32 },

    #[error("unknown chunk type {0}")]
    Kind(u32),
}

/// Failure while turning raw bytes into frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Text accumulated past the line capacity without a newline.
    #[error("line overflow: {0}")]
    LineOverflow(#[from] BufferFull),

    /// A complete header failed validation; no payload was consumed.
    #[error("invalid chunk header: {0}")]
    Header(#[from] HeaderError),
}

/// Failure of a single transfer. The connection survives these.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid chunk header: {0}")]
    Header(#[from] HeaderError),

    #[error("chunk out of sequence: expected {expected}, got {got}")]
    OutOfSequence { expected: u32, got: u32 },

    #[error("total chunks changed mid-transfer: {was} -> {now}")]
    TotalChanged { was: u32, now: u32 },

    #[error("unusable file name {0:?}")]
    BadFileName(String),

    #[error("cannot create {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("source file is empty")]
    EmptySource,

    #[error("source has {0} chunks, more than {max}", max = TOTAL_CHUNKS_MAX)]
    TooLarge(u64),

    #[error("file read failed: {0}")]
    Read(#[source] io::Error),

    #[error("file write failed: {0}")]
    Write(#[source] io::Error),

    #[error("transfer already in progress")]
    Busy,

    #[error("no data for {0:?}, transfer stalled")]
    Stalled(Duration),
}

impl TransferError {
    /// The single `ERROR:` line sent to the peer for this failure.
    pub fn reply(&self) -> &'static str {
        match self {
            TransferError::Header(_) => "ERROR: Invalid file transfer header",
            TransferError::OutOfSequence { .. } | TransferError::TotalChanged { .. } => {
                "ERROR: Chunk out of sequence"
            }
            TransferError::BadFileName(_) | TransferError::Create { .. } => {
                "ERROR: Cannot create file"
            }
            TransferError::Open { .. } => crate::protocol::reply::FILE_NOT_FOUND,
            TransferError::EmptySource => crate::protocol::reply::FILE_EMPTY,
            TransferError::Busy => crate::protocol::reply::BUSY,
            TransferError::TooLarge(_)
            | TransferError::Read(_)
            | TransferError::Write(_)
            | TransferError::Stalled(_) => "ERROR: File transfer failed",
        }
    }
}

/// Conditions fatal to a connection: the descriptor is closed and the
/// registry entry released.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("command buffer overflow: {0}")]
    Overflow(#[source] BufferFull),

    #[error("peer closed the connection")]
    Closed,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl ConnError {
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnError::Closed => true,
            ConnError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            ConnError::Overflow(_) => false,
        }
    }
}

/// The registry is at its configured bound; the new connection is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection limit of {0} reached")]
pub struct RegistryFull(pub usize);
