//! Shared protocol logic for both the server and the client
//!
//! Chunk header encoding and validation, chunk arithmetic, and safe
//! placement of peer-supplied file names under a storage root.

use std::path::{Component, Path, PathBuf};

use crate::error::{HeaderError, TransferError};
use crate::protocol::{CHUNK_TYPE_DATA, FILENAME_LEN, HEADER_LEN, TOTAL_CHUNKS_MAX};

/// Fixed-size header preceding every chunk payload.
/// Format: CHUNK_ID (4) | CHUNK_SIZE (4) | TOTAL_CHUNKS (4) | TYPE (4) | FILENAME (64)
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_id: u32,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub kind: u32,
    pub filename: [u8; FILENAME_LEN],
}

impl std::fmt::Debug for ChunkHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHeader")
            .field("chunk_id", &self.chunk_id)
            .field("chunk_size", &self.chunk_size)
            .field("total_chunks", &self.total_chunks)
            .field("kind", &self.kind)
            .field("filename", &self.filename_lossy())
            .finish()
    }
}

impl ChunkHeader {
    /// Header for chunk `chunk_id`; the name is only carried on chunk 0.
    pub fn new(chunk_id: u32, chunk_size: u32, total_chunks: u32, name: &str) -> Self {
        let mut filename = [0u8; FILENAME_LEN];
        if chunk_id == 0 {
            let bytes = truncate_name(name).as_bytes();
            filename[..bytes.len()].copy_from_slice(bytes);
        }
        ChunkHeader {
            chunk_id,
            chunk_size,
            total_chunks,
            kind: CHUNK_TYPE_DATA,
            filename,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.chunk_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.chunk_size.to_be_bytes());
        out[8..12].copy_from_slice(&self.total_chunks.to_be_bytes());
        out[12..16].copy_from_slice(&self.kind.to_be_bytes());
        out[16..].copy_from_slice(&self.filename);
        out
    }

    /// Convert from wire order. Performs no range checks; see [`ChunkHeader::validate`].
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        let mut filename = [0u8; FILENAME_LEN];
        filename.copy_from_slice(&raw[16..]);
        ChunkHeader {
            chunk_id: word(0),
            chunk_size: word(4),
            total_chunks: word(8),
            kind: word(12),
            filename,
        }
    }

    /// Enforce `0 < chunk_size <= chunk_max`, `0 < total_chunks <= TOTAL_CHUNKS_MAX`
    /// and `chunk_id < total_chunks`.
    pub fn validate(&self, chunk_max: u32) -> Result<(), HeaderError> {
        if self.chunk_size == 0 || self.chunk_size > chunk_max {
            return Err(HeaderError::ChunkSize {
                size: self.chunk_size,
                max: chunk_max,
            });
        }
        if self.total_chunks == 0 || self.total_chunks > TOTAL_CHUNKS_MAX {
            return Err(HeaderError::TotalChunks(self.total_chunks));
        }
        if self.chunk_id >= self.total_chunks {
            return Err(HeaderError::ChunkId {
                id: self.chunk_id,
                total: self.total_chunks,
            });
        }
        if self.kind != CHUNK_TYPE_DATA {
            return Err(HeaderError::Kind(self.kind));
        }
        Ok(())
    }

    /// True when `raw` plausibly opens a transfer: chunk 0, in-range sizes,
    /// non-empty name.
    pub fn looks_like_first(raw: &[u8; HEADER_LEN], chunk_max: u32) -> bool {
        let h = ChunkHeader::decode(raw);
        h.chunk_id == 0 && h.filename[0] != 0 && h.validate(chunk_max).is_ok()
    }

    /// File name bytes up to the first NUL.
    pub fn filename_bytes(&self) -> &[u8] {
        let end = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_LEN);
        &self.filename[..end]
    }

    pub fn filename_lossy(&self) -> String {
        String::from_utf8_lossy(self.filename_bytes()).into_owned()
    }
}

/// Longest prefix of `name` that fits the filename field with a trailing NUL,
/// cut on a char boundary.
fn truncate_name(name: &str) -> &str {
    let max = FILENAME_LEN - 1;
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// `ceil(size / chunk_size)` computed without overflow.
pub fn chunk_count(size: u64, chunk_size: u32) -> u64 {
    let chunk = u64::from(chunk_size.max(1));
    size / chunk + u64::from(size % chunk != 0)
}

/// Resolve a peer-supplied file name to a destination inside `root`.
///
/// Only plain relative components survive; `..`, absolute paths and NUL
/// bytes are refused. Symlinks are resolved and the result must still lie
/// under the canonical root.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf, TransferError> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    let bad = || TransferError::BadFileName(p.to_string_lossy().into_owned());

    if p.to_string_lossy().contains('\0') {
        return Err(bad());
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => return Err(bad()),
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(bad());
    }

    let canon_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let joined = canon_root.join(&safe);

    // new files: only the parent can be canonicalized
    let final_path = if joined.exists() {
        joined.canonicalize().map_err(|_| bad())?
    } else if let Some(parent) = joined.parent().filter(|p| p.exists()) {
        let canonical_parent = parent.canonicalize().map_err(|_| bad())?;
        match joined.file_name() {
            Some(name) => canonical_parent.join(name),
            None => canonical_parent,
        }
    } else {
        joined
    };

    if !final_path.starts_with(&canon_root) {
        return Err(bad());
    }
    Ok(final_path)
}

/// `mkdir -p`, tolerating an existing directory.
pub fn ensure_dir_exists(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
