//! Chunked transfer engine
//!
//! `Outgoing` turns a source file into a sequence of `[header, payload]`
//! frames. `Incoming` validates a chunk stream and writes it to a file under
//! the storage root. Neither touches a socket; the connection layer decides
//! when bytes move.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TransferError;
use crate::protocol::durability::{FLUSH_ABOVE_CHUNKS, FLUSH_EVERY, SYNC_ABOVE_CHUNKS, SYNC_EVERY};
use crate::protocol::pacing::chunk_pause;
use crate::protocol::{HEADER_LEN, TOTAL_CHUNKS_MAX};
use crate::protocol_core::{chunk_count, ensure_dir_exists, normalize_under_root, ChunkHeader};

const WRITE_BUFFER: usize = 64 * 1024;

/// Send path over one source file.
#[derive(Debug)]
pub struct Outgoing {
    file: File,
    name: String,
    size: u64,
    chunk_size: u32,
    total: u32,
    next_id: u32,
    bytes: u64,
    hasher: blake3::Hasher,
}

impl Outgoing {
    /// Open `path` for sending in `chunk_size` pieces. Empty files are
    /// refused: zero chunks could never signal completion.
    pub fn open(path: &Path, chunk_size: u32) -> Result<Self, TransferError> {
        let open_err = |source| TransferError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(open_err)?;
        let meta = file.metadata().map_err(open_err)?;
        if !meta.is_file() {
            return Err(open_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        let size = meta.len();
        if size == 0 {
            return Err(TransferError::EmptySource);
        }
        let chunk_size = chunk_size.max(1);
        let total = chunk_count(size, chunk_size);
        if total > u64::from(TOTAL_CHUNKS_MAX) {
            return Err(TransferError::TooLarge(total));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Outgoing {
            file,
            name,
            size,
            chunk_size,
            total: total as u32,
            next_id: 0,
            bytes: 0,
            hasher: blake3::Hasher::new(),
        })
    }

    /// Base name carried in the first header.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_chunks(&self) -> u32 {
        self.total
    }

    /// Chunks already produced.
    pub fn sent(&self) -> u32 {
        self.next_id
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes
    }

    pub fn is_done(&self) -> bool {
        self.next_id >= self.total
    }

    /// Append the next `[header, payload]` frame to `out`. Returns its
    /// header, or `None` once every chunk has been produced. On error `out`
    /// is left as it was.
    pub fn next_chunk(&mut self, out: &mut Vec<u8>) -> Result<Option<ChunkHeader>, TransferError> {
        if self.is_done() {
            return Ok(None);
        }
        let want = (self.size - self.bytes).min(u64::from(self.chunk_size)) as usize;
        let start = out.len();
        out.resize(start + HEADER_LEN + want, 0);
        let payload = &mut out[start + HEADER_LEN..];
        if let Err(e) = self.file.read_exact(payload) {
            out.truncate(start);
            return Err(TransferError::Read(e));
        }
        self.hasher.update(payload);

        let header = ChunkHeader::new(self.next_id, want as u32, self.total, &self.name);
        out[start..start + HEADER_LEN].copy_from_slice(&header.encode());
        self.next_id += 1;
        self.bytes += want as u64;
        Ok(Some(header))
    }

    /// Pause to insert after the chunk just produced, for very large sends.
    pub fn pause(&self) -> Option<Duration> {
        self.next_id
            .checked_sub(1)
            .and_then(|id| chunk_pause(id, self.total))
    }

    /// Hex blake3 digest of the payload bytes produced so far.
    pub fn digest(&self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

/// Outcome of one accepted chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Accepted {
    /// The first chunk opened the destination.
    Started { name: String, expected: u32 },
    Progress { chunk_id: u32, expected: u32 },
    Complete(Completed),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub path: PathBuf,
    pub name: String,
    pub chunks: u32,
    pub bytes: u64,
    pub digest: String,
}

#[derive(Debug)]
struct Active {
    file: BufWriter<File>,
    path: PathBuf,
    name: String,
    expected: u32,
    last_chunk_id: u32,
    bytes: u64,
    hasher: blake3::Hasher,
}

/// Receive path writing into a storage root.
///
/// Chunk 0 opens (or truncates) the destination; every later chunk must carry
/// the next id and the same total. Dropping an unfinished `Incoming` closes
/// the file and leaves the partial output in place.
#[derive(Debug)]
pub struct Incoming {
    storage: PathBuf,
    chunk_max: u32,
    active: Option<Active>,
}

impl Incoming {
    pub fn new(storage: impl Into<PathBuf>, chunk_max: u32) -> Self {
        Incoming {
            storage: storage.into(),
            chunk_max,
            active: None,
        }
    }

    /// Total announced by chunk 0, once it has arrived.
    pub fn expected(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.expected)
    }

    pub fn received(&self) -> u32 {
        self.active.as_ref().map_or(0, |a| a.last_chunk_id + 1)
    }

    pub fn last_chunk_id(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.last_chunk_id)
    }

    pub fn name(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.name.as_str())
    }

    pub fn path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    pub fn bytes(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.bytes)
    }

    pub fn accept(&mut self, header: &ChunkHeader, payload: &[u8]) -> Result<Accepted, TransferError> {
        header.validate(self.chunk_max)?;
        debug_assert_eq!(payload.len(), header.chunk_size as usize);

        let started = match &self.active {
            None => {
                if header.chunk_id != 0 {
                    return Err(TransferError::OutOfSequence {
                        expected: 0,
                        got: header.chunk_id,
                    });
                }
                self.active = Some(self.open(header)?);
                true
            }
            Some(a) => {
                if header.total_chunks != a.expected {
                    return Err(TransferError::TotalChanged {
                        was: a.expected,
                        now: header.total_chunks,
                    });
                }
                let next = a.last_chunk_id + 1;
                if header.chunk_id != next {
                    return Err(TransferError::OutOfSequence {
                        expected: next,
                        got: header.chunk_id,
                    });
                }
                false
            }
        };

        let Some(a) = self.active.as_mut() else {
            return Err(TransferError::OutOfSequence { expected: 0, got: header.chunk_id });
        };
        a.file.write_all(payload).map_err(TransferError::Write)?;
        a.hasher.update(payload);
        a.bytes += payload.len() as u64;
        a.last_chunk_id = header.chunk_id;
        let received = header.chunk_id + 1;

        if received == a.expected {
            return self.finish().map(Accepted::Complete);
        }
        if a.expected > FLUSH_ABOVE_CHUNKS && received % FLUSH_EVERY == 0 {
            a.file.flush().map_err(TransferError::Write)?;
        }
        if a.expected > SYNC_ABOVE_CHUNKS && received % SYNC_EVERY == 0 {
            a.file.flush().map_err(TransferError::Write)?;
            a.file.get_ref().sync_data().map_err(TransferError::Write)?;
        }

        if started {
            Ok(Accepted::Started {
                name: a.name.clone(),
                expected: a.expected,
            })
        } else {
            Ok(Accepted::Progress {
                chunk_id: header.chunk_id,
                expected: a.expected,
            })
        }
    }

    fn open(&self, header: &ChunkHeader) -> Result<Active, TransferError> {
        let name = header.filename_lossy();
        ensure_dir_exists(&self.storage).map_err(|source| TransferError::Create {
            path: self.storage.clone(),
            source,
        })?;
        let path = normalize_under_root(&self.storage, Path::new(&name))?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| TransferError::Create {
                path: path.clone(),
                source,
            })?;
        log::debug!("receiving {} ({} chunks) into {}", name, header.total_chunks, path.display());
        Ok(Active {
            file: BufWriter::with_capacity(WRITE_BUFFER, file),
            path,
            name,
            expected: header.total_chunks,
            last_chunk_id: 0,
            bytes: 0,
            hasher: blake3::Hasher::new(),
        })
    }

    fn finish(&mut self) -> Result<Completed, TransferError> {
        let Some(mut a) = self.active.take() else {
            return Err(TransferError::OutOfSequence { expected: 0, got: 0 });
        };
        a.file.flush().map_err(TransferError::Write)?;
        a.file.get_ref().sync_all().map_err(TransferError::Write)?;
        Ok(Completed {
            path: a.path,
            name: a.name,
            chunks: a.expected,
            bytes: a.bytes,
            digest: a.hasher.finalize().to_hex().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HeaderError;
    use crate::protocol::CHUNK_MAX;
    use std::fs;
    use tempfile::TempDir;

    fn frames(out: &mut Outgoing) -> Vec<(ChunkHeader, Vec<u8>)> {
        let mut v = Vec::new();
        let mut buf = Vec::new();
        while let Some(h) = out.next_chunk(&mut buf).unwrap() {
            let payload = buf[HEADER_LEN..].to_vec();
            v.push((h, payload));
            buf.clear();
        }
        v
    }

    #[test]
    fn exact_chunk_size_is_one_chunk() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("one.bin");
        fs::write(&src, vec![7u8; 512]).unwrap();
        let mut out = Outgoing::open(&src, 512).unwrap();
        assert_eq!(out.total_chunks(), 1);
        let f = frames(&mut out);
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].0.filename_lossy(), "one.bin");
        assert!(out.is_done());
    }

    #[test]
    fn one_extra_byte_makes_a_second_chunk() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("two.bin");
        fs::write(&src, vec![1u8; 513]).unwrap();
        let mut out = Outgoing::open(&src, 512).unwrap();
        assert_eq!(out.total_chunks(), 2);
        let f = frames(&mut out);
        assert_eq!(f[1].0.chunk_id, 1);
        assert_eq!(f[1].0.chunk_size, 1);
        assert_eq!(f[1].1.len(), 1);
        // name only on chunk 0
        assert!(f[1].0.filename_bytes().is_empty());
        assert_eq!(out.bytes_sent(), 513);
    }

    #[test]
    fn empty_and_missing_sources_are_refused() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(Outgoing::open(&empty, 512), Err(TransferError::EmptySource)));
        assert!(matches!(
            Outgoing::open(&dir.path().join("nope"), 512),
            Err(TransferError::Open { .. })
        ));
        assert!(matches!(Outgoing::open(dir.path(), 512), Err(TransferError::Open { .. })));
    }

    #[test]
    fn send_then_receive_reproduces_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("report.pdf");
        let data: Vec<u8> = (0..5120u32).map(|i| (i * 31 % 251) as u8).collect();
        fs::write(&src, &data).unwrap();

        let mut out = Outgoing::open(&src, 512).unwrap();
        let storage = dir.path().join("saved");
        let mut inc = Incoming::new(&storage, CHUNK_MAX);
        let mut last = None;
        for (h, p) in frames(&mut out) {
            last = Some(inc.accept(&h, &p).unwrap());
        }
        let Some(Accepted::Complete(done)) = last else { panic!("not complete") };
        assert_eq!(done.chunks, 10);
        assert_eq!(done.bytes, 5120);
        assert_eq!(done.digest, out.digest());
        assert_eq!(fs::read(storage.join("report.pdf")).unwrap(), data);
        assert!(inc.expected().is_none());
    }

    #[test]
    fn gap_in_sequence_aborts_on_third_chunk() {
        let dir = TempDir::new().unwrap();
        let mut inc = Incoming::new(dir.path(), CHUNK_MAX);
        let h = |id, name| ChunkHeader::new(id, 3, 5, name);
        assert!(matches!(
            inc.accept(&h(0, "gap.bin"), b"abc").unwrap(),
            Accepted::Started { expected: 5, .. }
        ));
        assert_eq!(
            inc.accept(&h(1, ""), b"def").unwrap(),
            Accepted::Progress { chunk_id: 1, expected: 5 }
        );
        let err = inc.accept(&h(3, ""), b"ghi").unwrap_err();
        assert!(matches!(err, TransferError::OutOfSequence { expected: 2, got: 3 }));
        drop(inc);
        // partial output stays
        assert_eq!(fs::read(dir.path().join("gap.bin")).unwrap(), b"abcdef");
    }

    #[test]
    fn duplicate_and_late_start_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut inc = Incoming::new(dir.path(), CHUNK_MAX);
        let err = inc.accept(&ChunkHeader::new(1, 1, 2, ""), b"x").unwrap_err();
        assert!(matches!(err, TransferError::OutOfSequence { expected: 0, got: 1 }));

        inc.accept(&ChunkHeader::new(0, 1, 3, "d.bin"), b"x").unwrap();
        let err = inc.accept(&ChunkHeader::new(0, 1, 3, "d.bin"), b"x").unwrap_err();
        assert!(matches!(err, TransferError::OutOfSequence { expected: 1, got: 0 }));
        let err = inc.accept(&ChunkHeader::new(1, 1, 4, ""), b"x").unwrap_err();
        assert!(matches!(err, TransferError::TotalChanged { was: 3, now: 4 }));
    }

    #[test]
    fn invalid_header_and_unsafe_name_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut inc = Incoming::new(dir.path(), 16);
        let err = inc.accept(&ChunkHeader::new(0, 17, 1, "big"), &[0; 17]).unwrap_err();
        assert!(matches!(err, TransferError::Header(HeaderError::ChunkSize { size: 17, max: 16 })));

        let err = inc.accept(&ChunkHeader::new(0, 1, 1, "../escape"), b"x").unwrap_err();
        assert!(matches!(err, TransferError::BadFileName(_)));
        assert_eq!(err.reply(), "ERROR: Cannot create file");
        assert!(!dir.path().parent().unwrap().join("escape").exists());
    }

    #[test]
    fn long_transfers_flush_buffered_writes_periodically() {
        let dir = TempDir::new().unwrap();
        let mut inc = Incoming::new(dir.path(), CHUNK_MAX);
        let total = FLUSH_ABOVE_CHUNKS + 1;
        let dest = dir.path().join("long.bin");
        for id in 0..FLUSH_EVERY {
            let name = if id == 0 { "long.bin" } else { "" };
            inc.accept(&ChunkHeader::new(id, 1, total, name), b"z").unwrap();
            if id == 0 {
                // still in the write buffer
                assert_eq!(fs::metadata(&dest).unwrap().len(), 0);
            }
        }
        assert_eq!(fs::metadata(&dest).unwrap().len(), u64::from(FLUSH_EVERY));
        assert_eq!(inc.received(), FLUSH_EVERY);
    }

    #[test]
    fn chunk_zero_truncates_existing_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("t.txt"), b"old contents that are long").unwrap();
        let mut inc = Incoming::new(dir.path(), CHUNK_MAX);
        inc.accept(&ChunkHeader::new(0, 3, 1, "t.txt"), b"new").unwrap();
        assert_eq!(fs::read(dir.path().join("t.txt")).unwrap(), b"new");
    }
}
