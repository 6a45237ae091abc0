//! Owned byte buffers for non-blocking I/O
//!
//! `BoundedBuf` accumulates input up to a fixed capacity and refuses writes
//! beyond it with a typed error. `OutBuffer` holds bytes queued for a socket
//! and tracks how much of them the kernel has already taken.

use std::io::{self, Write};

use crate::error::BufferFull;
use crate::protocol::pacing::retry_delay;

#[derive(Debug, Clone)]
pub struct BoundedBuf {
    data: Vec<u8>,
    capacity: usize,
}

impl BoundedBuf {
    pub fn new(capacity: usize) -> Self {
        BoundedBuf {
            data: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append all of `bytes` or nothing.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if bytes.len() > self.remaining() {
            return Err(BufferFull {
                capacity: self.capacity,
                len: self.data.len(),
                extra: bytes.len(),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Move bytes from the front of `input` until the buffer holds `target`
    /// bytes (or `input` runs dry). Returns true once `target` is reached.
    pub fn fill_to(&mut self, target: usize, input: &mut &[u8]) -> bool {
        let target = target.min(self.capacity);
        let want = target.saturating_sub(self.data.len());
        let take = want.min(input.len());
        self.data.extend_from_slice(&input[..take]);
        *input = &input[take..];
        self.data.len() == target
    }

    /// Hand out the contents, leaving the buffer empty with its capacity intact.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Result of pushing queued output at a non-blocking writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything queued has been written.
    Done,
    /// The writer would block; the remainder stays queued for the next
    /// write-readiness event.
    Blocked,
}

#[derive(Debug, Default)]
pub struct OutBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl OutBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn pending(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Queue one newline-terminated text line.
    pub fn push_line(&mut self, line: &str) {
        self.push(line.as_bytes());
        self.data.push(b'\n');
    }

    /// Backing vector for building a frame in place (header + payload).
    pub fn tail_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Move everything out of `other` behind what is already queued.
    pub fn append(&mut self, other: &mut OutBuffer) {
        self.data.extend_from_slice(other.pending());
        other.clear();
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    /// Write queued bytes until done or the writer blocks. A would-block is
    /// retried up to `retries` times with a growing delay before giving
    /// control back; hard errors (reset, broken pipe) are returned as-is.
    pub fn flush_to<W: Write>(&mut self, w: &mut W, retries: u32) -> io::Result<Flush> {
        let mut attempt = 0;
        while self.pos < self.data.len() {
            match w.write(&self.data[self.pos..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.pos += n;
                    attempt = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if attempt >= retries {
                        self.compact();
                        return Ok(Flush::Blocked);
                    }
                    std::thread::sleep(retry_delay(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        self.clear();
        Ok(Flush::Done)
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts `budget` bytes per call and then reports would-block.
    struct Throttled {
        out: Vec<u8>,
        per_call: usize,
        blocked_after: usize,
        calls: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.out.len() >= self.blocked_after {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.per_call);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn bounded_push_rejects_overflow_atomically() {
        let mut b = BoundedBuf::new(4);
        b.push(b"ab").unwrap();
        let err = b.push(b"cde").unwrap_err();
        assert_eq!(err, BufferFull { capacity: 4, len: 2, extra: 3 });
        assert_eq!(b.as_slice(), b"ab");
        b.push(b"cd").unwrap();
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn fill_to_spans_calls() {
        let mut b = BoundedBuf::new(8);
        let mut input: &[u8] = b"abc";
        assert!(!b.fill_to(5, &mut input));
        assert!(input.is_empty());
        let mut input: &[u8] = b"defgh";
        assert!(b.fill_to(5, &mut input));
        assert_eq!(b.as_slice(), b"abcde");
        assert_eq!(input, b"fgh");
        assert_eq!(b.take(), b"abcde".to_vec());
        assert!(b.is_empty());
    }

    #[test]
    fn flush_handles_short_writes() {
        let mut out = OutBuffer::new();
        out.push_line("SUCCESS: File uploaded");
        let mut w = Throttled { out: Vec::new(), per_call: 3, blocked_after: usize::MAX, calls: 0 };
        assert_eq!(out.flush_to(&mut w, 0).unwrap(), Flush::Done);
        assert_eq!(w.out, b"SUCCESS: File uploaded\n");
        assert!(out.is_empty());
    }

    #[test]
    fn blocked_flush_keeps_remainder() {
        let mut out = OutBuffer::new();
        out.push(b"0123456789");
        let mut w = Throttled { out: Vec::new(), per_call: 4, blocked_after: 4, calls: 0 };
        assert_eq!(out.flush_to(&mut w, 2).unwrap(), Flush::Blocked);
        // one successful write plus the initial attempt and two retries
        assert_eq!(w.calls, 4);
        assert_eq!(out.pending(), b"456789");

        w.blocked_after = usize::MAX;
        assert_eq!(out.flush_to(&mut w, 2).unwrap(), Flush::Done);
        assert_eq!(w.out, b"0123456789");
    }

    #[test]
    fn hard_error_propagates() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut out = OutBuffer::new();
        out.push(b"x");
        let err = out.flush_to(&mut Broken, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn append_moves_held_output() {
        let mut held = OutBuffer::new();
        held.push_line("ERROR: Transfer already in progress");
        let mut out = OutBuffer::new();
        out.push(b"chunk");
        out.append(&mut held);
        assert!(held.is_empty());
        assert_eq!(out.pending(), b"chunkERROR: Transfer already in progress\n");
    }
}
