//! Incremental frame reassembly
//!
//! Turns an arbitrarily fragmented byte stream into whole frames: text lines
//! terminated by `\n`, or binary chunks made of a fixed-size header and the
//! payload it declares. Every partial frame is carried over to the next call,
//! so the caller can hand over whatever a non-blocking read returned.

use crate::buffer::BoundedBuf;
use crate::error::{BufferFull, FrameError};
use crate::protocol::HEADER_LEN;
use crate::protocol_core::ChunkHeader;

/// One complete logical protocol unit.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    Chunk(Chunk),
    /// The text stream turned binary: a plausible chunk 0 header was seen at
    /// a line boundary. The header bytes stay buffered for the next call.
    BinaryDetected,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub payload: Vec<u8>,
}

/// Which sub-protocol the next bytes belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Text,
    Binary,
}

/// Newline-delimited line accumulator with a fixed capacity.
#[derive(Debug, Clone)]
pub struct LineAssembler {
    buf: BoundedBuf,
}

impl LineAssembler {
    pub fn new(capacity: usize) -> Self {
        LineAssembler {
            buf: BoundedBuf::new(capacity),
        }
    }

    /// Consume `input` up to and including the next `\n`. Returns the line
    /// with one trailing `\r` stripped, or `None` after buffering a partial
    /// line. A partial line that would pass capacity is an error.
    pub fn next_line(&mut self, input: &mut &[u8]) -> Result<Option<String>, BufferFull> {
        // bytes parked by `hold` may already contain a newline
        if let Some(i) = self.buf.as_slice().iter().position(|&b| b == b'\n') {
            let mut raw = self.buf.take();
            let rest = raw.split_off(i + 1);
            raw.pop();
            self.buf.push(&rest)?;
            return Ok(Some(finish_line(raw)));
        }
        match input.iter().position(|&b| b == b'\n') {
            Some(i) => {
                self.buf.push(&input[..i])?;
                *input = &input[i + 1..];
                Ok(Some(finish_line(self.buf.take())))
            }
            None => {
                self.buf.push(input)?;
                *input = &[];
                Ok(None)
            }
        }
    }

    /// Buffer `input` without looking for a newline.
    fn hold(&mut self, input: &mut &[u8]) -> Result<(), BufferFull> {
        self.buf.push(input)?;
        *input = &[];
        Ok(())
    }

    pub fn pending(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn take_pending(&mut self) -> Vec<u8> {
        self.buf.take()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

fn finish_line(mut raw: Vec<u8>) -> String {
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    String::from_utf8_lossy(&raw).into_owned()
}

enum Sniff {
    Text,
    Undecided,
    Header,
}

/// Stateful parser shared by both sides of a connection.
#[derive(Debug, Clone)]
pub struct Reassembler {
    lines: LineAssembler,
    header: BoundedBuf,
    payload: BoundedBuf,
    current: Option<ChunkHeader>,
    framing: Framing,
    chunk_max: u32,
    sniff: bool,
    // bytes already taken off the wire but not yet parsed, ahead of any input
    parked: Vec<u8>,
}

impl Reassembler {
    pub fn new(line_capacity: usize, chunk_max: u32) -> Self {
        Reassembler {
            lines: LineAssembler::new(line_capacity),
            header: BoundedBuf::new(HEADER_LEN),
            payload: BoundedBuf::new(chunk_max as usize),
            current: None,
            framing: Framing::Text,
            chunk_max,
            sniff: false,
            parked: Vec::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Switch sub-protocol. Entering binary starts at header phase and
    /// carries over whatever followed the last line; entering text drops any
    /// partial chunk.
    pub fn set_framing(&mut self, framing: Framing) {
        self.header.clear();
        self.payload.clear();
        self.current = None;
        self.framing = framing;
        if framing == Framing::Binary && !self.lines.is_empty() {
            let mut parked = self.lines.take_pending();
            parked.append(&mut self.parked);
            self.parked = parked;
        }
    }

    /// Enable or disable header sniffing at line boundaries in text mode.
    pub fn set_sniffing(&mut self, on: bool) {
        self.sniff = on;
    }

    /// Bytes of the header and payload currently buffered.
    pub fn partial(&self) -> (usize, usize) {
        let header = if self.current.is_some() {
            HEADER_LEN
        } else {
            self.header.len()
        };
        (header, self.payload.len())
    }

    /// Bytes of an unfinished text line currently buffered.
    pub fn pending_text(&self) -> usize {
        self.lines.len()
    }

    /// Produce the next complete frame from `input`, advancing it past the
    /// consumed bytes. `Ok(None)` means `input` is exhausted and the partial
    /// frame is carried over.
    pub fn next_frame(&mut self, input: &mut &[u8]) -> Result<Option<Frame>, FrameError> {
        if !self.parked.is_empty() {
            let parked = std::mem::take(&mut self.parked);
            let mut rest: &[u8] = &parked;
            let result = self.parse(&mut rest);
            // a switch during this call parks bytes that came before `rest`
            self.parked.extend_from_slice(rest);
            match result {
                Ok(None) => {}
                other => return other,
            }
        }
        self.parse(input)
    }

    fn parse(&mut self, input: &mut &[u8]) -> Result<Option<Frame>, FrameError> {
        match self.framing {
            Framing::Text => self.next_text(input),
            Framing::Binary => self.next_chunk(input),
        }
    }

    fn next_text(&mut self, input: &mut &[u8]) -> Result<Option<Frame>, FrameError> {
        if self.sniff {
            match self.sniff_header(input) {
                Sniff::Text => {}
                Sniff::Undecided => {
                    self.lines.hold(input)?;
                    return Ok(None);
                }
                Sniff::Header => {
                    let held = self.lines.take_pending();
                    self.set_framing(Framing::Binary);
                    let mut held: &[u8] = &held;
                    self.header.fill_to(HEADER_LEN, &mut held);
                    debug_assert!(held.is_empty());
                    return Ok(Some(Frame::BinaryDetected));
                }
            }
        }
        Ok(self.lines.next_line(input)?.map(Frame::Line))
    }

    /// Decide whether the line being assembled is really a chunk header.
    /// Headers that open a transfer begin with chunk id 0, i.e. four NUL
    /// bytes, which typed text never contains.
    fn sniff_header(&self, input: &[u8]) -> Sniff {
        let held = self.lines.pending();
        let avail = held.len() + input.len();
        if avail == 0 {
            return Sniff::Text;
        }
        let byte_at = |i: usize| {
            if i < held.len() {
                held[i]
            } else {
                input[i - held.len()]
            }
        };
        if (0..avail.min(4)).any(|i| byte_at(i) != 0) {
            return Sniff::Text;
        }
        if avail < HEADER_LEN {
            return Sniff::Undecided;
        }
        let mut raw = [0u8; HEADER_LEN];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = byte_at(i);
        }
        if ChunkHeader::looks_like_first(&raw, self.chunk_max) {
            Sniff::Header
        } else {
            Sniff::Text
        }
    }

    fn next_chunk(&mut self, input: &mut &[u8]) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.current.as_ref().map(|h| h.chunk_size as usize) {
                None => {
                    if !self.header.fill_to(HEADER_LEN, input) {
                        return Ok(None);
                    }
                    let mut raw = [0u8; HEADER_LEN];
                    raw.copy_from_slice(self.header.as_slice());
                    self.header.clear();
                    let header = ChunkHeader::decode(&raw);
                    if let Err(e) = header.validate(self.chunk_max) {
                        self.set_framing(Framing::Text);
                        return Err(e.into());
                    }
                    self.current = Some(header);
                }
                Some(size) => {
                    if !self.payload.fill_to(size, input) {
                        return Ok(None);
                    }
                    let Some(header) = self.current.take() else {
                        continue;
                    };
                    let payload = self.payload.take();
                    return Ok(Some(Frame::Chunk(Chunk { header, payload })));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HeaderError;
    use crate::protocol::{CHUNK_MAX, LINE_CAPACITY};

    fn chunk_bytes(id: u32, total: u32, name: &str, payload: &[u8]) -> Vec<u8> {
        let mut v = ChunkHeader::new(id, payload.len() as u32, total, name)
            .encode()
            .to_vec();
        v.extend_from_slice(payload);
        v
    }

    fn drain(r: &mut Reassembler, mut input: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(f) = r.next_frame(&mut input).unwrap() {
            frames.push(f);
        }
        assert!(input.is_empty());
        frames
    }

    #[test]
    fn lines_split_and_coalesced() {
        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        assert!(drain(&mut r, b"pw").is_empty());
        let frames = drain(&mut r, b"d\r\nls\ncd /t");
        assert_eq!(
            frames,
            vec![Frame::Line("pwd".into()), Frame::Line("ls".into())]
        );
        assert_eq!(r.pending_text(), 4);
        assert_eq!(drain(&mut r, b"mp\n"), vec![Frame::Line("cd /tmp".into())]);
    }

    #[test]
    fn only_one_carriage_return_is_stripped() {
        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        assert_eq!(drain(&mut r, b"a\r\r\n"), vec![Frame::Line("a\r".into())]);
        assert_eq!(drain(&mut r, b"\n"), vec![Frame::Line(String::new())]);
    }

    #[test]
    fn line_overflow_is_an_error() {
        let mut r = Reassembler::new(8, CHUNK_MAX);
        let mut input: &[u8] = b"0123456789";
        let err = r.next_frame(&mut input).unwrap_err();
        assert!(matches!(err, FrameError::LineOverflow(_)));
    }

    #[test]
    fn chunk_in_one_byte_fragments() {
        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        r.set_framing(Framing::Binary);
        let bytes = chunk_bytes(0, 1, "f.bin", b"hello world");
        let mut frames = Vec::new();
        for b in &bytes {
            frames.extend(drain(&mut r, std::slice::from_ref(b)));
            if frames.is_empty() {
                let (h, p) = r.partial();
                assert!(h + p > 0);
            }
        }
        assert_eq!(frames.len(), 1);
        let Frame::Chunk(c) = &frames[0] else { panic!("expected chunk") };
        assert_eq!(c.header.filename_lossy(), "f.bin");
        assert_eq!(c.payload, b"hello world");
        assert_eq!(r.partial(), (0, 0));
    }

    #[test]
    fn many_chunks_in_one_call() {
        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        r.set_framing(Framing::Binary);
        let mut bytes = chunk_bytes(0, 3, "x", b"aa");
        bytes.extend(chunk_bytes(1, 3, "", b"bb"));
        bytes.extend(chunk_bytes(2, 3, "", b"c"));
        bytes.extend(b"trailing-half-header");
        let mut input: &[u8] = &bytes;
        let mut ids = Vec::new();
        while let Some(Frame::Chunk(c)) = r.next_frame(&mut input).unwrap() {
            ids.push(c.header.chunk_id);
        }
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(r.partial().0, b"trailing-half-header".len());
    }

    #[test]
    fn bad_header_rejected_before_payload() {
        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        r.set_framing(Framing::Binary);
        let mut bytes = ChunkHeader::new(0, 0, 1, "x").encode().to_vec();
        bytes.extend_from_slice(b"ls\n");
        let mut input: &[u8] = &bytes;
        let err = r.next_frame(&mut input).unwrap_err();
        assert_eq!(err, FrameError::Header(HeaderError::ChunkSize { size: 0, max: CHUNK_MAX }));
        // payload bytes untouched, parser back in text mode
        assert_eq!(input, b"ls\n");
        assert_eq!(r.framing(), Framing::Text);

        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        r.set_framing(Framing::Binary);
        let bytes = ChunkHeader::new(0, CHUNK_MAX + 1, 1, "x").encode();
        let mut input: &[u8] = &bytes;
        assert!(r.next_frame(&mut input).is_err());
    }

    #[test]
    fn sniffs_header_at_line_boundary() {
        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        r.set_sniffing(true);
        // a header whose chunk_size encodes a newline byte (10)
        let bytes = chunk_bytes(0, 1, "ten.bin", b"0123456789");
        let mut frames = Vec::new();
        for piece in bytes.chunks(7) {
            frames.extend(drain(&mut r, piece));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::BinaryDetected);
        let Frame::Chunk(c) = &frames[1] else { panic!("expected chunk") };
        assert_eq!(c.payload, b"0123456789");
    }

    #[test]
    fn sniffing_leaves_text_alone() {
        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        r.set_sniffing(true);
        assert_eq!(drain(&mut r, b"health\n"), vec![Frame::Line("health".into())]);
        // NUL-led text that is not a header still comes out as a line
        let mut junk = vec![0u8; 4];
        junk.extend_from_slice(&[0xff; 80]);
        junk.push(b'\n');
        let frames = drain(&mut r, &junk);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Line(_)));
    }

    #[test]
    fn held_candidate_splits_into_lines_once_decided() {
        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        r.set_sniffing(true);
        assert!(drain(&mut r, b"\0\0\0\0hi\n").is_empty());
        let mut more = vec![b'x'; 80];
        more.push(b'\n');
        let frames = drain(&mut r, &more);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::Line("\0\0\0\0hi".into()));
        assert_eq!(frames[1], Frame::Line("x".repeat(80)));
    }

    #[test]
    fn bytes_behind_a_switching_line_reach_the_chunk_parser() {
        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        r.set_sniffing(true);
        let chunk = chunk_bytes(0, 1, "late.bin", b"data");
        let mut first = b"\0\0\0\0x\nupload\n".to_vec();
        first.extend_from_slice(&chunk[..10]);

        assert!(drain(&mut r, &first).is_empty());
        let mut input: &[u8] = &chunk[10..];
        let frame = r.next_frame(&mut input).unwrap();
        assert_eq!(frame, Some(Frame::Line("\0\0\0\0x".into())));
        let frame = r.next_frame(&mut input).unwrap();
        assert_eq!(frame, Some(Frame::Line("upload".into())));

        // the caller answers `upload` by switching before the next call
        r.set_sniffing(false);
        r.set_framing(Framing::Binary);
        let Some(Frame::Chunk(c)) = r.next_frame(&mut input).unwrap() else {
            panic!("expected chunk")
        };
        assert_eq!(c.header.filename_lossy(), "late.bin");
        assert_eq!(c.payload, b"data");
        assert!(input.is_empty());
        assert_eq!(r.partial(), (0, 0));
    }

    #[test]
    fn carried_header_is_still_validated() {
        let mut r = Reassembler::new(LINE_CAPACITY, CHUNK_MAX);
        r.set_sniffing(true);
        let bad = ChunkHeader::new(0, 0, 1, "z").encode();
        let mut first = b"\0\0\0\0x\nupload\n".to_vec();
        first.extend_from_slice(&bad[..10]);
        assert!(drain(&mut r, &first).is_empty());

        let mut rest = bad[10..].to_vec();
        rest.extend_from_slice(b"ls\n");
        let mut input: &[u8] = &rest;
        assert!(matches!(r.next_frame(&mut input).unwrap(), Some(Frame::Line(_))));
        assert_eq!(r.next_frame(&mut input).unwrap(), Some(Frame::Line("upload".into())));
        r.set_sniffing(false);
        r.set_framing(Framing::Binary);
        let err = r.next_frame(&mut input).unwrap_err();
        assert!(matches!(err, FrameError::Header(HeaderError::ChunkSize { size: 0, .. })));
        assert_eq!(r.framing(), Framing::Text);
        assert_eq!(r.next_frame(&mut input).unwrap(), Some(Frame::Line("ls".into())));
    }
}
