//! Per-connection state machine
//!
//! A [`Connection`] owns the frame reassembler, the active transfer and the
//! queued output for one socket, but never the socket itself: the reactor
//! hands it bytes that were read and asks it for bytes to write. Text frames
//! and transfer boundaries are reported through a [`FrameHandler`].

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::buffer::{Flush, OutBuffer};
use crate::error::{ConnError, FrameError, TransferError};
use crate::frame::{Chunk, Frame, Framing, Reassembler};
use crate::protocol::pacing::SEND_RETRIES;
use crate::protocol::{reply, CHUNK_MAX, LINE_CAPACITY};
use crate::transfer::{Accepted, Completed, Incoming, Outgoing};

/// Active mode. A transfer exists exactly when the mode is not `Command`.
#[derive(Debug)]
pub enum Mode {
    Command,
    Sending(Outgoing),
    Receiving(Incoming),
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Command => "command",
            Mode::Sending(_) => "sending",
            Mode::Receiving(_) => "receiving",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

/// Snapshot of the active transfer's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub direction: Direction,
    /// Unknown until chunk 0 of a receive arrives.
    pub expected_chunks: Option<u32>,
    pub done_chunks: u32,
    pub last_chunk_id: Option<u32>,
    pub partial_header: usize,
    pub partial_payload: usize,
    pub filename: Option<String>,
    pub bytes: u64,
}

/// Transfer boundary reported to the owner of a connection.
#[derive(Debug)]
pub enum TransferEvent {
    /// Chunk 0 of a receive was accepted and the destination opened.
    Started { name: String, expected: u32 },
    Progress { direction: Direction, done: u32, expected: u32 },
    /// Every expected chunk was written; the connection is back in `Command`.
    Received(Completed),
    /// The last chunk was queued; the connection is back in `Command`.
    Sent {
        name: String,
        chunks: u32,
        bytes: u64,
        digest: String,
    },
    /// The transfer was torn down; the connection is back in `Command`.
    Failed {
        direction: Direction,
        error: TransferError,
    },
}

/// Callbacks for frames a connection cannot handle on its own.
pub trait FrameHandler {
    /// A complete text line arrived while the connection is not receiving.
    fn on_line(&mut self, conn: &mut Connection, line: String);

    fn on_transfer(&mut self, conn: &mut Connection, event: TransferEvent);
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub line_capacity: usize,
    pub chunk_max: u32,
    pub send_retries: u32,
    /// Switch to `Receiving` when a first chunk header shows up in text.
    pub sniff: bool,
    /// Where received files are written.
    pub receive_dir: PathBuf,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            line_capacity: LINE_CAPACITY,
            chunk_max: CHUNK_MAX,
            send_retries: SEND_RETRIES,
            sniff: false,
            receive_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    peer: Option<SocketAddr>,
    frames: Reassembler,
    mode: Mode,
    outbox: OutBuffer,
    // text produced while sending, released after the last chunk
    held: OutBuffer,
    opts: ConnectionOptions,
}

impl Connection {
    pub fn new(peer: Option<SocketAddr>, opts: ConnectionOptions) -> Self {
        let mut frames = Reassembler::new(opts.line_capacity, opts.chunk_max);
        frames.set_sniffing(opts.sniff);
        Connection {
            peer,
            frames,
            mode: Mode::Command,
            outbox: OutBuffer::new(),
            held: OutBuffer::new(),
            opts,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.mode, Mode::Command)
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.mode, Mode::Receiving(_))
    }

    pub fn is_sending(&self) -> bool {
        matches!(self.mode, Mode::Sending(_))
    }

    /// Toggle first-header sniffing while in `Command` mode.
    pub fn set_sniffing(&mut self, on: bool) {
        self.opts.sniff = on;
        self.sync_framing();
    }

    /// Queue a text line. While sending it is held until the last chunk.
    pub fn queue_line(&mut self, line: &str) {
        if self.is_sending() {
            self.held.push_line(line);
        } else {
            self.outbox.push_line(line);
        }
    }

    /// True while there is output to flush or chunks left to produce.
    pub fn wants_write(&self) -> bool {
        !self.outbox.is_empty() || self.is_sending()
    }

    pub fn pending_output(&self) -> usize {
        self.outbox.len()
    }

    /// Enter `Sending`. Refused unless the connection is idle.
    pub fn begin_send(&mut self, out: Outgoing) -> Result<(), TransferError> {
        if !self.is_idle() {
            return Err(TransferError::Busy);
        }
        log::info!(
            "{}: sending {} ({} chunks)",
            self.peer_label(),
            out.name(),
            out.total_chunks()
        );
        self.set_mode(Mode::Sending(out));
        Ok(())
    }

    /// Enter `Receiving`; the next bytes on the stream are chunk frames.
    pub fn begin_receive(&mut self) -> Result<(), TransferError> {
        if !self.is_idle() {
            return Err(TransferError::Busy);
        }
        let incoming = Incoming::new(&self.opts.receive_dir, self.opts.chunk_max);
        self.set_mode(Mode::Receiving(incoming));
        Ok(())
    }

    /// Tear down the active transfer, if any, and report it as failed.
    pub fn abort_transfer<H: FrameHandler>(&mut self, error: TransferError, handler: &mut H) {
        let direction = match self.mode {
            Mode::Command => return,
            Mode::Sending(_) => Direction::Send,
            Mode::Receiving(_) => Direction::Receive,
        };
        log::warn!("{}: {} aborted: {}", self.peer_label(), self.mode.name(), error);
        self.set_mode(Mode::Command);
        handler.on_transfer(self, TransferEvent::Failed { direction, error });
    }

    pub fn progress(&self) -> Option<TransferProgress> {
        match &self.mode {
            Mode::Command => None,
            Mode::Sending(out) => Some(TransferProgress {
                direction: Direction::Send,
                expected_chunks: Some(out.total_chunks()),
                done_chunks: out.sent(),
                last_chunk_id: out.sent().checked_sub(1),
                partial_header: 0,
                partial_payload: 0,
                filename: Some(out.name().to_string()),
                bytes: out.bytes_sent(),
            }),
            Mode::Receiving(inc) => {
                let (partial_header, partial_payload) = self.frames.partial();
                Some(TransferProgress {
                    direction: Direction::Receive,
                    expected_chunks: inc.expected(),
                    done_chunks: inc.received(),
                    last_chunk_id: inc.last_chunk_id(),
                    partial_header,
                    partial_payload,
                    filename: inc.name().map(str::to_string),
                    bytes: inc.bytes(),
                })
            }
        }
    }

    /// Feed bytes read from the socket. Frames are handled strictly in
    /// arrival order; bytes after a mode-switching line go to the new
    /// sub-protocol. An overflowing line queues one error reply and is
    /// fatal to the connection.
    pub fn ingest<H: FrameHandler>(&mut self, mut data: &[u8], handler: &mut H) -> Result<(), ConnError> {
        loop {
            let frame = match self.frames.next_frame(&mut data) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(FrameError::LineOverflow(full)) => {
                    log::warn!("{}: {}", self.peer_label(), full);
                    self.outbox.push_line(reply::OVERFLOW);
                    return Err(ConnError::Overflow(full));
                }
                Err(FrameError::Header(e)) => {
                    self.abort_transfer(TransferError::Header(e), handler);
                    continue;
                }
            };
            match frame {
                Frame::Line(line) => handler.on_line(self, line),
                Frame::BinaryDetected => {
                    log::info!("{}: chunk stream detected, receiving", self.peer_label());
                    // the reassembler already switched and holds the header prefix
                    let incoming = Incoming::new(&self.opts.receive_dir, self.opts.chunk_max);
                    self.set_mode(Mode::Receiving(incoming));
                }
                Frame::Chunk(chunk) => self.accept_chunk(chunk, handler),
            }
        }
    }

    fn accept_chunk<H: FrameHandler>(&mut self, chunk: Chunk, handler: &mut H) {
        let result = match &mut self.mode {
            Mode::Receiving(inc) => inc.accept(&chunk.header, &chunk.payload),
            _ => {
                log::warn!("{}: chunk outside a transfer dropped", self.peer_label());
                self.sync_framing();
                return;
            }
        };
        log::debug!("{}: chunk {:?}", self.peer_label(), chunk.header);
        match result {
            Ok(Accepted::Started { name, expected }) => {
                handler.on_transfer(self, TransferEvent::Started { name, expected });
                self.report(Direction::Receive, 1, expected, handler);
            }
            Ok(Accepted::Progress { chunk_id, expected }) => {
                self.report(Direction::Receive, chunk_id + 1, expected, handler);
            }
            Ok(Accepted::Complete(done)) => {
                log::info!(
                    "{}: received {} ({} chunks, {} bytes)",
                    self.peer_label(),
                    done.name,
                    done.chunks,
                    done.bytes
                );
                self.set_mode(Mode::Command);
                handler.on_transfer(self, TransferEvent::Received(done));
            }
            Err(e) => self.abort_transfer(e, handler),
        }
    }

    /// Queue exactly one more chunk of the active send.
    pub fn pump<H: FrameHandler>(&mut self, handler: &mut H) {
        let Mode::Sending(out) = &mut self.mode else {
            return;
        };
        if let Err(e) = out.next_chunk(self.outbox.tail_mut()) {
            self.abort_transfer(e, handler);
            return;
        }
        if let Some(pause) = out.pause() {
            std::thread::sleep(pause);
        }
        let (done, expected) = (out.sent(), out.total_chunks());
        if !out.is_done() {
            self.report(Direction::Send, done, expected, handler);
            return;
        }
        let event = TransferEvent::Sent {
            name: out.name().to_string(),
            chunks: expected,
            bytes: out.bytes_sent(),
            digest: out.digest(),
        };
        log::info!("{}: sent all {} chunks", self.peer_label(), expected);
        self.set_mode(Mode::Command);
        handler.on_transfer(self, event);
    }

    /// Write queued output to `w`, retrying a would-block a bounded number
    /// of times before yielding with the remainder still queued.
    pub fn flush_to<W: Write>(&mut self, w: &mut W) -> Result<Flush, ConnError> {
        Ok(self.outbox.flush_to(w, self.opts.send_retries)?)
    }

    fn report<H: FrameHandler>(&mut self, direction: Direction, done: u32, expected: u32, handler: &mut H) {
        handler.on_transfer(
            self,
            TransferEvent::Progress {
                direction,
                done,
                expected,
            },
        );
    }

    fn set_mode(&mut self, mode: Mode) {
        let was_sending = self.is_sending();
        self.mode = mode;
        if was_sending && !self.is_sending() {
            self.outbox.append(&mut self.held);
        }
        self.sync_framing();
    }

    fn sync_framing(&mut self) {
        let framing = if self.is_receiving() {
            Framing::Binary
        } else {
            Framing::Text
        };
        if self.frames.framing() != framing {
            self.frames.set_framing(framing);
        }
        self.frames.set_sniffing(self.opts.sniff && self.is_idle());
    }

    fn peer_label(&self) -> String {
        self.peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "server".to_string())
    }
}
