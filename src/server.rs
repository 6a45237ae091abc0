//! Server event loop
//!
//! One thread, one untimed readiness wait. Each iteration accepts every
//! pending connection, drains every readable socket into its connection and
//! pumps one chunk per write-ready socket that is sending.

use anyhow::{bail, Context, Result};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::buffer::Flush;
use crate::commands::{health_report, Request, Session};
use crate::config::ServerConfig;
use crate::connection::{Connection, Direction, FrameHandler, TransferEvent};
use crate::error::ConnError;
use crate::journal::{new_transfer_id, TransferLog, TransferLogEntry, TransferStatus};
use crate::protocol::pacing::{report_progress, LARGE_SOCKET_BUFFER, LARGE_TRANSFER_CHUNKS};
use crate::protocol::reply;
use crate::protocol_core::ensure_dir_exists;
use crate::reactor::{set_socket_buffers, Interest, Poller, Readiness, Shutdown, Token, Waker};
use crate::registry::{ConnId, Registry, Teardown};
use crate::transfer::Outgoing;

const READ_BUF: usize = 64 * 1024;

/// One accepted client.
struct Peer {
    stream: TcpStream,
    conn: Connection,
    session: Session,
    transfer_id: Option<String>,
}

impl Teardown for Peer {
    fn teardown(&mut self) {
        if let Some(p) = self.conn.progress() {
            log::info!(
                "{}: closing with {:?} of {} in progress ({} chunks done)",
                self.label(),
                p.direction,
                p.filename.as_deref().unwrap_or("?"),
                p.done_chunks
            );
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Peer {
    fn label(&self) -> String {
        self.conn
            .peer()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".to_string())
    }
}

pub struct Server {
    listener: TcpListener,
    cfg: ServerConfig,
    waker: Waker,
    shutdown: Shutdown,
    journal: Option<TransferLog>,
}

impl Server {
    /// Validate the root, create the storage directory and bind the listener.
    pub fn bind(cfg: ServerConfig) -> Result<Self> {
        if !cfg.root.is_dir() {
            bail!("Root path is not a directory: {}", cfg.root.display());
        }
        let storage = cfg.storage_path();
        ensure_dir_exists(&storage)
            .with_context(|| format!("Failed to create storage directory: {}", storage.display()))?;

        let addr = cfg.bind_addr();
        let listener =
            TcpListener::bind(&addr).with_context(|| format!("Failed to bind {addr}"))?;
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;
        let waker = Waker::new().context("Failed to create waker")?;
        let shutdown = Shutdown::new(&waker);
        let journal = cfg.journal.as_deref().map(TransferLog::new);

        Ok(Server {
            listener,
            cfg,
            waker,
            shutdown,
            journal,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    /// Handle that stops [`Server::run`] from any thread.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn run(&mut self) -> Result<()> {
        let mut peers: Registry<Peer> = Registry::with_limit(self.cfg.max_clients);
        let mut poller = Poller::new();
        let mut buf = vec![0u8; READ_BUF];
        log::info!(
            "listening on {} (storage {}, max clients {})",
            self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            self.cfg.storage_path().display(),
            peers.bound().map_or("unbounded".to_string(), |b| b.to_string())
        );

        loop {
            poller.clear();
            let listen = poller.watch(self.listener.as_raw_fd(), Interest::READABLE);
            let wake = poller.watch(self.waker.fd(), Interest::READABLE);
            let watched: Vec<(ConnId, Token)> = peers
                .iter()
                .map(|(id, p)| {
                    let interest = Interest::with_write(p.conn.wants_write());
                    (id, poller.watch(p.stream.as_raw_fd(), interest))
                })
                .collect();

            poller.wait(None).context("readiness wait failed")?;

            if poller.readiness(wake).readable {
                self.waker.drain();
            }
            if self.shutdown.is_triggered() {
                log::info!("shutting down, dropping {} connection(s)", peers.len());
                break;
            }
            if poller.readiness(listen).readable {
                self.accept_all(&mut peers);
            }

            for (id, token) in watched {
                let ready = poller.readiness(token);
                if ready.is_empty() {
                    continue;
                }
                let Some(peer) = peers.get_mut(id) else {
                    continue;
                };
                if let Err(e) = self.service(peer, ready, &mut buf) {
                    self.drop_peer(&mut peers, id, e);
                }
            }
        }

        peers.clear();
        Ok(())
    }

    fn accept_all(&self, peers: &mut Registry<Peer>) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("{addr}: cannot make socket non-blocking: {e}");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    let peer = Peer {
                        stream,
                        conn: Connection::new(Some(addr), self.cfg.connection_options()),
                        session: Session::new(&self.cfg.root),
                        transfer_id: None,
                    };
                    match peers.add(peer) {
                        Ok(id) => log::info!("{addr}: connected as {id} ({} active)", peers.len()),
                        Err((full, _refused)) => log::warn!("{addr}: refused, {full}"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Read everything available, then write. Hangup is handled after the
    /// drain so a final command still gets processed.
    fn service(&self, peer: &mut Peer, ready: Readiness, buf: &mut [u8]) -> Result<(), ConnError> {
        let Peer {
            stream,
            conn,
            session,
            transfer_id,
        } = peer;
        let mut handler = Dispatch {
            session,
            transfer_id,
            fd: stream.as_raw_fd(),
            cfg: &self.cfg,
            journal: self.journal.as_ref(),
        };

        if ready.readable || ready.hangup {
            loop {
                match stream.read(buf) {
                    Ok(0) => return Err(ConnError::Closed),
                    Ok(n) => conn.ingest(&buf[..n], &mut handler)?,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if ready.error {
            let err = stream
                .take_error()
                .ok()
                .flatten()
                .unwrap_or_else(|| io::Error::from(io::ErrorKind::ConnectionReset));
            return Err(err.into());
        }

        if conn.flush_to(stream)? == Flush::Blocked {
            return Ok(());
        }
        if ready.writable && conn.is_sending() {
            conn.pump(&mut handler);
            conn.flush_to(stream)?;
        }
        Ok(())
    }

    fn drop_peer(&self, peers: &mut Registry<Peer>, id: ConnId, err: ConnError) {
        let Some(peer) = peers.get_mut(id) else {
            return;
        };
        match &err {
            ConnError::Overflow(_) => {
                log::warn!("{}: {err}, disconnecting", peer.label());
                // best effort delivery of the overflow reply
                let _ = peer.conn.flush_to(&mut peer.stream);
            }
            e if e.is_disconnect() => log::info!("{}: disconnected", peer.label()),
            _ => log::error!("{}: {err}", peer.label()),
        }
        if let (Some(p), Some(journal), Some(tid)) =
            (peer.conn.progress(), self.journal.as_ref(), peer.transfer_id.take())
        {
            let mut entry = TransferLogEntry::new(
                &tid,
                p.direction,
                p.filename.as_deref().unwrap_or(""),
                TransferStatus::Failed,
            );
            entry.peer = peer.conn.peer().map(|a| a.to_string());
            entry.chunks = p.done_chunks;
            entry.bytes = p.bytes;
            entry.error = Some(err.to_string());
            record(journal, &entry);
        }
        peers.remove(id);
        log::debug!("{} connection(s) remain", peers.len());
    }
}

/// Command dispatch and transfer bookkeeping for one connection.
struct Dispatch<'a> {
    session: &'a mut Session,
    transfer_id: &'a mut Option<String>,
    fd: RawFd,
    cfg: &'a ServerConfig,
    journal: Option<&'a TransferLog>,
}

impl Dispatch<'_> {
    fn get(&mut self, conn: &mut Connection, name: &str) {
        if !conn.is_idle() {
            conn.queue_line(reply::BUSY);
            return;
        }
        if name.is_empty() {
            conn.queue_line(reply::FILE_NOT_FOUND);
            return;
        }
        let Some(path) = self.session.resolve(name) else {
            log::warn!("{}: get {name}: outside the served root", label(conn));
            conn.queue_line(reply::FILE_NOT_FOUND);
            return;
        };
        let out = match Outgoing::open(&path, self.cfg.chunk_size) {
            Ok(out) => out,
            Err(e) => {
                log::info!("{}: get {name}: {e}", label(conn));
                conn.queue_line(e.reply());
                return;
            }
        };
        if out.total_chunks() > LARGE_TRANSFER_CHUNKS {
            self.widen_buffers(conn);
        }
        let tid = new_transfer_id();
        self.journal(conn, &tid, Direction::Send, out.name(), TransferStatus::Started, |_| {});
        *self.transfer_id = Some(tid);
        conn.queue_line(reply::BEGIN_TRANSFER);
        if let Err(e) = conn.begin_send(out) {
            conn.queue_line(e.reply());
        }
    }

    fn widen_buffers(&self, conn: &Connection) {
        if let Err(e) = set_socket_buffers(self.fd, LARGE_SOCKET_BUFFER) {
            log::warn!("{}: cannot enlarge socket buffers: {e}", label(conn));
        }
    }

    fn journal(
        &self,
        conn: &Connection,
        tid: &str,
        direction: Direction,
        file: &str,
        status: TransferStatus,
        fill: impl FnOnce(&mut TransferLogEntry),
    ) {
        let Some(journal) = self.journal else {
            return;
        };
        let mut entry = TransferLogEntry::new(tid, direction, file, status);
        entry.peer = conn.peer().map(|a| a.to_string());
        fill(&mut entry);
        record(journal, &entry);
    }
}

impl FrameHandler for Dispatch<'_> {
    fn on_line(&mut self, conn: &mut Connection, line: String) {
        log::debug!("{}: > {line}", label(conn));
        match Request::parse(&line) {
            Request::List => {
                for row in self.session.list() {
                    conn.queue_line(&row);
                }
            }
            Request::Get(name) => self.get(conn, name),
            Request::Upload => {
                if let Err(e) = conn.begin_receive() {
                    conn.queue_line(e.reply());
                }
            }
            Request::Pwd => conn.queue_line(&self.session.pwd()),
            Request::Cd(dir) => {
                let r = self.session.cd(dir);
                conn.queue_line(r);
            }
            Request::Delete(name) => conn.queue_line(self.session.delete(name)),
            Request::Rename(args) => conn.queue_line(self.session.rename(args)),
            Request::Health => {
                for row in health_report() {
                    conn.queue_line(&row);
                }
                log::info!("{}: sent health information", label(conn));
            }
            Request::Unknown(other) => {
                log::warn!("{}: unknown command {other:?}", label(conn));
                conn.queue_line(reply::UNKNOWN_COMMAND);
            }
        }
    }

    fn on_transfer(&mut self, conn: &mut Connection, event: TransferEvent) {
        match event {
            TransferEvent::Started { name, expected } => {
                log::info!("{}: upload of {name} started ({expected} chunks)", label(conn));
                if expected > LARGE_TRANSFER_CHUNKS {
                    self.widen_buffers(conn);
                }
                let tid = new_transfer_id();
                self.journal(conn, &tid, Direction::Receive, &name, TransferStatus::Started, |e| {
                    e.chunks = expected;
                });
                *self.transfer_id = Some(tid);
            }
            TransferEvent::Progress { direction, done, expected } => {
                if done > 0 && report_progress(done - 1, expected) {
                    log::info!("{}: {direction:?} {done}/{expected} chunks", label(conn));
                }
            }
            TransferEvent::Received(done) => {
                conn.queue_line(reply::FILE_UPLOADED);
                let tid = self.transfer_id.take().unwrap_or_else(new_transfer_id);
                self.journal(conn, &tid, Direction::Receive, &done.name, TransferStatus::Completed, |e| {
                    e.chunks = done.chunks;
                    e.bytes = done.bytes;
                    e.digest = Some(done.digest.clone());
                });
            }
            TransferEvent::Sent { name, chunks, bytes, digest } => {
                let tid = self.transfer_id.take().unwrap_or_else(new_transfer_id);
                self.journal(conn, &tid, Direction::Send, &name, TransferStatus::Completed, |e| {
                    e.chunks = chunks;
                    e.bytes = bytes;
                    e.digest = Some(digest);
                });
            }
            TransferEvent::Failed { direction, error } => {
                // a receiving peer cannot parse text mid-stream
                if direction == Direction::Receive {
                    conn.queue_line(error.reply());
                }
                let tid = self.transfer_id.take().unwrap_or_else(new_transfer_id);
                self.journal(conn, &tid, direction, "", TransferStatus::Failed, |e| {
                    e.error = Some(error.to_string());
                });
            }
        }
    }
}

fn label(conn: &Connection) -> String {
    conn.peer()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn record(journal: &TransferLog, entry: &TransferLogEntry) {
    if let Err(e) = journal.add_entry(entry) {
        log::warn!("journal {}: {e:#}", journal.path().display());
    }
}
