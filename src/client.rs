//! Interactive client
//!
//! Multiplexes the terminal and one server connection over the same
//! readiness wait the server uses. The wait is only timed while a download
//! is in flight, to notice a stalled transfer.

use anyhow::{Context, Result};
use std::io::{self, Read};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::buffer::Flush;
use crate::config::ClientConfig;
use crate::connection::{Connection, Direction, FrameHandler, TransferEvent};
use crate::error::{ConnError, TransferError};
use crate::frame::LineAssembler;
use crate::progress::{self, TransferBar};
use crate::protocol::pacing::{LARGE_SOCKET_BUFFER, LARGE_TRANSFER_CHUNKS};
use crate::protocol::timeouts::stall_limit;
use crate::protocol::{reply, verb, LINE_CAPACITY};
use crate::reactor::{set_socket_buffers, Interest, NonBlockingStdin, Poller, Shutdown, Waker};
use crate::transfer::Outgoing;

const READ_BUF: usize = 64 * 1024;

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Get(String),
    Send(String),
    List,
    Pwd,
    Cd(String),
    Delete(String),
    Rename(String, String),
    Health,
    Help,
    Clear,
    Exit,
    Empty,
    /// A command that needs an argument was given none.
    Usage(&'static str),
    Unknown(String),
}

impl UserCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        let arg = |make: fn(String) -> UserCommand, usage: &'static str| {
            if rest.is_empty() {
                UserCommand::Usage(usage)
            } else {
                make(rest.to_string())
            }
        };
        match word {
            "" => UserCommand::Empty,
            "get" => arg(UserCommand::Get, "Error: 'get' command requires a filename."),
            "send" => arg(UserCommand::Send, "Error: 'send' command requires a filename."),
            "list" | "ls" => UserCommand::List,
            "pwd" => UserCommand::Pwd,
            "cd" => arg(UserCommand::Cd, "Error: 'cd' command requires a directory path."),
            "delete" => arg(UserCommand::Delete, "Error: 'delete' command requires a filename."),
            "rename" => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(a), Some(b), None) => UserCommand::Rename(a.to_string(), b.to_string()),
                    _ => UserCommand::Usage("Error: 'rename' command requires an old and a new name."),
                }
            }
            "health" => UserCommand::Health,
            "help" => UserCommand::Help,
            "clear" => UserCommand::Clear,
            "exit" | "quit" => UserCommand::Exit,
            _ => UserCommand::Unknown(line.to_string()),
        }
    }

    /// Text request sent to the server, if this command has one. `send` is
    /// handled separately since it is followed by chunks.
    pub fn request(&self) -> Option<String> {
        match self {
            UserCommand::Get(name) => Some(format!("{} {name}", verb::GET)),
            UserCommand::List => Some(verb::LIST.to_string()),
            UserCommand::Pwd => Some(verb::PWD.to_string()),
            UserCommand::Cd(dir) => Some(format!("{} {dir}", verb::CD)),
            UserCommand::Delete(name) => Some(format!("{} {name}", verb::DELETE)),
            UserCommand::Rename(a, b) => Some(format!("{} {a} {b}", verb::RENAME)),
            UserCommand::Health => Some(verb::HEALTH.to_string()),
            _ => None,
        }
    }
}

/// Terminal side of the connection: prints server lines and tracks the
/// transfer the user asked for.
struct Console {
    awaiting_get: Option<String>,
    upload_pending: bool,
    detect_headers: bool,
    bar: Option<TransferBar>,
    printed: bool,
    fd: RawFd,
}

impl Console {
    fn print(&mut self, line: &str) {
        match self.bar.as_ref().filter(|b| !b.is_finished()) {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
        self.printed = true;
    }

    fn busy(&self, conn: &Connection) -> bool {
        !conn.is_idle() || self.awaiting_get.is_some()
    }
}

impl FrameHandler for Console {
    fn on_line(&mut self, conn: &mut Connection, line: String) {
        if line == reply::BEGIN_TRANSFER {
            if let Some(name) = self.awaiting_get.take() {
                conn.set_sniffing(false);
                match conn.begin_receive() {
                    Ok(()) => log::debug!("download of {name} announced"),
                    Err(e) => progress::error(&format!("Cannot receive {name}: {e}")),
                }
                return;
            }
            log::warn!("unexpected {line} ignored");
            return;
        }
        if line.starts_with(reply::ERROR) {
            if self.awaiting_get.take().is_some() {
                conn.set_sniffing(false);
            }
            self.upload_pending = false;
        } else if line.starts_with(reply::SUCCESS) {
            self.upload_pending = false;
        }
        self.print(&progress::status_line(&line));
    }

    fn on_transfer(&mut self, conn: &mut Connection, event: TransferEvent) {
        match event {
            TransferEvent::Started { name, expected } => {
                // covers downloads detected from header bytes alone
                self.awaiting_get = None;
                conn.set_sniffing(false);
                if expected > LARGE_TRANSFER_CHUNKS {
                    let _ = set_socket_buffers(self.fd, LARGE_SOCKET_BUFFER);
                }
                progress::success(&format!("Receiving file: {name} ({expected} chunks)"));
                self.bar = Some(TransferBar::new(&format!("get {name}"), u64::from(expected)));
            }
            TransferEvent::Progress { done, expected, .. } => {
                if let Some(bar) = &self.bar {
                    bar.set_length(u64::from(expected));
                    bar.set_position(u64::from(done));
                }
            }
            TransferEvent::Received(done) => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_success(&done.path.display().to_string(), done.bytes);
                }
                progress::success("File download completed successfully!");
                self.printed = true;
            }
            TransferEvent::Sent { name, bytes, .. } => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_success(&format!("sent {name}"), bytes);
                }
                self.upload_pending = true;
                self.printed = true;
            }
            TransferEvent::Failed { direction, error } => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_error(&error.to_string());
                }
                match direction {
                    Direction::Receive => progress::error("File download failed!"),
                    Direction::Send => progress::error("File upload failed!"),
                }
                self.printed = true;
            }
        }
    }
}

pub struct Client {
    stream: TcpStream,
    conn: Connection,
    console: Console,
    cfg: ClientConfig,
    waker: Waker,
    shutdown: Shutdown,
    idle_waits: u32,
}

impl Client {
    pub fn connect(cfg: ClientConfig) -> Result<Self> {
        let addr = cfg.addr();
        let stream =
            TcpStream::connect(&addr).with_context(|| format!("Failed to connect to {addr}"))?;
        stream
            .set_nonblocking(true)
            .context("Failed to make socket non-blocking")?;
        let _ = stream.set_nodelay(true);
        let waker = Waker::new().context("Failed to create waker")?;
        let shutdown = Shutdown::new(&waker);
        let console = Console {
            awaiting_get: None,
            upload_pending: false,
            detect_headers: cfg.detect_headers,
            bar: None,
            printed: false,
            fd: stream.as_raw_fd(),
        };
        let conn = Connection::new(stream.peer_addr().ok(), cfg.connection_options());
        Ok(Client {
            stream,
            conn,
            console,
            cfg,
            waker,
            shutdown,
            idle_waits: 0,
        })
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn run(&mut self) -> Result<()> {
        let stdin = NonBlockingStdin::new().context("Failed to make stdin non-blocking")?;
        let mut typed = LineAssembler::new(LINE_CAPACITY);
        let mut poller = Poller::new();
        let mut buf = vec![0u8; READ_BUF];
        let mut stdin_open = true;

        progress::success(&format!("Connected to server {}", self.cfg.addr()));
        progress::prompt();

        loop {
            if !stdin_open && self.settled() {
                break;
            }
            poller.clear();
            let input = stdin_open.then(|| poller.watch(stdin.fd(), Interest::READABLE));
            let sock = poller.watch(
                self.stream.as_raw_fd(),
                Interest::with_write(self.conn.wants_write()),
            );
            let wake = poller.watch(self.waker.fd(), Interest::READABLE);
            let timeout = self.conn.is_receiving().then(|| self.cfg.wait_timeout());

            let ready = poller.wait(timeout).context("readiness wait failed")?;
            if poller.readiness(wake).readable {
                self.waker.drain();
            }
            if self.shutdown.is_triggered() {
                break;
            }
            if ready == 0 {
                self.on_timeout();
                continue;
            }

            let s = poller.readiness(sock);
            if s.readable || s.hangup || s.error {
                match self.read_socket(&mut buf) {
                    Ok(()) => {}
                    Err(ConnError::Closed) => {
                        progress::error("\nServer disconnected");
                        break;
                    }
                    Err(e) => {
                        progress::error(&format!("\nConnection error: {e}"));
                        break;
                    }
                }
            }
            if let Err(e) = self.write_socket(s.writable) {
                progress::error(&format!("\nConnection error: {e}"));
                break;
            }
            if self.console.printed && self.conn.is_idle() {
                self.console.printed = false;
                progress::prompt();
            }

            let Some(input) = input else { continue };
            let i = poller.readiness(input);
            if !(i.readable || i.hangup || i.error) {
                continue;
            }
            match stdin.read(&mut buf) {
                Ok(0) => stdin_open = false,
                Ok(n) => {
                    let mut data: &[u8] = &buf[..n];
                    loop {
                        match typed.next_line(&mut data) {
                            Ok(Some(line)) => {
                                if !self.handle_command(UserCommand::parse(&line)) {
                                    return Ok(());
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                progress::error(&format!("Input too long: {e}"));
                                typed.clear();
                                break;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::error!("stdin read error: {e}");
                    stdin_open = false;
                }
            }
        }
        Ok(())
    }

    /// Nothing left in flight, so the client may exit after end of input.
    fn settled(&self) -> bool {
        self.conn.is_idle()
            && !self.conn.wants_write()
            && self.console.awaiting_get.is_none()
            && !self.console.upload_pending
    }

    fn read_socket(&mut self, buf: &mut [u8]) -> Result<(), ConnError> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Err(ConnError::Closed),
                Ok(n) => {
                    self.idle_waits = 0;
                    self.conn.ingest(&buf[..n], &mut self.console)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_socket(&mut self, writable: bool) -> Result<(), ConnError> {
        if self.conn.flush_to(&mut self.stream)? == Flush::Blocked {
            return Ok(());
        }
        if writable && self.conn.is_sending() {
            self.conn.pump(&mut self.console);
            self.conn.flush_to(&mut self.stream)?;
        }
        Ok(())
    }

    fn on_timeout(&mut self) {
        if !self.conn.is_receiving() {
            return;
        }
        self.idle_waits += 1;
        let snapshot = self.conn.progress();
        let expected = snapshot.as_ref().and_then(|p| p.expected_chunks).unwrap_or(0);
        let limit = stall_limit(self.cfg.stall_limit, expected);
        if self.idle_waits < limit {
            log::debug!("no data for {} wait(s) of {}", self.idle_waits, limit);
            return;
        }
        let waited = self.cfg.wait_timeout() * self.idle_waits;
        if let Some(p) = snapshot {
            progress::error(&format!(
                "\nTimeout: no data received from server for {}s. Progress: {}/{} chunks",
                waited.as_secs(),
                p.done_chunks,
                expected
            ));
        }
        self.idle_waits = 0;
        self.conn
            .abort_transfer(TransferError::Stalled(waited), &mut self.console);
        progress::prompt();
    }

    /// Act on one typed command. Returns false when the user asked to exit.
    fn handle_command(&mut self, cmd: UserCommand) -> bool {
        match &cmd {
            UserCommand::Empty => progress::prompt(),
            UserCommand::Exit => return false,
            UserCommand::Help => {
                progress::print_help();
                progress::prompt();
            }
            UserCommand::Clear => {
                progress::clear_screen();
                progress::prompt();
            }
            UserCommand::Usage(msg) => {
                progress::error(msg);
                progress::prompt();
            }
            UserCommand::Unknown(what) => {
                println!("Unknown command: \"{what}\". Use 'help' for a list of commands.");
                progress::prompt();
            }
            UserCommand::Send(path) => self.start_upload(path),
            UserCommand::Get(name) => {
                if self.console.busy(&self.conn) {
                    progress::error("Error: File transfer already in progress.");
                    progress::prompt();
                    return true;
                }
                progress::info(&format!("Starting download of file: {name}"));
                self.console.awaiting_get = Some(name.clone());
                if self.console.detect_headers {
                    self.conn.set_sniffing(true);
                }
                if let Some(req) = cmd.request() {
                    self.conn.queue_line(&req);
                }
            }
            _ => {
                if let Some(req) = cmd.request() {
                    self.conn.queue_line(&req);
                }
            }
        }
        true
    }

    fn start_upload(&mut self, path: &str) {
        if self.console.busy(&self.conn) {
            progress::error("Error: File transfer already in progress.");
            progress::prompt();
            return;
        }
        let out = match Outgoing::open(std::path::Path::new(path), self.cfg.chunk_size) {
            Ok(out) => out,
            Err(TransferError::EmptySource) => {
                progress::error(&format!("Error: {path} is empty, nothing to send."));
                progress::prompt();
                return;
            }
            Err(e) => {
                progress::error(&format!("Error: {e}"));
                progress::prompt();
                return;
            }
        };
        if out.total_chunks() > LARGE_TRANSFER_CHUNKS {
            let _ = set_socket_buffers(self.stream.as_raw_fd(), LARGE_SOCKET_BUFFER);
        }
        progress::success(&format!(
            "Sending file: {} ({} chunks)",
            out.name(),
            out.total_chunks()
        ));
        self.console.bar = Some(TransferBar::new(
            &format!("send {}", out.name()),
            u64::from(out.total_chunks()),
        ));
        self.conn.queue_line(verb::UPLOAD);
        if let Err(e) = self.conn.begin_send(out) {
            progress::error(&format!("Error: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HEADER_LEN;
    use crate::protocol_core::ChunkHeader;
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Duration;
    use tempfile::TempDir;

    /// A connected client plus the blocking socket standing in for the server.
    fn connected(cfg: ClientConfig) -> (Client, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let cfg = ClientConfig {
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
            ..cfg
        };
        let client = Client::connect(cfg).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        (client, server)
    }

    fn read_until(client: &mut Client, done: impl Fn(&Client) -> bool) {
        let mut buf = vec![0u8; READ_BUF];
        for _ in 0..500 {
            client.read_socket(&mut buf).unwrap();
            if done(client) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("client never reached the expected state");
    }

    fn flush_all(client: &mut Client) {
        for _ in 0..500 {
            if !client.conn.wants_write() {
                return;
            }
            client.write_socket(true).unwrap();
        }
        panic!("output never drained");
    }

    fn expect_request(server: &mut TcpStream, want: &[u8]) {
        let mut got = vec![0u8; want.len()];
        server.read_exact(&mut got).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn announced_download_lands_in_download_dir() {
        let dir = TempDir::new().unwrap();
        let (mut client, mut server) = connected(ClientConfig {
            download_dir: dir.path().to_path_buf(),
            ..ClientConfig::default()
        });
        assert!(client.handle_command(UserCommand::parse("get hello.txt")));
        flush_all(&mut client);
        expect_request(&mut server, b"get hello.txt\n");

        let data: Vec<u8> = (0..700u32).map(|i| (i % 97) as u8).collect();
        let mut wire = b"BEGIN_TRANSFER\n".to_vec();
        for (id, piece) in data.chunks(512).enumerate() {
            wire.extend(ChunkHeader::new(id as u32, piece.len() as u32, 2, "hello.txt").encode());
            wire.extend_from_slice(piece);
        }
        server.write_all(&wire).unwrap();
        read_until(&mut client, |c| c.conn.is_idle() && c.console.awaiting_get.is_none());
        assert_eq!(std::fs::read(dir.path().join("hello.txt")).unwrap(), data);
        assert!(client.settled());
    }

    #[test]
    fn stalled_download_returns_to_command_mode() {
        let dir = TempDir::new().unwrap();
        let (mut client, mut server) = connected(ClientConfig {
            download_dir: dir.path().to_path_buf(),
            stall_limit: 3,
            wait_timeout_ms: 10,
            ..ClientConfig::default()
        });
        client.handle_command(UserCommand::Get("slow.bin".into()));
        flush_all(&mut client);
        expect_request(&mut server, b"get slow.bin\n");
        server.write_all(b"BEGIN_TRANSFER\n").unwrap();
        read_until(&mut client, |c| c.conn.is_receiving());

        client.on_timeout();
        client.on_timeout();
        assert!(client.conn.is_receiving());
        // any data restarts the count
        server.write_all(&ChunkHeader::new(0, 4, 9, "slow.bin").encode()[..10]).unwrap();
        read_until(&mut client, |c| c.idle_waits == 0);
        client.on_timeout();
        client.on_timeout();
        assert!(client.conn.is_receiving());
        client.on_timeout();
        assert!(client.conn.is_idle());
        assert_eq!(client.idle_waits, 0);

        // not receiving: waits are not counted
        client.on_timeout();
        assert_eq!(client.idle_waits, 0);
    }

    #[test]
    fn send_writes_upload_then_sequenced_chunks() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("report.pdf");
        let data: Vec<u8> = (0..1300u32).map(|i| (i * 13) as u8).collect();
        std::fs::write(&src, &data).unwrap();
        let (mut client, mut server) = connected(ClientConfig {
            chunk_size: 512,
            ..ClientConfig::default()
        });

        let line = format!("send {}", src.display());
        client.handle_command(UserCommand::parse(&line));
        assert!(client.conn.is_sending());
        // a second transfer is refused while this one runs
        client.handle_command(UserCommand::Get("other".into()));
        assert!(client.console.awaiting_get.is_none());
        flush_all(&mut client);
        assert!(client.conn.is_idle());
        assert!(client.console.upload_pending);
        assert!(!client.settled());

        expect_request(&mut server, b"upload\n");
        let mut got = Vec::new();
        for want_id in 0..3u32 {
            let mut raw = [0u8; HEADER_LEN];
            server.read_exact(&mut raw).unwrap();
            let header = ChunkHeader::decode(&raw);
            assert_eq!(header.chunk_id, want_id);
            assert_eq!(header.total_chunks, 3);
            assert_eq!(header.validate(crate::protocol::CHUNK_MAX), Ok(()));
            let mut payload = vec![0u8; header.chunk_size as usize];
            server.read_exact(&mut payload).unwrap();
            got.extend(payload);
        }
        assert_eq!(got, data);

        server.write_all(b"SUCCESS: File uploaded\n").unwrap();
        read_until(&mut client, |c| !c.console.upload_pending);
        assert!(client.settled());
    }

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(UserCommand::parse("get report.pdf"), UserCommand::Get("report.pdf".into()));
        assert_eq!(UserCommand::parse("  send  a b.txt "), UserCommand::Send("a b.txt".into()));
        assert_eq!(UserCommand::parse("ls"), UserCommand::List);
        assert_eq!(UserCommand::parse("list"), UserCommand::List);
        assert_eq!(
            UserCommand::parse("rename old new"),
            UserCommand::Rename("old".into(), "new".into())
        );
        assert_eq!(UserCommand::parse("exit"), UserCommand::Exit);
        assert_eq!(UserCommand::parse(""), UserCommand::Empty);
        assert_eq!(UserCommand::parse("dance"), UserCommand::Unknown("dance".into()));
    }

    #[test]
    fn missing_arguments_send_nothing() {
        for line in ["get", "send ", "cd", "delete", "rename", "rename only"] {
            let cmd = UserCommand::parse(line);
            assert!(matches!(cmd, UserCommand::Usage(_)), "{line}");
            assert!(cmd.request().is_none());
        }
    }

    #[test]
    fn requests_match_server_verbs() {
        assert_eq!(UserCommand::parse("list").request().as_deref(), Some("ls"));
        assert_eq!(UserCommand::parse("get x").request().as_deref(), Some("get x"));
        assert_eq!(UserCommand::parse("cd /tmp").request().as_deref(), Some("cd /tmp"));
        assert_eq!(UserCommand::parse("rename a b").request().as_deref(), Some("rename a b"));
        assert!(UserCommand::parse("send f").request().is_none());
        assert!(UserCommand::parse("help").request().is_none());
    }
}
