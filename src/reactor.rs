//! Readiness wait over raw descriptors
//!
//! A thin layer over `poll(2)`: callers register interest per descriptor for
//! one iteration, wait, then inspect readiness by slot. Also carries the
//! non-blocking helpers both event loops need and a self-pipe waker so a
//! signal handler can interrupt an untimed wait.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { read: true, write: false };
    pub const READ_WRITE: Interest = Interest { read: true, write: true };

    pub fn with_write(write: bool) -> Interest {
        Interest { read: true, write }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.hangup || self.error)
    }

    fn from_revents(revents: libc::c_short) -> Self {
        Readiness {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            hangup: revents & libc::POLLHUP != 0,
            error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        }
    }
}

/// Slot handed out by [`Poller::watch`] for reading back readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(usize);

#[derive(Debug, Default)]
pub struct Poller {
    fds: Vec<libc::pollfd>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all registrations; call before rebuilding the watch set.
    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn watch(&mut self, fd: RawFd, interest: Interest) -> Token {
        let mut events = 0;
        if interest.read {
            events |= libc::POLLIN;
        }
        if interest.write {
            events |= libc::POLLOUT;
        }
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        Token(self.fds.len() - 1)
    }

    /// Block until at least one descriptor is ready or `timeout` elapses.
    /// `None` waits indefinitely. Returns the number of ready descriptors;
    /// 0 means the timeout expired.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };
        for fd in &mut self.fds {
            fd.revents = 0;
        }
        loop {
            let n = unsafe {
                libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms)
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub fn readiness(&self, token: Token) -> Readiness {
        self.fds
            .get(token.0)
            .map(|fd| Readiness::from_revents(fd.revents))
            .unwrap_or_default()
    }
}

/// Read end of a self-pipe that makes a descriptor readable on demand.
#[derive(Debug)]
pub struct Waker {
    rx: UnixStream,
    tx: Arc<UnixStream>,
}

/// Cloneable, `Send` write end of a [`Waker`].
#[derive(Debug, Clone)]
pub struct WakeHandle(Arc<UnixStream>);

impl WakeHandle {
    pub fn wake(&self) {
        // a full pipe already guarantees a wakeup
        let _ = (&*self.0).write(&[1]);
    }
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        Ok(Waker { rx, tx: Arc::new(tx) })
    }

    pub fn handle(&self) -> WakeHandle {
        WakeHandle(Arc::clone(&self.tx))
    }

    pub fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    /// Consume pending wakeups so the descriptor stops reporting readable.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

/// Shared stop request checked by an event loop after every wait.
#[derive(Debug, Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    wake: WakeHandle,
}

impl Shutdown {
    pub fn new(waker: &Waker) -> Self {
        Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
            wake: waker.handle(),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.wake.wake();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Route Ctrl-C to this handle.
    pub fn install_ctrlc(&self) -> Result<(), ctrlc::Error> {
        let me = self.clone();
        ctrlc::set_handler(move || me.trigger())
    }
}

/// Set or clear `O_NONBLOCK`, returning whether it was set before.
pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let was = flags & libc::O_NONBLOCK != 0;
    let wanted = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if wanted != flags && unsafe { libc::fcntl(fd, libc::F_SETFL, wanted) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(was)
}

/// Raise the kernel send and receive buffers of a socket.
pub fn set_socket_buffers(fd: RawFd, bytes: usize) -> io::Result<()> {
    let size = bytes.min(libc::c_int::MAX as usize) as libc::c_int;
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &size as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Stdin switched to non-blocking mode for the lifetime of the guard.
#[derive(Debug)]
pub struct NonBlockingStdin {
    was_nonblocking: bool,
}

impl NonBlockingStdin {
    pub fn new() -> io::Result<Self> {
        let was_nonblocking = set_nonblocking(libc::STDIN_FILENO, true)?;
        Ok(NonBlockingStdin { was_nonblocking })
    }

    pub fn fd(&self) -> RawFd {
        libc::STDIN_FILENO
    }

    /// Read straight from fd 0, bypassing std's buffered stdin so readiness
    /// and buffered data never disagree. `Ok(0)` is end of input.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::read(
                    libc::STDIN_FILENO,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for NonBlockingStdin {
    fn drop(&mut self) {
        if !self.was_nonblocking {
            if let Err(e) = set_nonblocking(libc::STDIN_FILENO, false) {
                log::warn!("could not restore blocking stdin: {e}");
            }
        }
    }
}
