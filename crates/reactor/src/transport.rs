//! Buffered, flow-controlled byte stream over one non-blocking socket.
//!
//! A [`Transport`] takes exclusive ownership of its socket and registers a reader and a
//! writer callback with the [`EventLoop`]. Outgoing bytes are buffered and flushed as the
//! socket accepts them; incoming bytes are read in chunks of [`RECV_CHUNK_SIZE`] and handed
//! to the data-received callback.
//!
//! # Lifecycle
//!
//! ```text
//!   Open ──close()──▶ Closing ──buffer drained──▶ Closed (ByLocal)
//!    │                   │
//!    └── peer EOF / reset / I/O failure ─────────▶ Closed (ByPeer | Error)
//! ```
//!
//! The closed callback fires exactly once, after the socket has been released.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::error::TransportError;
use crate::event_loop::EventLoop;

/// Maximum number of bytes read from the socket per read event.
pub const RECV_CHUNK_SIZE: usize = 1024;

/// A stream socket a [`Transport`] can drive.
pub trait Socket: Read + Write + AsRawFd + 'static {
    /// Moves the socket into or out of non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the underlying `fcntl`/`ioctl` call.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

impl Socket for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Closing,
    Closed,
}

/// Why a transport reached [`TransportState::Closed`].
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed or reset the connection.
    ByPeer,
    /// [`Transport::close`] was called and every queued byte was flushed.
    ByLocal,
    /// An unexpected I/O failure; the socket was released anyway.
    Error(io::Error),
}

impl CloseReason {
    pub fn is_by_peer(&self) -> bool {
        matches!(self, Self::ByPeer)
    }

    pub fn is_by_local(&self) -> bool {
        matches!(self, Self::ByLocal)
    }
}

type DataReceived = Box<dyn FnMut(Bytes) + 'static>;
type Closed = Box<dyn FnOnce(CloseReason) + 'static>;

enum ReadOutcome {
    Data(Bytes),
    Eof,
    Nothing,
    Failed(io::Error),
}

enum FlushOutcome {
    Pending,
    Idle,
    Drained,
    Reset,
    Failed(io::Error),
}

struct Core {
    socket: Option<Box<dyn Socket>>,
    outgoing: BytesMut,
    state: TransportState,
}

struct Inner {
    fd: RawFd,
    event_loop: EventLoop,
    this: Weak<Inner>,
    core: RefCell<Core>,
    reading: Cell<bool>,
    writer_armed: Cell<bool>,
    data_received: RefCell<Option<DataReceived>>,
    closed: RefCell<Option<Closed>>,
}

/// A non-blocking byte stream bound to an [`EventLoop`].
///
/// Clones refer to the same transport. The loop only keeps weak references, so dropping
/// the last clone unregisters the descriptor and closes the socket without invoking the
/// closed callback.
#[derive(Clone)]
pub struct Transport {
    inner: Rc<Inner>,
}

impl Transport {
    /// Takes ownership of `socket`, switches it to non-blocking mode and registers it with
    /// `event_loop`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if non-blocking mode can't be set, or
    /// [`TransportError::Register`] if the loop rejects the descriptor.
    pub fn new<S: Socket>(socket: S, event_loop: &EventLoop) -> Result<Self, TransportError> {
        socket.set_nonblocking(true)?;
        let fd = socket.as_raw_fd();
        let inner = Rc::new_cyclic(|this| Inner {
            fd,
            event_loop: event_loop.clone(),
            this: Weak::clone(this),
            core: RefCell::new(Core { socket: Some(Box::new(socket)), outgoing: BytesMut::new(), state: TransportState::Open }),
            reading: Cell::new(true),
            writer_armed: Cell::new(false),
            data_received: RefCell::new(None),
            closed: RefCell::new(None),
        });

        inner.arm_reader()?;
        inner.arm_writer()?;
        trace!(fd, "transport registered");
        Ok(Self { inner })
    }

    /// Sets the callback receiving every chunk read from the socket.
    pub fn set_data_received<F>(&self, callback: F)
    where
        F: FnMut(Bytes) + 'static,
    {
        *self.inner.data_received.borrow_mut() = Some(Box::new(callback));
    }

    /// Sets the callback told once the transport is closed.
    pub fn set_closed<F>(&self, callback: F)
    where
        F: FnOnce(CloseReason) + 'static,
    {
        *self.inner.closed.borrow_mut() = Some(Box::new(callback));
    }

    /// Queues `data` and flushes as much as the socket accepts right now.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closing`] or [`TransportError::Closed`] once
    /// [`close`](Self::close) was called or the peer went away; nothing is queued then.
    pub fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        {
            let mut core = self.inner.core.borrow_mut();
            match core.state {
                TransportState::Open => {}
                TransportState::Closing => return Err(TransportError::Closing),
                TransportState::Closed => return Err(TransportError::Closed),
            }
            core.outgoing.extend_from_slice(data);
        }
        self.inner.handle_write();
        Ok(())
    }

    /// Closes the transport once every queued byte is flushed. Does nothing unless open.
    pub fn close(&self) {
        {
            let mut core = self.inner.core.borrow_mut();
            if core.state != TransportState::Open {
                return;
            }
            core.state = TransportState::Closing;
        }
        debug!(fd = self.inner.fd, "transport closing");
        self.inner.handle_write();
    }

    /// Pauses or resumes delivery of incoming data.
    ///
    /// Resuming schedules a read attempt right away, since the socket may already hold data
    /// that won't trigger a new readiness change.
    pub fn resume_reading(&self, enabled: bool) {
        let inner = &self.inner;
        if inner.reading.replace(enabled) == enabled || self.state() == TransportState::Closed {
            return;
        }

        if enabled {
            if let Err(e) = inner.arm_reader() {
                warn!(fd = inner.fd, cause = %e, "failed to resume reading");
                return;
            }
            let this = Weak::clone(&inner.this);
            inner.event_loop.call_soon(move || {
                if let Some(inner) = this.upgrade() {
                    inner.handle_read();
                }
            });
        } else if let Err(e) = inner.event_loop.remove_reader(inner.fd) {
            warn!(fd = inner.fd, cause = %e, "failed to pause reading");
        }
    }

    pub fn state(&self) -> TransportState {
        self.inner.core.borrow().state
    }

    pub fn is_reading(&self) -> bool {
        self.inner.reading.get()
    }

    /// Number of queued bytes not yet accepted by the socket.
    pub fn pending_output(&self) -> usize {
        self.inner.core.borrow().outgoing.len()
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("fd", &self.inner.fd)
            .field("state", &self.state())
            .field("reading", &self.is_reading())
            .field("pending_output", &self.pending_output())
            .finish()
    }
}

impl Inner {
    fn arm_reader(&self) -> Result<(), TransportError> {
        let this = Weak::clone(&self.this);
        self.event_loop.set_reader(self.fd, move || {
            if let Some(inner) = this.upgrade() {
                inner.handle_read();
            }
        })?;
        Ok(())
    }

    fn arm_writer(&self) -> Result<(), TransportError> {
        if self.writer_armed.get() {
            return Ok(());
        }
        let this = Weak::clone(&self.this);
        self.event_loop.set_writer(self.fd, move || {
            if let Some(inner) = this.upgrade() {
                inner.handle_write();
            }
        })?;
        self.writer_armed.set(true);
        Ok(())
    }

    fn disarm_writer(&self) {
        if !self.writer_armed.replace(false) {
            return;
        }
        if let Err(e) = self.event_loop.remove_writer(self.fd) {
            warn!(fd = self.fd, cause = %e, "failed to remove writer");
        }
    }

    fn handle_read(&self) {
        if !self.reading.get() {
            return;
        }

        let outcome = {
            let mut core = self.core.borrow_mut();
            if core.state == TransportState::Closed {
                return;
            }
            let Some(socket) = core.socket.as_mut() else {
                return;
            };
            let mut buf = BytesMut::zeroed(RECV_CHUNK_SIZE);
            match socket.read(&mut buf) {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => {
                    buf.truncate(n);
                    ReadOutcome::Data(buf.freeze())
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => ReadOutcome::Nothing,
                Err(e) if is_peer_reset(&e) => ReadOutcome::Eof,
                Err(e) => ReadOutcome::Failed(e),
            }
        };

        match outcome {
            ReadOutcome::Nothing => {}
            ReadOutcome::Eof => self.finish(CloseReason::ByPeer),
            ReadOutcome::Failed(e) => {
                error!(fd = self.fd, cause = %e, "failed to read from socket");
                self.finish(CloseReason::Error(e));
            }
            ReadOutcome::Data(data) => {
                // incoming data is dropped once closing
                if self.core.borrow().state == TransportState::Open {
                    self.deliver(data);
                }
            }
        }
    }

    fn deliver(&self, data: Bytes) {
        let callback = self.data_received.borrow_mut().take();
        let Some(mut callback) = callback else {
            trace!(fd = self.fd, size = data.len(), "no data callback, bytes dropped");
            return;
        };

        callback(data);

        // the callback may have closed us or installed a replacement meanwhile
        if self.core.borrow().state != TransportState::Closed {
            let mut slot = self.data_received.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }

    fn handle_write(&self) {
        let outcome = {
            let mut guard = self.core.borrow_mut();
            let core = &mut *guard;
            if core.state == TransportState::Closed {
                return;
            }
            flush(core)
        };

        match outcome {
            FlushOutcome::Pending => {
                if let Err(e) = self.arm_writer() {
                    error!(fd = self.fd, cause = %e, "failed to watch socket for writing");
                    self.finish(CloseReason::Error(io::Error::other(e)));
                }
            }
            FlushOutcome::Idle => self.disarm_writer(),
            FlushOutcome::Drained => self.finish(CloseReason::ByLocal),
            FlushOutcome::Reset => self.finish(CloseReason::ByPeer),
            FlushOutcome::Failed(e) => {
                error!(fd = self.fd, cause = %e, "failed to write to socket");
                self.finish(CloseReason::Error(e));
            }
        }
    }

    fn finish(&self, reason: CloseReason) {
        let socket = {
            let mut core = self.core.borrow_mut();
            if core.state == TransportState::Closed {
                return;
            }
            core.state = TransportState::Closed;
            core.outgoing.clear();
            core.socket.take()
        };

        self.unregister();
        self.writer_armed.set(false);
        drop(socket);
        debug!(fd = self.fd, ?reason, "transport closed");

        let data_received = self.data_received.borrow_mut().take();
        drop(data_received);
        let closed = self.closed.borrow_mut().take();
        if let Some(closed) = closed {
            closed(reason);
        }
    }

    fn unregister(&self) {
        if let Err(e) = self.event_loop.remove_reader(self.fd) {
            warn!(fd = self.fd, cause = %e, "failed to remove reader");
        }
        if let Err(e) = self.event_loop.remove_writer(self.fd) {
            warn!(fd = self.fd, cause = %e, "failed to remove writer");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.core.get_mut().state != TransportState::Closed {
            self.unregister();
        }
    }
}

fn flush(core: &mut Core) -> FlushOutcome {
    if core.outgoing.is_empty() {
        return if core.state == TransportState::Closing { FlushOutcome::Drained } else { FlushOutcome::Idle };
    }
    let Some(socket) = core.socket.as_mut() else {
        return FlushOutcome::Idle;
    };

    match socket.write(&core.outgoing) {
        Ok(0) => FlushOutcome::Failed(io::ErrorKind::WriteZero.into()),
        Ok(n) => {
            core.outgoing.advance(n);
            match (core.outgoing.is_empty(), core.state) {
                (false, _) => FlushOutcome::Pending,
                (true, TransportState::Closing) => FlushOutcome::Drained,
                (true, _) => FlushOutcome::Idle,
            }
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => FlushOutcome::Pending,
        Err(e) if is_peer_reset(&e) => FlushOutcome::Reset,
        Err(e) => FlushOutcome::Failed(e),
    }
}

fn is_peer_reset(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted)
}
