//! The self-pipe used to interrupt a blocked `select`.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::{trace, warn};

/// Write end of the self-pipe. Safe to share between threads.
#[derive(Debug)]
pub(crate) struct Waker {
    sender: UnixStream,
}

/// Read end of the self-pipe, permanently registered with the selector.
#[derive(Debug)]
pub(crate) struct WakeReceiver {
    receiver: UnixStream,
}

pub(crate) fn wake_pair() -> io::Result<(Waker, WakeReceiver)> {
    let (sender, receiver) = UnixStream::pair()?;
    sender.set_nonblocking(true)?;
    receiver.set_nonblocking(true)?;
    Ok((Waker { sender }, WakeReceiver { receiver }))
}

impl Waker {
    /// Makes the read end readable, so the next (or current) `select` returns.
    pub(crate) fn wake(&self) {
        match (&self.sender).write(&[1]) {
            Ok(_) => {}
            // the buffer is full of wake bytes already, the loop is going to wake anyway
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(e) => warn!(cause = %e, "failed to wake event loop"),
        }
    }
}

impl WakeReceiver {
    /// Consumes every pending wake byte.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(0) => return,
                Ok(n) => trace!(bytes = n, "event loop woken up"),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(cause = %e, "failed to drain wake channel");
                    return;
                }
            }
        }
    }
}

impl AsRawFd for WakeReceiver {
    fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}
