//! Readiness polling over registered file descriptors.
//!
//! A [`Selector`] knows nothing about sockets, HTTP or callbacks: it keeps at most one
//! [`SelectorKey`] per file descriptor and reports which of the registered
//! [`EventSet`] directions became ready. The interface follows the shape of Python's
//! `selectors` module.
//!
//! # Variants
//!
//! - [`SelectSelector`]: portable `select(2)` implementation, limited to `FD_SETSIZE`
//! - [`EpollSelector`]: Linux and Android `epoll(7)`
//! - [`KqueueSelector`]: macOS, iOS and FreeBSD `kqueue(2)`
//!
//! All variants are level-triggered: a descriptor stays ready across repeated
//! [`Selector::select`] calls until the underlying condition changes. Use
//! [`default_selector`] to get the best variant of the current platform.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::SelectorError;

mod select;
pub use select::SelectSelector;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::EpollSelector;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub use kqueue::KqueueSelector;

/// One direction of readiness interest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IoEvent {
    Read,
    Write,
}

bitflags! {
    /// A set of [`IoEvent`]s.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct EventSet: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl EventSet {
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(EventSet::READ)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(EventSet::WRITE)
    }
}

impl From<IoEvent> for EventSet {
    fn from(event: IoEvent) -> Self {
        match event {
            IoEvent::Read => EventSet::READ,
            IoEvent::Write => EventSet::WRITE,
        }
    }
}

/// The registration of one file descriptor.
///
/// Returned by [`Selector::register`], [`Selector::unregister`] and as part of the
/// [`Selector::select`] result, so callers can recover the former interest set and data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorKey<D = ()> {
    fd: RawFd,
    events: EventSet,
    data: D,
}

impl<D> SelectorKey<D> {
    pub fn new(fd: RawFd, events: EventSet, data: D) -> Self {
        Self { fd, events, data }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn events(&self) -> EventSet {
        self.events
    }

    #[inline]
    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn into_data(self) -> D {
        self.data
    }
}

/// Polls a set of registered file descriptors for read/write readiness.
pub trait Selector<D: Clone = ()> {
    /// Registers `fd` for `events`.
    ///
    /// # Errors
    ///
    /// Returns [`SelectorError::AlreadyRegistered`] if `fd` already has a key, or an
    /// I/O error if the OS subscription fails.
    fn register(&mut self, fd: RawFd, events: EventSet, data: D) -> Result<SelectorKey<D>, SelectorError>;

    /// Removes the registration of `fd` and returns its former key.
    ///
    /// # Errors
    ///
    /// Returns [`SelectorError::NotRegistered`] if `fd` has no key.
    fn unregister(&mut self, fd: RawFd) -> Result<SelectorKey<D>, SelectorError>;

    /// Waits for registered descriptors to become ready.
    ///
    /// - `None` blocks until at least one descriptor is ready
    /// - `Some(Duration::ZERO)` polls without blocking
    /// - `Some(timeout)` blocks up to `timeout`
    ///
    /// Returns one entry per ready descriptor with the subset of its registered interest
    /// that fired. Signal interruptions are retried internally, so an empty result
    /// always means the timeout elapsed.
    fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<(SelectorKey<D>, EventSet)>, SelectorError>;

    /// Releases the underlying OS polling handle. Calling it again does nothing.
    fn close(&mut self);

    /// Returns the current key of `fd`.
    fn get(&self, fd: RawFd) -> Option<&SelectorKey<D>>;
}

/// Creates the most efficient selector available on this platform.
///
/// # Errors
///
/// Returns an error if the OS polling handle can't be created.
pub fn default_selector<D: Clone + 'static>() -> Result<Box<dyn Selector<D>>, SelectorError> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        Ok(Box::new(EpollSelector::new()?))
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    {
        Ok(Box::new(KqueueSelector::new()?))
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    )))]
    {
        Ok(Box::new(SelectSelector::new()))
    }
}

/// Runs `poll` again whenever it is interrupted by a signal, shrinking the timeout to what
/// is left of the original one.
pub(crate) fn retry_interrupted<T>(
    timeout: Option<Duration>,
    mut poll: impl FnMut(Option<Duration>) -> io::Result<T>,
) -> io::Result<T> {
    let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
    let mut current = timeout;
    loop {
        match poll(current) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if let Some(deadline) = deadline {
                    current = Some(deadline.saturating_duration_since(Instant::now()));
                }
            }
            result => return result,
        }
    }
}

/// Converts a timeout to whole milliseconds, rounding up so a poll never returns before the
/// deadline. `None` maps to `-1` (block forever).
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            let millis = timeout.as_nanos().div_ceil(1_000_000);
            libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_set_from_io_event() {
        assert_eq!(EventSet::from(IoEvent::Read), EventSet::READ);
        assert_eq!(EventSet::from(IoEvent::Write), EventSet::WRITE);

        let all = EventSet::READ | EventSet::WRITE;
        assert!(all.is_readable());
        assert!(all.is_writable());
        assert!(!EventSet::READ.is_writable());
        assert!(EventSet::empty().is_empty());
    }

    #[test]
    fn retry_until_not_interrupted() {
        let mut calls = 0;
        let result = retry_interrupted(Some(Duration::from_secs(5)), |timeout| {
            calls += 1;
            assert!(timeout.unwrap() <= Duration::from_secs(5));
            if calls < 3 { Err(io::Error::from(io::ErrorKind::Interrupted)) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn retry_keeps_infinite_timeout() {
        let mut calls = 0;
        let result = retry_interrupted(None, |timeout| {
            calls += 1;
            assert!(timeout.is_none());
            if calls < 2 { Err(io::Error::from(io::ErrorKind::Interrupted)) } else { Ok(()) }
        });
        result.unwrap();
    }

    #[test]
    fn retry_propagates_other_errors() {
        let result: io::Result<()> = retry_interrupted(None, |_| Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::PermissionDenied);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn millis_round_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(1500))), 1500);
        assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), libc::c_int::MAX);
    }
}
