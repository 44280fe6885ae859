//! Selector built on Linux `epoll(7)`, used level-triggered.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::trace;

use crate::error::SelectorError;
use crate::selector::{EventSet, Selector, SelectorKey, retry_interrupted, timeout_millis};
use crate::utils::ensure;

/// Default maximum number of events fetched by one `epoll_wait` call.
const DEFAULT_MAX_EVENTS: usize = 1024;

pub struct EpollSelector<D = ()> {
    epoll: Option<OwnedFd>,
    keys: HashMap<RawFd, SelectorKey<D>>,
    events: Vec<libc::epoll_event>,
}

impl<D: fmt::Debug> fmt::Debug for EpollSelector<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpollSelector")
            .field("epoll", &self.epoll)
            .field("keys", &self.keys)
            .field("max_events", &self.events.len())
            .finish()
    }
}

impl<D> EpollSelector<D> {
    /// Creates a selector fetching at most 1024 events per `select` call.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `epoll_create1` fails.
    pub fn new() -> Result<Self, SelectorError> {
        Self::with_max_events(DEFAULT_MAX_EVENTS)
    }

    /// Creates a selector fetching at most `max_events` events per `select` call.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `epoll_create1` fails.
    pub fn with_max_events(max_events: usize) -> Result<Self, SelectorError> {
        // SAFETY: plain syscall without pointer arguments
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        ensure!(fd >= 0, SelectorError::last_os_error());
        // SAFETY: fd was just returned by epoll_create1 and is owned by nobody else
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };

        let empty = libc::epoll_event { events: 0, u64: 0 };
        Ok(Self { epoll: Some(epoll), keys: HashMap::new(), events: vec![empty; max_events.max(1)] })
    }

    fn epoll_fd(&self) -> Result<RawFd, SelectorError> {
        self.epoll.as_ref().map(AsRawFd::as_raw_fd).ok_or(SelectorError::Closed)
    }
}

impl<D: Clone> Selector<D> for EpollSelector<D> {
    fn register(&mut self, fd: RawFd, events: EventSet, data: D) -> Result<SelectorKey<D>, SelectorError> {
        let epoll_fd = self.epoll_fd()?;
        ensure!(!self.keys.contains_key(&fd), SelectorError::already_registered(fd));

        let mut event = libc::epoll_event { events: to_epoll_events(events), u64: fd_token(fd) };
        // SAFETY: event points at a live epoll_event for the duration of the call
        let status = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &raw mut event) };
        ensure!(status >= 0, SelectorError::last_os_error());

        let key = SelectorKey::new(fd, events, data);
        self.keys.insert(fd, key.clone());
        Ok(key)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<SelectorKey<D>, SelectorError> {
        let epoll_fd = self.epoll_fd()?;
        let key = self.keys.remove(&fd).ok_or_else(|| SelectorError::not_registered(fd))?;

        // SAFETY: EPOLL_CTL_DEL ignores the event argument, null is accepted since Linux 2.6.9
        let status = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if status < 0 {
            let error = io::Error::last_os_error();
            // the kernel drops closed descriptors from the interest list on its own
            match error.raw_os_error() {
                Some(libc::EBADF | libc::ENOENT) => trace!(fd, cause = %error, "descriptor already left epoll"),
                _ => return Err(error.into()),
            }
        }
        Ok(key)
    }

    fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<(SelectorKey<D>, EventSet)>, SelectorError> {
        let epoll_fd = self.epoll_fd()?;
        let buffer = &mut self.events;
        let max_events = libc::c_int::try_from(buffer.len()).unwrap_or(libc::c_int::MAX);

        let count = retry_interrupted(timeout, |timeout| {
            // SAFETY: the buffer holds max_events initialized entries
            let count = unsafe { libc::epoll_wait(epoll_fd, buffer.as_mut_ptr(), max_events, timeout_millis(timeout)) };
            if count < 0 { Err(io::Error::last_os_error()) } else { Ok(usize::try_from(count).unwrap_or_default()) }
        })?;

        let mut ready = Vec::with_capacity(count);
        for event in &self.events[..count] {
            let (bits, token) = (event.events, event.u64);
            let Ok(fd) = RawFd::try_from(token) else {
                continue;
            };
            let Some(key) = self.keys.get(&fd) else {
                continue;
            };
            let fired = from_epoll_events(bits) & key.events();
            if !fired.is_empty() {
                ready.push((key.clone(), fired));
            }
        }
        Ok(ready)
    }

    fn close(&mut self) {
        self.keys.clear();
        self.epoll.take();
    }

    fn get(&self, fd: RawFd) -> Option<&SelectorKey<D>> {
        self.keys.get(&fd)
    }
}

fn fd_token(fd: RawFd) -> u64 {
    u64::try_from(fd).unwrap_or_default()
}

fn to_epoll_events(events: EventSet) -> u32 {
    let mut bits = 0;
    if events.is_readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if events.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn from_epoll_events(bits: u32) -> EventSet {
    let mut events = EventSet::empty();
    // errors and hang-ups wake both directions, the read/write attempt will surface them
    let failure = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
    if bits & (libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32 | failure) != 0 {
        events |= EventSet::READ;
    }
    if bits & (libc::EPOLLOUT as u32 | failure) != 0 {
        events |= EventSet::WRITE;
    }
    events
}
