//! Selector built on BSD `kqueue(2)`.
//!
//! Each [`IoEvent`](crate::selector::IoEvent) direction maps to its own kqueue filter
//! (`EVFILT_READ`, `EVFILT_WRITE`); filters are added without `EV_CLEAR` so the queue
//! stays level-triggered. Events of the same descriptor are merged into one entry.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use tracing::trace;

use crate::error::SelectorError;
use crate::selector::{EventSet, Selector, SelectorKey, retry_interrupted};
use crate::utils::ensure;

/// Default maximum number of events fetched by one `kevent` call.
const DEFAULT_MAX_EVENTS: usize = 1024;

pub struct KqueueSelector<D = ()> {
    kqueue: Option<OwnedFd>,
    keys: HashMap<RawFd, SelectorKey<D>>,
    max_events: usize,
}

impl<D: fmt::Debug> fmt::Debug for KqueueSelector<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KqueueSelector")
            .field("kqueue", &self.kqueue)
            .field("keys", &self.keys)
            .field("max_events", &self.max_events)
            .finish()
    }
}

impl<D> KqueueSelector<D> {
    /// Creates a selector fetching at most 1024 events per `select` call.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `kqueue` fails.
    pub fn new() -> Result<Self, SelectorError> {
        Self::with_max_events(DEFAULT_MAX_EVENTS)
    }

    /// Creates a selector fetching at most `max_events` events per `select` call.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `kqueue` fails.
    pub fn with_max_events(max_events: usize) -> Result<Self, SelectorError> {
        // SAFETY: plain syscall without arguments
        let fd = unsafe { libc::kqueue() };
        ensure!(fd >= 0, SelectorError::last_os_error());
        // SAFETY: fd was just returned by kqueue and is owned by nobody else
        let kqueue = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { kqueue: Some(kqueue), keys: HashMap::new(), max_events: max_events.max(1) })
    }

    fn kqueue_fd(&self) -> Result<RawFd, SelectorError> {
        self.kqueue.as_ref().map(AsRawFd::as_raw_fd).ok_or(SelectorError::Closed)
    }
}

impl<D: Clone> Selector<D> for KqueueSelector<D> {
    fn register(&mut self, fd: RawFd, events: EventSet, data: D) -> Result<SelectorKey<D>, SelectorError> {
        let kqueue_fd = self.kqueue_fd()?;
        ensure!(!self.keys.contains_key(&fd), SelectorError::already_registered(fd));

        let changes = changes_for(fd, events, libc::EV_ADD);
        apply_changes(kqueue_fd, &changes)?;

        let key = SelectorKey::new(fd, events, data);
        self.keys.insert(fd, key.clone());
        Ok(key)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<SelectorKey<D>, SelectorError> {
        let kqueue_fd = self.kqueue_fd()?;
        let key = self.keys.remove(&fd).ok_or_else(|| SelectorError::not_registered(fd))?;

        let changes = changes_for(fd, key.events(), libc::EV_DELETE);
        if let Err(error) = apply_changes(kqueue_fd, &changes) {
            // closing a descriptor removes its filters from every kqueue
            match error.raw_os_error() {
                Some(libc::EBADF | libc::ENOENT) => trace!(fd, cause = %error, "descriptor already left kqueue"),
                _ => return Err(error.into()),
            }
        }
        Ok(key)
    }

    fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<(SelectorKey<D>, EventSet)>, SelectorError> {
        let kqueue_fd = self.kqueue_fd()?;
        // SAFETY: kevent is a plain C struct, all zero is a valid value
        let mut events: Vec<libc::kevent> = vec![unsafe { mem::zeroed() }; self.max_events];
        let max_events = libc::c_int::try_from(events.len()).unwrap_or(libc::c_int::MAX);

        let count = retry_interrupted(timeout, |timeout| {
            let timespec = timeout.map(to_timespec);
            let timespec_ptr = timespec.as_ref().map_or(ptr::null(), ptr::from_ref);
            // SAFETY: the output buffer holds max_events entries, the timespec pointer is
            // either null or points at a live value
            let count = unsafe { libc::kevent(kqueue_fd, ptr::null(), 0, events.as_mut_ptr(), max_events, timespec_ptr) };
            if count < 0 { Err(io::Error::last_os_error()) } else { Ok(usize::try_from(count).unwrap_or_default()) }
        })?;

        // keep the order in which descriptors first showed up
        let mut order: Vec<RawFd> = Vec::with_capacity(count);
        let mut fired: HashMap<RawFd, EventSet> = HashMap::with_capacity(count);
        for event in &events[..count] {
            let Ok(fd) = RawFd::try_from(event.ident) else {
                continue;
            };
            let direction = if event.filter == libc::EVFILT_READ {
                EventSet::READ
            } else if event.filter == libc::EVFILT_WRITE {
                EventSet::WRITE
            } else {
                continue;
            };
            fired
                .entry(fd)
                .and_modify(|set| *set |= direction)
                .or_insert_with(|| {
                    order.push(fd);
                    direction
                });
        }

        let mut ready = Vec::with_capacity(order.len());
        for fd in order {
            let Some(key) = self.keys.get(&fd) else {
                continue;
            };
            let events = fired[&fd] & key.events();
            if !events.is_empty() {
                ready.push((key.clone(), events));
            }
        }
        Ok(ready)
    }

    fn close(&mut self) {
        self.keys.clear();
        self.kqueue.take();
    }

    fn get(&self, fd: RawFd) -> Option<&SelectorKey<D>> {
        self.keys.get(&fd)
    }
}

fn changes_for(fd: RawFd, events: EventSet, flags: u16) -> Vec<libc::kevent> {
    let mut changes = Vec::with_capacity(2);
    let ident = libc::uintptr_t::try_from(fd).unwrap_or_default();
    for (direction, filter) in [(EventSet::READ, libc::EVFILT_READ), (EventSet::WRITE, libc::EVFILT_WRITE)] {
        if events.contains(direction) {
            // SAFETY: kevent is a plain C struct, all zero is a valid value
            let mut change: libc::kevent = unsafe { mem::zeroed() };
            change.ident = ident;
            change.filter = filter;
            change.flags = flags;
            changes.push(change);
        }
    }
    changes
}

fn apply_changes(kqueue_fd: RawFd, changes: &[libc::kevent]) -> io::Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let count = libc::c_int::try_from(changes.len()).unwrap_or(libc::c_int::MAX);
    // SAFETY: the change list is a live slice of count entries, no output buffer is passed
    let status = unsafe { libc::kevent(kqueue_fd, changes.as_ptr(), count, ptr::null_mut(), 0, ptr::null()) };
    if status < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

fn to_timespec(timeout: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::from(timeout.subsec_nanos().min(999_999_999).cast_signed()),
    }
}
