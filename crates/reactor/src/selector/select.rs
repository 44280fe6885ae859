//! Portable selector built on `select(2)`.
//!
//! The interest sets are rebuilt from the registered keys on every call, so registering
//! and unregistering never touch the OS. Descriptors must stay below `FD_SETSIZE`.

use std::collections::BTreeMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use crate::error::SelectorError;
use crate::selector::{EventSet, Selector, SelectorKey, retry_interrupted};
use crate::utils::ensure;

const FD_LIMIT: usize = libc::FD_SETSIZE as usize;

#[derive(Debug)]
pub struct SelectSelector<D = ()> {
    keys: BTreeMap<RawFd, SelectorKey<D>>,
    closed: bool,
}

impl<D> SelectSelector<D> {
    pub fn new() -> Self {
        Self { keys: BTreeMap::new(), closed: false }
    }
}

impl<D> Default for SelectSelector<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Clone> Selector<D> for SelectSelector<D> {
    fn register(&mut self, fd: RawFd, events: EventSet, data: D) -> Result<SelectorKey<D>, SelectorError> {
        ensure!(!self.closed, SelectorError::Closed);
        ensure!(usize::try_from(fd).is_ok_and(|fd| fd < FD_LIMIT), SelectorError::fd_out_of_range(fd, FD_LIMIT));
        ensure!(!self.keys.contains_key(&fd), SelectorError::already_registered(fd));

        let key = SelectorKey::new(fd, events, data);
        self.keys.insert(fd, key.clone());
        Ok(key)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<SelectorKey<D>, SelectorError> {
        self.keys.remove(&fd).ok_or_else(|| SelectorError::not_registered(fd))
    }

    fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<(SelectorKey<D>, EventSet)>, SelectorError> {
        ensure!(!self.closed, SelectorError::Closed);

        let keys = &self.keys;
        let (read_set, write_set) = retry_interrupted(timeout, |timeout| {
            let mut read_set = empty_fd_set();
            let mut write_set = empty_fd_set();
            let mut max_fd = -1;

            for (&fd, key) in keys {
                if key.events().is_readable() {
                    // SAFETY: register() guarantees 0 <= fd < FD_SETSIZE
                    unsafe { libc::FD_SET(fd, &raw mut read_set) };
                }
                if key.events().is_writable() {
                    // SAFETY: same as above
                    unsafe { libc::FD_SET(fd, &raw mut write_set) };
                }
                max_fd = max_fd.max(fd);
            }

            let mut timeval;
            let timeval_ptr = match timeout {
                None => ptr::null_mut(),
                Some(timeout) => {
                    timeval = to_timeval(timeout);
                    &raw mut timeval
                }
            };

            // SAFETY: both sets are initialized and outlive the call, the timeval pointer is
            // either null or points at a live stack value
            let status = unsafe { libc::select(max_fd + 1, &raw mut read_set, &raw mut write_set, ptr::null_mut(), timeval_ptr) };
            if status < 0 { Err(io::Error::last_os_error()) } else { Ok((read_set, write_set)) }
        })?;

        let mut ready = Vec::new();
        for (&fd, key) in &self.keys {
            let mut events = EventSet::empty();
            // SAFETY: fd is within FD_SETSIZE and the sets were filled by select()
            if key.events().is_readable() && unsafe { libc::FD_ISSET(fd, &raw const read_set) } {
                events |= EventSet::READ;
            }
            // SAFETY: same as above
            if key.events().is_writable() && unsafe { libc::FD_ISSET(fd, &raw const write_set) } {
                events |= EventSet::WRITE;
            }
            if !events.is_empty() {
                ready.push((key.clone(), events));
            }
        }
        Ok(ready)
    }

    fn close(&mut self) {
        self.closed = true;
        self.keys.clear();
    }

    fn get(&self, fd: RawFd) -> Option<&SelectorKey<D>> {
        self.keys.get(&fd)
    }
}

fn empty_fd_set() -> libc::fd_set {
    let mut set = MaybeUninit::<libc::fd_set>::uninit();
    // SAFETY: FD_ZERO fully initializes the set
    unsafe {
        libc::FD_ZERO(set.as_mut_ptr());
        set.assume_init()
    }
}

fn to_timeval(timeout: Duration) -> libc::timeval {
    // round up so select never wakes before the requested time
    let micros = timeout.as_nanos().div_ceil(1_000);
    let secs = micros / 1_000_000;
    let usecs = micros % 1_000_000;
    libc::timeval {
        tv_sec: libc::time_t::try_from(secs).unwrap_or(libc::time_t::MAX),
        tv_usec: libc::suseconds_t::try_from(usecs).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::contract;

    #[test]
    fn register_round_trip() {
        contract::register_round_trip(SelectSelector::new());
    }

    #[test]
    fn reports_fired_subset() {
        contract::reports_fired_subset(SelectSelector::new());
    }

    #[test]
    fn times_out_when_idle() {
        contract::times_out_when_idle(SelectSelector::new());
    }

    #[test]
    fn close_is_idempotent() {
        contract::close_is_idempotent(SelectSelector::new());
    }

    #[test]
    fn rejects_fd_beyond_limit() {
        let mut selector = SelectSelector::<()>::new();
        let fd = RawFd::try_from(FD_LIMIT).unwrap();
        let error = selector.register(fd, EventSet::READ, ()).unwrap_err();
        assert!(matches!(error, SelectorError::FdOutOfRange { .. }));

        let error = selector.register(-1, EventSet::READ, ()).unwrap_err();
        assert!(matches!(error, SelectorError::FdOutOfRange { .. }));
    }

    #[test]
    fn timeval_rounds_up() {
        let timeval = to_timeval(Duration::from_nanos(1_500_000_001));
        assert_eq!(timeval.tv_sec, 1);
        assert_eq!(timeval.tv_usec, 500_001);
    }
}
