use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("event loop is already running")]
    AlreadyRunning,

    #[error("selector error: {source}")]
    Selector {
        #[from]
        source: SelectorError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SelectorError {
    #[error("file descriptor {fd} is already registered")]
    AlreadyRegistered { fd: RawFd },

    #[error("file descriptor {fd} is not registered")]
    NotRegistered { fd: RawFd },

    #[error("file descriptor {fd} exceed the select limit {limit}")]
    FdOutOfRange { fd: RawFd, limit: usize },

    #[error("selector is closed")]
    Closed,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SelectorError {
    pub fn already_registered(fd: RawFd) -> Self {
        Self::AlreadyRegistered { fd }
    }

    pub fn not_registered(fd: RawFd) -> Self {
        Self::NotRegistered { fd }
    }

    pub fn fd_out_of_range(fd: RawFd, limit: usize) -> Self {
        Self::FdOutOfRange { fd, limit }
    }

    /// Builds an error from the current `errno`.
    pub fn last_os_error() -> Self {
        Self::Io { source: io::Error::last_os_error() }
    }

    /// Returns true for the two key conflict variants.
    pub fn is_key_conflict(&self) -> bool {
        matches!(self, Self::AlreadyRegistered { .. } | Self::NotRegistered { .. })
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is closing, no more data can be written")]
    Closing,

    #[error("transport is closed")]
    Closed,

    #[error("can't register transport to event loop: {source}")]
    Register {
        #[from]
        source: SelectorError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}
