use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::waker::Waker;

pub(crate) type RemoteCallback = Box<dyn FnOnce() + Send + 'static>;

/// State of an [`EventLoop`](super::EventLoop) that other threads may touch.
pub(crate) struct Shared {
    running: AtomicBool,
    waker: Waker,
    remote: Mutex<Vec<RemoteCallback>>,
}

impl Shared {
    pub(crate) fn new(waker: Waker) -> Self {
        Self { running: AtomicBool::new(false), waker, remote: Mutex::new(Vec::new()) }
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn stop(&self) {
        self.set_running(false);
        self.waker.wake();
    }

    pub(crate) fn push_remote(&self, callback: RemoteCallback) {
        self.remote.lock().unwrap_or_else(PoisonError::into_inner).push(callback);
        self.waker.wake();
    }

    pub(crate) fn take_remote(&self) -> Vec<RemoteCallback> {
        std::mem::take(&mut *self.remote.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A `Send + Sync` handle to an [`EventLoop`](super::EventLoop) for use from other threads.
///
/// Every request goes through the loop's self-pipe, so a loop blocked in `select` picks it
/// up right away instead of waiting for an unrelated event or timeout.
///
/// # Example
///
/// ```no_run
/// use micro_reactor::EventLoop;
///
/// let event_loop = EventLoop::new().unwrap();
/// let handle = event_loop.handle();
/// std::thread::spawn(move || {
///     handle.call_soon(|| println!("hello from the loop thread"));
///     handle.stop();
/// });
/// event_loop.run_forever().unwrap();
/// ```
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Asks the loop to return from `run_forever` after the current iteration.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Runs `callback` on the loop thread on one of the next iterations.
    pub fn call_soon<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push_remote(Box::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle").field("running", &self.shared.is_running()).finish_non_exhaustive()
    }
}
