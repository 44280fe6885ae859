//! The single-threaded reactor.
//!
//! An [`EventLoop`] owns one [`Selector`] and multiplexes three kinds of work on the thread
//! calling [`EventLoop::run_forever`]:
//!
//! - **I/O callbacks**: at most one reader and one writer per file descriptor, invoked while
//!   the descriptor stays ready (the selector is level-triggered)
//! - **immediate callbacks**: queued with [`EventLoop::call_soon`], run FIFO
//! - **scheduled callbacks**: queued with [`EventLoop::call_later`] / [`EventLoop::call_at`],
//!   run once due, ties broken by scheduling order
//!
//! One iteration polls the selector, dispatches the I/O callbacks (reader before writer per
//! descriptor), moves due scheduled callbacks to the immediate queue and finally runs a
//! snapshot of that queue. Callbacks queued during the snapshot run on the next iteration.
//!
//! The loop is deliberately `!Send`. Other threads talk to it through a [`LoopHandle`], which
//! wakes a blocked `select` with a self-pipe.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::error::{ReactorError, SelectorError};
use crate::selector::{EventSet, IoEvent, Selector, default_selector};
use crate::utils::ensure;

mod handle;
mod scheduled;
mod waker;

pub use handle::LoopHandle;

use handle::Shared;
use scheduled::ScheduledCallback;

pub(crate) type Callback = Box<dyn FnOnce() + 'static>;
type IoCallback = Rc<dyn Fn() + 'static>;

#[derive(Default)]
struct IoHandlers {
    reader: Option<IoCallback>,
    writer: Option<IoCallback>,
}

impl IoHandlers {
    fn interest(&self) -> EventSet {
        let mut events = EventSet::empty();
        if self.reader.is_some() {
            events |= EventSet::READ;
        }
        if self.writer.is_some() {
            events |= EventSet::WRITE;
        }
        events
    }

    fn slot_mut(&mut self, event: IoEvent) -> &mut Option<IoCallback> {
        match event {
            IoEvent::Read => &mut self.reader,
            IoEvent::Write => &mut self.writer,
        }
    }

    fn get(&self, event: IoEvent) -> Option<IoCallback> {
        match event {
            IoEvent::Read => self.reader.clone(),
            IoEvent::Write => self.writer.clone(),
        }
    }
}

struct Inner {
    selector: RefCell<Box<dyn Selector>>,
    handlers: RefCell<HashMap<RawFd, IoHandlers>>,
    ready: RefCell<VecDeque<Callback>>,
    scheduled: RefCell<BinaryHeap<ScheduledCallback>>,
    next_seq: Cell<u64>,
    iteration: Cell<u64>,
    active: Cell<bool>,
    shared: Arc<Shared>,
}

/// A cheap, clonable handle to a single-threaded event loop.
///
/// Clones share the same loop, so components such as transports keep one to register their
/// callbacks.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl EventLoop {
    /// Creates a loop on top of the platform's [`default_selector`].
    ///
    /// # Errors
    ///
    /// Returns an error if the selector or the self-pipe can't be created.
    pub fn new() -> Result<Self, ReactorError> {
        Self::with_selector(default_selector()?)
    }

    /// Creates a loop on top of the given selector.
    ///
    /// # Errors
    ///
    /// Returns an error if the self-pipe can't be created or registered.
    pub fn with_selector(selector: Box<dyn Selector>) -> Result<Self, ReactorError> {
        let (waker, receiver) = waker::wake_pair()?;
        let inner = Inner {
            selector: RefCell::new(selector),
            handlers: RefCell::new(HashMap::new()),
            ready: RefCell::new(VecDeque::new()),
            scheduled: RefCell::new(BinaryHeap::new()),
            next_seq: Cell::new(0),
            iteration: Cell::new(0),
            active: Cell::new(false),
            shared: Arc::new(Shared::new(waker)),
        };
        let event_loop = Self { inner: Rc::new(inner) };

        let wake_fd = receiver.as_raw_fd();
        event_loop.set_reader(wake_fd, move || receiver.drain())?;
        Ok(event_loop)
    }

    /// Attaches `callback` to read readiness of `fd`, replacing any previous reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the selector rejects the descriptor.
    pub fn set_reader<F>(&self, fd: RawFd, callback: F) -> Result<(), SelectorError>
    where
        F: Fn() + 'static,
    {
        self.set_handler(fd, IoEvent::Read, Some(Rc::new(callback))).map(|_| ())
    }

    /// Attaches `callback` to write readiness of `fd`, replacing any previous writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the selector rejects the descriptor.
    pub fn set_writer<F>(&self, fd: RawFd, callback: F) -> Result<(), SelectorError>
    where
        F: Fn() + 'static,
    {
        self.set_handler(fd, IoEvent::Write, Some(Rc::new(callback))).map(|_| ())
    }

    /// Detaches the reader of `fd`. Returns whether there was one.
    ///
    /// The descriptor is unregistered from the selector once it has neither reader nor writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the selector fails to update the descriptor.
    pub fn remove_reader(&self, fd: RawFd) -> Result<bool, SelectorError> {
        self.set_handler(fd, IoEvent::Read, None)
    }

    /// Detaches the writer of `fd`. Returns whether there was one.
    ///
    /// # Errors
    ///
    /// Returns an error if the selector fails to update the descriptor.
    pub fn remove_writer(&self, fd: RawFd) -> Result<bool, SelectorError> {
        self.set_handler(fd, IoEvent::Write, None)
    }

    fn set_handler(&self, fd: RawFd, event: IoEvent, callback: Option<IoCallback>) -> Result<bool, SelectorError> {
        let mut handlers = self.inner.handlers.borrow_mut();

        let current = handlers.get(&fd).map_or_else(EventSet::empty, IoHandlers::interest);
        let mut interest = current;
        interest.set(EventSet::from(event), callback.is_some());
        if interest != current {
            self.update_interest(fd, current, interest)?;
        }

        let entry = handlers.entry(fd).or_default();
        let previous = std::mem::replace(entry.slot_mut(event), callback);
        if interest.is_empty() {
            handlers.remove(&fd);
        }
        drop(handlers);

        Ok(previous.is_some())
    }

    fn update_interest(&self, fd: RawFd, current: EventSet, interest: EventSet) -> Result<(), SelectorError> {
        let mut selector = self.inner.selector.borrow_mut();
        if !current.is_empty() {
            selector.unregister(fd)?;
        }
        if interest.is_empty() {
            return Ok(());
        }
        if let Err(e) = selector.register(fd, interest, ()) {
            if !current.is_empty() {
                if let Err(restore) = selector.register(fd, current, ()) {
                    warn!(fd, cause = %restore, "failed to restore former interest");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Runs `callback` on the next iteration, after that iteration's I/O dispatch.
    pub fn call_soon<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.ready.borrow_mut().push_back(Box::new(callback));
    }

    /// Runs `callback` once `delay` has elapsed.
    pub fn call_later<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + 'static,
    {
        match Instant::now().checked_add(delay) {
            Some(when) => self.call_at(when, callback),
            None => warn!(?delay, "delay out of range, callback dropped"),
        }
    }

    /// Runs `callback` once `when` is reached. Callbacks due at the same instant run in the
    /// order they were scheduled.
    pub fn call_at<F>(&self, when: Instant, callback: F)
    where
        F: FnOnce() + 'static,
    {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        self.inner.scheduled.borrow_mut().push(ScheduledCallback::new(when, seq, Box::new(callback)));
    }

    /// Makes [`run_forever`](Self::run_forever) return once the running callback completes.
    pub fn stop(&self) {
        self.inner.shared.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.is_running()
    }

    /// Number of completed loop iterations.
    pub fn iteration(&self) -> u64 {
        self.inner.iteration.get()
    }

    /// Returns a handle usable from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(Arc::clone(&self.inner.shared))
    }

    /// Runs iterations until [`stop`](Self::stop) is called.
    ///
    /// A panic inside a callback is caught and logged; the loop keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::AlreadyRunning`] when called from inside the loop, or the
    /// selector error that ended the loop.
    pub fn run_forever(&self) -> Result<(), ReactorError> {
        ensure!(!self.inner.active.get(), ReactorError::AlreadyRunning);
        self.inner.active.set(true);
        self.inner.shared.set_running(true);
        debug!("event loop started");

        let result = loop {
            if !self.inner.shared.is_running() {
                break Ok(());
            }
            if let Err(e) = self.run_once() {
                error!(cause = %e, "event loop aborted");
                break Err(e);
            }
        };

        self.inner.shared.set_running(false);
        self.inner.active.set(false);
        debug!(iteration = self.iteration(), "event loop stopped");
        result
    }

    fn run_once(&self) -> Result<(), ReactorError> {
        let inner = &*self.inner;

        let remote = inner.shared.take_remote();
        if !remote.is_empty() {
            let mut ready = inner.ready.borrow_mut();
            for callback in remote {
                ready.push_back(callback);
            }
        }

        let timeout = if !inner.ready.borrow().is_empty() {
            Some(Duration::ZERO)
        } else if let Some(next) = inner.scheduled.borrow().peek() {
            Some(next.when().saturating_duration_since(Instant::now()))
        } else {
            None
        };

        let events = inner.selector.borrow_mut().select(timeout)?;
        for (key, fired) in events {
            let fd = key.fd();
            if fired.is_readable() {
                if let Some(reader) = self.handler(fd, IoEvent::Read) {
                    run_callback(&*reader);
                }
            }
            if fired.is_writable() {
                if let Some(writer) = self.handler(fd, IoEvent::Write) {
                    run_callback(&*writer);
                }
            }
        }

        let now = Instant::now();
        {
            let mut scheduled = inner.scheduled.borrow_mut();
            let mut ready = inner.ready.borrow_mut();
            while scheduled.peek().is_some_and(|next| next.when() <= now) {
                if let Some(next) = scheduled.pop() {
                    ready.push_back(next.into_callback());
                }
            }
        }

        let pending = inner.ready.borrow().len();
        for _ in 0..pending {
            let Some(callback) = inner.ready.borrow_mut().pop_front() else {
                break;
            };
            run_callback(callback);
        }

        inner.iteration.set(inner.iteration.get() + 1);
        Ok(())
    }

    fn handler(&self, fd: RawFd, event: IoEvent) -> Option<IoCallback> {
        self.inner.handlers.borrow().get(&fd).and_then(|handlers| handlers.get(event))
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.is_running())
            .field("iteration", &self.iteration())
            .field("descriptors", &self.inner.handlers.borrow().len())
            .field("ready", &self.inner.ready.borrow().len())
            .field("scheduled", &self.inner.scheduled.borrow().len())
            .finish()
    }
}

fn run_callback(callback: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        error!(cause = panic_message(payload.as_ref()), "callback panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::SelectSelector;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn recorder<T: 'static>() -> Rc<RefCell<Vec<T>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut result = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                result.push(tail);
            }
        }
        result
    }

    #[test]
    fn stop_from_callback() {
        let event_loop = EventLoop::new().unwrap();
        let stopper = event_loop.clone();
        event_loop.call_soon(move || stopper.stop());

        assert!(!event_loop.is_running());
        event_loop.run_forever().unwrap();
        assert!(!event_loop.is_running());
        assert!(event_loop.iteration() >= 1);
    }

    #[test]
    fn call_soon_runs_fifo() {
        let event_loop = EventLoop::new().unwrap();
        let seen = recorder();
        for i in 0..5 {
            let seen = Rc::clone(&seen);
            event_loop.call_soon(move || seen.borrow_mut().push(i));
        }
        let stopper = event_loop.clone();
        event_loop.call_soon(move || stopper.stop());

        event_loop.run_forever().unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn call_later_fires_by_delay() {
        let event_loop = EventLoop::new().unwrap();
        let seen = recorder();
        for (name, millis) in [("slow", 30), ("fast", 10), ("middle", 20)] {
            let seen = Rc::clone(&seen);
            event_loop.call_later(Duration::from_millis(millis), move || seen.borrow_mut().push(name));
        }
        let stopper = event_loop.clone();
        event_loop.call_later(Duration::from_millis(40), move || stopper.stop());

        let start = Instant::now();
        event_loop.run_forever().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(*seen.borrow(), vec!["fast", "middle", "slow"]);
    }

    #[test]
    fn call_at_fires_in_time_order_for_any_registration_order() {
        for order in permutations(&[0, 1, 2, 3]) {
            let event_loop = EventLoop::new().unwrap();
            let base = Instant::now() + Duration::from_millis(5);
            let times: Vec<_> = (0..4u64).map(|i| base + Duration::from_micros(i)).collect();

            let seen = recorder();
            for &index in &order {
                let seen = Rc::clone(&seen);
                event_loop.call_at(times[index], move || seen.borrow_mut().push(index));
            }
            let stopper = event_loop.clone();
            event_loop.call_at(times[3] + Duration::from_millis(1), move || stopper.stop());

            event_loop.run_forever().unwrap();
            assert_eq!(*seen.borrow(), vec![0, 1, 2, 3], "registration order {order:?}");
        }
    }

    #[test]
    fn same_instant_runs_in_scheduling_order() {
        let event_loop = EventLoop::new().unwrap();
        let when = Instant::now();
        let seen = recorder();
        for i in 0..4 {
            let seen = Rc::clone(&seen);
            event_loop.call_at(when, move || seen.borrow_mut().push(i));
        }
        let stopper = event_loop.clone();
        event_loop.call_at(when, move || stopper.stop());

        event_loop.run_forever().unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn call_soon_from_callback_runs_on_later_iteration() {
        let event_loop = EventLoop::new().unwrap();
        let iterations = recorder();

        let outer_loop = event_loop.clone();
        let outer_seen = Rc::clone(&iterations);
        event_loop.call_soon(move || {
            outer_seen.borrow_mut().push(outer_loop.iteration());
            let inner_loop = outer_loop.clone();
            let inner_seen = Rc::clone(&outer_seen);
            outer_loop.call_soon(move || {
                inner_seen.borrow_mut().push(inner_loop.iteration());
                inner_loop.stop();
            });
        });

        event_loop.run_forever().unwrap();
        let iterations = iterations.borrow();
        assert_eq!(iterations.len(), 2);
        assert!(iterations[1] > iterations[0]);
    }

    #[test]
    fn reader_fires_on_incoming_data() {
        let event_loop = EventLoop::new().unwrap();
        let (left, mut right) = UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        let fd = left.as_raw_fd();

        let seen = recorder();
        let reader_seen = Rc::clone(&seen);
        let reader_loop = event_loop.clone();
        event_loop
            .set_reader(fd, move || {
                let mut buf = [0u8; 16];
                let n = (&left).read(&mut buf).unwrap();
                reader_seen.borrow_mut().extend_from_slice(&buf[..n]);
                reader_loop.remove_reader(fd).unwrap();
                reader_loop.stop();
            })
            .unwrap();

        right.write_all(b"ping").unwrap();
        event_loop.run_forever().unwrap();
        assert_eq!(*seen.borrow(), b"ping");
    }

    #[test]
    fn reader_runs_before_writer() {
        let event_loop = EventLoop::new().unwrap();
        let (left, mut right) = UnixStream::pair().unwrap();
        let fd = left.as_raw_fd();
        right.write_all(b"x").unwrap();

        let seen = recorder();
        let reader_seen = Rc::clone(&seen);
        let reader_loop = event_loop.clone();
        event_loop
            .set_reader(fd, move || {
                reader_seen.borrow_mut().push("read");
                reader_loop.remove_reader(fd).unwrap();
            })
            .unwrap();
        let writer_seen = Rc::clone(&seen);
        let writer_loop = event_loop.clone();
        event_loop
            .set_writer(fd, move || {
                writer_seen.borrow_mut().push("write");
                writer_loop.remove_writer(fd).unwrap();
                writer_loop.stop();
            })
            .unwrap();

        event_loop.run_forever().unwrap();
        assert_eq!(*seen.borrow(), vec!["read", "write"]);
        drop(left);
    }

    #[test]
    fn remove_handlers_unregisters_descriptor() {
        let (left, _right) = UnixStream::pair().unwrap();
        let fd = left.as_raw_fd();

        let event_loop = EventLoop::with_selector(Box::new(SelectSelector::new())).unwrap();
        event_loop.set_reader(fd, || {}).unwrap();
        event_loop.set_writer(fd, || {}).unwrap();
        assert_eq!(event_loop.inner.selector.borrow().get(fd).map(|key| key.events()), Some(EventSet::READ | EventSet::WRITE));

        assert!(event_loop.remove_reader(fd).unwrap());
        assert_eq!(event_loop.inner.selector.borrow().get(fd).map(|key| key.events()), Some(EventSet::WRITE));
        assert!(!event_loop.remove_reader(fd).unwrap());

        assert!(event_loop.remove_writer(fd).unwrap());
        assert!(event_loop.inner.selector.borrow().get(fd).is_none());
        assert!(!event_loop.inner.handlers.borrow().contains_key(&fd));
    }

    #[test]
    fn set_reader_replaces_previous() {
        let event_loop = EventLoop::new().unwrap();
        let (left, mut right) = UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        let fd = left.as_raw_fd();

        let seen = recorder();
        let first_seen = Rc::clone(&seen);
        event_loop.set_reader(fd, move || first_seen.borrow_mut().push("first")).unwrap();

        let second_seen = Rc::clone(&seen);
        let second_loop = event_loop.clone();
        event_loop
            .set_reader(fd, move || {
                second_seen.borrow_mut().push("second");
                second_loop.remove_reader(fd).unwrap();
                second_loop.stop();
            })
            .unwrap();

        right.write_all(b"x").unwrap();
        event_loop.run_forever().unwrap();
        assert_eq!(*seen.borrow(), vec!["second"]);
        drop(left);
    }

    #[test]
    fn stop_from_another_thread_wakes_blocked_loop() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.stop();
        });

        let start = Instant::now();
        event_loop.run_forever().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        stopper.join().unwrap();
    }

    #[test]
    fn call_soon_from_another_thread() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let (sender, receiver) = std::sync::mpsc::channel();

        let remote = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let stopper = handle.clone();
            handle.call_soon(move || {
                sender.send(thread::current().id()).unwrap();
                stopper.stop();
            });
        });

        event_loop.run_forever().unwrap();
        remote.join().unwrap();
        assert_eq!(receiver.recv().unwrap(), thread::current().id());
    }

    #[test]
    fn panicking_callback_does_not_stop_the_loop() {
        let event_loop = EventLoop::new().unwrap();
        let seen = recorder();

        event_loop.call_soon(|| panic!("boom"));
        let after_seen = Rc::clone(&seen);
        event_loop.call_soon(move || after_seen.borrow_mut().push("after"));
        let stopper = event_loop.clone();
        event_loop.call_later(Duration::from_millis(5), move || stopper.stop());

        event_loop.run_forever().unwrap();
        assert_eq!(*seen.borrow(), vec!["after"]);
    }

    #[test]
    fn nested_run_is_rejected() {
        let event_loop = EventLoop::new().unwrap();
        let nested = recorder();

        let inner_loop = event_loop.clone();
        let inner_seen = Rc::clone(&nested);
        event_loop.call_soon(move || {
            let result = inner_loop.run_forever();
            inner_seen.borrow_mut().push(matches!(result, Err(ReactorError::AlreadyRunning)));
            inner_loop.stop();
        });

        event_loop.run_forever().unwrap();
        assert_eq!(*nested.borrow(), vec![true]);
    }
}
