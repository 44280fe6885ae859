//! A single-threaded I/O reactor
//!
//! This crate provides the building blocks of a callback driven network server without
//! threads or async runtimes: a readiness [`selector`], an [`EventLoop`] multiplexing I/O
//! readiness with immediate and scheduled callbacks, and a buffered, flow-controlled
//! [`Transport`] over one non-blocking socket.
//!
//! # Features
//!
//! - Level-triggered selectors over `select(2)`, `epoll(7)` and `kqueue(2)`
//! - Immediate (`call_soon`) and timed (`call_later` / `call_at`) callbacks with stable order
//! - Self-pipe wakeup, so other threads can stop the loop or hand it work
//! - Transport with write buffering, graceful close and read backpressure
//! - Panics inside callbacks are logged and never take the loop down
//!
//! # Example
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::net::TcpListener;
//! use std::os::fd::AsRawFd;
//! use micro_reactor::{EventLoop, Transport};
//! use tracing::{info, warn};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let listener = TcpListener::bind("127.0.0.1:8080").unwrap();
//! listener.set_nonblocking(true).unwrap();
//!
//! let accept_loop = event_loop.clone();
//! let transports = RefCell::new(Vec::new());
//! event_loop
//!     .set_reader(listener.as_raw_fd(), move || {
//!         let (stream, peer) = match listener.accept() {
//!             Ok(accepted) => accepted,
//!             Err(e) => {
//!                 warn!(cause = %e, "failed to accept");
//!                 return;
//!             }
//!         };
//!         info!(%peer, "accepted");
//!         let transport = Transport::new(stream, &accept_loop).unwrap();
//!         let echo = transport.clone();
//!         transport.set_data_received(move |data| {
//!             let _ = echo.write(&data);
//!         });
//!         transports.borrow_mut().push(transport);
//!     })
//!     .unwrap();
//!
//! event_loop.run_forever().unwrap();
//! ```
//!
//! # Architecture
//!
//! - [`selector`]: the [`Selector`](selector::Selector) trait and its platform variants
//! - [`event_loop`]: the [`EventLoop`] and its cross-thread [`LoopHandle`]
//! - [`transport`]: the [`Transport`] and the [`Socket`](transport::Socket) trait
//! - [`error`]: error types of the three layers

pub mod error;
pub mod event_loop;
pub mod selector;
pub mod transport;

mod utils;

pub use error::{ReactorError, SelectorError, TransportError};
pub use event_loop::{EventLoop, LoopHandle};
pub use transport::{CloseReason, Transport, TransportState};
