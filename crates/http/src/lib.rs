//! A small embeddable HTTP/1.1 server running on a [`micro_reactor`] event loop.
//!
//! Requests are handed to an [`Application`](handler::Application) following a CGI / WSGI
//! style gateway contract: the application receives an [`Environ`](protocol::Environ) of
//! string variables, a function to start the response and a function to stream the body.
//! Everything runs on the single loop thread; nothing blocks.
//!
//! # Features
//!
//! - Resumable header parsing, independent of how the bytes were fragmented
//! - Streaming request bodies with backpressure
//! - Streaming responses
//! - One request per connection: the connection closes once the response is finished
//!
//! # Example
//!
//! ```no_run
//! use micro_reactor::EventLoop;
//! use micro_reactor_http::handler::make_application;
//! use micro_reactor_http::server::HttpServer;
//! use tracing::info;
//!
//! let application = make_application(|environ, start_response, send_body| {
//!     info!(path = environ.path_info(), "request");
//!     let input = environ.input().clone();
//!     let mut received = 0;
//!     input.register(move |data| {
//!         if data.is_empty() {
//!             let body = format!("received {received} bytes\r\n");
//!             start_response.start("200 OK", &[("Content-Length", &body.len().to_string())]);
//!             send_body.send(body.as_bytes());
//!             send_body.finish();
//!         } else {
//!             received += data.len();
//!         }
//!     });
//! });
//!
//! let event_loop = EventLoop::new()?;
//! let server = HttpServer::builder().event_loop(event_loop.clone()).application(application).build()?;
//! server.start()?;
//! event_loop.run_forever()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - [`codec`]: the incremental [`HeaderParser`](codec::HeaderParser)
//! - [`protocol`]: request model, environment and parse errors
//! - [`handler`]: the application contract
//! - [`connection`]: per-connection state machine and the response handles
//! - [`server`]: the listening socket and the live connection set
//!
//! # Limitations
//!
//! - No keep-alive, pipelining or chunked transfer encoding
//! - No TLS
//! - Maximum header size: 8KB

pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;

mod utils;
pub(crate) use utils::ensure;

pub use connection::{ConnectionId, HttpConnection, Input, SendBody, StartResponse};
pub use handler::{Application, make_application};
pub use protocol::{Environ, HttpRequest};
pub use server::HttpServer;
