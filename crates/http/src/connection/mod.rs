//! Per-connection request handling.
//!
//! - [`HttpConnection`]: drives one request/response exchange over a
//!   [`Transport`](micro_reactor::Transport)
//! - [`Input`]: where the application registers for request body chunks
//! - [`StartResponse`] and [`SendBody`]: how the application answers
//!
//! Every connection serves exactly one request and closes once the response body is
//! finished.

mod http_connection;
mod responder;

pub use http_connection::{ConnectionId, HttpConnection, RequestState, ResponseState, SERVER_SOFTWARE};
pub use responder::{Input, SendBody, StartResponse};
