//! Request model and application environment.
//!
//! - [`HttpRequest`]: the parsed request line and headers
//! - [`HeaderList`]: ordered headers with case-insensitive lookup
//! - [`Environ`]: CGI-style variables plus the body input slot, built per request
//! - [`ParseError`]: everything that makes a request head unusable

mod error;
pub use error::ParseError;

mod request;
pub use request::HeaderList;
pub use request::HttpRequest;

pub mod environ;
pub use environ::Environ;
pub(crate) use environ::ServerInfo;
