//! The application contract.
//!
//! An [`Application`] is called exactly once per connection, as soon as the request head is
//! parsed. It receives the request [`Environ`], a [`StartResponse`] to send the status line
//! and headers, and a [`SendBody`] to stream the response body; sending an empty body chunk
//! finishes the response and closes the connection.
//!
//! Both response handles are cheap to clone and may be kept to answer later from another
//! loop callback, for example once the request body has been read through
//! [`Environ::input`].
//!
//! # Example
//!
//! ```
//! use micro_reactor_http::handler::make_application;
//!
//! let application = make_application(|environ, start_response, send_body| {
//!     let body = format!("hello {}", environ.path_info());
//!     start_response.start("200 OK", &[("Content-Length", &body.len().to_string())]);
//!     send_body.send(body.as_bytes());
//!     send_body.send(b"");
//! });
//! # let _ = application;
//! ```

use crate::connection::{SendBody, StartResponse};
use crate::protocol::Environ;

pub trait Application {
    fn call(&self, environ: Environ, start_response: StartResponse, send_body: SendBody);
}

#[derive(Debug)]
pub struct ApplicationFn<F> {
    f: F,
}

impl<F> Application for ApplicationFn<F>
where
    F: Fn(Environ, StartResponse, SendBody),
{
    fn call(&self, environ: Environ, start_response: StartResponse, send_body: SendBody) {
        (self.f)(environ, start_response, send_body);
    }
}

pub fn make_application<F>(f: F) -> ApplicationFn<F>
where
    F: Fn(Environ, StartResponse, SendBody),
{
    ApplicationFn { f }
}
