use std::fmt;
use std::rc::Weak;

use bytes::Bytes;

use crate::connection::http_connection::ConnectionInner;

/// Slot through which an application receives the request body.
///
/// Handles stay valid after the connection is gone; they just do nothing.
#[derive(Clone)]
pub struct Input {
    connection: Weak<ConnectionInner>,
}

impl Input {
    pub(crate) fn new(connection: Weak<ConnectionInner>) -> Self {
        Self { connection }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self { connection: Weak::new() }
    }

    /// Registers `handler` for body chunks and resumes reading.
    ///
    /// Bytes that arrived together with the header are handed over first. The end of the body
    /// is signalled with one empty chunk, right away when the request declares no
    /// `Content-Length`. Registering again replaces the previous handler.
    pub fn register<F>(&self, handler: F)
    where
        F: FnMut(Bytes) + 'static,
    {
        if let Some(connection) = self.connection.upgrade() {
            connection.register_input(Some(Box::new(handler)));
        }
    }

    /// Drops the handler and stops reading until the next [`register`](Self::register).
    pub fn pause(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.register_input(None);
        }
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Input").field("attached", &(self.connection.strong_count() > 0)).finish()
    }
}

/// Sends the status line and headers of the response.
#[derive(Clone)]
pub struct StartResponse {
    connection: Weak<ConnectionInner>,
}

impl StartResponse {
    pub(crate) fn new(connection: Weak<ConnectionInner>) -> Self {
        Self { connection }
    }

    /// Writes `HTTP/1.1 <status>` followed by `headers`.
    ///
    /// `Connection: close` and `Server` are added unless present. Only the first call on a
    /// connection has any effect.
    pub fn start(&self, status: &str, headers: &[(&str, &str)]) {
        if let Some(connection) = self.connection.upgrade() {
            connection.start_response(status, headers);
        }
    }
}

impl fmt::Debug for StartResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartResponse").finish_non_exhaustive()
    }
}

/// Streams the response body.
#[derive(Clone)]
pub struct SendBody {
    connection: Weak<ConnectionInner>,
}

impl SendBody {
    pub(crate) fn new(connection: Weak<ConnectionInner>) -> Self {
        Self { connection }
    }

    /// Queues `data`; an empty slice finishes the response and closes the connection once
    /// everything queued is flushed.
    pub fn send(&self, data: &[u8]) {
        if let Some(connection) = self.connection.upgrade() {
            connection.send_body(data);
        }
    }

    pub fn finish(&self) {
        self.send(&[]);
    }
}

impl fmt::Debug for SendBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendBody").finish_non_exhaustive()
    }
}
