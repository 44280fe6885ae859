use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use bytes::Bytes;
use http::StatusCode;
use micro_reactor::{CloseReason, EventLoop, Transport, TransportState};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{Element, HeaderParser};
use crate::connection::{Input, SendBody, StartResponse};
use crate::handler::Application;
use crate::protocol::{Environ, HeaderList, HttpRequest, ParseError, ServerInfo};

/// Value of the `Server` response header unless the application sets its own.
pub const SERVER_SOFTWARE: &str = "Embassy";

/// Identity of one connection within its server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestState {
    ParsingHeader,
    ReadingBody,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseState {
    SendingHeader,
    SendingBody,
}

pub(crate) type InputHandler = Box<dyn FnMut(Bytes) + 'static>;
type ClosedCallback = Box<dyn FnOnce(ConnectionId) + 'static>;

struct State {
    request_state: RequestState,
    response_state: ResponseState,
    parser: Option<HeaderParser>,
    elements: Vec<Element>,
    request: Option<HttpRequest>,
    initial_body: Option<Bytes>,
    content_length: Option<u64>,
    bytes_read: u64,
    input_done: bool,
}

impl State {
    fn remaining(&self) -> u64 {
        self.content_length.unwrap_or(0).saturating_sub(self.bytes_read)
    }
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    transport: Transport,
    event_loop: EventLoop,
    application: Rc<dyn Application>,
    server_name: Rc<str>,
    server_port: u16,
    this: Weak<ConnectionInner>,
    state: RefCell<State>,
    input_handler: RefCell<Option<InputHandler>>,
    input_generation: Cell<u64>,
    delivering: Cell<bool>,
    closed: RefCell<Option<ClosedCallback>>,
}

/// One client connection: parses a single request, runs the application once and streams
/// its response back.
///
/// The request side moves from [`RequestState::ParsingHeader`] to
/// [`RequestState::ReadingBody`] once the header section is complete; the response side
/// moves from [`ResponseState::SendingHeader`] to [`ResponseState::SendingBody`] once the
/// application starts the response. There is no keep-alive: finishing the response closes
/// the transport.
pub struct HttpConnection {
    inner: Rc<ConnectionInner>,
}

impl HttpConnection {
    pub fn new(
        id: ConnectionId,
        transport: Transport,
        event_loop: EventLoop,
        application: Rc<dyn Application>,
        server_name: Rc<str>,
        server_port: u16,
    ) -> Self {
        let inner = Rc::new_cyclic(|this| ConnectionInner {
            id,
            transport,
            event_loop,
            application,
            server_name,
            server_port,
            this: Weak::clone(this),
            state: RefCell::new(State {
                request_state: RequestState::ParsingHeader,
                response_state: ResponseState::SendingHeader,
                parser: None,
                elements: Vec::new(),
                request: None,
                initial_body: None,
                content_length: None,
                bytes_read: 0,
                input_done: false,
            }),
            input_handler: RefCell::new(None),
            input_generation: Cell::new(0),
            delivering: Cell::new(false),
            closed: RefCell::new(None),
        });

        let this = Rc::downgrade(&inner);
        inner.transport.set_data_received(move |data| {
            if let Some(inner) = this.upgrade() {
                inner.handle_data(data);
            }
        });
        let this = Rc::downgrade(&inner);
        inner.transport.set_closed(move |reason| {
            if let Some(inner) = this.upgrade() {
                inner.handle_closed(&reason);
            }
        });

        Self { inner }
    }

    /// Sets the callback told once the underlying transport is closed.
    pub fn set_closed<F>(&self, callback: F)
    where
        F: FnOnce(ConnectionId) + 'static,
    {
        *self.inner.closed.borrow_mut() = Some(Box::new(callback));
    }

    /// Flushes what is queued and closes the connection.
    pub fn close(&self) {
        self.inner.transport.close();
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn request_state(&self) -> RequestState {
        self.inner.state.borrow().request_state
    }

    pub fn response_state(&self) -> ResponseState {
        self.inner.state.borrow().response_state
    }

    /// The parsed request, once the header section is complete.
    pub fn request(&self) -> Option<HttpRequest> {
        self.inner.state.borrow().request.clone()
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("id", &self.inner.id)
            .field("request_state", &self.request_state())
            .field("response_state", &self.response_state())
            .field("transport", &self.inner.transport)
            .finish()
    }
}

impl ConnectionInner {
    fn handle_data(&self, data: Bytes) {
        let request_state = self.state.borrow().request_state;
        match request_state {
            RequestState::ParsingHeader => self.handle_header_data(&data),
            RequestState::ReadingBody => self.handle_body_data(data),
        }
    }

    fn handle_header_data(&self, data: &[u8]) {
        let parsed = {
            let mut state = self.state.borrow_mut();
            let result = state.parser.get_or_insert_with(HeaderParser::new).feed(data);
            let elements = match result {
                Ok(elements) => elements,
                Err(e) => {
                    drop(state);
                    self.reject(&e);
                    return;
                }
            };
            state.elements.extend(elements);

            // only handle the request once the end of the header section shows up
            if !matches!(state.elements.last(), Some(Element::End { .. })) {
                return;
            }
            state.parser = None;
            HttpRequest::from_elements(std::mem::take(&mut state.elements))
        };

        let (request, initial_body) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.reject(&e);
                return;
            }
        };
        debug!(
            id = %self.id,
            method = %request.method(),
            path = request.path(),
            version = request.version(),
            headers = ?request.headers(),
            "header parsed"
        );

        {
            let mut state = self.state.borrow_mut();
            state.content_length = request.content_length();
            state.initial_body = (!initial_body.is_empty()).then_some(initial_body);
            state.request_state = RequestState::ReadingBody;
        }
        // the application resumes reading by registering an input handler
        self.transport.resume_reading(false);

        let server = ServerInfo { name: &self.server_name, port: self.server_port };
        let input = Input::new(Weak::clone(&self.this));
        let environ = Environ::new(&request, server, input, self.event_loop.clone(), self.id);
        self.state.borrow_mut().request = Some(request);

        self.run_application(environ);
    }

    fn run_application(&self, environ: Environ) {
        let start_response = StartResponse::new(Weak::clone(&self.this));
        let send_body = SendBody::new(Weak::clone(&self.this));
        let application = Rc::clone(&self.application);

        let result = panic::catch_unwind(AssertUnwindSafe(|| application.call(environ, start_response, send_body)));
        if result.is_err() {
            error!(id = %self.id, "application panicked");
            self.abort(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    fn handle_body_data(&self, data: Bytes) {
        if self.state.borrow().input_done {
            trace!(id = %self.id, size = data.len(), "body already complete, bytes dropped");
            return;
        }
        if self.input_handler.borrow().is_none() {
            error!(id = %self.id, size = data.len(), "body data received without input handler");
            return;
        }
        self.deliver_body(data);
    }

    /// Hands `data` to the input handler, clipped to the declared content length, and sends
    /// end-of-body once the length is reached.
    fn deliver_body(&self, mut data: Bytes) {
        let finished = {
            let mut state = self.state.borrow_mut();
            let remaining = state.remaining();
            if u64::try_from(data.len()).is_ok_and(|len| len > remaining) {
                data.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
            }
            state.bytes_read += u64::try_from(data.len()).unwrap_or(u64::MAX);
            state.remaining() == 0
        };

        if !data.is_empty() {
            self.call_input(data);
        }
        // a handler that finished the response closed the transport under us
        if finished || self.transport.state() == TransportState::Closed {
            self.finish_input();
        }
    }

    fn call_input(&self, data: Bytes) {
        let handler = self.input_handler.borrow_mut().take();
        let Some(mut handler) = handler else {
            error!(id = %self.id, size = data.len(), "body data received without input handler");
            return;
        };
        let generation = self.input_generation.get();

        self.delivering.set(true);
        handler(data);
        self.delivering.set(false);

        // keep the handler unless it was replaced, paused or finished meanwhile
        if generation == self.input_generation.get() && !self.state.borrow().input_done {
            let mut slot = self.input_handler.borrow_mut();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }

    fn finish_input(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.input_done {
                return;
            }
            state.input_done = true;
        }
        self.transport.resume_reading(false);

        let handler = self.input_handler.borrow_mut().take();
        if let Some(mut handler) = handler {
            handler(Bytes::new());
        }
    }

    pub(crate) fn register_input(&self, handler: Option<InputHandler>) {
        self.input_generation.set(self.input_generation.get() + 1);

        let Some(handler) = handler else {
            let previous = self.input_handler.borrow_mut().take();
            drop(previous);
            self.transport.resume_reading(false);
            return;
        };

        let (initial_body, remaining) = {
            let mut state = self.state.borrow_mut();
            if state.request_state != RequestState::ReadingBody || state.input_done {
                drop(state);
                error!(id = %self.id, "input registered while no body is expected");
                return;
            }
            (state.initial_body.take(), state.remaining())
        };

        let previous = self.input_handler.borrow_mut().replace(handler);
        drop(previous);

        if remaining == 0 {
            self.finish_input();
            return;
        }
        if let Some(body) = initial_body {
            self.deliver_body(body);
        }
        if !self.state.borrow().input_done && self.input_handler.borrow().is_some() {
            self.transport.resume_reading(true);
        }
    }

    pub(crate) fn start_response(&self, status: &str, headers: &[(&str, &str)]) {
        {
            let mut state = self.state.borrow_mut();
            if state.request_state == RequestState::ParsingHeader || state.response_state != ResponseState::SendingHeader {
                drop(state);
                error!(id = %self.id, status, "response is not ready for sending header");
                return;
            }
            state.response_state = ResponseState::SendingBody;
        }

        let mut headers: HeaderList = headers.iter().copied().collect();
        // no keep-alive support, the connection always closes after the response
        if !headers.contains("Connection") {
            headers.push("Connection", "close");
        }
        if !headers.contains("Server") {
            headers.push("Server", SERVER_SOFTWARE);
        }
        debug!(id = %self.id, status, headers = ?headers, "start response");

        let mut head = String::with_capacity(128);
        head.push_str("HTTP/1.1 ");
        head.push_str(status);
        head.push_str("\r\n");
        for (key, value) in headers.iter() {
            head.push_str(key);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        if let Err(e) = self.transport.write(head.as_bytes()) {
            warn!(id = %self.id, cause = %e, "failed to send response header");
        }
    }

    pub(crate) fn send_body(&self, data: &[u8]) {
        if self.state.borrow().response_state != ResponseState::SendingBody {
            error!(id = %self.id, "response is not ready for sending body");
            return;
        }
        if data.is_empty() {
            info!(id = %self.id, "finish response");
            self.transport.close();
            return;
        }
        if let Err(e) = self.transport.write(data) {
            warn!(id = %self.id, cause = %e, "failed to send response body");
        }
    }

    fn reject(&self, e: &ParseError) {
        warn!(id = %self.id, cause = %e, "bad request");
        self.abort(StatusCode::BAD_REQUEST);
    }

    /// Stops reading, answers with an empty `status` response unless one was started, and
    /// closes.
    fn abort(&self, status: StatusCode) {
        let started = {
            let mut state = self.state.borrow_mut();
            state.request_state = RequestState::ReadingBody;
            state.parser = None;
            state.elements.clear();
            let started = state.response_state == ResponseState::SendingBody;
            state.response_state = ResponseState::SendingBody;
            started
        };
        self.transport.resume_reading(false);

        if !started {
            let head = format!(
                "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\nServer: {SERVER_SOFTWARE}\r\n\r\n",
                status.as_str(),
                status.canonical_reason().unwrap_or_default()
            );
            if let Err(e) = self.transport.write(head.as_bytes()) {
                warn!(id = %self.id, cause = %e, "failed to send error response");
            }
        }
        self.transport.close();
    }

    fn handle_closed(&self, reason: &CloseReason) {
        info!(id = %self.id, ?reason, "connection closed");

        // an in-flight delivery sends end-of-body itself once its handler returns
        if !self.delivering.get() {
            self.finish_input();
        }

        let closed = self.closed.borrow_mut().take();
        if let Some(closed) = closed {
            closed(self.id);
        }
    }
}
