//! The listening side: accepts TCP connections on an [`EventLoop`] and hands every one of
//! them to a new [`HttpConnection`].
//!
//! ```no_run
//! use micro_reactor::EventLoop;
//! use micro_reactor_http::handler::make_application;
//! use micro_reactor_http::server::HttpServer;
//!
//! let event_loop = EventLoop::new()?;
//! let server = HttpServer::builder()
//!     .event_loop(event_loop.clone())
//!     .application(make_application(|_environ, start_response, send_body| {
//!         start_response.start("200 OK", &[]);
//!         send_body.send(b"Hello World!\r\n");
//!         send_body.finish();
//!     }))
//!     .interface("127.0.0.1")
//!     .port(8080)
//!     .build()?;
//! server.start()?;
//! event_loop.run_forever()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};

use micro_reactor::{EventLoop, SelectorError, Transport};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionId, HttpConnection};
use crate::ensure;
use crate::handler::Application;

pub const DEFAULT_INTERFACE: &str = "::1";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("event loop must be set")]
    MissingEventLoop,
    #[error("application must be set")]
    MissingApplication,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("server is already started")]
    AlreadyStarted,
    #[error("failed to bind listener: {source}")]
    Bind { source: io::Error },
    #[error("failed to register listener: {source}")]
    Register {
        #[from]
        source: SelectorError,
    },
}

impl ServerError {
    fn bind(source: io::Error) -> Self {
        Self::Bind { source }
    }
}

#[derive(Default)]
pub struct HttpServerBuilder {
    event_loop: Option<EventLoop>,
    application: Option<Rc<dyn Application>>,
    interface: Option<String>,
    port: Option<u16>,
    server_name: Option<String>,
}

impl HttpServerBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    pub fn application(mut self, application: impl Application + 'static) -> Self {
        self.application = Some(Rc::new(application));
        self
    }

    /// Address to listen on, `::1` unless set.
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Port to listen on, `8080` unless set; `0` picks a free one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Value of `SERVER_NAME`, the interface unless set.
    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn build(self) -> Result<HttpServer, ServerBuildError> {
        let event_loop = self.event_loop.ok_or(ServerBuildError::MissingEventLoop)?;
        let application = self.application.ok_or(ServerBuildError::MissingApplication)?;
        let interface = self.interface.unwrap_or_else(|| DEFAULT_INTERFACE.to_owned());
        let server_name: Rc<str> = Rc::from(self.server_name.as_deref().unwrap_or(&interface));
        let port = self.port.unwrap_or(DEFAULT_PORT);

        let inner = Rc::new_cyclic(|this| ServerInner {
            event_loop,
            application,
            interface,
            port,
            server_name,
            this: Weak::clone(this),
            listener: RefCell::new(None),
            bound_port: Cell::new(port),
            connections: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        });
        Ok(HttpServer { inner })
    }
}

impl fmt::Debug for HttpServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServerBuilder")
            .field("interface", &self.interface)
            .field("port", &self.port)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// An HTTP/1.1 server bound to one event loop.
///
/// Every accepted connection lives in the server's connection set until its transport
/// closes.
pub struct HttpServer {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    event_loop: EventLoop,
    application: Rc<dyn Application>,
    interface: String,
    port: u16,
    server_name: Rc<str>,
    this: Weak<ServerInner>,
    listener: RefCell<Option<TcpListener>>,
    bound_port: Cell<u16>,
    connections: RefCell<HashMap<ConnectionId, HttpConnection>>,
    next_id: Cell<u64>,
}

impl HttpServer {
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder::new()
    }

    /// Binds the listening socket and starts accepting on the event loop.
    ///
    /// Accepting only happens while the loop runs.
    pub fn start(&self) -> Result<(), ServerError> {
        let inner = &self.inner;
        ensure!(inner.listener.borrow().is_none(), ServerError::AlreadyStarted);

        let listener = TcpListener::bind((inner.interface.as_str(), inner.port)).map_err(ServerError::bind)?;
        listener.set_nonblocking(true).map_err(ServerError::bind)?;
        let port = listener.local_addr().map_err(ServerError::bind)?.port();

        let this = Weak::clone(&inner.this);
        inner.event_loop.set_reader(listener.as_raw_fd(), move || {
            if let Some(inner) = this.upgrade() {
                inner.accept();
            }
        })?;

        info!(interface = %inner.interface, port, "start listening");
        inner.bound_port.set(port);
        *inner.listener.borrow_mut() = Some(listener);
        Ok(())
    }

    /// Stops accepting and releases the listening socket. Live connections carry on.
    pub fn stop(&self) {
        self.inner.stop_listening();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.borrow().as_ref().and_then(|listener| listener.local_addr().ok())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.borrow().len()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("interface", &self.inner.interface)
            .field("port", &self.inner.bound_port.get())
            .field("listening", &self.inner.listener.borrow().is_some())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ServerInner {
    fn accept(&self) {
        loop {
            let accepted = match self.listener.borrow().as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => self.open_connection(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    return;
                }
            }
        }
    }

    fn open_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let transport = match Transport::new(stream, &self.event_loop) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(%peer, cause = %e, "failed to open transport");
                return;
            }
        };

        let id = ConnectionId::new(self.next_id.get());
        self.next_id.set(id.get() + 1);

        let connection = HttpConnection::new(
            id,
            transport,
            self.event_loop.clone(),
            Rc::clone(&self.application),
            Rc::clone(&self.server_name),
            self.bound_port.get(),
        );
        let this = Weak::clone(&self.this);
        connection.set_closed(move |id| {
            if let Some(inner) = this.upgrade() {
                inner.remove_connection(id);
            }
        });

        debug!(%id, %peer, "connection accepted");
        self.connections.borrow_mut().insert(id, connection);
    }

    fn remove_connection(&self, id: ConnectionId) {
        let removed = self.connections.borrow_mut().remove(&id);
        debug!(%id, live = self.connections.borrow().len(), "connection removed");
        drop(removed);
    }

    fn stop_listening(&self) {
        let listener = self.listener.borrow_mut().take();
        if let Some(listener) = listener {
            if let Err(e) = self.event_loop.remove_reader(listener.as_raw_fd()) {
                warn!(cause = %e, "failed to unregister listener");
            }
            info!(port = self.bound_port.get(), "stop listening");
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.stop_listening();
    }
}
