//! The environment handed to an [`Application`](crate::handler::Application).
//!
//! It follows the CGI / WSGI convention: request metadata is exposed as string variables
//! such as `REQUEST_METHOD` or `PATH_INFO`, and every request header is re-exposed as
//! `HTTP_<NAME>` with the name upper-cased and `-` replaced by `_`. Gateway specific values
//! live under the `gateway.` prefix. Typed members carry what can't be a string: the body
//! [`Input`], the [`EventLoop`] and the [`ConnectionId`].

use std::collections::BTreeMap;
use std::fmt;

use micro_reactor::EventLoop;

use crate::connection::{ConnectionId, Input};
use crate::protocol::HttpRequest;

pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
pub const SCRIPT_NAME: &str = "SCRIPT_NAME";
pub const PATH_INFO: &str = "PATH_INFO";
pub const QUERY_STRING: &str = "QUERY_STRING";
pub const CONTENT_TYPE: &str = "CONTENT_TYPE";
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
pub const SERVER_NAME: &str = "SERVER_NAME";
pub const SERVER_PORT: &str = "SERVER_PORT";
pub const SERVER_PROTOCOL: &str = "SERVER_PROTOCOL";
pub const GATEWAY_VERSION: &str = "gateway.version";
pub const GATEWAY_URL_SCHEME: &str = "gateway.url_scheme";
pub const GATEWAY_ERROR: &str = "gateway.error";

/// Version of the application contract.
pub const VERSION: &str = "0.1";

pub struct Environ {
    vars: BTreeMap<String, String>,
    input: Input,
    event_loop: EventLoop,
    connection_id: ConnectionId,
}

/// Where the request was received.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerInfo<'a> {
    pub(crate) name: &'a str,
    pub(crate) port: u16,
}

impl Environ {
    pub(crate) fn new(
        request: &HttpRequest,
        server: ServerInfo<'_>,
        input: Input,
        event_loop: EventLoop,
        connection_id: ConnectionId,
    ) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(REQUEST_METHOD.to_owned(), request.method().as_str().to_owned());
        vars.insert(SCRIPT_NAME.to_owned(), String::new());

        match request.path().split_once('?') {
            Some((path, query)) => {
                vars.insert(PATH_INFO.to_owned(), path.to_owned());
                vars.insert(QUERY_STRING.to_owned(), query.to_owned());
            }
            None => {
                vars.insert(PATH_INFO.to_owned(), request.path().to_owned());
            }
        }

        if let Some(content_type) = request.headers().get("Content-Type") {
            vars.insert(CONTENT_TYPE.to_owned(), content_type.to_owned());
        }
        if let Some(content_length) = request.headers().get("Content-Length") {
            vars.insert(CONTENT_LENGTH.to_owned(), content_length.to_owned());
        }

        for (key, value) in request.headers().iter() {
            vars.entry(header_var(key))
                .and_modify(|joined: &mut String| {
                    joined.push_str(", ");
                    joined.push_str(value);
                })
                .or_insert_with(|| value.to_owned());
        }

        vars.insert(SERVER_NAME.to_owned(), server.name.to_owned());
        vars.insert(SERVER_PORT.to_owned(), server.port.to_string());
        vars.insert(SERVER_PROTOCOL.to_owned(), "HTTP/1.1".to_owned());
        vars.insert(GATEWAY_VERSION.to_owned(), VERSION.to_owned());
        vars.insert(GATEWAY_URL_SCHEME.to_owned(), "http".to_owned());
        vars.insert(GATEWAY_ERROR.to_owned(), String::new());

        Self { vars, input, event_loop, connection_id }
    }

    /// Returns the string variable `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Iterates over every string variable, ordered by key.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn request_method(&self) -> &str {
        self.get(REQUEST_METHOD).unwrap_or_default()
    }

    pub fn path_info(&self) -> &str {
        self.get(PATH_INFO).unwrap_or_default()
    }

    pub fn query_string(&self) -> Option<&str> {
        self.get(QUERY_STRING)
    }

    /// Returns the value of request header `name`, looked up through its `HTTP_` variable.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.get(&header_var(name))
    }

    /// Slot to register the request body handler with.
    pub fn input(&self) -> &Input {
        &self.input
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Always false: an application runs on a single loop thread.
    pub fn multithread(&self) -> bool {
        false
    }

    pub fn multiprocess(&self) -> bool {
        false
    }

    pub fn run_once(&self) -> bool {
        false
    }
}

impl fmt::Debug for Environ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environ").field("vars", &self.vars).field("connection_id", &self.connection_id).finish_non_exhaustive()
    }
}

/// `Content-Type` becomes `HTTP_CONTENT_TYPE`.
fn header_var(name: &str) -> String {
    let mut var = String::with_capacity(name.len() + 5);
    var.push_str("HTTP_");
    var.extend(name.chars().map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() }));
    var
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HeaderParser;

    fn environ(raw: &[u8]) -> Environ {
        let elements = HeaderParser::new().feed(raw).unwrap();
        let (request, _) = HttpRequest::from_elements(elements).unwrap();
        let event_loop = EventLoop::new().unwrap();
        Environ::new(&request, ServerInfo { name: "localhost", port: 8080 }, Input::detached(), event_loop, ConnectionId::new(7))
    }

    #[test]
    fn header_var_names() {
        assert_eq!(header_var("Content-Type"), "HTTP_CONTENT_TYPE");
        assert_eq!(header_var("x-forwarded-for"), "HTTP_X_FORWARDED_FOR");
        assert_eq!(header_var("Host"), "HTTP_HOST");
    }

    #[test]
    fn path_and_query() {
        let environ = environ(b"GET /path?foo=bar HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(environ.request_method(), "GET");
        assert_eq!(environ.path_info(), "/path");
        assert_eq!(environ.query_string(), Some("foo=bar"));
        assert_eq!(environ.get(SCRIPT_NAME), Some(""));
        assert_eq!(environ.header("host"), Some("h"));
        assert_eq!(environ.connection_id(), ConnectionId::new(7));
    }

    #[test]
    fn query_keeps_later_question_marks() {
        let environ = environ(b"GET /a?b=1?c=2 HTTP/1.1\r\n\r\n");
        assert_eq!(environ.path_info(), "/a");
        assert_eq!(environ.query_string(), Some("b=1?c=2"));
    }

    #[test]
    fn no_query_string_without_question_mark() {
        let environ = environ(b"GET /plain HTTP/1.1\r\n\r\n");
        assert_eq!(environ.path_info(), "/plain");
        assert_eq!(environ.query_string(), None);
        assert_eq!(environ.get(CONTENT_TYPE), None);
        assert_eq!(environ.get(CONTENT_LENGTH), None);
    }

    #[test]
    fn server_and_gateway_keys() {
        let environ = environ(b"POST / HTTP/1.0\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\n");
        assert_eq!(environ.get(SERVER_NAME), Some("localhost"));
        assert_eq!(environ.get(SERVER_PORT), Some("8080"));
        assert_eq!(environ.get(SERVER_PROTOCOL), Some("HTTP/1.1"));
        assert_eq!(environ.get(CONTENT_TYPE), Some("text/plain"));
        assert_eq!(environ.get(CONTENT_LENGTH), Some("4"));
        assert_eq!(environ.get("HTTP_CONTENT_LENGTH"), Some("4"));
        assert_eq!(environ.get(GATEWAY_VERSION), Some("0.1"));
        assert_eq!(environ.get(GATEWAY_URL_SCHEME), Some("http"));
        assert_eq!(environ.get(GATEWAY_ERROR), Some(""));
        assert!(!environ.multithread());
        assert!(!environ.multiprocess());
        assert!(!environ.run_once());
    }

    #[test]
    fn duplicate_headers_are_joined() {
        let environ = environ(b"GET / HTTP/1.1\r\nAccept: text/html\r\naccept: application/json\r\n\r\n");
        assert_eq!(environ.get("HTTP_ACCEPT"), Some("text/html, application/json"));
    }
}
