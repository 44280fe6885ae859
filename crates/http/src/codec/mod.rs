//! Byte level decoding of the request head.
//!
//! The [`HeaderParser`] turns a fragmented byte stream into request line, header and
//! end-of-header [`Element`]s. It is resumable: the element sequence does not depend on how
//! the stream was chunked.
//!
//! # Example
//!
//! ```
//! use micro_reactor_http::codec::{Element, HeaderParser};
//!
//! let mut parser = HeaderParser::new();
//! assert!(parser.feed(b"GET / HTTP/1.1\r\nHo").unwrap().len() == 1);
//! let elements = parser.feed(b"st: a\r\n\r\n").unwrap();
//! assert_eq!(elements[0], Element::Header { key: "Host".into(), value: "a".into() });
//! assert!(parser.is_finished());
//! ```

mod header_parser;

pub use header_parser::{Element, HeaderParser, MAX_HEADER_BYTES};
