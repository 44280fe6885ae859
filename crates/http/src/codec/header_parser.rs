//! Incremental parser for the request line and header section of an HTTP/1.1 request.
//!
//! The parser is fed arbitrary chunks of the byte stream and returns the [`Element`]s that
//! became complete. It keeps the not yet delimited tail between calls and resumes scanning
//! where the previous call stopped, so the output never depends on how the input is split:
//! feeding a request in one call or byte by byte yields the same element sequence.
//!
//! # Limits
//!
//! - Maximum header section size: 8KB ([`MAX_HEADER_BYTES`])
//! - Lines must be valid UTF-8 and terminated by CRLF
//!
//! One parser handles exactly one request. Once [`Element::End`] has been produced the
//! parser is finished and ignores further input.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::ensure;
use crate::protocol::ParseError;

/// Maximum size in bytes allowed for the request line plus the header section
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const CRLF: &[u8] = b"\r\n";

/// One parsed piece of the request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// The request line. `version` is everything after the path, extra tokens included.
    Head { method: String, path: String, version: String },
    /// One header line, split on the first colon.
    Header { key: String, value: String },
    /// End of the header section, with the body bytes that followed it in the buffer.
    End { body: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Headers,
    Done,
}

#[derive(Debug)]
pub struct HeaderParser {
    state: State,
    buffer: BytesMut,
    /// position in `buffer` already known to hold no CRLF
    scanned: usize,
    /// bytes of complete lines consumed so far
    consumed: usize,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderParser {
    pub fn new() -> Self {
        Self { state: State::Head, buffer: BytesMut::new(), scanned: 0, consumed: 0 }
    }

    /// Returns true once [`Element::End`] has been produced.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == State::Done
    }

    /// Feeds the next chunk of the byte stream and returns the elements it completed.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if:
    /// - the header section grows beyond [`MAX_HEADER_BYTES`]
    /// - the request line lacks a method or a path
    /// - a line is not valid UTF-8
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Element>, ParseError> {
        if data.is_empty() || self.state == State::Done {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(data);

        let mut elements = Vec::new();
        loop {
            let Some(index) = find_crlf(&self.buffer, self.scanned) else {
                // a trailing CR may pair with a LF of the next chunk
                self.scanned = self.buffer.len().saturating_sub(1);
                let current_size = self.consumed + self.buffer.len();
                ensure!(current_size <= MAX_HEADER_BYTES, ParseError::too_large_header(current_size, MAX_HEADER_BYTES));
                return Ok(elements);
            };

            let line = self.buffer.split_to(index + CRLF.len());
            self.scanned = 0;
            self.consumed += line.len();
            ensure!(self.consumed <= MAX_HEADER_BYTES, ParseError::too_large_header(self.consumed, MAX_HEADER_BYTES));
            let line = &line[..index];

            if self.state == State::Head {
                elements.push(parse_request_line(line)?);
                self.state = State::Headers;
                continue;
            }

            if line.is_empty() {
                let body = self.buffer.split().freeze();
                trace!(header_size = self.consumed, body_size = body.len(), "parsed header section");
                elements.push(Element::End { body });
                self.state = State::Done;
                return Ok(elements);
            }
            elements.push(parse_header(line)?);
        }
    }
}

fn find_crlf(buffer: &[u8], from: usize) -> Option<usize> {
    buffer.get(from..)?.windows(CRLF.len()).position(|window| window == CRLF).map(|position| position + from)
}

fn parse_request_line(line: &[u8]) -> Result<Element, ParseError> {
    let line = std::str::from_utf8(line).map_err(ParseError::invalid_encoding)?;
    let mut parts = line.splitn(3, ' ');

    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    ensure!(!method.is_empty() && !path.is_empty(), ParseError::invalid_request_line(line));
    let version = parts.next().unwrap_or_default();

    Ok(Element::Head { method: method.to_owned(), path: path.to_owned(), version: version.to_owned() })
}

fn parse_header(line: &[u8]) -> Result<Element, ParseError> {
    let line = std::str::from_utf8(line).map_err(ParseError::invalid_encoding)?;
    let (key, value) = match line.split_once(':') {
        Some((key, value)) => (key, value.trim_start_matches([' ', '\t'])),
        None => (line, ""),
    };
    Ok(Element::Header { key: key.to_owned(), value: value.to_owned() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn head(method: &str, path: &str, version: &str) -> Element {
        Element::Head { method: method.into(), path: path.into(), version: version.into() }
    }

    fn header(key: &str, value: &str) -> Element {
        Element::Header { key: key.into(), value: value.into() }
    }

    fn end(body: &'static [u8]) -> Element {
        Element::End { body: Bytes::from_static(body) }
    }

    fn crlf(text: &str) -> Vec<u8> {
        text.replace('\n', "\r\n").into_bytes()
    }

    fn feed_in_chunks(data: &[u8], size: usize) -> Vec<Element> {
        let mut parser = HeaderParser::new();
        let mut elements = Vec::new();
        for chunk in data.chunks(size) {
            elements.extend(parser.feed(chunk).unwrap());
        }
        elements
    }

    #[test]
    fn byte_by_byte() {
        let elements = feed_in_chunks(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", 1);
        assert_eq!(elements, vec![head("GET", "/", "HTTP/1.1"), header("Host", "a"), end(b"")]);
    }

    #[test]
    fn any_chunking_yields_same_elements() {
        let request = crlf(indoc! {r##"
        POST /index.html?a=1 HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*
        Content-Length: 5

        hello"##});

        let expected = vec![
            head("POST", "/index.html?a=1", "HTTP/1.1"),
            header("Host", "127.0.0.1:8080"),
            header("User-Agent", "curl/7.79.1"),
            header("Accept", "*/*"),
            header("Content-Length", "5"),
            end(b"hello"),
        ];

        let mut parser = HeaderParser::new();
        assert_eq!(parser.feed(&request).unwrap(), expected);
        assert!(parser.is_finished());

        for size in 1..request.len() {
            // the body may be split too, the End element only carries what came with it
            let elements = feed_in_chunks(&request, size);
            assert_eq!(elements[..5], expected[..5], "chunk size {size}");
            assert!(matches!(elements.last(), Some(Element::End { .. })), "chunk size {size}");
        }
    }

    #[test]
    fn cr_and_lf_in_different_chunks() {
        let mut parser = HeaderParser::new();
        assert!(parser.feed(b"GET / HTTP/1.1\r").unwrap().is_empty());
        assert_eq!(parser.feed(b"\n").unwrap(), vec![head("GET", "/", "HTTP/1.1")]);
        assert!(parser.feed(b"\r").unwrap().is_empty());
        assert_eq!(parser.feed(b"\nbody").unwrap(), vec![end(b"body")]);
    }

    #[test]
    fn header_value_keeps_colons() {
        let mut parser = HeaderParser::new();
        let elements = parser.feed(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\nX-Time:12:30:00\r\n\r\n").unwrap();
        assert_eq!(
            elements,
            vec![head("GET", "/", "HTTP/1.1"), header("Host", "example.com:8080"), header("X-Time", "12:30:00"), end(b"")]
        );
    }

    #[test]
    fn header_without_colon() {
        let mut parser = HeaderParser::new();
        let elements = parser.feed(b"GET / HTTP/1.1\r\nweird\r\n\r\n").unwrap();
        assert_eq!(elements[1], header("weird", ""));
    }

    #[test]
    fn version_keeps_extra_tokens() {
        let mut parser = HeaderParser::new();
        let elements = parser.feed(b"GET /a b HTTP/1.1\r\n").unwrap();
        assert_eq!(elements, vec![head("GET", "/a", "b HTTP/1.1")]);

        let mut parser = HeaderParser::new();
        let elements = parser.feed(b"GET /\r\n").unwrap();
        assert_eq!(elements, vec![head("GET", "/", "")]);
    }

    #[test]
    fn empty_chunk_is_noop() {
        let mut parser = HeaderParser::new();
        assert!(parser.feed(b"").unwrap().is_empty());
        assert!(parser.feed(b"GET").unwrap().is_empty());
        assert!(parser.feed(b"").unwrap().is_empty());
        assert_eq!(parser.feed(b" / HTTP/1.0\r\n").unwrap(), vec![head("GET", "/", "HTTP/1.0")]);
    }

    #[test]
    fn finished_parser_ignores_input() {
        let mut parser = HeaderParser::new();
        let elements = parser.feed(b"GET / HTTP/1.1\r\n\r\nabc").unwrap();
        assert_eq!(elements, vec![head("GET", "/", "HTTP/1.1"), end(b"abc")]);
        assert!(parser.feed(b"GET / HTTP/1.1\r\n\r\n").unwrap().is_empty());
    }

    #[test]
    fn from_edge() {
        let request = crlf(indoc! {r##"
        GET /index/?a=1&b=2&a=3 HTTP/1.1
        Host: 127.0.0.1:8080
        Connection: keep-alive
        sec-ch-ua: "#Not_A Brand";v="99", "Microsoft Edge";v="109", "Chromium";v="109"
        User-Agent: Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36 Edg/109.0.1518.52
        Accept-Language: zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7

        "##});

        let elements = HeaderParser::new().feed(&request).unwrap();
        assert_eq!(elements.len(), 7);
        assert_eq!(elements[0], head("GET", "/index/?a=1&b=2&a=3", "HTTP/1.1"));
        assert_eq!(elements[3], header("sec-ch-ua", r##""#Not_A Brand";v="99", "Microsoft Edge";v="109", "Chromium";v="109""##));
        assert_eq!(elements[5], header("Accept-Language", "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7"));
        assert_eq!(elements[6], end(b""));
    }

    #[test]
    fn too_large_header() {
        let mut parser = HeaderParser::new();
        parser.feed(b"GET / HTTP/1.1\r\n").unwrap();

        let huge = format!("X-Huge: {}\r\n", "a".repeat(MAX_HEADER_BYTES));
        let error = parser.feed(huge.as_bytes()).unwrap_err();
        assert!(matches!(error, ParseError::TooLargeHeader { max_size: MAX_HEADER_BYTES, .. }));
    }

    #[test]
    fn too_large_without_line_end() {
        let mut parser = HeaderParser::new();
        let error = parser.feed(&vec![b'a'; MAX_HEADER_BYTES + 1]).unwrap_err();
        assert!(matches!(error, ParseError::TooLargeHeader { current_size, .. } if current_size == MAX_HEADER_BYTES + 1));
    }

    #[test]
    fn body_does_not_count_against_limit() {
        let mut request = b"POST / HTTP/1.1\r\n\r\n".to_vec();
        request.extend_from_slice(&vec![b'x'; 2 * MAX_HEADER_BYTES]);
        let elements = HeaderParser::new().feed(&request).unwrap();
        assert!(matches!(&elements[1], Element::End { body } if body.len() == 2 * MAX_HEADER_BYTES));
    }

    #[test]
    fn invalid_request_line() {
        let error = HeaderParser::new().feed(b"GET\r\n").unwrap_err();
        assert!(matches!(error, ParseError::InvalidRequestLine { .. }));

        let error = HeaderParser::new().feed(b"\r\n").unwrap_err();
        assert!(matches!(error, ParseError::InvalidRequestLine { .. }));
    }

    #[test]
    fn invalid_encoding() {
        let error = HeaderParser::new().feed(b"GET /\xff HTTP/1.1\r\n").unwrap_err();
        assert!(matches!(error, ParseError::InvalidEncoding { .. }));
    }
}
