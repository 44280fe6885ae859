//! The parsed request head.
//!
//! [`HttpRequest`] is assembled from the [`Element`]s of one
//! [`HeaderParser`](crate::codec::HeaderParser) run. Headers keep their original order and
//! spelling in a [`HeaderList`]; lookups ignore ASCII case.

use bytes::Bytes;
use http::Method;

use crate::codec::Element;
use crate::protocol::ParseError;

/// Ordered header pairs with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    headers: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }

    /// Returns the first value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.iter().find(|(name, _)| name.eq_ignore_ascii_case(key)).map(|(_, value)| value.as_str())
    }

    /// Returns every value of `key` in arrival order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers.iter().filter(move |(name, _)| name.eq_ignore_ascii_case(key)).map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn push<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.headers.push((key.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self { headers: iter.into_iter().map(|(key, value)| (key.into(), value.into())).collect() }
    }
}

/// Request line and headers of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    method: Method,
    path: String,
    version: String,
    headers: HeaderList,
}

impl HttpRequest {
    pub fn new(method: Method, path: String, version: String, headers: HeaderList) -> Self {
        Self { method, path, version, headers }
    }

    /// Builds the request from a complete element sequence and returns it together with the
    /// body bytes carried by [`Element::End`].
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidRequestLine`] if no [`Element::Head`] is present, or
    /// [`ParseError::InvalidMethod`] if the method is not a valid token.
    pub fn from_elements(elements: Vec<Element>) -> Result<(Self, Bytes), ParseError> {
        let mut head = None;
        let mut headers = HeaderList::default();
        let mut body = Bytes::new();

        for element in elements {
            match element {
                Element::Head { method, path, version } => head = Some((method, path, version)),
                Element::Header { key, value } => headers.push(key, value),
                Element::End { body: initial } => body = initial,
            }
        }

        let (method, path, version) = head.ok_or_else(|| ParseError::invalid_request_line(""))?;
        let method = Method::from_bytes(method.as_bytes()).map_err(|_e| ParseError::invalid_method(&method))?;
        Ok((Self { method, path, version, headers }, body))
    }

    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request target, query string included.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The version as sent by the client, e.g. `HTTP/1.1`.
    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[inline]
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    /// Declared `Content-Length`, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length").and_then(|value| value.trim().parse().ok())
    }
}
