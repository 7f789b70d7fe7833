//! HTTP/1.1 request as seen by handlers.
//!
//! A [`Request`] is built by the connection as soon as the parser reports the
//! end of the headers. The body is not buffered up front: it arrives through
//! the request's [`Stream`] while the handler is already running.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::parser::RequestHead;
use super::{Headers, Method};
use crate::stream::{Stream, StreamError};

/// An HTTP request whose body is read on demand.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use apodo::http::{Event, Parser, Request};
/// use apodo::stream::Stream;
///
/// let mut parser = Parser::new(8192);
/// parser.feed(b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n");
/// let Some(Event::Headers(head)) = parser.next_event().unwrap() else { unreachable!() };
/// let request = Request::new(head, Arc::new(Stream::new()));
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: String,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    args: HashMap<String, String>,
    upgrade: bool,
    stream: Arc<Stream>,
}

impl Request {
    /// Builds a request from a parsed head and the connection's body stream.
    pub fn new(head: RequestHead, stream: Arc<Stream>) -> Self {
        let (path, query) = match head.url.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (head.url.clone(), None),
        };
        let args = query.as_deref().map(parse_query_string).unwrap_or_default();

        Self {
            method: head.method,
            url: head.url,
            path,
            version: head.version,
            headers: head.headers,
            query,
            args,
            upgrade: head.upgrade,
            stream,
        }
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the raw request target, including the query string.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the `Host` header, if any.
    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a parsed query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    /// Returns the cookies sent with the request.
    pub fn cookies(&self) -> HashMap<String, String> {
        self.headers.cookies()
    }

    /// Returns `true` when the client asked to switch protocols.
    pub fn is_upgrade(&self) -> bool {
        self.upgrade
    }

    /// Returns the body stream.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Reads the whole body.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::AlreadyConsumed`] if the body was already read.
    pub async fn body(&self) -> Result<Bytes, StreamError> {
        self.stream.read().await
    }
}

/// Parses a URL query string (`key=value&key2=value2`) into a `HashMap`.
///
/// Keys and values have `+` decoded as a space.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.replace('+', " ");
            let value = parts.next().unwrap_or("").replace('+', " ");
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Event, Parser};

    fn head(raw: &[u8]) -> RequestHead {
        let mut parser = Parser::new(8192);
        parser.feed(raw);
        match parser.next_event().unwrap() {
            Some(Event::Headers(head)) => head,
            other => panic!("expected headers, got {other:?}"),
        }
    }

    #[test]
    fn parse_query_string() {
        let req = Request::new(
            head(b"GET /search?q=rust+lang&page=2 HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            Arc::new(Stream::new()),
        );
        assert_eq!(req.path(), "/search");
        assert_eq!(req.url(), "/search?q=rust+lang&page=2");
        assert_eq!(req.query_string(), Some("q=rust+lang&page=2"));
        assert_eq!(req.query_param("q"), Some("rust lang"));
        assert_eq!(req.query_param("page"), Some("2"));
        assert_eq!(req.host(), Some("example.com"));
    }

    #[test]
    fn no_query() {
        let req = Request::new(head(b"GET / HTTP/1.1\r\n\r\n"), Arc::new(Stream::new()));
        assert_eq!(req.path(), "/");
        assert_eq!(req.query_string(), None);
        assert_eq!(req.version(), 1);
    }

    #[tokio::test]
    async fn body_comes_from_stream() {
        let stream = Arc::new(Stream::new());
        let req = Request::new(
            head(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n"),
            Arc::clone(&stream),
        );
        stream.put(Bytes::from_static(b"hello"));
        stream.end();
        assert_eq!(&req.body().await.unwrap()[..], b"hello");
        assert!(req.body().await.is_err());
    }
}
