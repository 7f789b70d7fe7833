//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them to a byte buffer for transmission over TCP. Responses are
//! always framed with `Content-Length`; chunked responses are not produced.

use std::fmt::Write as _;
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::date::format_http_date;
use super::{Headers, StatusCode};

/// A `Set-Cookie` header line. Attributes are written in the order they
/// are added.
///
/// ```
/// use apodo::http::Cookie;
///
/// let cookie = Cookie::new("session", "abc").path("/").http_only(true);
/// assert_eq!(cookie.header(), "Set-Cookie: session=abc; Path=/; HttpOnly");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pair: String,
    attributes: Vec<String>,
}

impl Cookie {
    pub fn new(name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        Self {
            pair: format!("{}={}", name.as_ref(), value.as_ref()),
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn path(self, path: impl AsRef<str>) -> Self {
        self.attribute(format!("Path={}", path.as_ref()))
    }

    #[must_use]
    pub fn domain(self, domain: impl AsRef<str>) -> Self {
        self.attribute(format!("Domain={}", domain.as_ref()))
    }

    #[must_use]
    pub fn max_age(self, seconds: u64) -> Self {
        self.attribute(format!("Max-Age={seconds}"))
    }

    #[must_use]
    pub fn secure(self, secure: bool) -> Self {
        self.flag("Secure", secure)
    }

    #[must_use]
    pub fn http_only(self, http_only: bool) -> Self {
        self.flag("HttpOnly", http_only)
    }

    fn flag(self, name: &str, on: bool) -> Self {
        if on { self.attribute(name.to_owned()) } else { self }
    }

    fn attribute(mut self, attribute: String) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// The full header line, without the trailing CRLF.
    pub fn header(&self) -> String {
        let mut line = format!("Set-Cookie: {}", self.pair);
        for attribute in &self.attributes {
            line.push_str("; ");
            line.push_str(attribute);
        }
        line
    }
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use apodo::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.encode("Thu, 01 Jan 1970 00:00:00 GMT");
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    cookies: Vec<Cookie>,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            cookies: Vec::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Creates a `text/plain` response.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
    }

    /// Creates an `application/json` response by serializing `value`.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `value` cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(
        status: StatusCode,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(status)
            .header("Content-Type", "application/json")
            .body_bytes(body))
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Adds a cookie, rendered as its own `Set-Cookie` line.
    #[must_use]
    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`encode`](Self::encode).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether a `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the headers set by the caller.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the body bytes.
    pub fn body_ref(&self) -> &[u8] {
        &self.body
    }

    /// Returns `false` if the response asks for the connection to close.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Serializes the response using HTTP/1.1 wire format.
    ///
    /// Layout: status line, `Content-Length`, `Date`, caller headers in
    /// insertion order, one line per cookie, `Connection: close` when the
    /// response is not keep-alive, a blank line, then the body verbatim.
    pub fn encode(&self, date: &str) -> BytesMut {
        let mut buf =
            BytesMut::with_capacity(128 + (self.headers.len() + self.cookies.len()) * 48 + self.body.len());
        // Writing into a `BytesMut` cannot fail.
        let _ = write!(
            buf,
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nDate: {date}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason(),
            self.body.len(),
        );
        for (name, value) in self.headers.iter() {
            let _ = write!(buf, "{name}: {value}\r\n");
        }
        for cookie in &self.cookies {
            let _ = write!(buf, "{}\r\n", cookie.header());
        }
        if !self.keep_alive {
            buf.put_slice(b"Connection: close\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf
    }

    /// Serializes the response with a freshly formatted `Date` header.
    pub fn into_bytes(self) -> BytesMut {
        self.encode(&format_http_date(SystemTime::now()))
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATE: &str = "Sun, 06 Nov 1994 08:49:37 GMT";

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::Ok).body("Hello");
        let s = to_string(r.encode(DATE));
        assert_eq!(
            s,
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nDate: Sun, 06 Nov 1994 08:49:37 GMT\r\n\r\nHello"
        );
    }

    #[test]
    fn custom_header_follows_date() {
        let r = Response::new(StatusCode::Ok)
            .header("X-Request-Id", "abc-123")
            .body("ok");
        let s = to_string(r.encode(DATE));
        let date_at = s.find("Date:").unwrap();
        let custom_at = s.find("X-Request-Id: abc-123\r\n").unwrap();
        assert!(date_at < custom_at);
    }

    #[test]
    fn cookies_are_separate_lines() {
        let r = Response::new(StatusCode::Ok)
            .cookie(Cookie::new("a", "1"))
            .cookie(Cookie::new("b", "2").max_age(60).secure(true));
        let s = to_string(r.encode(DATE));
        assert!(s.contains("Set-Cookie: a=1\r\n"));
        assert!(s.contains("Set-Cookie: b=2; Max-Age=60; Secure\r\n"));
    }

    #[test]
    fn no_body() {
        let r = Response::new(StatusCode::NoContent);
        let s = to_string(r.encode(DATE));
        assert!(s.contains("Content-Length: 0\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::Ok).keep_alive(false);
        let s = to_string(r.encode(DATE));
        assert!(s.contains("Connection: close\r\n"));
        let keep = to_string(Response::new(StatusCode::Ok).encode(DATE));
        assert!(!keep.contains("Connection:"));
    }

    #[test]
    fn json_body() {
        let r = Response::json(StatusCode::Created, &serde_json::json!({"id": 7})).unwrap();
        let s = to_string(r.encode(DATE));
        assert!(s.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(s.contains("Content-Type: application/json\r\n"));
        assert!(s.ends_with("{\"id\":7}"));
    }
}
