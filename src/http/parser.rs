//! Incremental HTTP/1.1 request parser built on [`httparse`].
//!
//! The connection feeds raw socket bytes with [`Parser::feed`] and then drains
//! [`Event`]s with [`Parser::next_event`]. Three events are produced per
//! message, mirroring the classic push-parser callbacks:
//!
//! 1. [`Event::Headers`] once the request line and headers are complete.
//! 2. Zero or more [`Event::Body`] chunks (`Content-Length` or chunked framing).
//! 3. [`Event::MessageComplete`] after the last body byte.
//!
//! Bytes belonging to a following (pipelined) request stay buffered until the
//! caller asks for the next event, so a connection can process one message at
//! a time.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method};

/// Maximum number of headers we support per request.
const MAX_HEADERS: usize = 64;

/// Longest chunk-size line (including extensions) we accept.
const MAX_CHUNK_LINE: usize = 1024;

/// Errors that make the byte stream unusable. All of them are fatal for the
/// connection.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request head exceeds {max_bytes} bytes")]
    HeadTooLarge { max_bytes: usize },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("invalid chunked transfer encoding")]
    InvalidChunk,

    #[error("unsupported HTTP version 1.{0}")]
    UnsupportedVersion(u8),
}

/// The request line and headers of one message.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Raw request target, including any query string.
    pub url: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Headers,
    /// `true` when the client asked to switch protocols.
    pub upgrade: bool,
}

impl RequestHead {
    /// Returns `true` if the client allows the connection to be reused.
    ///
    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        self.version == 1 || self.headers.has_token("connection", "keep-alive")
    }
}

/// One step of parser output.
#[derive(Debug)]
pub enum Event {
    Headers(RequestHead),
    Body(Bytes),
    MessageComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Complete,
}

/// Incremental request parser. One instance lives for the whole connection.
#[derive(Debug)]
pub struct Parser {
    buf: BytesMut,
    state: State,
    max_head_size: usize,
}

impl Parser {
    /// Creates a parser rejecting request heads larger than `max_head_size`.
    pub fn new(max_head_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            state: State::Head,
            max_head_size,
        }
    }

    /// Appends raw bytes received from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns `true` while a message has started but not finished.
    pub fn in_message(&self) -> bool {
        self.state != State::Head
    }

    /// Returns `true` once the last body byte has been produced and only
    /// [`Event::MessageComplete`] is left for the current message.
    pub fn body_finished(&self) -> bool {
        self.state == State::Complete
    }

    /// Returns `true` if unparsed bytes are buffered.
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Produces the next event, or `None` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when the buffered bytes cannot be a valid
    /// HTTP/1.x request. The parser must not be used afterwards.
    pub fn next_event(&mut self) -> Result<Option<Event>, ParseError> {
        loop {
            match self.state {
                State::Head => return self.parse_head(),
                State::Body { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::Complete
                    } else {
                        State::Body { remaining }
                    };
                    return Ok(Some(Event::Body(chunk)));
                }
                State::ChunkSize => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                    return Ok(Some(Event::Body(chunk)));
                }
                State::ChunkDataEnd => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunk);
                    }
                    self.buf.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = State::Complete;
                    }
                }
                State::Complete => {
                    self.state = State::Head;
                    return Ok(Some(Event::MessageComplete));
                }
            }
        }
    }

    fn parse_head(&mut self) -> Result<Option<Event>, ParseError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let head_len = match raw_req.parse(&self.buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => {
                if self.buf.len() > self.max_head_size {
                    return Err(ParseError::HeadTooLarge {
                        max_bytes: self.max_head_size,
                    });
                }
                return Ok(None);
            }
        };
        if head_len > self.max_head_size {
            return Err(ParseError::HeadTooLarge {
                max_bytes: self.max_head_size,
            });
        }

        let method = Method::from(
            raw_req
                .method
                .ok_or(ParseError::MissingField { field: "method" })?,
        );
        let url = raw_req
            .path
            .ok_or(ParseError::MissingField { field: "path" })?
            .to_owned();
        let version = raw_req
            .version
            .ok_or(ParseError::MissingField { field: "version" })?;
        if version > 1 {
            return Err(ParseError::UnsupportedVersion(version));
        }

        let header_map = Headers::from_raw(raw_req.headers);
        let content_length = header_map
            .content_length()
            .transpose()
            .map_err(|_| ParseError::InvalidContentLength)?;

        self.state = if header_map.is_chunked() {
            State::ChunkSize
        } else {
            match content_length {
                Some(0) | None => State::Complete,
                Some(remaining) => State::Body { remaining },
            }
        };

        let upgrade = header_map.wants_upgrade();

        self.buf.advance(head_len);

        Ok(Some(Event::Headers(RequestHead {
            method,
            url,
            version,
            headers: header_map,
            upgrade,
        })))
    }

    // Removes one CRLF-terminated line from the buffer, without the CRLF.
    fn take_line(&mut self) -> Result<Option<BytesMut>, ParseError> {
        match self.buf.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                Ok(Some(line))
            }
            None if self.buf.len() > MAX_CHUNK_LINE => Err(ParseError::InvalidChunk),
            None => Ok(None),
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidChunk)?;
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(parser: &mut Parser) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = parser.next_event().unwrap() {
            let done = matches!(event, Event::MessageComplete);
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn body_of(events: &[Event]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Body(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn parse_simple_get() {
        let mut parser = Parser::new(8192);
        parser.feed(b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let events = drain(&mut parser);
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::Headers(head) => {
                assert_eq!(head.method, Method::Get);
                assert_eq!(head.url, "/hello?name=world");
                assert_eq!(head.version, 1);
                assert_eq!(head.headers.get("host"), Some("localhost"));
                assert!(head.is_keep_alive());
                assert!(!head.upgrade);
            }
            other => panic!("expected headers, got {other:?}"),
        }
        assert!(matches!(events[1], Event::MessageComplete));
        assert!(!parser.in_message());
    }

    #[test]
    fn incomplete_head_needs_more_bytes() {
        let mut parser = Parser::new(8192);
        parser.feed(b"GET / HTTP/1.1\r\nHost:");
        assert!(parser.next_event().unwrap().is_none());
        parser.feed(b" localhost\r\n\r\n");
        assert!(matches!(parser.next_event().unwrap(), Some(Event::Headers(_))));
    }

    #[test]
    fn content_length_body_arrives_in_pieces() {
        let mut parser = Parser::new(8192);
        parser.feed(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello");
        assert!(matches!(parser.next_event().unwrap(), Some(Event::Headers(_))));
        match parser.next_event().unwrap() {
            Some(Event::Body(b)) => assert_eq!(&b[..], b"hello"),
            other => panic!("expected body, got {other:?}"),
        }
        assert!(parser.next_event().unwrap().is_none());
        assert!(parser.in_message());

        parser.feed(b"world");
        match parser.next_event().unwrap() {
            Some(Event::Body(b)) => assert_eq!(&b[..], b"world"),
            other => panic!("expected body, got {other:?}"),
        }
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(Event::MessageComplete)
        ));
    }

    #[test]
    fn chunked_body_is_decoded() {
        let mut parser = Parser::new(8192);
        parser.feed(
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n5;ext=1\r\nworld\r\n0\r\nX-Trailer: yes\r\n\r\n",
        );
        let events = drain(&mut parser);
        assert!(matches!(events.last(), Some(Event::MessageComplete)));
        assert_eq!(body_of(&events), b"helloworld");
    }

    #[test]
    fn bad_chunk_size_is_rejected() {
        let mut parser = Parser::new(8192);
        parser.feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n");
        assert!(matches!(parser.next_event().unwrap(), Some(Event::Headers(_))));
        assert!(matches!(parser.next_event(), Err(ParseError::InvalidChunk)));
    }

    #[test]
    fn pipelined_request_stays_buffered() {
        let mut parser = Parser::new(8192);
        parser.feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let first = drain(&mut parser);
        assert_eq!(first.len(), 2);
        assert!(parser.has_buffered());

        let second = drain(&mut parser);
        match &second[0] {
            Event::Headers(head) => assert_eq!(head.url, "/b"),
            other => panic!("expected headers, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_an_error() {
        let mut parser = Parser::new(8192);
        parser.feed(b"\x00\x01 nonsense\r\n\r\n");
        assert!(matches!(parser.next_event(), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn oversized_head_is_an_error() {
        let mut parser = Parser::new(32);
        parser.feed(b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert!(matches!(
            parser.next_event(),
            Err(ParseError::HeadTooLarge { max_bytes: 32 })
        ));
    }

    #[test]
    fn invalid_content_length() {
        let mut parser = Parser::new(8192);
        parser.feed(b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n");
        assert!(matches!(
            parser.next_event(),
            Err(ParseError::InvalidContentLength)
        ));
    }

    #[test]
    fn http10_defaults_to_close() {
        let mut parser = Parser::new(8192);
        parser.feed(b"GET / HTTP/1.0\r\n\r\n");
        match parser.next_event().unwrap() {
            Some(Event::Headers(head)) => assert!(!head.is_keep_alive()),
            other => panic!("expected headers, got {other:?}"),
        }
    }

    #[test]
    fn upgrade_flag() {
        let mut parser = Parser::new(8192);
        parser.feed(
            b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        );
        match parser.next_event().unwrap() {
            Some(Event::Headers(head)) => assert!(head.upgrade),
            other => panic!("expected headers, got {other:?}"),
        }
    }
}
