//! Per-socket HTTP/1.1 state machine.
//!
//! A [`Connection`] owns the socket, an incremental [`Parser`], the request
//! body [`Stream`] and a write buffer. It runs as one task and reacts to five
//! kinds of wake-ups: socket data, write progress, handler completion, body
//! demand from the handler, and a stop request from the Reaper or the
//! worker's shutdown path.
//!
//! ```text
//!            data                 message complete
//!  PENDING ────────▶ RECEIVING ─────────────────────▶ PROCESSING
//!     ▲                                                    │
//!     └──────────────── response sent (keep-alive) ◀───────┘
//! ```
//!
//! Reading is paused after every body chunk and resumes only when the
//! handler asks for more, and it stays paused while a request is processed,
//! so at most one request per connection is in flight.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::registry::{ConnectionHandle, ConnectionRegistry, Status};
use crate::config::ServerConfig;
use crate::context::Context;
use crate::http::date::DateCache;
use crate::http::{Event, Parser, RequestHead};
use crate::router::{RouteError, RouteMatch, Router};
use crate::stream::Stream;
use crate::{Request, Response, StatusCode};

/// Above this many buffered response bytes the connection stops being
/// writable.
pub const HIGH_WATER: usize = 64 * 1024;

/// Once unwritable, the connection becomes writable again at or below this.
pub const LOW_WATER: usize = 16 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Longest a closing connection may spend flushing its write buffer.
const CLOSE_GRACE: Duration = Duration::from_secs(30);

/// Worker-wide state every connection needs.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub router: Arc<Router>,
    pub registry: Arc<ConnectionRegistry>,
    pub dates: DateCache,
    pub keep_alive: bool,
    pub max_head_size: usize,
}

impl ConnectionSettings {
    pub fn new(router: Arc<Router>, config: &ServerConfig) -> Self {
        Self {
            router,
            registry: Arc::new(ConnectionRegistry::new()),
            dates: DateCache::new(),
            keep_alive: config.keep_alive,
            max_head_size: config.limits.max_head_size,
        }
    }
}

pub struct Connection<T> {
    reader: ReadHalf<T>,
    writer: WriteHalf<T>,
    read_buf: BytesMut,
    out: BytesMut,
    parser: Parser,
    stream: Arc<Stream>,
    handle: Arc<ConnectionHandle>,
    settings: ConnectionSettings,

    reading: bool,
    writable: bool,
    in_request: bool,
    message_complete: bool,
    request_keep_alive: bool,
    stop_seen: bool,
    aborted: bool,

    task: Option<JoinHandle<Response>>,
    timeout: Option<JoinHandle<()>>,
    // Keep-alive decision of a framed response waiting for the buffer to drain.
    pending_after_response: Option<bool>,
    close_deadline: Option<Instant>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps an accepted socket and registers it with the worker.
    pub fn new(io: T, settings: ConnectionSettings) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let handle = settings.registry.register();
        Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            out: BytesMut::new(),
            parser: Parser::new(settings.max_head_size),
            stream: Arc::new(Stream::new()),
            handle,
            settings,
            reading: true,
            writable: true,
            in_request: false,
            message_complete: false,
            request_keep_alive: true,
            stop_seen: false,
            aborted: false,
            task: None,
            timeout: None,
            pending_after_response: None,
            close_deadline: None,
        }
    }

    /// Returns the handle shared with the registry.
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// Serves requests until the connection closes.
    pub async fn run(mut self) {
        let id = self.handle.id();
        trace!(connection = id, "connection opened");

        loop {
            if self.aborted {
                break;
            }
            if self.close_deadline.is_some() && self.out.is_empty() {
                break;
            }

            let deadline = self.close_deadline;
            tokio::select! {
                biased;

                written = self.writer.write_buf(&mut self.out), if !self.out.is_empty() => {
                    match written {
                        Ok(0) => {
                            debug!(connection = id, "peer stopped accepting data");
                            self.aborted = true;
                        }
                        Ok(_) => self.on_drain(),
                        Err(e) => {
                            debug!(connection = id, error = %e, "write failed");
                            self.aborted = true;
                        }
                    }
                }
                joined = join(&mut self.task), if self.task.is_some() => {
                    self.task = None;
                    self.on_handler_done(joined);
                }
                () = self.stream.demanded(), if self.paused_mid_body() => {
                    self.reading = true;
                    self.pump();
                }
                read = self.reader.read_buf(&mut self.read_buf), if self.reading => {
                    match read {
                        Ok(0) => {
                            trace!(connection = id, "peer closed the connection");
                            self.aborted = true;
                        }
                        Ok(_) => self.on_data(),
                        Err(e) => {
                            debug!(connection = id, error = %e, "read failed");
                            self.aborted = true;
                        }
                    }
                }
                () = self.handle.stop_requested(), if !self.stop_seen => {
                    self.stop_seen = true;
                    if self.handle.status() == Status::Pending {
                        self.schedule_close();
                    }
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debug!(connection = id, "write buffer did not drain in time");
                    self.aborted = true;
                }
            }
        }

        self.close().await;
    }

    fn paused_mid_body(&self) -> bool {
        !self.reading
            && self.in_request
            && !self.message_complete
            && self.pending_after_response.is_none()
            && self.close_deadline.is_none()
    }

    fn on_data(&mut self) {
        if self.handle.status() == Status::Pending {
            self.handle.set_status(Status::Receiving);
        }
        self.handle.touch();
        self.parser.feed(&self.read_buf);
        self.read_buf.clear();
        self.pump();
    }

    // Drains parser events while reading is allowed.
    fn pump(&mut self) {
        while self.reading && !self.aborted {
            match self.parser.next_event() {
                Ok(None) => break,
                Ok(Some(event)) => self.on_event(event),
                Err(e) => {
                    debug!(connection = self.handle.id(), error = %e, "invalid request, closing");
                    self.reading = false;
                    self.aborted = true;
                }
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Headers(head) => self.on_headers(head),
            Event::Body(chunk) => {
                self.stream.put(chunk);
                // The completion event needs no more input; let it through.
                if !self.parser.body_finished() {
                    self.reading = false;
                }
            }
            Event::MessageComplete => {
                self.stream.end();
                self.message_complete = true;
                self.handle.set_status(Status::Processing);
                self.reading = false;
            }
        }
    }

    fn on_headers(&mut self, head: RequestHead) {
        self.handle.set_status(Status::Receiving);
        self.handle.touch();
        self.in_request = true;
        self.request_keep_alive = head.is_keep_alive();

        let request = Request::new(head, Arc::clone(&self.stream));
        debug!(
            connection = self.handle.id(),
            method = %request.method(),
            path = request.path(),
            "request received"
        );

        let task = match self.settings.router.get_route(&request) {
            Ok(RouteMatch { route, params }) => {
                let handler = Arc::clone(route.handler());
                let ctx = Context::with_params(request, params);
                let task = tokio::spawn(async move { handler(ctx).await });
                if let Some(limit) = route.handler_timeout() {
                    let abort = task.abort_handle();
                    self.timeout = Some(tokio::spawn(async move {
                        tokio::time::sleep(limit).await;
                        abort.abort();
                    }));
                }
                task
            }
            Err(err) => {
                debug!(connection = self.handle.id(), error = %err, "no route");
                let response = routing_error_response(&err);
                tokio::spawn(async move { response })
            }
        };
        self.task = Some(task);
    }

    fn on_handler_done(&mut self, joined: Result<Response, JoinError>) {
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }

        let id = self.handle.id();
        let response = match joined {
            Ok(response) => response,
            Err(e) if e.is_cancelled() => {
                warn!(connection = id, "handler timed out");
                Response::text(StatusCode::ServiceUnavailable, "Service Unavailable")
            }
            Err(e) => {
                error!(connection = id, error = %e, "handler panicked");
                Response::text(StatusCode::InternalServerError, "Internal Server Error")
            }
        };

        let keep_alive = self.settings.keep_alive
            && self.request_keep_alive
            && self.message_complete
            && response.is_keep_alive()
            && !self.handle.is_stopped();
        let response = if keep_alive {
            response
        } else {
            response.keep_alive(false)
        };

        debug!(connection = id, status = response.status().as_u16(), "response queued");
        self.out
            .extend_from_slice(&response.encode(&self.settings.dates.get()));
        if self.out.len() > HIGH_WATER {
            self.writable = false;
        }
        self.pending_after_response = Some(keep_alive);
        self.finish_response_if_writable();
    }

    fn on_drain(&mut self) {
        if !self.writable && self.out.len() <= LOW_WATER {
            self.writable = true;
        }
        self.finish_response_if_writable();
    }

    fn finish_response_if_writable(&mut self) {
        if !self.writable {
            return;
        }
        if let Some(keep_alive) = self.pending_after_response.take() {
            self.after_response(keep_alive);
        }
    }

    fn after_response(&mut self, keep_alive: bool) {
        self.handle.set_status(Status::Pending);
        self.handle.touch();
        self.stream.clear();
        self.in_request = false;
        let complete = std::mem::take(&mut self.message_complete);

        if !keep_alive || !complete || self.handle.is_stopped() {
            self.schedule_close();
            return;
        }

        self.reading = true;
        // A pipelined request may already be buffered.
        self.pump();
    }

    // Stop reading and close once the write buffer is flushed.
    fn schedule_close(&mut self) {
        self.reading = false;
        if self.close_deadline.is_none() {
            self.close_deadline = Some(Instant::now() + CLOSE_GRACE);
        }
    }

    async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
        let _ = self.writer.shutdown().await;
        self.handle.mark_closed();
        self.settings.registry.discard(self.handle.id());
        trace!(connection = self.handle.id(), "connection closed");
    }
}

async fn join(task: &mut Option<JoinHandle<Response>>) -> Result<Response, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Maps a routing failure to the response sent instead of running a handler.
pub fn routing_error_response(err: &RouteError) -> Response {
    match err {
        RouteError::NotFound | RouteError::ReverseNotFound(_) => {
            Response::text(StatusCode::NotFound, "Not Found")
        }
        RouteError::MethodNotAllowed { allowed } => {
            let allow = allowed
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            Response::text(StatusCode::MethodNotAllowed, "Method Not Allowed").header("Allow", allow)
        }
        _ => Response::text(StatusCode::InternalServerError, "Internal Server Error"),
    }
}
