//! Request body stream: a single-producer/single-consumer backpressure queue.
//!
//! The connection pushes body chunks with [`Stream::put`] as the parser
//! produces them and pauses socket reads after each one. The handler pulls
//! chunks with [`Stream::get`] (or collects everything with
//! [`Stream::read`]); when the queue is empty it signals *demand*, which is
//! what lets the connection resume reading. A slow consumer therefore keeps
//! the socket paused instead of letting the body pile up in memory.
//!
//! ```text
//!  parser ──put──▶ [chunk][chunk] ──get──▶ handler
//!     ▲                                  │
//!     └────────── demand (resume) ◀──────┘
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::Notify;

/// Errors returned by body reads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream already consumed")]
    AlreadyConsumed,
}

#[derive(Debug, Default)]
struct State {
    chunks: VecDeque<Bytes>,
    // A consumer is parked in `get`.
    waiting: bool,
    // Chunks were pushed since the last `clear`.
    dirty: bool,
    // The producer called `end`.
    finished: bool,
    // The consumer observed the terminal value.
    consumed: bool,
}

/// The body of one request.
///
/// Owned by its connection and shared with the request handed to application
/// code. It is cleared after every response so that a keep-alive connection
/// can reuse it.
#[derive(Debug, Default)]
pub struct Stream {
    state: Mutex<State>,
    data_ready: Notify,
    demand: Notify,
}

impl Stream {
    /// Creates an empty, unfinished stream.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends a chunk and wakes a parked consumer.
    pub fn put(&self, chunk: Bytes) {
        let mut state = self.lock();
        state.dirty = true;
        state.chunks.push_back(chunk);
        if state.waiting {
            self.data_ready.notify_one();
        }
    }

    /// Marks the end of the body and wakes a parked consumer.
    pub fn end(&self) {
        let mut state = self.lock();
        state.finished = true;
        if state.waiting {
            self.data_ready.notify_one();
        }
    }

    /// Returns the next chunk, parking until one arrives.
    ///
    /// Yields `Ok(None)` exactly once when the body is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::AlreadyConsumed`] once the terminal value has
    /// been observed, until the stream is [cleared](Self::clear).
    pub async fn get(&self) -> Result<Option<Bytes>, StreamError> {
        loop {
            {
                let mut state = self.lock();
                if state.consumed {
                    return Err(StreamError::AlreadyConsumed);
                }
                if let Some(chunk) = state.chunks.pop_front() {
                    state.waiting = false;
                    return Ok(Some(chunk));
                }
                if state.finished {
                    state.waiting = false;
                    state.consumed = true;
                    return Ok(None);
                }
                state.waiting = true;
            }
            self.demand.notify_waiters();
            self.data_ready.notified().await;
        }
    }

    /// Collects the whole body.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::AlreadyConsumed`] if the body was already read
    /// to the end.
    pub async fn read(&self) -> Result<Bytes, StreamError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.get().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// Resets the stream for the next request on the same connection.
    pub fn clear(&self) {
        let mut state = self.lock();
        if state.dirty {
            state.chunks.clear();
            state.dirty = false;
        }
        state.finished = false;
        state.consumed = false;
        state.waiting = false;
    }

    /// Resolves while a consumer is parked on an empty, unfinished stream.
    ///
    /// Demand is a state, not an event: a `get` that was satisfied before
    /// this call does not count.
    pub async fn demanded(&self) {
        loop {
            let notified = self.demand.notified();
            tokio::pin!(notified);
            // Register before checking so a `get` racing with the check wakes us.
            notified.as_mut().enable();
            if self.wants_data() {
                return;
            }
            notified.await;
        }
    }

    fn wants_data(&self) -> bool {
        let state = self.lock();
        state.waiting && state.chunks.is_empty() && !state.finished && !state.consumed
    }

    /// Returns `true` if the producer has called [`end`](Self::end).
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Returns `true` if a consumer is parked waiting for data.
    pub fn is_waiting(&self) -> bool {
        self.lock().waiting
    }

    /// Returns the number of buffered chunks.
    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    /// Returns `true` if no chunks are buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn read_concatenates_in_order() {
        let stream = Stream::new();
        stream.put(Bytes::from_static(b"hello"));
        stream.put(Bytes::from_static(b"world"));
        stream.end();
        assert_eq!(&stream.read().await.unwrap()[..], b"helloworld");
    }

    #[tokio::test]
    async fn second_read_fails() {
        let stream = Stream::new();
        stream.put(Bytes::from_static(b"x"));
        stream.end();
        stream.read().await.unwrap();
        assert_eq!(stream.read().await, Err(StreamError::AlreadyConsumed));
        assert_eq!(stream.get().await, Err(StreamError::AlreadyConsumed));
    }

    #[tokio::test]
    async fn empty_finished_stream_yields_terminal_value() {
        let stream = Stream::new();
        stream.end();
        assert_eq!(stream.get().await, Ok(None));
    }

    #[tokio::test]
    async fn clear_allows_reuse() {
        let stream = Stream::new();
        stream.put(Bytes::from_static(b"left over"));
        stream.end();
        let _ = stream.get().await;
        stream.clear();
        assert!(stream.is_empty());
        assert!(!stream.is_finished());

        stream.put(Bytes::from_static(b"next"));
        stream.end();
        assert_eq!(&stream.read().await.unwrap()[..], b"next");
    }

    #[tokio::test]
    async fn parked_consumer_is_woken_by_put_and_end() {
        let stream = Arc::new(Stream::new());
        let reader = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.read().await })
        };

        // The consumer parks and signals demand.
        tokio::time::timeout(Duration::from_secs(1), stream.demanded())
            .await
            .unwrap();
        assert!(stream.is_waiting());

        stream.put(Bytes::from_static(b"ab"));
        tokio::time::timeout(Duration::from_secs(1), stream.demanded())
            .await
            .unwrap();
        stream.put(Bytes::from_static(b"cd"));
        stream.end();

        let body = reader.await.unwrap().unwrap();
        assert_eq!(&body[..], b"abcd");
    }

    #[tokio::test]
    async fn no_demand_while_chunks_are_buffered() {
        let stream = Stream::new();
        stream.put(Bytes::from_static(b"a"));
        stream.put(Bytes::from_static(b"b"));
        assert_eq!(stream.get().await.unwrap().as_deref(), Some(&b"a"[..]));
        let demanded =
            tokio::time::timeout(Duration::from_millis(20), stream.demanded()).await;
        assert!(demanded.is_err());
        assert_eq!(stream.len(), 1);
    }

    #[tokio::test]
    async fn early_get_does_not_leave_demand_behind() {
        let stream = Arc::new(Stream::new());
        let reader = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.get().await })
        };
        stream.demanded().await;

        stream.put(Bytes::from_static(b"first"));
        let first = reader.await.unwrap().unwrap();
        assert_eq!(first.as_deref(), Some(&b"first"[..]));

        // Nobody is parked any more, so there is nothing to resume for.
        let demanded = tokio::time::timeout(Duration::from_millis(20), stream.demanded()).await;
        assert!(demanded.is_err());

        stream.end();
        stream.clear();
        let demanded = tokio::time::timeout(Duration::from_millis(20), stream.demanded()).await;
        assert!(demanded.is_err());
    }
}
