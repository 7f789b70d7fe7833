//! The per-worker set of open connections.
//!
//! The event loop adds a [`ConnectionHandle`] on accept and discards it on
//! close. The Reaper thread takes snapshots to find idle or stuck
//! connections; everything it reads is atomic or briefly locked, and the only
//! thing it may do to a connection is ask it to [`stop`](ConnectionHandle::stop).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Where a connection is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Waiting for the first byte of the next request.
    Pending = 0,
    /// Reading a request head or body.
    Receiving = 1,
    /// A handler is running or its response is being written.
    Processing = 2,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Status::Receiving,
            2 => Status::Processing,
            _ => Status::Pending,
        }
    }
}

/// The part of a connection that other threads may observe.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    status: AtomicU8,
    closed: AtomicBool,
    stopped: AtomicBool,
    last_activity: Mutex<Instant>,
    stop_signal: Notify,
}

impl ConnectionHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            status: AtomicU8::new(Status::Pending as u8),
            closed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            stop_signal: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn activity(&self) -> MutexGuard<'_, Instant> {
        match self.last_activity.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records activity now.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, at: Instant) {
        *self.activity() = at;
    }

    pub fn last_activity(&self) -> Instant {
        *self.activity()
    }

    /// Time since the last recorded activity, as seen at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Asks the connection to close once it is between requests.
    ///
    /// Safe to call from any thread.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_signal.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves when [`stop`](Self::stop) is called. A stop issued before
    /// the first poll is not lost.
    pub async fn stop_requested(&self) {
        self.stop_signal.notified().await;
    }
}

/// Open connections of one worker, keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<ConnectionHandle>>> {
        match self.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Creates a handle for a freshly accepted connection and tracks it.
    pub fn register(&self) -> Arc<ConnectionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnectionHandle::new(id));
        self.lock().insert(id, Arc::clone(&handle));
        handle
    }

    /// Stops tracking a closed connection. Unknown ids are ignored.
    pub fn discard(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Copies the current set so callers can iterate without the lock.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Calls [`ConnectionHandle::stop`] on every open connection.
    pub fn stop_all(&self) {
        for handle in self.snapshot() {
            handle.stop();
        }
    }
}
