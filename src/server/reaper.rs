//! Per-worker housekeeping thread.
//!
//! Once a second the Reaper refreshes the cached `Date` header. Every
//! `keep_alive_timeout` ticks it soft-stops connections that have been idle
//! for longer than that timeout, and every `worker_timeout` ticks it looks
//! for handlers that have run past the worker timeout. A stuck handler
//! cannot be cancelled from outside the event loop, so the whole worker is
//! killed and the supervisor replaces it.

use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::registry::{ConnectionRegistry, Status};
use crate::config::ServerLimits;
use crate::http::date::DateCache;

const TICK: Duration = Duration::from_secs(1);

/// Messages accepted by the Reaper thread.
#[derive(Debug)]
pub enum ReaperCommand {
    Stop,
}

type Terminator = Box<dyn Fn() + Send + 'static>;

pub struct Reaper {
    registry: Arc<ConnectionRegistry>,
    dates: DateCache,
    keep_alive_timeout: Duration,
    worker_timeout: Duration,
    terminate: Terminator,
    ticks: u64,
}

impl Reaper {
    pub fn new(registry: Arc<ConnectionRegistry>, dates: DateCache, limits: &ServerLimits) -> Self {
        Self {
            registry,
            dates,
            keep_alive_timeout: limits.keep_alive_timeout,
            worker_timeout: limits.worker_timeout,
            terminate: Box::new(kill_current_process),
            ticks: 0,
        }
    }

    /// Replaces what happens when a stuck handler is found.
    #[must_use]
    pub fn with_terminator(mut self, terminate: impl Fn() + Send + 'static) -> Self {
        self.terminate = Box::new(terminate);
        self
    }

    /// Stops every pending connection idle for longer than the keep-alive
    /// timeout. Returns how many were stopped.
    pub fn kill_idles(&self, now: Instant) -> usize {
        if self.keep_alive_timeout.is_zero() {
            return 0;
        }
        let mut stopped = 0;
        for handle in self.registry.snapshot() {
            if handle.status() == Status::Pending
                && !handle.is_closed()
                && handle.idle_for(now) > self.keep_alive_timeout
            {
                debug!(connection = handle.id(), "closing idle connection");
                handle.stop();
                stopped += 1;
            }
        }
        stopped
    }

    /// Returns `true` if some handler has run longer than the worker timeout.
    pub fn find_stuck(&self, now: Instant) -> bool {
        self.registry.snapshot().iter().any(|handle| {
            handle.status() == Status::Processing
                && !handle.is_closed()
                && handle.idle_for(now) > self.worker_timeout
        })
    }

    /// One iteration of the loop.
    pub fn tick(&mut self, now: Instant) {
        self.ticks += 1;
        self.dates.refresh();

        let keep_alive_every = self.keep_alive_timeout.as_secs().max(1);
        if self.ticks % keep_alive_every == 0 {
            let stopped = self.kill_idles(now);
            if stopped > 0 {
                warn!(count = stopped, "evicted idle connections");
            }
        }

        let worker_every = self.worker_timeout.as_secs().max(1);
        if self.ticks % worker_every == 0 && self.find_stuck(now) {
            error!(
                timeout_secs = self.worker_timeout.as_secs(),
                "handler exceeded worker timeout, terminating worker"
            );
            (self.terminate)();
        }
    }

    /// Runs the loop on a dedicated thread until [`ReaperHandle::stop`].
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn(mut self) -> io::Result<ReaperHandle> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("apodo-reaper".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(TICK) {
                        Ok(ReaperCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => self.tick(Instant::now()),
                    }
                }
                debug!("reaper stopped");
            })?;
        Ok(ReaperHandle {
            tx,
            thread: Some(thread),
        })
    }
}

/// Owner side of a running Reaper thread.
pub struct ReaperHandle {
    tx: mpsc::Sender<ReaperCommand>,
    thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Sends [`ReaperCommand::Stop`] and joins the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(ReaperCommand::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(unix)]
fn kill_current_process() {
    // SAFETY: `kill` and `getpid` have no memory-safety preconditions.
    unsafe {
        libc::kill(libc::getpid(), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_current_process() {
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limits(keep_alive: u64, worker: u64) -> ServerLimits {
        ServerLimits {
            keep_alive_timeout: Duration::from_secs(keep_alive),
            worker_timeout: Duration::from_secs(worker),
            ..ServerLimits::default()
        }
    }

    #[test]
    fn idle_pending_connection_is_stopped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let idle = registry.register();
        let fresh = registry.register();
        let busy = registry.register();
        let start = Instant::now();
        idle.touch_at(start);
        fresh.touch_at(start + Duration::from_secs(9));
        busy.touch_at(start);
        busy.set_status(Status::Receiving);

        let reaper = Reaper::new(Arc::clone(&registry), DateCache::new(), &limits(5, 60));
        assert_eq!(reaper.kill_idles(start + Duration::from_secs(10)), 1);
        assert!(idle.is_stopped());
        assert!(!fresh.is_stopped());
        assert!(!busy.is_stopped());
    }

    #[test]
    fn zero_keep_alive_timeout_disables_eviction() {
        let registry = Arc::new(ConnectionRegistry::new());
        let idle = registry.register();
        let start = Instant::now();
        idle.touch_at(start);
        let reaper = Reaper::new(Arc::clone(&registry), DateCache::new(), &limits(0, 60));
        assert_eq!(reaper.kill_idles(start + Duration::from_secs(3600)), 0);
        assert!(!idle.is_stopped());
    }

    #[test]
    fn processing_within_timeout_is_left_alone() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handle = registry.register();
        let start = Instant::now();
        handle.touch_at(start);
        handle.set_status(Status::Processing);

        let kills = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&kills);
        let mut reaper = Reaper::new(Arc::clone(&registry), DateCache::new(), &limits(30, 2))
            .with_terminator(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert!(!reaper.find_stuck(start + Duration::from_secs(1)));
        reaper.tick(start + Duration::from_secs(1));
        reaper.tick(start + Duration::from_secs(2));
        assert_eq!(kills.load(Ordering::SeqCst), 0);
        assert!(!handle.is_stopped());
    }

    #[test]
    fn stuck_handler_terminates_worker() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handle = registry.register();
        let start = Instant::now();
        handle.touch_at(start);
        handle.set_status(Status::Processing);

        let kills = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&kills);
        let mut reaper = Reaper::new(Arc::clone(&registry), DateCache::new(), &limits(30, 2))
            .with_terminator(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert!(reaper.find_stuck(start + Duration::from_secs(5)));
        // The check only runs every `worker_timeout` ticks.
        reaper.tick(start + Duration::from_secs(5));
        assert_eq!(kills.load(Ordering::SeqCst), 0);
        reaper.tick(start + Duration::from_secs(6));
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_connections_are_ignored() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handle = registry.register();
        let start = Instant::now();
        handle.touch_at(start);
        handle.set_status(Status::Processing);
        handle.mark_closed();
        let reaper = Reaper::new(Arc::clone(&registry), DateCache::new(), &limits(1, 1));
        assert!(!reaper.find_stuck(start + Duration::from_secs(100)));
    }

    #[test]
    fn thread_stops_on_command() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handle = Reaper::new(registry, DateCache::new(), &ServerLimits::default())
            .spawn()
            .unwrap();
        handle.stop();
    }
}
