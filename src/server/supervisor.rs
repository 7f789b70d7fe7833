//! The supervisor process: a fixed-size pool of worker processes and the
//! Necromancer thread that keeps it full.
//!
//! Process creation sits behind the [`Spawn`] and [`WorkerProcess`] traits.
//! [`ProcessSpawner`] re-executes the current binary with [`WORKER_ENV`] set,
//! so the same `main` ends up calling [`Worker::run`](super::Worker::run) in
//! the child.

use std::env;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::ServerError;

/// Environment variable marking a process as a worker.
pub const WORKER_ENV: &str = "APODO_WORKER";

/// A running worker as seen by the supervisor.
pub trait WorkerProcess: Send + 'static {
    fn id(&self) -> u32;

    /// Returns `false` once the process has exited.
    fn is_alive(&mut self) -> bool;

    /// Asks the process to shut down gracefully.
    fn terminate(&mut self) -> io::Result<()>;

    /// Blocks until the process exits.
    fn wait(&mut self) -> io::Result<()>;
}

/// Creates worker processes.
pub trait Spawn: Send + Sync + 'static {
    type Worker: WorkerProcess;

    fn spawn(&self) -> io::Result<Self::Worker>;
}

/// Spawns workers by re-executing the current binary.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessSpawner {
    /// Uses the current executable and its arguments.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the executable path cannot be determined.
    pub fn current() -> io::Result<Self> {
        Ok(Self {
            program: env::current_exe()?,
            args: env::args_os().skip(1).collect(),
        })
    }

    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Spawn for ProcessSpawner {
    type Worker = ChildWorker;

    fn spawn(&self) -> io::Result<ChildWorker> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ENV, "1")
            .spawn()?;
        Ok(ChildWorker(child))
    }
}

/// A worker backed by an OS child process.
#[derive(Debug)]
pub struct ChildWorker(Child);

impl WorkerProcess for ChildWorker {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.0.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let pid = libc::pid_t::try_from(self.0.id())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: `kill` has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.0.kill()
    }

    fn wait(&mut self) -> io::Result<()> {
        self.0.wait().map(|_| ())
    }
}

type Pool<W> = Arc<Mutex<Vec<W>>>;

fn lock<W>(pool: &Mutex<Vec<W>>) -> MutexGuard<'_, Vec<W>> {
    match pool.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Replaces dead workers in place.
pub struct Necromancer<S: Spawn> {
    spawner: Arc<S>,
    workers: Pool<S::Worker>,
}

impl<S: Spawn> Necromancer<S> {
    /// Checks every slot once. Returns how many workers were replaced.
    ///
    /// A failed spawn leaves the dead worker in its slot, so it is retried
    /// on the next tick.
    pub fn tick(&self) -> usize {
        let mut replaced = 0;
        for slot in lock(&self.workers).iter_mut() {
            if slot.is_alive() {
                continue;
            }
            match self.spawner.spawn() {
                Ok(worker) => {
                    warn!(dead = slot.id(), replacement = worker.id(), "replaced dead worker");
                    *slot = worker;
                    replaced += 1;
                }
                Err(e) => error!(dead = slot.id(), error = %e, "failed to respawn worker"),
            }
        }
        replaced
    }

    fn spawn_thread(self, interval: Duration) -> io::Result<NecromancerHandle> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("apodo-necromancer".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(NecromancerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => {
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            self.tick();
                        }
                    }
                }
                debug!("necromancer stopped");
            })?;
        Ok(NecromancerHandle {
            tx,
            thread: Some(thread),
        })
    }
}

/// Messages accepted by the Necromancer thread.
#[derive(Debug)]
pub enum NecromancerCommand {
    Stop,
}

/// Owner side of a running Necromancer thread.
pub struct NecromancerHandle {
    tx: mpsc::Sender<NecromancerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl NecromancerHandle {
    /// Sends [`NecromancerCommand::Stop`] and joins the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(NecromancerCommand::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for NecromancerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Owns the worker pool.
pub struct ProcessSupervisor<S: Spawn> {
    spawner: Arc<S>,
    workers: Pool<S::Worker>,
    size: usize,
    interval: Duration,
    necromancer: Option<NecromancerHandle>,
}

impl<S: Spawn> ProcessSupervisor<S> {
    pub fn new(spawner: S, size: usize, interval: Duration) -> Self {
        Self {
            spawner: Arc::new(spawner),
            workers: Arc::new(Mutex::new(Vec::with_capacity(size))),
            size: size.max(1),
            interval,
            necromancer: None,
        }
    }

    /// Spawns the pool and starts the Necromancer.
    ///
    /// # Errors
    ///
    /// [`ServerError::Spawn`] if an initial worker cannot be created, in which
    /// case the workers already started are terminated.
    pub fn start(&mut self) -> Result<(), ServerError> {
        self.spawn_workers()?;
        self.necromancer = Some(self.necromancer().spawn_thread(self.interval)?);
        Ok(())
    }

    /// Fills the pool up to its configured size.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub fn spawn_workers(&mut self) -> Result<(), ServerError> {
        let mut workers = lock(&self.workers);
        while workers.len() < self.size {
            match self.spawner.spawn() {
                Ok(worker) => {
                    debug!(pid = worker.id(), "worker spawned");
                    workers.push(worker);
                }
                Err(e) => {
                    drop(workers);
                    self.stop_workers();
                    return Err(ServerError::Spawn(e));
                }
            }
        }
        info!(workers = workers.len(), "worker pool started");
        Ok(())
    }

    /// A Necromancer sharing this supervisor's pool.
    pub fn necromancer(&self) -> Necromancer<S> {
        Necromancer {
            spawner: Arc::clone(&self.spawner),
            workers: Arc::clone(&self.workers),
        }
    }

    /// Number of workers currently alive.
    pub fn alive(&self) -> usize {
        let mut alive = 0;
        for worker in lock(&self.workers).iter_mut() {
            if worker.is_alive() {
                alive += 1;
            }
        }
        alive
    }

    pub fn len(&self) -> usize {
        lock(&self.workers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.workers).is_empty()
    }

    /// Stops the Necromancer, asks every worker to terminate and waits for
    /// them to exit.
    pub fn shutdown(&mut self) {
        if let Some(necromancer) = self.necromancer.take() {
            necromancer.stop();
        }
        self.stop_workers();
        info!("worker pool stopped");
    }

    fn stop_workers(&self) {
        let mut workers = lock(&self.workers);
        for worker in workers.iter_mut() {
            if let Err(e) = worker.terminate() {
                debug!(pid = worker.id(), error = %e, "terminate failed");
            }
        }
        for mut worker in workers.drain(..) {
            if let Err(e) = worker.wait() {
                warn!(pid = worker.id(), error = %e, "failed to reap worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeWorker {
        id: u32,
        alive: Arc<AtomicBool>,
    }

    impl WorkerProcess for FakeWorker {
        fn id(&self) -> u32 {
            self.id
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn wait(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSpawner {
        spawned: AtomicU32,
        failing: AtomicBool,
        handles: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FakeSpawner {
        // Kills the worker spawned `index`-th.
        fn kill(&self, index: usize) {
            self.handles.lock().unwrap()[index].store(false, Ordering::SeqCst);
        }
    }

    impl Spawn for Arc<FakeSpawner> {
        type Worker = FakeWorker;

        fn spawn(&self) -> io::Result<FakeWorker> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(io::Error::other("spawn refused"));
            }
            let id = self.spawned.fetch_add(1, Ordering::SeqCst);
            let alive = Arc::new(AtomicBool::new(true));
            self.handles.lock().unwrap().push(Arc::clone(&alive));
            Ok(FakeWorker { id, alive })
        }
    }

    #[test]
    fn necromancer_replaces_dead_worker() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut supervisor =
            ProcessSupervisor::new(Arc::clone(&spawner), 4, Duration::from_secs(5));
        supervisor.spawn_workers().unwrap();
        assert_eq!(supervisor.alive(), 4);

        spawner.kill(2);
        assert_eq!(supervisor.alive(), 3);

        assert_eq!(supervisor.necromancer().tick(), 1);
        assert_eq!(supervisor.alive(), 4);
        assert_eq!(supervisor.len(), 4);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn failed_respawn_is_retried() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut supervisor =
            ProcessSupervisor::new(Arc::clone(&spawner), 2, Duration::from_secs(5));
        supervisor.spawn_workers().unwrap();
        spawner.kill(0);

        spawner.failing.store(true, Ordering::SeqCst);
        let necromancer = supervisor.necromancer();
        assert_eq!(necromancer.tick(), 0);
        assert_eq!(supervisor.alive(), 1);

        spawner.failing.store(false, Ordering::SeqCst);
        assert_eq!(necromancer.tick(), 1);
        assert_eq!(supervisor.alive(), 2);
    }

    #[test]
    fn initial_spawn_failure_is_reported() {
        let spawner = Arc::new(FakeSpawner::default());
        spawner.failing.store(true, Ordering::SeqCst);
        let mut supervisor = ProcessSupervisor::new(spawner, 3, Duration::from_secs(5));
        assert!(matches!(supervisor.spawn_workers(), Err(ServerError::Spawn(_))));
        assert!(supervisor.is_empty());
    }

    #[test]
    fn necromancer_thread_keeps_pool_full() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut supervisor =
            ProcessSupervisor::new(Arc::clone(&spawner), 3, Duration::from_millis(10));
        supervisor.start().unwrap();

        spawner.kill(0);
        spawner.kill(1);
        let mut waited = Duration::ZERO;
        while supervisor.alive() < 3 && waited < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        assert_eq!(supervisor.alive(), 3);

        supervisor.shutdown();
        assert!(supervisor.is_empty());
    }

    #[test]
    fn shutdown_terminates_every_worker() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut supervisor =
            ProcessSupervisor::new(Arc::clone(&spawner), 2, Duration::from_secs(5));
        supervisor.spawn_workers().unwrap();
        supervisor.shutdown();
        let handles = spawner.handles.lock().unwrap();
        assert!(handles.iter().all(|alive| !alive.load(Ordering::SeqCst)));
    }
}
