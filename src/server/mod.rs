//! Prefork HTTP/1.1 server.
//!
//! One binary plays two roles. Started normally it is the **supervisor**: it
//! spawns `workers` copies of itself and keeps that many alive until SIGTERM
//! or SIGINT. Started with [`WORKER_ENV`] set it is a **worker**: it binds its
//! own `SO_REUSEPORT` listener and serves connections on a single-threaded
//! Tokio runtime.
//!
//! ```text
//!  supervisor ── Necromancer thread (respawns dead workers)
//!     ├── worker ── event loop: accept → Connection tasks → handler tasks
//!     │          └─ Reaper thread (Date cache, idle and stuck connections)
//!     ├── worker
//!     └── …
//! ```

use std::io;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::Router;
use crate::config::{ConfigError, ServerConfig};

pub mod connection;
pub mod reaper;
pub mod registry;
pub mod supervisor;
pub mod worker;

pub use connection::{Connection, ConnectionSettings};
pub use reaper::{Reaper, ReaperHandle};
pub use registry::{ConnectionHandle, ConnectionRegistry, Status};
pub use supervisor::{
    ChildWorker, Necromancer, ProcessSpawner, ProcessSupervisor, Spawn, WORKER_ENV,
    WorkerProcess,
};
pub use worker::{Worker, bind_reuse_port};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The apodo HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use apodo::{Response, Router, Server, StatusCode};
/// use apodo::config::ServerConfig;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new();
///     router.get("/", |_ctx| async { Response::text(StatusCode::Ok, "Hello!") })?;
///
///     Server::new(router, ServerConfig::from_env()?).run()?;
///     Ok(())
/// }
/// ```
pub struct Server {
    router: Arc<Router>,
    config: ServerConfig,
}

impl Server {
    pub fn new(router: Router, config: ServerConfig) -> Self {
        Self {
            router: Arc::new(router),
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns `true` in processes spawned by the supervisor.
    pub fn is_worker_process() -> bool {
        std::env::var_os(WORKER_ENV).is_some()
    }

    /// Runs the role of the current process until shutdown.
    ///
    /// # Errors
    ///
    /// See [`Worker::run`] and [`supervise`](Self::supervise).
    pub fn run(self) -> Result<(), ServerError> {
        if Self::is_worker_process() {
            Worker::new(self.router, self.config).run()
        } else {
            let spawner = ProcessSpawner::current()?;
            self.supervise(spawner)
        }
    }

    /// Keeps a pool of workers created by `spawner` alive until SIGTERM or
    /// SIGINT, then terminates them and waits for them to exit.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the configured address does not resolve,
    /// [`ServerError::Spawn`] if the initial pool cannot be started.
    pub fn supervise<S: Spawn>(self, spawner: S) -> Result<(), ServerError> {
        let addr = self.config.addr();
        let resolved = addr
            .to_socket_addrs()
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?
            .count();
        if resolved == 0 {
            return Err(ServerError::Bind {
                addr,
                source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"),
            });
        }

        let mut supervisor = ProcessSupervisor::new(
            spawner,
            self.config.workers,
            self.config.necromancer_interval,
        );
        supervisor.start()?;
        info!(
            pid = std::process::id(),
            address = %addr,
            workers = self.config.workers,
            "supervisor started"
        );

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(shutdown_signal());

        info!("shutting down");
        supervisor.shutdown();
        Ok(())
    }
}

/// Resolves on the first SIGTERM or SIGINT.
pub(crate) async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
