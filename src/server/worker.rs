//! One worker process: its own listener, event loop, registry and Reaper.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionSettings};
use super::reaper::Reaper;
use super::registry::ConnectionRegistry;
use super::{ServerError, shutdown_signal};
use crate::Router;
use crate::config::ServerConfig;

/// Pending-connection queue length for each worker's listener.
pub const BACKLOG: u32 = 1000;

const DRAIN_POLL: Duration = Duration::from_secs(1);

/// Binds `addr` with `SO_REUSEADDR` and, on Unix, `SO_REUSEPORT`, so every
/// worker can own a listener on the same port and let the kernel balance
/// accepts between them.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns the OS error from socket creation, option setting, bind or listen.
pub fn bind_reuse_port(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// Serves HTTP on one process.
pub struct Worker {
    router: Arc<Router>,
    config: ServerConfig,
}

impl Worker {
    pub fn new(router: Arc<Router>, config: ServerConfig) -> Self {
        Self { router, config }
    }

    /// Runs the worker on a single-threaded runtime until SIGTERM or SIGINT,
    /// then drains open connections.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the listener cannot be created, or
    /// [`ServerError::Io`] if the runtime or the Reaper thread cannot start.
    pub fn run(self) -> Result<(), ServerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async move {
            let addr = self.config.addr();
            let resolved = tokio::net::lookup_host(&addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: addr.clone(),
                    source,
                })?
                .next()
                .ok_or_else(|| ServerError::Bind {
                    addr: addr.clone(),
                    source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"),
                })?;
            let listener =
                bind_reuse_port(resolved).map_err(|source| ServerError::Bind { addr, source })?;
            self.serve_on(listener, shutdown_signal()).await
        })
    }

    /// Accepts connections from `listener` until `shutdown` resolves, then
    /// stops every connection and waits up to the drain timeout for them to
    /// close.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the Reaper thread cannot be spawned.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let settings = ConnectionSettings::new(self.router, &self.config);
        let reaper = Reaper::new(
            Arc::clone(&settings.registry),
            settings.dates.clone(),
            &self.config.limits,
        )
        .spawn()?;

        let local = listener.local_addr()?;
        info!(pid = std::process::id(), address = %local, "worker listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        debug!(peer = %peer, "connection accepted");
                        tokio::spawn(Connection::new(stream, settings.clone()).run());
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
            }
        }

        drop(listener);
        info!(
            pid = std::process::id(),
            open = settings.registry.len(),
            "worker shutting down"
        );
        drain(&settings.registry, self.config.limits.drain_timeout).await;
        reaper.stop();
        Ok(())
    }
}

// Stops every connection, then polls until they are gone or time runs out.
async fn drain(registry: &ConnectionRegistry, timeout: Duration) {
    registry.stop_all();
    let deadline = Instant::now() + timeout;
    loop {
        let open = registry.len();
        if open == 0 {
            return;
        }
        if Instant::now() >= deadline {
            warn!(open, "drain timeout elapsed with connections still open");
            return;
        }
        tokio::time::sleep(DRAIN_POLL.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Response, StatusCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn router() -> Arc<Router> {
        let mut router = Router::new();
        router
            .get("/", |_ctx| async { Response::text(StatusCode::Ok, "root") })
            .unwrap();
        Arc::new(router)
    }

    #[tokio::test]
    async fn two_listeners_share_a_port() {
        let first = bind_reuse_port("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        #[cfg(unix)]
        {
            let second = bind_reuse_port(addr).unwrap();
            assert_eq!(second.local_addr().unwrap(), addr);
        }
    }

    #[tokio::test]
    async fn serves_until_shutdown_then_drains() {
        let listener = bind_reuse_port("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let config = ServerConfig::default().with_drain_timeout(Duration::from_secs(2));

        let worker = tokio::spawn(Worker::new(router(), config).serve_on(listener, async {
            let _ = stop_rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").await.unwrap();
        let mut received: Vec<u8> = Vec::new();
        let mut buf = [0u8; 1024];
        while !received.ends_with(b"root") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            received.extend_from_slice(&buf[..n]);
        }
        assert!(received.starts_with(b"HTTP/1.1 200 OK\r\n"));

        stop_tx.send(()).unwrap();
        // The idle kept-alive connection is closed by the drain.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn drain_gives_up_after_timeout() {
        let registry = ConnectionRegistry::new();
        let _stuck = registry.register();
        let started = Instant::now();
        drain(&registry, Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(registry.len(), 1);
    }
}
