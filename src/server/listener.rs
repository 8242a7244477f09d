//! Relay server listener
//!
//! Handles TCP accept loop and spawns connection handlers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::capture::CaptureLauncher;
use crate::error::Result;
use crate::registry::{RelayConfig, SessionRegistry};
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::stats::ServerStats;

/// Live counters shared with connection tasks
#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    pub(crate) total_connections: AtomicU64,
    pub(crate) active_connections: AtomicU64,
    pub(crate) rejected_connections: AtomicU64,
    pub(crate) units_sent: AtomicU64,
}

impl ServerCounters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            units_sent: self.units_sent.load(Ordering::Relaxed),
        }
    }
}

/// WebSocket relay server
///
/// Serves `/video/{device_id}`: each connection attaches to the device's
/// streaming session and receives its NAL units as binary messages.
pub struct RelayServer<L: CaptureLauncher> {
    config: ServerConfig,
    registry: Arc<SessionRegistry<L>>,
    next_connection_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    counters: Arc<ServerCounters>,
}

impl<L: CaptureLauncher> RelayServer<L> {
    /// Create a new server with the given configuration and launcher
    pub fn new(config: ServerConfig, launcher: L) -> Self {
        Self::with_relay_config(config, launcher, RelayConfig::default())
    }

    /// Create a new server with custom session configuration
    pub fn with_relay_config(config: ServerConfig, launcher: L, relay_config: RelayConfig) -> Self {
        Self::with_registry(
            config,
            Arc::new(SessionRegistry::with_config(launcher, relay_config)),
        )
    }

    /// Create a server over an existing registry
    pub fn with_registry(config: ServerConfig, registry: Arc<SessionRegistry<L>>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            registry,
            next_connection_id: AtomicU64::new(1),
            connection_semaphore,
            counters: Arc::new(ServerCounters::default()),
        }
    }

    /// Get a reference to the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry<L>> {
        &self.registry
    }

    /// Connection counters
    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_until(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` completes
    ///
    /// Every session is torn down before returning.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Relay server listening");

        // Spawn cleanup task for the session registry
        let cleanup_handle = self.registry.spawn_cleanup_task();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        cleanup_handle.abort();
        self.registry.shutdown().await;

        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit; the permit lives as long as the connection
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.counters
                        .rejected_connections
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            connection_id = connection_id,
            peer = %peer_addr,
            "New connection"
        );

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);
        let counters = Arc::clone(&self.counters);

        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let _permit = permit;
            let connection = Connection::new(
                connection_id,
                peer_addr,
                config,
                registry,
                Arc::clone(&counters),
            );

            if let Err(e) = connection.run(socket).await {
                tracing::debug!(
                    connection_id = connection_id,
                    error = %e,
                    "Connection error"
                );
            }

            counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(connection_id = connection_id, "Connection closed");
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}
