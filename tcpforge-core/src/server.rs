//! The listening server.
//!
//! [`Server`] owns the listener, the accept loop and everything the
//! connections share: the registry, the router and the lifecycle hooks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  TCP Listener   │
//! └────────┬────────┘
//!          │ accept
//!          ├──→ registry full? → close socket
//!          │
//!          └──→ Connection (registered)
//!                   │
//!                   ├──→ on_connect hook
//!                   │
//!                   ├──→ reader → Router → worker / task → Handler
//!                   │
//!                   ├──→ writer ← send / send_buffered
//!                   │
//!                   └──→ on_disconnect hook
//! ```
//!
//! # Examples
//!
//! ```no_run
//! use tcpforge_core::prelude::*;
//!
//! async fn chat(req: Request) -> Result<()> {
//!     let text = req.message().as_text().unwrap_or_default().to_string();
//!     req.conn().send(2, text).await
//! }
//!
//! # async fn example() -> Result<()> {
//! let server = Server::new(ServerConfig::default().with_bind("127.0.0.1", 8999));
//! server.add_route(2, handler_fn(chat));
//! server.set_on_connect(|conn| tracing::info!("hello {}", conn.id()));
//!
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```

use crate::codec::DataPack;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionContext, ConnectionId};
use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::registry::ConnectionRegistry;
use crate::router::{Handler, Router};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct ServerInner {
    config: ServerConfig,
    ctx: Arc<ConnectionContext>,
    next_conn_id: AtomicU32,
    started: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
}

/// A TCP server built on the length-prefixed frame protocol.
///
/// Cheap to clone; clones share the same listener, registry and routes.
/// Routes and hooks should be registered before [`start`](Self::start).
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Creates a server. Nothing is bound until [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Self {
        let ctx = Arc::new(ConnectionContext {
            registry: Arc::new(ConnectionRegistry::new()),
            router: Arc::new(Router::new(
                config.worker_pool_size,
                config.worker_queue_depth,
            )),
            hooks: Arc::new(Hooks::new()),
            pack: DataPack::new(config.max_packet_size),
            outbound_queue_depth: config.outbound_queue_depth,
        });

        Self {
            inner: Arc::new(ServerInner {
                config,
                ctx,
                next_conn_id: AtomicU32::new(0),
                started: AtomicBool::new(false),
                local_addr: OnceLock::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Returns the configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Returns the connection registry.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.inner.ctx.registry.clone()
    }

    /// Returns the router.
    pub fn router(&self) -> Arc<Router> {
        self.inner.ctx.router.clone()
    }

    /// Returns the bound address once [`start`](Self::start) has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Registers the handler for a message type. The last registration wins.
    pub fn add_route<H: Handler>(&self, msg_id: u32, handler: H) {
        self.inner.ctx.router.add_route(msg_id, handler);
    }

    /// Sets the hook run when a connection starts.
    ///
    /// The hook runs before any message from that connection is dispatched.
    pub fn set_on_connect<F>(&self, f: F)
    where
        F: Fn(Arc<Connection>) + Send + Sync + 'static,
    {
        self.inner.ctx.hooks.set_on_connect(f);
    }

    /// Sets the hook run once when a started connection stops.
    pub fn set_on_disconnect<F>(&self, f: F)
    where
        F: Fn(Arc<Connection>) + Send + Sync + 'static,
    {
        self.inner.ctx.hooks.set_on_disconnect(f);
    }

    /// Binds the listener, starts the worker pool and spawns the accept loop.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is 0.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the configuration is invalid or the server was
    ///   already started.
    /// - [`Error::Io`] if the address cannot be resolved or bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        let inner = &self.inner;
        inner.config.validate()?;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::config("server already started"));
        }

        let bind_addr = inner.config.bind_addr();
        let bound = match Self::bind(&bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)).map_err(Error::from),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!("[{}] failed to listen on {}: {}", inner.config.name, bind_addr, e);
                // A failed bind leaves the server startable again.
                inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let _ = inner.local_addr.set(local_addr);

        inner.ctx.router.start_worker_pool(inner.shutdown.clone());

        info!(
            "[{}] listening on {} (max connections {}, max packet {} bytes, {} workers)",
            inner.config.name,
            local_addr,
            inner.config.max_connections,
            inner.config.max_packet_size,
            inner.config.worker_pool_size
        );

        tokio::spawn(self.clone().accept_loop(listener));
        Ok(local_addr)
    }

    /// Stops accepting, stops the workers and closes every connection.
    ///
    /// Each connection runs its normal close path, including the
    /// `on_disconnect` hook.
    pub fn stop(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("[{}] stopping", self.inner.config.name);
        }
        self.inner.shutdown.cancel();
        self.inner.ctx.registry.clear_all();
    }

    /// Waits until [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Starts the server and runs until Ctrl-C or [`stop`](Self::stop).
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    self.stopped().await;
                } else {
                    info!("[{}] received Ctrl-C", self.inner.config.name);
                }
            }
            _ = self.stopped() => {}
        }

        self.stop();
        Ok(())
    }

    async fn bind(addr: &str) -> Result<TcpListener> {
        let mut last_err = None;
        for candidate in lookup_host(addr).await? {
            match TcpListener::bind(candidate).await {
                Ok(listener) => return Ok(listener),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => Error::Io(e),
            None => Error::config(format!("{} resolved to no addresses", addr)),
        })
    }

    async fn accept_loop(self, listener: TcpListener) {
        let inner = &self.inner;
        let shutdown = inner.shutdown.clone();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("[{}] accept failed: {}", inner.config.name, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            self.admit(stream, peer_addr);
        }

        info!("[{}] accept loop stopped", inner.config.name);
    }

    // Registers and starts an accepted socket, or drops it.
    fn admit(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let inner = &self.inner;

        // stop() may have drained the registry while this accept completed.
        if inner.shutdown.is_cancelled() {
            debug!("Dropping {} accepted during shutdown", peer_addr);
            return;
        }

        let max = inner.config.max_connections;
        if inner.ctx.registry.count() >= max {
            warn!(
                "Rejecting {}: {}",
                peer_addr,
                Error::AdmissionRejected { max }
            );
            return;
        }

        let Some(conn_id) = self.next_conn_id() else {
            warn!(
                "[{}] rejecting {}: connection ids exhausted",
                inner.config.name, peer_addr
            );
            return;
        };

        match Connection::new(conn_id, stream, inner.ctx.clone()) {
            Ok(conn) => {
                // Registered after stop() cancelled but before its drain finished.
                if inner.shutdown.is_cancelled() {
                    conn.stop();
                    return;
                }
                debug!("Accepted connection {} from {}", conn_id, peer_addr);
                tokio::spawn(async move { conn.start() });
            }
            Err(e) => warn!("Failed to set up connection from {}: {}", peer_addr, e),
        }
    }

    // Ids are never reused while the server runs, so allocation stops at u32::MAX.
    fn next_conn_id(&self) -> Option<ConnectionId> {
        self.inner
            .next_conn_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .ok()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.config.name)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.inner.ctx.registry.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig::default().with_bind("127.0.0.1", 0)
    }

    #[tokio::test]
    async fn test_start_returns_bound_addr() {
        let server = Server::new(local_config());
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        server.stop();
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let server = Server::new(local_config());
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(Error::Config(_))));
        server.stop();
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let server = Server::new(local_config().with_max_packet_size(0));
        assert!(matches!(server.start().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_io_error() {
        let first = Server::new(local_config());
        let addr = first.start().await.unwrap();

        let second = Server::new(local_config().with_bind("127.0.0.1", addr.port()));
        assert!(matches!(second.start().await, Err(Error::Io(_))));
        first.stop();
    }

    #[tokio::test]
    async fn test_serve_returns_after_stop() {
        let server = Server::new(local_config());
        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.serve().await }
        });

        while server.local_addr().is_none() {
            tokio::task::yield_now().await;
        }
        server.stop();

        let res = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_start_retries_after_bind_failure() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let server = Server::new(local_config().with_bind("127.0.0.1", port));
        assert!(matches!(server.start().await, Err(Error::Io(_))));

        drop(blocker);
        let addr = server.start().await.unwrap();
        assert_eq!(addr.port(), port);
        server.stop();
    }

    #[tokio::test]
    async fn test_accept_after_stop_is_dropped() {
        let server = Server::new(local_config());
        server.stop();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();
        server.admit(stream, peer_addr);

        assert_eq!(server.registry().count(), 0);
        drop(client);
    }

    #[tokio::test]
    async fn test_connection_ids_stop_at_max() {
        let server = Server::new(local_config());
        server.inner.next_conn_id.store(u32::MAX - 1, Ordering::SeqCst);

        assert_eq!(server.next_conn_id(), Some(u32::MAX - 1));
        assert_eq!(server.next_conn_id(), None);
        assert_eq!(server.next_conn_id(), None);
    }
}
