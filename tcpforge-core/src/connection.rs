//! TCP connection actor.
//!
//! This module provides [`Connection`], the object that owns one accepted
//! socket for its whole life. A connection runs two concurrent tasks:
//!
//! - **Reader task**: reads frames with the [`DataPack`] codec, wraps each one
//!   in a [`Request`] and hands it to the [`Router`].
//! - **Writer task**: drains two outbound queues onto the socket.
//!
//! # Lifecycle
//!
//! ```text
//! Created --start()--> Running --stop()--> Closed
//! ```
//!
//! 1. The server constructs the connection, which registers itself in the
//!    [`ConnectionRegistry`] (`Created`).
//! 2. `start()` spawns the writer, runs the `on_connect` hook, then spawns the
//!    reader (`Running`). No message is dispatched before the hook returns.
//! 3. `stop()` runs once: it marks the connection `Closed`, runs the
//!    `on_disconnect` hook, cancels both tasks, deregisters the connection and
//!    drops the outbound queues. Further calls are no-ops. `on_disconnect`
//!    never starts before `on_connect` has returned.
//!
//! # Outbound queues
//!
//! - [`send`](Connection::send) is a synchronous handoff: it returns once the
//!   writer task has taken the frame.
//! - [`send_buffered`](Connection::send_buffered) enqueues onto a bounded
//!   queue and only waits while that queue is full.
//!
//! The writer picks from either queue with no priority between them.
//!
//! # Examples
//!
//! ```no_run
//! use tcpforge_core::prelude::*;
//!
//! # async fn example(conn: std::sync::Arc<Connection>) -> Result<()> {
//! conn.set_property("pid", 7);
//! let pid: i32 = conn.property("pid")?;
//!
//! conn.send(1, pid.to_le_bytes()).await?;
//! conn.send_buffered(200, b"position update").await?;
//! # Ok(())
//! # }
//! ```

use crate::codec::DataPack;
use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::message::Request;
use crate::property::{FromProperty, Properties, PropertyValue};
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process-unique connection identifier, assigned at accept time.
pub type ConnectionId = u32;

/// The lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed and registered, tasks not yet running.
    Created,
    /// Reader and writer tasks are running.
    Running,
    /// Stopped. Sends fail with [`Error::ConnectionClosed`].
    Closed,
}

/// Everything a connection needs from the server that created it.
pub(crate) struct ConnectionContext {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) router: Arc<Router>,
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) pack: DataPack,
    pub(crate) outbound_queue_depth: usize,
}

struct DirectFrame {
    frame: Bytes,
    delivered: oneshot::Sender<()>,
}

struct Outbound {
    direct: mpsc::Sender<DirectFrame>,
    buffered: mpsc::Sender<Bytes>,
}

struct Lifecycle {
    state: ConnectionState,
    outbound: Option<Outbound>,
    // Set while on_connect runs. A stop() in that window defers on_disconnect
    // to start(), after on_connect has returned.
    connecting: bool,
    disconnect_deferred: bool,
}

// Held between construction and start().
struct Pending {
    stream: TcpStream,
    direct_rx: mpsc::Receiver<DirectFrame>,
    buffered_rx: mpsc::Receiver<Bytes>,
}

/// An accepted client connection.
///
/// Always handled as `Arc<Connection>`: the reader and writer tasks, pending
/// requests and application code each hold a reference. The registry only
/// keeps a weak one.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    connected_at: SystemTime,
    lifecycle: RwLock<Lifecycle>,
    pending: Mutex<Option<Pending>>,
    properties: Properties,
    cancel: CancellationToken,
    ctx: Arc<ConnectionContext>,
}

impl Connection {
    /// Wraps an accepted socket and registers the connection.
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        ctx: Arc<ConnectionContext>,
    ) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on connection {}: {}", id, e);
        }

        let (direct_tx, direct_rx) = mpsc::channel(1);
        let (buffered_tx, buffered_rx) = mpsc::channel(ctx.outbound_queue_depth.max(1));

        let conn = Arc::new(Self {
            id,
            peer_addr,
            local_addr,
            connected_at: SystemTime::now(),
            lifecycle: RwLock::new(Lifecycle {
                state: ConnectionState::Created,
                outbound: Some(Outbound {
                    direct: direct_tx,
                    buffered: buffered_tx,
                }),
                connecting: false,
                disconnect_deferred: false,
            }),
            pending: Mutex::new(Some(Pending {
                stream,
                direct_rx,
                buffered_rx,
            })),
            properties: Properties::new(),
            cancel: CancellationToken::new(),
            ctx,
        });

        conn.ctx.registry.add(&conn);
        Ok(conn)
    }

    /// Returns the connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the client's socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Returns the local socket address the client connected to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the time the connection was accepted.
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.read_lifecycle().state
    }

    /// Returns `true` once [`stop`](Self::stop) has begun.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Waits until the connection's tasks have been told to shut down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Starts the reader and writer tasks and runs the `on_connect` hook.
    ///
    /// Only the first call on a `Created` connection has any effect. Must be
    /// called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let Some(pending) = self.lock_pending().take() else {
            debug!("Connection {} already started", self.id);
            return;
        };

        {
            let mut lifecycle = self.write_lifecycle();
            if lifecycle.state != ConnectionState::Created {
                debug!("Connection {} is {:?}, not starting", self.id, lifecycle.state);
                return;
            }
            lifecycle.state = ConnectionState::Running;
            lifecycle.connecting = true;
        }

        let Pending {
            stream,
            direct_rx,
            buffered_rx,
        } = pending;
        let (reader, writer) = stream.into_split();

        tokio::spawn(self.clone().write_loop(writer, direct_rx, buffered_rx));
        self.ctx.hooks.call_on_connect(self);

        let stopped_while_connecting = {
            let mut lifecycle = self.write_lifecycle();
            lifecycle.connecting = false;
            std::mem::take(&mut lifecycle.disconnect_deferred)
        };
        if stopped_while_connecting {
            self.ctx.hooks.call_on_disconnect(self);
            return;
        }

        tokio::spawn(self.clone().read_loop(reader));

        info!("Connection {} started from {}", self.id, self.peer_addr);
    }

    /// Stops the connection.
    ///
    /// The first call marks the connection closed, runs the `on_disconnect`
    /// hook (if the connection reached `Running`), closes the socket, cancels
    /// both tasks, removes the connection from the registry and drops the
    /// outbound queues. Later calls return immediately.
    ///
    /// If `on_connect` is still running, `on_disconnect` runs after it
    /// returns instead, on the task that called [`start`](Self::start).
    ///
    /// The hook may read properties; sends from inside it fail with
    /// [`Error::ConnectionClosed`].
    pub fn stop(self: &Arc<Self>) {
        let (fire_hook, outbound) = {
            let mut lifecycle = self.write_lifecycle();
            if lifecycle.state == ConnectionState::Closed {
                return;
            }
            let mut fire_hook = lifecycle.state == ConnectionState::Running;
            if fire_hook && lifecycle.connecting {
                lifecycle.disconnect_deferred = true;
                fire_hook = false;
            }
            lifecycle.state = ConnectionState::Closed;
            (fire_hook, lifecycle.outbound.take())
        };

        info!("Stopping connection {}", self.id);

        if fire_hook {
            self.ctx.hooks.call_on_disconnect(self);
        }

        // Only set when the connection never started.
        drop(self.lock_pending().take());
        self.cancel.cancel();
        self.ctx.registry.remove(self);
        drop(outbound);
    }

    /// Sends a frame and waits until the writer task has taken it.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is closed or closes
    ///   while waiting.
    /// - [`Error::OversizedMessage`] if the payload does not fit a frame.
    pub async fn send(&self, msg_id: u32, data: impl AsRef<[u8]>) -> Result<()> {
        let frame = self.ctx.pack.encode(msg_id, data.as_ref())?;
        let direct = self.outbound(|o| o.direct.clone())?;
        let (delivered, taken) = oneshot::channel();

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::ConnectionClosed(self.id)),
            res = direct.send(DirectFrame { frame, delivered }) => {
                res.map_err(|_| Error::ConnectionClosed(self.id))?;
            }
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::ConnectionClosed(self.id)),
            res = taken => res.map_err(|_| Error::ConnectionClosed(self.id)),
        }
    }

    /// Enqueues a frame on the buffered outbound queue.
    ///
    /// Waits only while the queue is at capacity.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn send_buffered(&self, msg_id: u32, data: impl AsRef<[u8]>) -> Result<()> {
        let frame = self.ctx.pack.encode(msg_id, data.as_ref())?;
        let buffered = self.outbound(|o| o.buffered.clone())?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::ConnectionClosed(self.id)),
            res = buffered.send(frame) => res.map_err(|_| Error::ConnectionClosed(self.id)),
        }
    }

    /// Enqueues a frame on the buffered queue without waiting.
    ///
    /// Usable from the synchronous lifecycle hooks.
    ///
    /// # Errors
    ///
    /// [`Error::QueueFull`] if the queue is at capacity, otherwise as
    /// [`send`](Self::send).
    pub fn try_send_buffered(&self, msg_id: u32, data: impl AsRef<[u8]>) -> Result<()> {
        let frame = self.ctx.pack.encode(msg_id, data.as_ref())?;
        let buffered = self.outbound(|o| o.buffered.clone())?;

        buffered.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull(self.id),
            TrySendError::Closed(_) => Error::ConnectionClosed(self.id),
        })
    }

    /// Stores a property on this connection.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.set(key, value);
    }

    /// Returns the raw value of a property.
    ///
    /// # Errors
    ///
    /// [`Error::PropertyNotFound`] if the key is absent.
    pub fn get_property(&self, key: &str) -> Result<PropertyValue> {
        self.properties.get_value(key)
    }

    /// Returns a property converted to `T`.
    ///
    /// # Errors
    ///
    /// [`Error::PropertyNotFound`] or [`Error::TypeMismatch`].
    pub fn property<T: FromProperty>(&self, key: &str) -> Result<T> {
        self.properties.get(key)
    }

    /// Removes a property, returning its value if it was set.
    pub fn delete_property(&self, key: &str) -> Option<PropertyValue> {
        self.properties.remove(key)
    }

    /// Returns the whole property bag.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        debug!("Reader started for connection {}", self.id);
        let pack = self.ctx.pack;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = pack.read_message(&mut reader) => result,
            };

            match result {
                Ok(message) => {
                    let request = Request::new(self.clone(), message);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.ctx.router.dispatch(request) => {}
                    }
                }
                Err(e) if e.is_disconnect() => {
                    info!("Connection {} closed by peer: {}", self.id, e);
                    break;
                }
                Err(e @ Error::OversizedMessage { .. }) => {
                    warn!(conn_id = self.id, "Dropping connection: {}", e);
                    break;
                }
                Err(e) => {
                    warn!(conn_id = self.id, "Failed to decode frame: {}", e);
                    break;
                }
            }
        }

        debug!("Reader ended for connection {}", self.id);
        self.stop();
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut direct_rx: mpsc::Receiver<DirectFrame>,
        mut buffered_rx: mpsc::Receiver<Bytes>,
    ) {
        debug!("Writer started for connection {}", self.id);

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(direct) = direct_rx.recv() => {
                    let _ = direct.delivered.send(());
                    direct.frame
                }
                Some(frame) = buffered_rx.recv() => frame,
                else => break,
            };

            let written = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = writer.write_all(&frame) => res,
            };
            if let Err(e) = written {
                warn!("Failed to write to connection {}: {}", self.id, e);
                break;
            }
        }

        // Unblocks the reader, whose exit path runs stop().
        self.cancel.cancel();
        let _ = writer.shutdown().await;
        debug!("Writer ended for connection {}", self.id);
    }

    fn outbound<T>(&self, f: impl FnOnce(&Outbound) -> T) -> Result<T> {
        let lifecycle = self.read_lifecycle();
        match &lifecycle.outbound {
            Some(outbound) if lifecycle.state != ConnectionState::Closed => Ok(f(outbound)),
            _ => Err(Error::ConnectionClosed(self.id)),
        }
    }

    fn read_lifecycle(&self) -> RwLockReadGuard<'_, Lifecycle> {
        self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lifecycle(&self) -> RwLockWriteGuard<'_, Lifecycle> {
        self.lifecycle.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
