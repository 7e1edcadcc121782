//! The server-wide table of live connections.
//!
//! Connections add themselves on construction and remove themselves when
//! they stop. The registry holds weak references only, so it never keeps a
//! stopped connection alive.

use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info, warn};

/// Thread-safe map from [`ConnectionId`] to live [`Connection`].
///
/// # Examples
///
/// ```no_run
/// use tcpforge_core::prelude::*;
///
/// # async fn example(server: Server) -> Result<()> {
/// let registry = server.registry();
/// println!("{} players online", registry.count());
///
/// registry.broadcast(257, b"server restarting").await;
///
/// if let Ok(conn) = registry.get(3) {
///     conn.send(1, b"just you").await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Weak<Connection>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection and returns the new count.
    pub fn add(&self, conn: &Arc<Connection>) -> usize {
        let mut map = self.write();
        map.insert(conn.id(), Arc::downgrade(conn));
        let count = map.len();
        debug!("Connection {} registered, {} total", conn.id(), count);
        count
    }

    /// Removes a connection. Removing an absent connection does nothing.
    pub fn remove(&self, conn: &Connection) {
        let mut map = self.write();
        // Only drop the entry if it still belongs to this connection.
        let owned = map
            .get(&conn.id())
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), conn));
        if owned {
            map.remove(&conn.id());
            debug!("Connection {} removed, {} remaining", conn.id(), map.len());
        }
    }

    /// Looks up a live connection.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionNotFound`] if no live connection has this id.
    pub fn get(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        self.read()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or(Error::ConnectionNotFound(id))
    }

    /// Returns the number of registered connections.
    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Returns the ids of every registered connection, in no particular order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.read().keys().copied().collect()
    }

    /// Returns every live connection, in no particular order.
    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.read().values().filter_map(Weak::upgrade).collect()
    }

    /// Stops every registered connection and empties the registry.
    ///
    /// Each connection goes through its normal close path, including the
    /// `on_disconnect` hook. The map is drained before any connection is
    /// stopped, so no lock is held while hooks run.
    pub fn clear_all(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut map = self.write();
            map.drain().filter_map(|(_, weak)| weak.upgrade()).collect()
        };

        if !drained.is_empty() {
            info!("Closing {} connections", drained.len());
        }
        for conn in drained {
            conn.stop();
        }
    }

    /// Queues a frame on every live connection's buffered path.
    ///
    /// Per-connection failures are logged and do not stop the broadcast.
    pub async fn broadcast(&self, msg_id: u32, data: impl AsRef<[u8]>) {
        self.broadcast_filtered(msg_id, data.as_ref(), None).await
    }

    /// Like [`broadcast`](Self::broadcast), skipping one connection.
    pub async fn broadcast_except(&self, except: ConnectionId, msg_id: u32, data: impl AsRef<[u8]>) {
        self.broadcast_filtered(msg_id, data.as_ref(), Some(except))
            .await
    }

    async fn broadcast_filtered(&self, msg_id: u32, data: &[u8], except: Option<ConnectionId>) {
        for conn in self.all_connections() {
            if Some(conn.id()) == except {
                continue;
            }
            if let Err(e) = conn.send_buffered(msg_id, data).await {
                warn!("Failed to broadcast to {}: {}", conn.id(), e);
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Weak<Connection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Weak<Connection>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataPack;
    use crate::connection::tests::{socket_pair, test_context};
    use crate::hooks::Hooks;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn read_frame(client: &mut tokio::net::TcpStream) -> crate::message::Message {
        let pack = DataPack::new(4096);
        tokio::time::timeout(Duration::from_secs(5), pack.read_message(client))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_missing() {
        let registry = ConnectionRegistry::new();
        assert!(matches!(registry.get(5), Err(Error::ConnectionNotFound(5))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let ctx = test_context(Arc::new(Hooks::new()), 4);
        let (a, _ca) = socket_pair().await;
        let (b, _cb) = socket_pair().await;
        let a = Connection::new(1, a, ctx.clone()).unwrap();
        let b = Connection::new(2, b, ctx.clone()).unwrap();
        let registry = &ctx.registry;

        assert_eq!(registry.count(), 2);
        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        registry.remove(&a);
        registry.remove(&a);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(2).unwrap().id(), b.id());
    }

    #[tokio::test]
    async fn test_clear_all_stops_everything() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let hooks = Arc::new(Hooks::new());
        let s = stopped.clone();
        // Re-entering the registry from the hook must not deadlock.
        let registry_slot = Arc::new(std::sync::Mutex::new(None::<Arc<ConnectionRegistry>>));
        let slot = registry_slot.clone();
        hooks.set_on_disconnect(move |_conn| {
            if let Some(registry) = slot.lock().unwrap().as_ref() {
                let _ = registry.count();
            }
            s.fetch_add(1, Ordering::SeqCst);
        });

        let ctx = test_context(hooks, 4);
        *registry_slot.lock().unwrap() = Some(ctx.registry.clone());

        let mut clients = Vec::new();
        let mut conns = Vec::new();
        for id in 1..=3 {
            let (server, client) = socket_pair().await;
            let conn = Connection::new(id, server, ctx.clone()).unwrap();
            conn.start();
            conns.push(conn);
            clients.push(client);
        }

        ctx.registry.clear_all();

        assert_eq!(stopped.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.registry.count(), 0);
        assert!(conns.iter().all(|c| c.is_closed()));
    }

    #[tokio::test]
    async fn test_broadcast_except() {
        let ctx = test_context(Arc::new(Hooks::new()), 4);
        let (a, mut client_a) = socket_pair().await;
        let (b, mut client_b) = socket_pair().await;
        let a = Connection::new(1, a, ctx.clone()).unwrap();
        let b = Connection::new(2, b, ctx.clone()).unwrap();
        a.start();
        b.start();

        ctx.registry.broadcast_except(1, 200, b"moved").await;
        ctx.registry.broadcast(257, b"hello").await;

        let first_b = read_frame(&mut client_b).await;
        assert_eq!(first_b.id(), 200);
        let second_b = read_frame(&mut client_b).await;
        assert_eq!(second_b.id(), 257);

        let only_a = read_frame(&mut client_a).await;
        assert_eq!(only_a.id(), 257);
        assert_eq!(only_a.data(), b"hello");
    }
}
