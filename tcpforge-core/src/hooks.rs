//! Connection lifecycle hooks.
//!
//! The application registers an `on_connect` and an `on_disconnect` callback
//! on the [`Server`](crate::server::Server). Both receive the connection by
//! `Arc` so they can stash it, read its properties, or spawn tasks that send
//! through it.

use crate::connection::Connection;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::error;

/// Callback invoked on a connection lifecycle transition.
pub type ConnectionHook = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

/// The pair of lifecycle hooks shared by every connection of a server.
#[derive(Default)]
pub struct Hooks {
    on_connect: RwLock<Option<ConnectionHook>>,
    on_disconnect: RwLock<Option<ConnectionHook>>,
}

impl Hooks {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the on-connect hook.
    pub fn set_on_connect<F>(&self, f: F)
    where
        F: Fn(Arc<Connection>) + Send + Sync + 'static,
    {
        *self.on_connect.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(f));
    }

    /// Replaces the on-disconnect hook.
    pub fn set_on_disconnect<F>(&self, f: F)
    where
        F: Fn(Arc<Connection>) + Send + Sync + 'static,
    {
        *self.on_disconnect.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(f));
    }

    pub(crate) fn call_on_connect(&self, conn: &Arc<Connection>) {
        let hook = self.on_connect.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            Self::invoke("on_connect", &hook, conn);
        }
    }

    pub(crate) fn call_on_disconnect(&self, conn: &Arc<Connection>) {
        let hook = self.on_disconnect.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            Self::invoke("on_disconnect", &hook, conn);
        }
    }

    // Runs with no engine lock held. A panicking hook is logged and swallowed.
    fn invoke(name: &str, hook: &ConnectionHook, conn: &Arc<Connection>) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(conn.clone()))) {
            error!(
                "{} hook panicked for connection {}: {}",
                name,
                conn.id(),
                crate::router::panic_message(payload.as_ref())
            );
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = |slot: &RwLock<Option<ConnectionHook>>| {
            slot.read().unwrap_or_else(PoisonError::into_inner).is_some()
        };
        f.debug_struct("Hooks")
            .field("on_connect", &set(&self.on_connect))
            .field("on_disconnect", &set(&self.on_disconnect))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{socket_pair, test_context};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_unset_hooks_are_noops() {
        let hooks = Arc::new(Hooks::new());
        let ctx = test_context(hooks.clone(), 4);
        let (server, _client) = socket_pair().await;
        let conn = Connection::new(1, server, ctx).unwrap();

        hooks.call_on_connect(&conn);
        hooks.call_on_disconnect(&conn);
    }

    #[tokio::test]
    async fn test_panicking_hook_is_contained() {
        let hooks = Arc::new(Hooks::new());
        hooks.set_on_connect(|_| panic!("hook failure"));
        let ctx = test_context(hooks.clone(), 4);
        let (server, _client) = socket_pair().await;
        let conn = Connection::new(1, server, ctx).unwrap();

        hooks.call_on_connect(&conn);
    }

    #[tokio::test]
    async fn test_replacing_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = Arc::new(Hooks::new());
        hooks.set_on_disconnect(|_| panic!("replaced hook ran"));
        let c = calls.clone();
        hooks.set_on_disconnect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let ctx = test_context(hooks.clone(), 4);
        let (server, _client) = socket_pair().await;
        let conn = Connection::new(1, server, ctx).unwrap();
        hooks.call_on_disconnect(&conn);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
