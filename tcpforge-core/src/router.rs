//! Message routing and the dispatch worker pool.
//!
//! The [`Router`] maps a message type identifier to the [`Handler`] that
//! processes it, and decides where each inbound [`Request`] runs.
//!
//! # Dispatch modes
//!
//! ```text
//!                        ┌──────────────────────┐
//!   reader loop ──────→  │  Router::dispatch    │
//!                        └──────────┬───────────┘
//!                                   │
//!          pool size 0 ─────────────┼───────────── pool size N
//!               │                                      │
//!      tokio::spawn per request           worker[conn_id % N] queue
//!      (no ordering)                      (bounded, in order per connection)
//!               │                                      │
//!               └────→ pre_handle → handle → post_handle ←┘
//! ```
//!
//! With the pool enabled every request from one connection lands on the same
//! worker, so a connection's messages are handled in the order they arrived.
//! Enqueueing blocks while that worker's queue is full, which slows the
//! reader of every connection mapped to it.
//!
//! A panic anywhere in a handler chain is caught at the dispatch boundary
//! and the request is abandoned. The log line carries the panic location and
//! a backtrace taken at the panic site. The worker keeps running.
//!
//! # Examples
//!
//! ```
//! use tcpforge_core::prelude::*;
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Handler for Ping {
//!     async fn handle(&self, req: &Request) -> Result<()> {
//!         req.conn().send(1, b"pong").await
//!     }
//! }
//!
//! async fn chat(req: Request) -> Result<()> {
//!     tracing::info!("chat from {}: {:?}", req.conn_id(), req.message().as_text());
//!     Ok(())
//! }
//!
//! let router = Router::new(0, 1);
//! router.add_route(1, Ping);
//! router.add_route(2, handler_fn(chat));
//! assert_eq!(router.route_count(), 2);
//! ```

use crate::error::{Error, Result};
use crate::message::Request;
use crate::panic_trace::{self, PanicTrace};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Processes requests of one message type.
///
/// All three stages default to doing nothing, so an implementation only
/// overrides the ones it needs. Stages run in order; an error from one stage
/// is logged and skips the stages after it.
///
/// # Examples
///
/// ```
/// use tcpforge_core::prelude::*;
///
/// struct Move;
///
/// #[async_trait]
/// impl Handler for Move {
///     async fn pre_handle(&self, req: &Request) -> Result<()> {
///         if req.data().len() != 16 {
///             return Err(Error::custom("move payload must be 16 bytes"));
///         }
///         Ok(())
///     }
///
///     async fn handle(&self, req: &Request) -> Result<()> {
///         let pid: i32 = req.conn().property("pid")?;
///         tracing::debug!("player {} moved", pid);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Runs before [`handle`](Self::handle).
    async fn pre_handle(&self, _req: &Request) -> Result<()> {
        Ok(())
    }

    /// Processes the request.
    async fn handle(&self, _req: &Request) -> Result<()> {
        Ok(())
    }

    /// Runs after [`handle`](Self::handle).
    async fn post_handle(&self, _req: &Request) -> Result<()> {
        Ok(())
    }
}

/// A [`Handler`] backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, req: &Request) -> Result<()> {
        (self.f)(req.clone()).await
    }
}

/// Wraps an async closure as a [`Handler`] whose `handle` stage calls it.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler { f }
}

/// Message type to handler table plus the dispatch policy.
pub struct Router {
    routes: DashMap<u32, Arc<dyn Handler>>,
    pool_size: usize,
    queue_depth: usize,
    workers: OnceLock<Vec<mpsc::Sender<Request>>>,
}

impl Router {
    /// Creates a router.
    ///
    /// A `pool_size` of 0 dispatches every request on its own task. Otherwise
    /// [`start_worker_pool`](Self::start_worker_pool) starts `pool_size`
    /// workers, each with a queue of `queue_depth` requests.
    pub fn new(pool_size: usize, queue_depth: usize) -> Self {
        panic_trace::install();
        Self {
            routes: DashMap::new(),
            pool_size,
            queue_depth: queue_depth.max(1),
            workers: OnceLock::new(),
        }
    }

    /// Registers the handler for a message type.
    ///
    /// Registering a second handler for the same type replaces the first.
    pub fn add_route<H: Handler>(&self, msg_id: u32, handler: H) {
        if self.routes.insert(msg_id, Arc::new(handler)).is_some() {
            warn!("Route for message type {} replaced", msg_id);
        } else {
            debug!("Route added for message type {}", msg_id);
        }
    }

    /// Returns `true` if a handler is registered for `msg_id`.
    pub fn has_route(&self, msg_id: u32) -> bool {
        self.routes.contains_key(&msg_id)
    }

    /// Returns the number of registered routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Returns the configured worker count. 0 means inline dispatch.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns `true` once the worker pool is running.
    pub fn is_pooled(&self) -> bool {
        self.workers.get().is_some()
    }

    /// Spawns the worker tasks. Workers exit when `shutdown` is cancelled.
    ///
    /// Does nothing if the pool size is 0 or the pool is already running.
    pub fn start_worker_pool(self: &Arc<Self>, shutdown: CancellationToken) {
        if self.pool_size == 0 || self.workers.get().is_some() {
            return;
        }

        let mut senders = Vec::with_capacity(self.pool_size);
        let mut receivers = Vec::with_capacity(self.pool_size);
        for _ in 0..self.pool_size {
            let (tx, rx) = mpsc::channel(self.queue_depth);
            senders.push(tx);
            receivers.push(rx);
        }

        if self.workers.set(senders).is_err() {
            return;
        }

        for (worker_id, rx) in receivers.into_iter().enumerate() {
            tokio::spawn(self.clone().run_worker(worker_id, rx, shutdown.clone()));
        }

        info!(
            "Worker pool started: {} workers, queue depth {}",
            self.pool_size, self.queue_depth
        );
    }

    /// Hands a request to its worker, or to a fresh task without a pool.
    ///
    /// With the pool running this waits while the chosen worker's queue is
    /// full.
    pub async fn dispatch(self: &Arc<Self>, req: Request) {
        let Some(workers) = self.workers.get() else {
            let router = self.clone();
            tokio::spawn(async move {
                router.run_logged(req).await;
            });
            return;
        };

        let worker_id = req.conn_id() as usize % workers.len();
        if let Err(e) = workers[worker_id].send(req).await {
            debug!(
                "Worker {} stopped, dropping message type {} from connection {}",
                worker_id,
                e.0.msg_id(),
                e.0.conn_id()
            );
        }
    }

    /// Runs the handler chain for `req` on the current task.
    ///
    /// A request whose type has no route is dropped and `Ok` is returned.
    ///
    /// # Errors
    ///
    /// - [`Error::HandlerPanic`] if any stage panicked.
    /// - Whatever error the failing stage returned.
    pub async fn handle(&self, req: Request) -> Result<()> {
        self.run_chain(req).await.0
    }

    // The trace is only set when the chain panicked.
    async fn run_chain(&self, req: Request) -> (Result<()>, Option<PanicTrace>) {
        let msg_id = req.msg_id();
        let Some(handler) = self.routes.get(&msg_id).map(|h| h.value().clone()) else {
            debug!(
                "No route for message type {} from connection {}",
                msg_id,
                req.conn_id()
            );
            return (Ok(()), None);
        };

        let chain = panic_trace::traced(async {
            handler.pre_handle(&req).await?;
            handler.handle(&req).await?;
            handler.post_handle(&req).await
        });

        match AssertUnwindSafe(chain).catch_unwind().await {
            Ok(result) => (result, None),
            Err(payload) => {
                let err = Error::HandlerPanic {
                    msg_id,
                    message: panic_message(payload.as_ref()),
                };
                (Err(err), panic_trace::take())
            }
        }
    }

    async fn run_logged(&self, req: Request) {
        let conn_id = req.conn_id();
        match self.run_chain(req).await {
            (Ok(()), _) => {}
            (Err(e @ Error::HandlerPanic { .. }), Some(trace)) => {
                error!(
                    "Handler panicked for connection {} at {}: {}\n{}",
                    conn_id,
                    trace.location.as_deref().unwrap_or("unknown location"),
                    e,
                    trace.backtrace
                );
            }
            (Err(e @ Error::HandlerPanic { .. }), None) => {
                error!("Handler panicked for connection {}: {}", conn_id, e);
            }
            (Err(e), _) => {
                warn!("Handler error for connection {}: {}", conn_id, e);
            }
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        worker_id: usize,
        mut rx: mpsc::Receiver<Request>,
        shutdown: CancellationToken,
    ) {
        debug!("Worker {} started", worker_id);
        loop {
            let req = tokio::select! {
                _ = shutdown.cancelled() => break,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };
            self.run_logged(req).await;
        }
        debug!("Worker {} stopped", worker_id);
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .field("pool_size", &self.pool_size)
            .field("queue_depth", &self.queue_depth)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

/// Extracts the text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::connection::tests::{socket_pair, test_context};
    use crate::hooks::Hooks;
    use crate::message::Message;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recording {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Handler for Recording {
        async fn pre_handle(&self, _req: &Request) -> Result<()> {
            self.log.lock().unwrap().push("pre");
            Ok(())
        }

        async fn handle(&self, _req: &Request) -> Result<()> {
            self.log.lock().unwrap().push("handle");
            Ok(())
        }

        async fn post_handle(&self, _req: &Request) -> Result<()> {
            self.log.lock().unwrap().push("post");
            Ok(())
        }
    }

    struct Rejecting {
        handled: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Handler for Rejecting {
        async fn pre_handle(&self, _req: &Request) -> Result<()> {
            Err(Error::custom("rejected"))
        }

        async fn handle(&self, _req: &Request) -> Result<()> {
            *self.handled.lock().unwrap() = true;
            Ok(())
        }
    }

    async fn boom(_req: Request) -> Result<()> {
        panic!("boom")
    }

    async fn request(msg_id: u32) -> (Request, tokio::net::TcpStream) {
        let ctx = test_context(Arc::new(Hooks::new()), 4);
        let (server, client) = socket_pair().await;
        let conn = Connection::new(1, server, ctx).unwrap();
        (Request::new(conn, Message::new(msg_id, "payload")), client)
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new(0, 1);
        router.add_route(5, Recording { log: log.clone() });

        let (req, _client) = request(5).await;
        router.handle(req).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["pre", "handle", "post"]);
    }

    #[tokio::test]
    async fn test_unrouted_message_is_dropped() {
        let router = Router::new(0, 1);
        let (req, _client) = request(99).await;
        assert!(router.handle(req).await.is_ok());
    }

    #[tokio::test]
    async fn test_last_route_wins() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new(0, 1);
        router.add_route(1, Recording { log: first.clone() });
        router.add_route(1, Recording { log: second.clone() });
        assert_eq!(router.route_count(), 1);

        let (req, _client) = request(1).await;
        router.handle(req).await.unwrap();

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stage_error_skips_rest() {
        let handled = Arc::new(Mutex::new(false));
        let router = Router::new(0, 1);
        router.add_route(1, Rejecting { handled: handled.clone() });

        let (req, _client) = request(1).await;
        let err = router.handle(req).await.unwrap_err();

        assert!(matches!(err, Error::Custom(_)));
        assert!(!*handled.lock().unwrap());
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let router = Router::new(0, 1);
        router.add_route(1, handler_fn(boom));

        let (req, _client) = request(1).await;
        let err = router.handle(req).await.unwrap_err();
        assert!(matches!(
            err,
            Error::HandlerPanic { msg_id: 1, ref message } if message == "boom"
        ));
    }

    #[tokio::test]
    async fn test_pooled_dispatch_survives_panic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router::new(2, 8));
        router.add_route(1, handler_fn(boom));
        router.add_route(
            2,
            handler_fn(move |req: Request| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(req.msg_id());
                    Ok::<(), Error>(())
                }
            }),
        );

        let shutdown = CancellationToken::new();
        router.start_worker_pool(shutdown.clone());
        assert!(router.is_pooled());

        let (panicking, _c1) = request(1).await;
        let (ok, _c2) = request(2).await;
        router.dispatch(panicking).await;
        router.dispatch(ok).await;

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(2));
        shutdown.cancel();
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[inline(never)]
    fn reject_teleport() {
        panic!("teleport rejected");
    }

    async fn teleport(_req: Request) -> Result<()> {
        reject_teleport();
        Ok(())
    }

    #[tokio::test]
    async fn test_panic_log_names_panic_site() {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let router = Router::new(0, 1);
        router.add_route(4, handler_fn(teleport));
        let (req, _client) = request(4).await;
        router.run_logged(req).await;

        let logged = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("teleport rejected"), "{}", logged);
        assert!(logged.contains("router.rs"), "{}", logged);
        assert!(logged.contains("reject_teleport"), "{}", logged);
    }

    #[test]
    fn test_panic_message() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(s.as_ref()), "non-string panic payload");
    }
}
