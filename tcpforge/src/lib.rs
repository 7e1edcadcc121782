//! # TcpForge - Framed TCP Servers for Rust
//!
//! TcpForge is a small engine for game and service backends that speak a
//! length-prefixed binary protocol over TCP. It owns the sockets, the framing,
//! the connection lifecycle and dispatch; the application registers a handler
//! per message type and a pair of lifecycle hooks.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! tcpforge = "0.1.0"
//! tokio = { version = "1.40", features = ["full"] }
//! ```
//!
//! ```no_run
//! use tcpforge::prelude::*;
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
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let _log = logging::init(LogSink::Stderr, LogFormat::Compact)?;
//!
//!     let server = Server::new(ServerConfig::default().with_bind("127.0.0.1", 8999));
//!     server.add_route(0, Ping);
//!     server.set_on_connect(|conn| {
//!         println!("client {} from {}", conn.id(), conn.peer_addr());
//!     });
//!
//!     server.serve().await
//! }
//! ```
//!
//! ## Protocol
//!
//! Every frame is `[len: u32 LE][msg type: u32 LE][len bytes of payload]`.
//! Clients can use [`DataPack`] to build and parse frames.
//!
//! ## Dispatch
//!
//! With `workerPoolSize > 0` each connection is pinned to one worker and its
//! messages are handled in arrival order. With `workerPoolSize = 0` every
//! message runs on its own task with no ordering between them.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use tcpforge_core::*;

/// Re-exports everything needed to write a server.
pub mod prelude {
    pub use tcpforge_core::prelude::*;
}
