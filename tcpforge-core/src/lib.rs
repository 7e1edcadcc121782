//! # TcpForge Core - Framed TCP Server Engine
//!
//! `tcpforge-core` accepts TCP clients, frames a small binary protocol on the
//! wire and dispatches each decoded message to the handler registered for its
//! message type, either on its own task or through a bounded worker pool.
//!
//! ## Key Features
//!
//! - **Length-prefixed frames**: 8-byte little-endian header, bounded payloads
//! - **Per-connection actor**: one reader task, one writer task, two outbound queues
//! - **Ordered worker pool**: messages from one connection are handled in order
//! - **Lifecycle hooks**: `on_connect` and `on_disconnect`, each run exactly once
//! - **Property bag**: typed per-connection application state
//! - **Panic isolation**: a panicking handler only loses its own request
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Application                           │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │  Handlers  │  │  Hooks       │  │  Connection props    │  │
//! │  └────────────┘  └──────────────┘  └──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      TcpForge Core                           │
//! │  ┌──────────┐  ┌────────────┐  ┌──────────┐  ┌───────────┐   │
//! │  │  Server  │  │ Connection │  │  Router  │  │  DataPack │   │
//! │  │          │  │  Registry  │  │ + Workers│  │   codec   │   │
//! │  └──────────┘  └────────────┘  └──────────┘  └───────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tcpforge_core::prelude::*;
//!
//! async fn echo(req: Request) -> Result<()> {
//!     req.conn().send(req.msg_id(), req.data()).await
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let _log = logging::init(LogSink::Stderr, LogFormat::Full)?;
//!
//!     let server = Server::new(ServerConfig::default());
//!     server.add_route(1, handler_fn(echo));
//!     server.serve().await
//! }
//! ```
//!
//! ## Wire Format
//!
//! ```text
//! | payload len: u32 LE | message type: u32 LE | payload |
//! ```
//!
//! Frames whose declared payload exceeds `maxPacketSize` close the
//! connection before the payload is read.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod message;
mod panic_trace;
pub mod property;
pub mod registry;
pub mod router;
pub mod server;

pub use codec::{DataPack, FrameHeader, HEADER_LEN};
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{Error, Result};
pub use hooks::{ConnectionHook, Hooks};
pub use message::{Message, Request};
pub use property::{FromProperty, Properties, PropertyValue};
pub use registry::ConnectionRegistry;
pub use router::{FnHandler, Handler, Router, handler_fn};
pub use server::Server;

/// Commonly used types, traits and functions.
///
/// ```
/// use tcpforge_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::codec::DataPack;
    pub use crate::config::ServerConfig;
    pub use crate::connection::{Connection, ConnectionId, ConnectionState};
    pub use crate::error::{Error, Result};
    pub use crate::logging::{self, LogFormat, LogSink};
    pub use crate::message::{Message, Request};
    pub use crate::property::PropertyValue;
    pub use crate::registry::ConnectionRegistry;
    pub use crate::router::{Handler, Router, handler_fn};
    pub use crate::server::Server;
    pub use async_trait::async_trait;
}
