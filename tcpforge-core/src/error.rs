//! Error types and result handling for TcpForge.
//!
//! This module provides a unified error type that covers every failure the
//! engine can report, from malformed frames on the wire to application-level
//! lookups on a connection's property bag.
//!
//! # Error Categories
//!
//! - **Transport errors**: [`Frame`](Error::Frame), [`OversizedMessage`](Error::OversizedMessage)
//!   and [`Io`](Error::Io). These are fatal to the connection that produced
//!   them and are handled inside the reader loop; they never reach handlers.
//! - **Connection errors**: [`ConnectionClosed`](Error::ConnectionClosed),
//!   [`ConnectionNotFound`](Error::ConnectionNotFound) and
//!   [`QueueFull`](Error::QueueFull). Returned to the caller, never fatal to
//!   the server.
//! - **Property errors**: [`PropertyNotFound`](Error::PropertyNotFound) and
//!   [`TypeMismatch`](Error::TypeMismatch).
//! - **Dispatch errors**: [`HandlerPanic`](Error::HandlerPanic), reported at the
//!   dispatch boundary after a handler hook panicked.
//! - **Setup errors**: [`Config`](Error::Config), [`Logging`](Error::Logging)
//!   and [`AdmissionRejected`](Error::AdmissionRejected).
//!
//! # Examples
//!
//! ```
//! use tcpforge_core::Error;
//!
//! let err = Error::PropertyNotFound("pid".to_string());
//! assert_eq!(err.to_string(), "Property not found: pid");
//!
//! match err {
//!     Error::PropertyNotFound(key) => assert_eq!(key, "pid"),
//!     other => panic!("unexpected error: {}", other),
//! }
//! ```

use crate::connection::ConnectionId;
use std::fmt;
use thiserror::Error;

/// The main error type for TcpForge operations.
///
/// It uses the [`thiserror`](https://docs.rs/thiserror) crate to implement
/// `std::error::Error` and produce readable messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame header.
    ///
    /// Raised when fewer than [`HEADER_LEN`](crate::codec::HEADER_LEN) bytes
    /// are supplied to the header decoder.
    #[error("Frame error: {0}")]
    Frame(String),

    /// A frame header declared a payload larger than the configured maximum.
    ///
    /// The reader aborts the connection before allocating the payload buffer.
    #[error("Oversized message: declared {declared} bytes, maximum is {max}")]
    OversizedMessage {
        /// Payload length declared by the header (or requested by an encoder).
        declared: u64,
        /// Configured maximum packet size.
        max: u64,
    },

    /// An operation was attempted on a connection that is closed or closing.
    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),

    /// No live connection is registered under the given identifier.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The connection's buffered outbound queue is at capacity.
    ///
    /// Only returned by the non-blocking send path.
    #[error("Outbound queue full for connection {0}")]
    QueueFull(ConnectionId),

    /// No property is stored under the given key.
    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    /// A property exists but holds a value of another type.
    #[error("Property '{key}' is not a {expected}")]
    TypeMismatch {
        /// The property key.
        key: String,
        /// Name of the type the caller asked for.
        expected: &'static str,
    },

    /// A new socket arrived while the server was at capacity.
    ///
    /// The socket is closed immediately; this value only travels to the log.
    #[error("Admission rejected: connection limit of {max} reached")]
    AdmissionRejected {
        /// Configured maximum number of live connections.
        max: usize,
    },

    /// A handler hook panicked while processing a request.
    #[error("Handler for message {msg_id} panicked: {message}")]
    HandlerPanic {
        /// Message type of the abandoned request.
        msg_id: u32,
        /// Panic payload rendered as text.
        message: String,
    },

    /// Invalid server configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The logging sink could not be installed.
    #[error("Logging error: {0}")]
    Logging(String),

    /// I/O error from the socket, the listener or the file system.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Custom application-defined error.
    #[error("Custom error: {0}")]
    Custom(String),
}

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a custom error with the given message.
    ///
    /// # Examples
    ///
    /// ```
    /// use tcpforge_core::Error;
    ///
    /// let err = Error::custom(format!("player {} not in world", 7));
    /// assert_eq!(err.to_string(), "Custom error: player 7 not in world");
    /// ```
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Creates a frame error with the given message.
    pub fn frame<T: fmt::Display>(msg: T) -> Self {
        Error::Frame(msg.to_string())
    }

    /// Creates a configuration error with the given message.
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// Returns `true` if this error means the peer hung up or the socket failed.
    ///
    /// The reader loop logs these at `info` level instead of `warn`.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
