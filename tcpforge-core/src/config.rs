//! Server configuration.
//!
//! [`ServerConfig`] holds every tunable the engine reads. It deserializes
//! from JSON with camelCase keys and every field optional:
//!
//! ```json
//! {
//!   "name": "mmo-game",
//!   "bindHost": "0.0.0.0",
//!   "bindPort": 8999,
//!   "maxConnections": 3000,
//!   "maxPacketSize": 4096,
//!   "workerPoolSize": 10,
//!   "workerQueueDepth": 1024,
//!   "outboundQueueDepth": 1024
//! }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default maximum accepted payload length in bytes.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 4096;

/// Settings for a [`Server`](crate::server::Server).
///
/// # Examples
///
/// ```
/// use tcpforge_core::ServerConfig;
///
/// let config = ServerConfig::from_json_str(r#"{"bindPort": 7777, "workerPoolSize": 0}"#)
///     .unwrap()
///     .with_name("lobby");
///
/// assert_eq!(config.bind_port, 7777);
/// assert_eq!(config.worker_pool_size, 0);
/// assert_eq!(config.max_packet_size, 4096);
/// ```
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Server name, used in log lines.
    pub name: String,

    /// Host or IP address to listen on.
    pub bind_host: String,

    /// TCP port to listen on. 0 picks an ephemeral port.
    pub bind_port: u16,

    /// Maximum number of live connections.
    ///
    /// A new socket is closed on accept when this many connections are
    /// already registered.
    pub max_connections: usize,

    /// Maximum payload length of an inbound frame.
    pub max_packet_size: u32,

    /// Number of dispatch workers. 0 runs every handler on its own task.
    pub worker_pool_size: usize,

    /// Capacity of each worker's request queue.
    pub worker_queue_depth: usize,

    /// Capacity of each connection's buffered outbound queue.
    pub outbound_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "tcpforge".to_string(),
            bind_host: "0.0.0.0".to_string(),
            bind_port: 8999,
            max_connections: 12000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            worker_pool_size: 10,
            worker_queue_depth: 1024,
            outbound_queue_depth: 1024,
        }
    }
}

impl ServerConfig {
    /// Parses a configuration from JSON text.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] on malformed input, [`Error::Config`] if the result
    /// fails [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.bind_host.trim().is_empty() {
            return Err(Error::config("bindHost must not be empty"));
        }
        if self.max_packet_size == 0 {
            return Err(Error::config("maxPacketSize must be at least 1"));
        }
        if self.worker_queue_depth == 0 {
            return Err(Error::config("workerQueueDepth must be at least 1"));
        }
        if self.outbound_queue_depth == 0 {
            return Err(Error::config("outboundQueueDepth must be at least 1"));
        }
        Ok(())
    }

    /// Returns the `host:port` string the server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }

    /// Sets the server name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the bind host and port.
    pub fn with_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.bind_host = host.into();
        self.bind_port = port;
        self
    }

    /// Sets the connection limit.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the inbound payload limit.
    pub fn with_max_packet_size(mut self, max: u32) -> Self {
        self.max_packet_size = max;
        self
    }

    /// Sets the worker count and per-worker queue depth.
    pub fn with_worker_pool(mut self, size: usize, queue_depth: usize) -> Self {
        self.worker_pool_size = size;
        self.worker_queue_depth = queue_depth;
        self
    }

    /// Sets the buffered outbound queue depth.
    pub fn with_outbound_queue_depth(mut self, depth: usize) -> Self {
        self.outbound_queue_depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.name, "tcpforge");
        assert_eq!(config.bind_addr(), "0.0.0.0:8999");
        assert_eq!(config.max_connections, 12000);
        assert_eq!(config.max_packet_size, 4096);
        assert_eq!(config.worker_pool_size, 10);
        assert_eq!(config.worker_queue_depth, 1024);
        assert_eq!(config.outbound_queue_depth, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ServerConfig::from_json_str(
            r#"{"name": "mmo", "maxConnections": 3000, "bindHost": "127.0.0.1"}"#,
        )
        .unwrap();
        assert_eq!(config.name, "mmo");
        assert_eq!(config.max_connections, 3000);
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.bind_port, 8999);
    }

    #[test]
    fn test_camel_case_roundtrip() {
        let config = ServerConfig::default().with_worker_pool(0, 8);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["workerPoolSize"], 0);
        assert_eq!(json["workerQueueDepth"], 8);
        let back: ServerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_zero_packet_size_rejected() {
        let err = ServerConfig::from_json_str(r#"{"maxPacketSize": 0}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let config = ServerConfig::default().with_outbound_queue_depth(0);
        assert!(config.validate().is_err());
        let config = ServerConfig::default().with_worker_pool(4, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = ServerConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_from_missing_file() {
        let err = ServerConfig::from_json_file("/nonexistent/tcpforge.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
