//! Message and request value types.
//!
//! A [`Message`] is one decoded frame: a message type and its payload. A
//! [`Request`] pairs a message with the [`Connection`] it arrived on and is
//! what handlers receive.
//!
//! Both types are immutable once built. Payloads are held in [`Bytes`], so
//! cloning a message or a request never copies the payload.
//!
//! # Examples
//!
//! ```
//! use tcpforge_core::Message;
//!
//! let msg = Message::new(2, "hello world");
//! assert_eq!(msg.id(), 2);
//! assert_eq!(msg.len(), 11);
//! assert_eq!(msg.as_text(), Some("hello world"));
//! ```

use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// One decoded frame.
///
/// The payload length always equals `data().len()`; there is no way to build
/// a message whose declared length disagrees with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u32,
    data: Bytes,
}

impl Message {
    /// Creates a message from a type identifier and payload.
    pub fn new(id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Returns the message type identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the payload length as carried in the frame header.
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns a cheap clone of the payload buffer.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Consumes the message and returns its payload.
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Returns the payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Deserializes a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload is not valid JSON for `T`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tcpforge_core::Message;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Chat {
    ///     text: String,
    /// }
    ///
    /// let msg = Message::new(2, r#"{"text":"hi"}"#);
    /// let chat: Chat = msg.json().unwrap();
    /// assert_eq!(chat.text, "hi");
    /// ```
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(Error::from)
    }
}

/// A decoded message together with the connection that sent it.
///
/// Created once per inbound frame by the connection's reader loop and handed
/// to exactly one handler chain.
#[derive(Clone)]
pub struct Request {
    conn: Arc<Connection>,
    message: Message,
}

impl Request {
    /// Creates a request. Normally only the reader loop does this.
    pub fn new(conn: Arc<Connection>, message: Message) -> Self {
        Self { conn, message }
    }

    /// Returns the connection the message arrived on.
    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Returns the identifier of the originating connection.
    pub fn conn_id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Returns the decoded message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Returns the message type identifier.
    pub fn msg_id(&self) -> u32 {
        self.message.id()
    }

    /// Returns the payload bytes.
    pub fn data(&self) -> &[u8] {
        self.message.data()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("conn_id", &self.conn.id())
            .field("msg_id", &self.message.id())
            .field("len", &self.message.len())
            .finish()
    }
}
