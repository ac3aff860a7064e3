//! Binary protocol for the page broadcast channel.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┐
//! │ msg_type │ origin    │ page_id   │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes  │ variable │
//! └──────────┴───────────┴───────────┴──────────┘
//! ```
//!
//! A client multiplexes every page it views over one connection:
//! `Hello` names the connection, `Subscribe`/`Unsubscribe` manage topics
//! (topic = page id), and `Update` carries a full content snapshot.

use quire_core::{Content, PageId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the broadcast protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First frame on a connection; `origin` identifies the client
    Hello = 1,
    /// Start receiving updates for `page_id`
    Subscribe = 2,
    /// Stop receiving updates for `page_id`
    Unsubscribe = 3,
    /// Full content snapshot for `page_id`
    Update = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
}

/// A content update as seen by a receiving session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub page_id: PageId,
    pub content: Content,
    /// Client that published the update.
    pub origin: Uuid,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub origin: Uuid,
    pub page_id: PageId,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn control(msg_type: MessageType, origin: Uuid, page_id: PageId) -> Self {
        Self {
            msg_type,
            origin,
            page_id,
            payload: Vec::new(),
        }
    }

    pub fn hello(origin: Uuid) -> Self {
        Self::control(MessageType::Hello, origin, PageId::nil())
    }

    pub fn subscribe(origin: Uuid, page_id: PageId) -> Self {
        Self::control(MessageType::Subscribe, origin, page_id)
    }

    pub fn unsubscribe(origin: Uuid, page_id: PageId) -> Self {
        Self::control(MessageType::Unsubscribe, origin, page_id)
    }

    /// Create a content update carrying the full snapshot.
    pub fn update(origin: Uuid, page_id: PageId, content: &Content) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(content, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Update,
            origin,
            page_id,
            payload,
        })
    }

    pub fn ping(origin: Uuid) -> Self {
        Self::control(MessageType::Ping, origin, PageId::nil())
    }

    pub fn pong(origin: Uuid) -> Self {
        Self::control(MessageType::Pong, origin, PageId::nil())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the content snapshot of an `Update`.
    pub fn content(&self) -> Result<Content, ProtocolError> {
        if self.msg_type != MessageType::Update {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (content, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(content)
    }

    /// Convert an `Update` into the message a session reconciles.
    pub fn into_broadcast(self) -> Result<BroadcastMessage, ProtocolError> {
        let content = self.content()?;
        Ok(BroadcastMessage {
            page_id: self.page_id,
            content,
            origin: self.origin,
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
