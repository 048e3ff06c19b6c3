//! Wire events delivered to endpoint consumers.
//!
//! Every frame a client sends arrives at the consumer as a
//! [`ServerEvent::Message`] carrying a [`MessageEvent`]. Connection
//! lifecycle shows up as `ClientConnected` / `ClientDisconnected` so
//! consumers can correlate traffic without polling the registry.
//!
//! Field names are part of the wire contract. Consumers match on exact
//! type strings and camelCase keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ClientId, ServerId};

/// An inbound client message with routing context.
///
/// `payload` is the decoded JSON value when the frame parses, otherwise the
/// raw text wrapped as a JSON string. Binary frames that are valid UTF-8 are
/// treated as text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    /// Server that received the frame.
    pub server_id: ServerId,
    /// Client that sent the frame.
    pub client_id: ClientId,
    /// Decoded JSON payload, or the raw text as a JSON string.
    pub payload: Value,
    /// ISO 8601 receipt timestamp.
    pub timestamp: String,
}

impl MessageEvent {
    /// Create a message event stamped with the current UTC time.
    #[must_use]
    pub fn now(server_id: ServerId, client_id: ClientId, payload: Value) -> Self {
        Self {
            server_id,
            client_id,
            payload,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Why a client connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The peer closed the connection.
    ClientClosed,
    /// Evicted after a missed heartbeat pong.
    HeartbeatTimeout,
    /// The endpoint shut down with the client still attached.
    ServerClosed,
    /// The underlying socket errored.
    TransportError,
}

/// Event emitted by a server endpoint to its consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A client frame arrived.
    #[serde(rename = "message")]
    Message {
        /// Message with routing context.
        #[serde(flatten)]
        event: MessageEvent,
    },

    /// A client completed the handshake and joined the table.
    #[serde(rename = "clientConnected")]
    ClientConnected {
        /// Server the client joined.
        #[serde(rename = "serverId")]
        server_id: ServerId,
        /// New client.
        #[serde(rename = "clientId")]
        client_id: ClientId,
        /// ISO 8601 timestamp.
        timestamp: String,
    },

    /// A client left the table.
    #[serde(rename = "clientDisconnected")]
    ClientDisconnected {
        /// Server the client left.
        #[serde(rename = "serverId")]
        server_id: ServerId,
        /// Departed client.
        #[serde(rename = "clientId")]
        client_id: ClientId,
        /// Why the connection ended.
        reason: DisconnectReason,
        /// ISO 8601 timestamp.
        timestamp: String,
    },
}

impl ServerEvent {
    /// Wrap a client frame as a message event.
    #[must_use]
    pub fn message(server_id: ServerId, client_id: ClientId, payload: Value) -> Self {
        Self::Message {
            event: MessageEvent::now(server_id, client_id, payload),
        }
    }

    /// Create a client-connected event stamped with the current UTC time.
    #[must_use]
    pub fn client_connected(server_id: ServerId, client_id: ClientId) -> Self {
        Self::ClientConnected {
            server_id,
            client_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Create a client-disconnected event stamped with the current UTC time.
    #[must_use]
    pub fn client_disconnected(
        server_id: ServerId,
        client_id: ClientId,
        reason: DisconnectReason,
    ) -> Self {
        Self::ClientDisconnected {
            server_id,
            client_id,
            reason,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Get the event type string (for type discrimination).
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::Message { .. } => "message",
            Self::ClientConnected { .. } => "clientConnected",
            Self::ClientDisconnected { .. } => "clientDisconnected",
        }
    }

    /// Server this event belongs to.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        match self {
            Self::Message { event } => &event.server_id,
            Self::ClientConnected { server_id, .. }
            | Self::ClientDisconnected { server_id, .. } => server_id,
        }
    }

    /// Client this event concerns.
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        match self {
            Self::Message { event } => &event.client_id,
            Self::ClientConnected { client_id, .. }
            | Self::ClientDisconnected { client_id, .. } => client_id,
        }
    }

    /// Get the timestamp.
    #[must_use]
    pub fn timestamp(&self) -> &str {
        match self {
            Self::Message { event } => &event.timestamp,
            Self::ClientConnected { timestamp, .. }
            | Self::ClientDisconnected { timestamp, .. } => timestamp,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
