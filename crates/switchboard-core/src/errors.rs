//! Error types for registry operations.
//!
//! Built on [`thiserror`]:
//!
//! - [`RegistryError`]: every failure a registry operation can surface, each
//!   variant carrying the ids involved and a stable machine-readable code
//! - [`AuthError`]: handshake authentication failure with an HTTP-style
//!   status (401 unauthorized, 403 forbidden, 500 verifier failure)
//!
//! Dispatch retry decisions key off [`RegistryError::retryable`]: a missing
//! client is permanent, a closed or congested connection is worth another
//! attempt.

use thiserror::Error;

use crate::ids::{ClientId, ServerId};

// ── Error code constants ────────────────────────────────────────────

/// Listener could not bind its address.
pub const BIND_ERROR: &str = "BIND_ERROR";
/// Client id is not present in the server's client table.
pub const CLIENT_NOT_FOUND: &str = "CLIENT_NOT_FOUND";
/// Client is known but its connection is no longer open.
pub const CONNECTION_NOT_OPEN: &str = "CONNECTION_NOT_OPEN";
/// Delivery failed after exhausting retry attempts.
pub const SEND_FAILURE: &str = "SEND_FAILURE";
/// Handshake authentication rejected or errored.
pub const AUTHENTICATION_ERROR: &str = "AUTHENTICATION_ERROR";
/// Server id is not registered.
pub const SERVER_NOT_FOUND: &str = "SERVER_NOT_FOUND";

/// Top-level error type for registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The listener socket could not be bound.
    ///
    /// Raised when the requested address is already in use or otherwise
    /// unavailable. The registry never silently retries on another port.
    #[error("failed to bind {addr} for server {server_id}: {message}")]
    Bind {
        /// Server being registered.
        server_id: ServerId,
        /// Address that failed to bind, `host:port`.
        addr: String,
        /// Human-readable message.
        message: String,
        /// Original cause.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No client with this id is registered on the server.
    #[error("client {client_id} not found on server {server_id}")]
    ClientNotFound {
        /// Server that was searched.
        server_id: ServerId,
        /// Missing client.
        client_id: ClientId,
    },

    /// The client exists but its connection cannot accept frames.
    #[error("connection for client {client_id} on server {server_id} is not open")]
    ConnectionNotOpen {
        /// Server owning the connection.
        server_id: ServerId,
        /// Client whose connection is closed.
        client_id: ClientId,
    },

    /// Delivery to the client failed.
    #[error("send to client {client_id} on server {server_id} failed after {attempts} attempt(s)")]
    SendFailed {
        /// Server owning the connection.
        server_id: ServerId,
        /// Destination client.
        client_id: ClientId,
        /// Attempts made before giving up.
        attempts: u32,
        /// Last underlying failure.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Handshake authentication failed.
    #[error("{0}")]
    Authentication(#[from] AuthError),

    /// No server with this id is registered.
    #[error("server {server_id} not found")]
    ServerNotFound {
        /// Missing server.
        server_id: ServerId,
    },
}

impl RegistryError {
    /// Machine-readable error code for this variant.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Bind { .. } => BIND_ERROR,
            Self::ClientNotFound { .. } => CLIENT_NOT_FOUND,
            Self::ConnectionNotOpen { .. } => CONNECTION_NOT_OPEN,
            Self::SendFailed { .. } => SEND_FAILURE,
            Self::Authentication(_) => AUTHENTICATION_ERROR,
            Self::ServerNotFound { .. } => SERVER_NOT_FOUND,
        }
    }

    /// Whether the dispatcher may re-attempt delivery after this error.
    ///
    /// A missing client id is permanent. A connection that is closed or has
    /// a full outbound queue may recover within the retry window.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionNotOpen { .. } | Self::SendFailed { .. }
        )
    }

    /// Attach the underlying cause, on variants that carry one.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        if let Self::Bind { source: slot, .. } | Self::SendFailed { source: slot, .. } = &mut self
        {
            *slot = Some(Box::new(source));
        }
        self
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

// ─────────────────────────────────────────────────────────────────────────────
// AuthError
// ─────────────────────────────────────────────────────────────────────────────

/// Handshake authentication failure.
///
/// The status mirrors what the HTTP upgrade response reports: 401 when
/// credentials are missing or unrecognized, 403 when they are recognized but
/// rejected, 500 when the verifier itself failed.
#[derive(Debug, Error)]
#[error("authentication failed ({status}): {message}")]
pub struct AuthError {
    /// HTTP status reported on the upgrade response.
    pub status: u16,
    /// Human-readable message.
    pub message: String,
    /// Original cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AuthError {
    /// Missing or unrecognized credentials (401).
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: 401,
            message: message.into(),
            source: None,
        }
    }

    /// Recognized but rejected credentials (403).
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: 403,
            message: message.into(),
            source: None,
        }
    }

    /// Verifier failure (500).
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            message: message.into(),
            source: None,
        }
    }

    /// Set the error cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    fn ids() -> (ServerId, ClientId) {
        (ServerId::from("ws-5680"), ClientId::from("c-1"))
    }

    #[test]
    fn bind_code_and_display() {
        let (server_id, _) = ids();
        let err = RegistryError::Bind {
            server_id,
            addr: "127.0.0.1:5680".into(),
            message: "address in use".into(),
            source: None,
        };
        assert_eq!(err.code(), BIND_ERROR);
        assert!(err.to_string().contains("127.0.0.1:5680"));
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn client_not_found_is_not_retryable() {
        let (server_id, client_id) = ids();
        let err = RegistryError::ClientNotFound { server_id, client_id };
        assert_eq!(err.code(), CLIENT_NOT_FOUND);
        assert!(!err.retryable());
    }

    #[test]
    fn connection_not_open_is_retryable() {
        let (server_id, client_id) = ids();
        let err = RegistryError::ConnectionNotOpen { server_id, client_id };
        assert_eq!(err.code(), CONNECTION_NOT_OPEN);
        assert!(err.retryable());
    }

    #[test]
    fn send_failed_reports_attempts() {
        let (server_id, client_id) = ids();
        let err = RegistryError::SendFailed {
            server_id,
            client_id,
            attempts: 3,
            source: None,
        };
        assert_eq!(err.code(), SEND_FAILURE);
        assert!(err.retryable());
        assert!(err.to_string().contains("after 3 attempt"));
    }

    #[test]
    fn server_not_found_code() {
        let err = RegistryError::ServerNotFound {
            server_id: ServerId::from_port(9999),
        };
        assert_eq!(err.code(), SERVER_NOT_FOUND);
        assert!(err.to_string().contains("ws-9999"));
        assert!(!err.retryable());
    }

    #[test]
    fn with_source_attaches_cause() {
        let (server_id, _) = ids();
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = RegistryError::Bind {
            server_id,
            addr: "0.0.0.0:80".into(),
            message: "address in use".into(),
            source: None,
        }
        .with_source(io);
        assert!(err.source().is_some());
    }

    #[test]
    fn with_source_ignored_on_sourceless_variants() {
        let (server_id, client_id) = ids();
        let io = std::io::Error::other("boom");
        let err = RegistryError::ClientNotFound { server_id, client_id }.with_source(io);
        assert!(err.source().is_none());
    }

    // -- AuthError --

    #[test]
    fn auth_status_constructors() {
        assert_eq!(AuthError::unauthorized("no token").status, 401);
        assert_eq!(AuthError::forbidden("bad token").status, 403);
        assert_eq!(AuthError::internal("verifier panicked").status, 500);
    }

    #[test]
    fn auth_error_converts_to_registry_error() {
        let err: RegistryError = AuthError::forbidden("nope").into();
        assert_eq!(err.code(), AUTHENTICATION_ERROR);
        assert!(err.to_string().contains("403"));
        assert!(!err.retryable());
    }

    #[test]
    fn auth_with_source() {
        let io = std::io::Error::other("backend down");
        let err = AuthError::internal("verifier failed").with_source(io);
        assert!(err.source().is_some());
    }
}
