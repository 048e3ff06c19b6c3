//! Branded ID newtypes for type safety.
//!
//! Every entity in the registry has a distinct ID type implemented as a
//! newtype wrapper around `String`. This prevents accidentally passing a
//! client ID where a server ID is expected.
//!
//! Generation differs per type: server ids are caller-chosen (with
//! [`ServerId::from_port`] building the conventional `ws-{port}` form),
//! client ids are short random tokens assigned at connection time, and
//! execution/workflow ids are UUID v7 (time-ordered).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a new UUID v7 string (time-ordered).
fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identifier for a registered server endpoint.
    ///
    /// Chosen by the caller at registration time. There is exactly one
    /// naming scheme: whatever string the caller supplies is the key, and
    /// [`ServerId::from_port`] is the conventional builder for callers that
    /// identify endpoints by listen port.
    ServerId
}

branded_id! {
    /// Unique identifier for a connected WebSocket client.
    ClientId
}

branded_id! {
    /// Unique identifier for an execution holding a server reference.
    ExecutionId
}

branded_id! {
    /// Unique identifier for a workflow holding a server reference.
    WorkflowId
}

impl ServerId {
    /// Build the conventional port-derived id, e.g. `ws-5680`.
    #[must_use]
    pub fn from_port(port: u16) -> Self {
        Self(format!("ws-{port}"))
    }
}

impl ClientId {
    /// Length of generated client tokens.
    pub const GENERATED_LEN: usize = 16;

    /// Generate a random 16-character alphanumeric client id.
    #[must_use]
    pub fn generate() -> Self {
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::rng();
        let token: String = (0..Self::GENERATED_LEN)
            .map(|_| {
                let idx = rng.random_range(0..CHARSET.len());
                CHARSET[idx] as char
            })
            .collect();
        Self(token)
    }
}

impl ExecutionId {
    /// Create a new random ID (UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(new_v7())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowId {
    /// Create a new random ID (UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(new_v7())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
