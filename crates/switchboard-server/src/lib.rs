//! # switchboard-server
//!
//! In-process registry of `WebSocket` server endpoints.
//!
//! - **Registry**: create-or-reuse endpoints keyed by `ServerId`, serialized
//!   admission, idempotent close
//! - **Listeners**: one axum upgrade route per endpoint, bound directly or
//!   parked for the host to mount
//! - **Sessions**: per-client outbound pump, connection greeting, ping/pong
//!   heartbeat with single-miss eviction
//! - **Delivery**: retrying dispatcher for single clients, best-effort
//!   broadcast fan-out
//! - **Lifecycle**: soft close for shared referenced endpoints, grace-window
//!   close when an exclusive endpoint is released, idle sweep
//! - **Observability**: `tracing` spans, `metrics` counters and gauges, JSON
//!   snapshot export

#![deny(unsafe_code)]

pub mod client_table;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod lifecycle;
pub mod listener;
pub mod metrics;
pub mod registry;
pub mod shutdown;
pub mod snapshot;

mod entry;
mod heartbeat;
mod session;
mod sweep;

pub use client_table::{BroadcastOutcome, ClientTable};
pub use config::{AuthMode, BindMode, ConfigError, RegistryConfig, ServerConfig, SharingMode};
pub use connection::{ClientConnection, EnqueueError, OutboundFrame};
pub use dispatcher::{DispatchReceipt, Dispatcher};
pub use lifecycle::{CloseOptions, ServerPhase, TriggerHandle};
pub use listener::{AuthVerifier, ListenerHandle};
pub use registry::ServerRegistry;
pub use shutdown::ShutdownCoordinator;
pub use snapshot::{read_snapshot, write_snapshot, RegistrySnapshot, ServerInfo};

pub use switchboard_core::{
    AuthError, ClientId, DisconnectReason, ExecutionId, MessageEvent, RegistryError, Result,
    RetryConfig, ServerEvent, ServerId, WorkflowId,
};
