//! # switchboard-core
//!
//! Shared vocabulary for the Switchboard WebSocket endpoint registry.
//!
//! This crate provides the types the server crate and its embedders both
//! depend on:
//!
//! - **Branded IDs**: `ServerId`, `ClientId`, `ExecutionId`, `WorkflowId` as
//!   newtypes for type safety
//! - **Errors**: `RegistryError` hierarchy via `thiserror`, with stable
//!   machine-readable codes
//! - **Wire events**: `ServerEvent` / `MessageEvent` envelopes delivered to
//!   endpoint consumers
//! - **Retry policy**: `RetryConfig` governing dispatch re-attempts

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod retry;

pub use errors::{AuthError, RegistryError, Result};
pub use events::{DisconnectReason, MessageEvent, ServerEvent};
pub use ids::{ClientId, ExecutionId, ServerId, WorkflowId};
pub use retry::RetryConfig;
