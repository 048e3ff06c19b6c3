//! Entry phases, close options, and the close decision.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use switchboard_core::{
    ExecutionId, RegistryError, Result, ServerEvent, ServerId, WorkflowId,
};

use crate::config::SharingMode;
use crate::registry::ServerRegistry;

/// Where a server entry sits in its lifecycle.
///
/// `Active` entries accept new trigger attachments. `SoftClosed` entries keep
/// their listener and clients but take no new attachments until revived by a
/// matching `get_or_create_server` or a fresh registration. `Closed` is
/// terminal: the listener is unbound and the entry is gone from the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPhase {
    /// Listener bound and accepting trigger attachments.
    Active,
    /// Listener and clients retained, attachment refused.
    SoftClosed,
    /// Torn down and removed.
    Closed,
}

/// Caller intent for `close_server`.
#[derive(Clone, Debug, Default)]
pub struct CloseOptions {
    /// Keep clients connected when other executions or workflows still
    /// reference the entry. Ignored for exclusive servers.
    pub keep_clients_alive: bool,
    /// Execution to unregister before deciding the close kind.
    pub execution_id: Option<ExecutionId>,
    /// Free-form reason recorded in logs.
    pub reason: Option<String>,
}

/// Decide between tearing an entry down and leaving it soft-closed.
///
/// A hard close happens when the server is exclusive, when nothing references
/// it any more, or when the caller declined to keep clients alive. Only a
/// shared entry that is still referenced and whose caller asked for it
/// survives as soft-closed.
#[must_use]
pub fn should_hard_close(
    sharing: SharingMode,
    has_executions: bool,
    has_workflows: bool,
    keep_clients_alive: bool,
) -> bool {
    sharing == SharingMode::Exclusive
        || (!has_executions && !has_workflows)
        || !keep_clients_alive
}

/// Handle returned by [`ServerRegistry::trigger`].
///
/// Owns the workflow and execution registration it made. The orchestrator
/// calls [`TriggerHandle::close`] exactly once when the workflow step ends;
/// duplicate calls are tolerated and do nothing.
pub struct TriggerHandle {
    server_id: ServerId,
    workflow_id: WorkflowId,
    execution_id: ExecutionId,
    url: String,
    registry: ServerRegistry,
    events: broadcast::Receiver<ServerEvent>,
    closed: AtomicBool,
}

impl TriggerHandle {
    pub(crate) fn new(
        server_id: ServerId,
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
        url: String,
        registry: ServerRegistry,
        events: broadcast::Receiver<ServerEvent>,
    ) -> Self {
        Self {
            server_id,
            workflow_id,
            execution_id,
            url,
            registry,
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Server this trigger attached to.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Workflow registered on the server.
    #[must_use]
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// Execution registered on the server.
    #[must_use]
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// WebSocket URL clients should connect to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether [`TriggerHandle::close`] already ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next event from the server, or `None` once the server is gone.
    ///
    /// Lagged gaps are logged and skipped rather than surfaced; a slow
    /// consumer loses old events, not the stream.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        server_id = %self.server_id,
                        skipped,
                        "event consumer lagged, dropping oldest events"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Release the registrations made by `trigger` and close the server,
    /// keeping clients alive if anything else still references it.
    ///
    /// Idempotent: the second and later calls return `Ok` without touching
    /// the registry. A server already removed by another path is not an
    /// error here.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        ignore_missing(
            self.registry
                .unregister_execution(&self.server_id, &self.execution_id)
                .await,
        )?;
        ignore_missing(
            self.registry
                .unregister_workflow(&self.server_id, &self.workflow_id)
                .await,
        )?;
        ignore_missing(
            self.registry
                .close_server(
                    &self.server_id,
                    CloseOptions {
                        keep_clients_alive: true,
                        execution_id: None,
                        reason: Some("workflow complete".into()),
                    },
                )
                .await,
        )
    }
}

impl std::fmt::Debug for TriggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerHandle")
            .field("server_id", &self.server_id)
            .field("workflow_id", &self.workflow_id)
            .field("execution_id", &self.execution_id)
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(RegistryError::ServerNotFound { .. }) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ── phases ──

    #[test]
    fn phase_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ServerPhase::Active).unwrap(),
            "active"
        );
        assert_eq!(
            serde_json::to_value(ServerPhase::SoftClosed).unwrap(),
            "soft_closed"
        );
        assert_eq!(
            serde_json::to_value(ServerPhase::Closed).unwrap(),
            "closed"
        );
    }

    // ── close options ──

    #[test]
    fn close_options_default_to_hard_close() {
        let options = CloseOptions::default();
        assert!(!options.keep_clients_alive);
        assert!(options.execution_id.is_none());
        assert!(options.reason.is_none());
    }

    // ── close decision ──

    #[test]
    fn exclusive_overrides_keep_clients_alive() {
        assert!(should_hard_close(SharingMode::Exclusive, true, true, true));
    }

    #[test]
    fn unreferenced_entry_hard_closes() {
        assert!(should_hard_close(SharingMode::Shared, false, false, true));
    }

    #[test]
    fn declining_keep_alive_hard_closes() {
        assert!(should_hard_close(SharingMode::Shared, true, true, false));
    }

    #[test]
    fn referenced_shared_entry_soft_closes() {
        assert!(!should_hard_close(SharingMode::Shared, true, false, true));
        assert!(!should_hard_close(SharingMode::Shared, false, true, true));
        assert!(!should_hard_close(SharingMode::Shared, true, true, true));
    }

    proptest! {
        #[test]
        fn exclusive_never_soft_closes(
            has_executions: bool,
            has_workflows: bool,
            keep_clients_alive: bool,
        ) {
            prop_assert!(should_hard_close(
                SharingMode::Exclusive,
                has_executions,
                has_workflows,
                keep_clients_alive,
            ));
        }

        #[test]
        fn soft_close_requires_reference_and_keep_alive(
            has_executions: bool,
            has_workflows: bool,
            keep_clients_alive: bool,
        ) {
            let hard = should_hard_close(
                SharingMode::Shared,
                has_executions,
                has_workflows,
                keep_clients_alive,
            );
            let referenced = has_executions || has_workflows;
            prop_assert_eq!(hard, !(referenced && keep_clients_alive));
        }
    }
}
