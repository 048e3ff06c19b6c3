//! Per-server entry: listener, client table, reference counts, and tasks.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use switchboard_core::{ExecutionId, ServerEvent, ServerId, WorkflowId};

use crate::client_table::ClientTable;
use crate::config::{RegistryConfig, ServerConfig};
use crate::lifecycle::ServerPhase;
use crate::listener::{Listener, ListenerHandle};
use crate::shutdown::ShutdownCoordinator;
use crate::snapshot::ServerInfo;
use std::sync::Arc;

/// Mutable lifecycle state, guarded by the entry's async mutex.
///
/// Registry operations that read or write phase and reference sets take this
/// lock; the admission lock orders whole create/close transitions above it.
pub(crate) struct EntryState {
    pub(crate) phase: ServerPhase,
    pub(crate) executions: HashSet<ExecutionId>,
    pub(crate) workflows: HashSet<WorkflowId>,
    /// Timeout watchdog per registered execution.
    pub(crate) watchdogs: HashMap<ExecutionId, JoinHandle<()>>,
    /// Pending grace-window close, when the last execution just left.
    pub(crate) deferred_close: Option<JoinHandle<()>>,
}

impl EntryState {
    fn new() -> Self {
        Self {
            phase: ServerPhase::Active,
            executions: HashSet::new(),
            workflows: HashSet::new(),
            watchdogs: HashMap::new(),
            deferred_close: None,
        }
    }

    /// Whether any execution or workflow still references the entry.
    pub(crate) fn has_refs(&self) -> bool {
        !self.executions.is_empty() || !self.workflows.is_empty()
    }

    /// Stop the watchdog for one execution, if running.
    pub(crate) fn abort_watchdog(&mut self, execution_id: &ExecutionId) {
        if let Some(handle) = self.watchdogs.remove(execution_id) {
            handle.abort();
        }
    }

    /// Cancel a scheduled grace-window close, if any.
    pub(crate) fn abort_deferred_close(&mut self) {
        if let Some(handle) = self.deferred_close.take() {
            handle.abort();
        }
    }

    /// Stop every background task tied to this state.
    pub(crate) fn abort_all_tasks(&mut self) {
        for (_, handle) in self.watchdogs.drain() {
            handle.abort();
        }
        self.abort_deferred_close();
    }
}

/// One registered server endpoint.
pub(crate) struct ServerEntry {
    pub(crate) id: ServerId,
    pub(crate) config: ServerConfig,
    pub(crate) tuning: Arc<RegistryConfig>,
    pub(crate) listener: Listener,
    pub(crate) clients: Arc<ClientTable>,
    events: broadcast::Sender<ServerEvent>,
    /// Cancelled on hard close; sessions and the listener watch its token.
    pub(crate) shutdown: ShutdownCoordinator,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    pub(crate) created_at: String,
    last_activity: Mutex<Instant>,
    pub(crate) state: AsyncMutex<EntryState>,
}

impl ServerEntry {
    pub(crate) fn new(
        id: ServerId,
        config: ServerConfig,
        tuning: Arc<RegistryConfig>,
        listener: Listener,
        clients: Arc<ClientTable>,
        events: broadcast::Sender<ServerEvent>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            id,
            config,
            tuning,
            listener,
            clients,
            events,
            shutdown,
            heartbeat: Mutex::new(None),
            created_at: chrono::Utc::now().to_rfc3339(),
            last_activity: Mutex::new(Instant::now()),
            state: AsyncMutex::new(EntryState::new()),
        }
    }

    /// Record activity, resetting the idle clock.
    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// New receiver over this server's event stream.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Sender half of the event stream, for spawned tasks.
    pub(crate) fn events(&self) -> broadcast::Sender<ServerEvent> {
        self.events.clone()
    }

    /// Publish an event; a stream with no subscribers drops it.
    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Caller-facing handle to the bound listener.
    pub(crate) fn handle(&self) -> ListenerHandle {
        self.listener.handle(self.id.clone())
    }

    /// Attach the heartbeat task after spawn.
    pub(crate) fn set_heartbeat(&self, handle: JoinHandle<()>) {
        *self.heartbeat.lock() = Some(handle);
    }

    /// Detach the serve and heartbeat tasks for a graceful join.
    pub(crate) fn take_task_handles(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(serve) = self.listener.take_serve() {
            handles.push(serve);
        }
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            handles.push(heartbeat);
        }
        handles
    }

    /// Diagnostic row for `list_servers` and the snapshot file.
    pub(crate) async fn describe(&self) -> ServerInfo {
        let state = self.state.lock().await;
        ServerInfo {
            server_id: self.id.clone(),
            port: self.listener.port(),
            path: self.listener.path().to_owned(),
            phase: state.phase,
            clients: self.clients.len(),
            executions: state.executions.len(),
            workflows: state.workflows.len(),
            created_at: self.created_at.clone(),
            idle_secs: self.idle_for().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::ClientId;

    use crate::listener::ListenerState;

    fn make_entry() -> Arc<ServerEntry> {
        let config = ServerConfig {
            port: 9999,
            ..ServerConfig::default()
        };
        let tuning = Arc::new(RegistryConfig::default());
        let (events, _keep) = broadcast::channel(16);
        Arc::new_cyclic(|weak| {
            let state = ListenerState::new(weak.clone(), None);
            let listener = Listener::handoff(&config, state);
            ServerEntry::new(
                ServerId::from("ws-9999"),
                config,
                tuning,
                listener,
                Arc::new(ClientTable::new()),
                events,
                ShutdownCoordinator::new(),
            )
        })
    }

    #[tokio::test]
    async fn fresh_entry_is_active_and_unreferenced() {
        let entry = make_entry();
        let state = entry.state.lock().await;
        assert_eq!(state.phase, ServerPhase::Active);
        assert!(!state.has_refs());
        assert!(state.watchdogs.is_empty());
        assert!(state.deferred_close.is_none());
    }

    #[tokio::test]
    async fn refs_track_both_sets() {
        let entry = make_entry();
        let mut state = entry.state.lock().await;

        let _ = state.executions.insert(ExecutionId::new());
        assert!(state.has_refs());
        state.executions.clear();
        assert!(!state.has_refs());

        let _ = state.workflows.insert(WorkflowId::new());
        assert!(state.has_refs());
    }

    #[tokio::test]
    async fn touch_resets_idle_clock() {
        let entry = make_entry();
        *entry.last_activity.lock() = Instant::now() - Duration::from_secs(120);
        assert!(entry.idle_for() >= Duration::from_secs(120));

        entry.touch();
        assert!(entry.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let entry = make_entry();
        let mut rx = entry.subscribe();
        entry.emit(ServerEvent::client_connected(
            entry.id.clone(),
            ClientId::from("c-1"),
        ));
        assert_eq!(rx.recv().await.unwrap().event_type(), "clientConnected");
    }

    #[tokio::test]
    async fn describe_reports_counts() {
        let entry = make_entry();
        {
            let mut state = entry.state.lock().await;
            let _ = state.executions.insert(ExecutionId::new());
            let _ = state.workflows.insert(WorkflowId::new());
        }

        let info = entry.describe().await;
        assert_eq!(info.server_id.as_str(), "ws-9999");
        assert_eq!(info.port, 9999);
        assert_eq!(info.path, "/ws");
        assert_eq!(info.phase, ServerPhase::Active);
        assert_eq!(info.clients, 0);
        assert_eq!(info.executions, 1);
        assert_eq!(info.workflows, 1);
    }

    #[tokio::test]
    async fn abort_all_tasks_clears_handles() {
        let entry = make_entry();
        let mut state = entry.state.lock().await;
        let execution_id = ExecutionId::new();
        let _ = state.watchdogs.insert(
            execution_id.clone(),
            tokio::spawn(std::future::pending::<()>()),
        );
        state.deferred_close = Some(tokio::spawn(std::future::pending::<()>()));

        state.abort_all_tasks();
        assert!(state.watchdogs.is_empty());
        assert!(state.deferred_close.is_none());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        use crate::config::SharingMode;
        use crate::lifecycle::should_hard_close;

        // (register?, execution-set?, which id) applied in order. The small
        // id space forces re-registration and unknown-id removal cases.
        fn op_sequence() -> impl Strategy<Value = Vec<(bool, bool, u8)>> {
            proptest::collection::vec((any::<bool>(), any::<bool>(), 0..4u8), 1..40)
        }

        proptest! {
            #[test]
            fn shared_entry_open_exactly_while_referenced(ops in op_sequence()) {
                let mut state = EntryState::new();
                let mut live_executions: Vec<u8> = Vec::new();
                let mut live_workflows: Vec<u8> = Vec::new();

                for (register, on_executions, n) in ops {
                    if on_executions {
                        let id = ExecutionId::from(format!("ex-{n}"));
                        if register {
                            let _ = state.executions.insert(id);
                            if !live_executions.contains(&n) {
                                live_executions.push(n);
                            }
                        } else {
                            let _ = state.executions.remove(&id);
                            live_executions.retain(|m| *m != n);
                        }
                    } else {
                        let id = WorkflowId::from(format!("wf-{n}"));
                        if register {
                            let _ = state.workflows.insert(id);
                            if !live_workflows.contains(&n) {
                                live_workflows.push(n);
                            }
                        } else {
                            let _ = state.workflows.remove(&id);
                            live_workflows.retain(|m| *m != n);
                        }
                    }

                    let referenced =
                        !live_executions.is_empty() || !live_workflows.is_empty();
                    prop_assert_eq!(state.has_refs(), referenced);
                    // A keep-alive close must not tear down a referenced
                    // shared entry, and must tear down an unreferenced one.
                    prop_assert_eq!(
                        should_hard_close(
                            SharingMode::Shared,
                            !state.executions.is_empty(),
                            !state.workflows.is_empty(),
                            true,
                        ),
                        !referenced
                    );
                }
            }
        }
    }
}
