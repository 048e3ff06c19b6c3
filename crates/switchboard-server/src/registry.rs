//! The endpoint registry: create, look up, reference, and close servers.
//!
//! One registry instance is built by the host process and handed to
//! everything that needs it. All entry transitions (create, replace, close)
//! are serialized by a single admission lock; per-entry mutable state sits
//! behind each entry's own lock, always acquired after admission.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::Router;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use switchboard_core::{
    ClientId, DisconnectReason, ExecutionId, RegistryError, Result, ServerEvent, ServerId,
    WorkflowId,
};

use crate::client_table::ClientTable;
use crate::config::{BindMode, RegistryConfig, ServerConfig, SharingMode};
use crate::connection::{ClientConnection, OutboundFrame};
use crate::dispatcher::{DispatchReceipt, Dispatcher};
use crate::entry::{EntryState, ServerEntry};
use crate::heartbeat;
use crate::lifecycle::{should_hard_close, CloseOptions, ServerPhase, TriggerHandle};
use crate::listener::{self, AuthVerifier, Listener, ListenerHandle, ListenerState};
use crate::metrics as names;
use crate::shutdown::ShutdownCoordinator;
use crate::snapshot::{self, ServerInfo};
use crate::sweep;

pub(crate) struct RegistryInner {
    pub(crate) servers: DashMap<ServerId, Arc<ServerEntry>>,
    /// Serializes create, replace, and close transitions.
    pub(crate) admission: Mutex<()>,
    pub(crate) config: Arc<RegistryConfig>,
    auth: Option<Arc<dyn AuthVerifier>>,
    dispatcher: Dispatcher,
    pub(crate) shutdown: ShutdownCoordinator,
    sweep: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Registry of WebSocket server endpoints.
///
/// Cheap to clone; clones share one underlying registry.
#[derive(Clone)]
pub struct ServerRegistry {
    inner: Arc<RegistryInner>,
}

impl ServerRegistry {
    /// Build a registry and start its idle sweep.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self::build(config, None)
    }

    /// Build a registry whose auth-required servers consult `auth` during
    /// the upgrade handshake.
    #[must_use]
    pub fn with_auth(config: RegistryConfig, auth: Arc<dyn AuthVerifier>) -> Self {
        Self::build(config, Some(auth))
    }

    fn build(config: RegistryConfig, auth: Option<Arc<dyn AuthVerifier>>) -> Self {
        let config = Arc::new(config);
        let registry = Self {
            inner: Arc::new(RegistryInner {
                servers: DashMap::new(),
                admission: Mutex::new(()),
                config: config.clone(),
                auth,
                dispatcher: Dispatcher::new(config.retry),
                shutdown: ShutdownCoordinator::new(),
                sweep: parking_lot::Mutex::new(None),
            }),
        };
        *registry.inner.sweep.lock() = Some(sweep::spawn(&registry));
        registry
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn tuning(&self) -> Arc<RegistryConfig> {
        self.inner.config.clone()
    }

    pub(crate) fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.inner.shutdown.token()
    }

    fn lookup(&self, server_id: &ServerId) -> Option<Arc<ServerEntry>> {
        self.inner
            .servers
            .get(server_id)
            .map(|entry| entry.value().clone())
    }

    fn require(&self, server_id: &ServerId) -> Result<Arc<ServerEntry>> {
        self.lookup(server_id).ok_or_else(|| RegistryError::ServerNotFound {
            server_id: server_id.clone(),
        })
    }

    // ── create / reuse ──────────────────────────────────────────────────

    /// Return the server registered under `server_id`, creating it if
    /// absent.
    ///
    /// An existing entry with a matching binding is reused as-is: any
    /// pending grace-window close is cancelled and the entry goes back to
    /// `Active`. An entry whose binding differs is hard-closed first and a
    /// fresh one takes its place. A port that cannot be bound fails the
    /// call; there is no fallback to a neighboring port.
    #[instrument(skip_all, fields(server_id = %server_id))]
    pub async fn get_or_create_server(
        &self,
        server_id: &ServerId,
        config: ServerConfig,
    ) -> Result<ListenerHandle> {
        let _admission = self.inner.admission.lock().await;

        if let Some(existing) = self.lookup(server_id) {
            if existing.config.same_binding(&config) {
                let mut state = existing.state.lock().await;
                state.abort_deferred_close();
                state.phase = ServerPhase::Active;
                drop(state);
                existing.touch();
                debug!("reusing server with matching binding");
                return Ok(existing.handle());
            }
            info!("binding changed, replacing server");
            self.hard_close_entry(&existing, "binding changed").await;
        }

        let entry = self.create_entry(server_id, config).await?;
        let _ = self.inner.servers.insert(server_id.clone(), entry.clone());
        counter!(names::SERVER_CREATES_TOTAL).increment(1);
        gauge!(names::SERVERS_ACTIVE).increment(1.0);
        info!(
            port = entry.listener.port(),
            path = entry.listener.path(),
            handoff = entry.listener.is_handoff(),
            "server registered"
        );
        Ok(entry.handle())
    }

    async fn create_entry(
        &self,
        server_id: &ServerId,
        config: ServerConfig,
    ) -> Result<Arc<ServerEntry>> {
        let tuning = self.inner.config.clone();
        let auth = self.inner.auth.clone();
        let shutdown = ShutdownCoordinator::new();
        let cancel = shutdown.token();
        let (events, _first) = broadcast::channel(tuning.event_buffer);

        let entry = match config.bind {
            BindMode::Direct => {
                let (tcp, addr) = listener::bind_socket(server_id, &config).await?;
                Arc::new_cyclic(|weak| {
                    let state = ListenerState::new(weak.clone(), auth);
                    let listener = Listener::serve_on(tcp, addr, &config, state, cancel);
                    ServerEntry::new(
                        server_id.clone(),
                        config,
                        tuning.clone(),
                        listener,
                        Arc::new(ClientTable::new()),
                        events,
                        shutdown,
                    )
                })
            }
            BindMode::Handoff => Arc::new_cyclic(|weak| {
                let state = ListenerState::new(weak.clone(), auth);
                let listener = Listener::handoff(&config, state);
                ServerEntry::new(
                    server_id.clone(),
                    config,
                    tuning.clone(),
                    listener,
                    Arc::new(ClientTable::new()),
                    events,
                    shutdown,
                )
            }),
        };

        entry.set_heartbeat(tokio::spawn(heartbeat::run_heartbeat(
            entry.id.clone(),
            entry.clients.clone(),
            entry.events(),
            tuning.heartbeat_interval(),
            entry.shutdown.token(),
        )));
        Ok(entry)
    }

    // ── lookups ─────────────────────────────────────────────────────────

    /// Look up a server, refreshing its activity clock.
    #[must_use]
    pub fn get_server(&self, server_id: &ServerId) -> Option<ListenerHandle> {
        let entry = self.lookup(server_id)?;
        entry.touch();
        Some(entry.handle())
    }

    /// Look up a connected client.
    pub async fn get_client(
        &self,
        server_id: &ServerId,
        client_id: &ClientId,
    ) -> Option<Arc<ClientConnection>> {
        let entry = self.lookup(server_id)?;
        entry.clients.get(client_id).await
    }

    /// Subscribe to a server's event stream.
    #[must_use]
    pub fn subscribe(&self, server_id: &ServerId) -> Option<broadcast::Receiver<ServerEvent>> {
        self.lookup(server_id).map(|entry| entry.subscribe())
    }

    /// Take the parked router of a handoff-mode server for mounting on the
    /// host's own listener. `None` for direct-mode servers or after the
    /// router was already taken.
    #[must_use]
    pub fn take_router(&self, server_id: &ServerId) -> Option<Router> {
        self.lookup(server_id)
            .and_then(|entry| entry.listener.take_router())
    }

    // ── reference counting ──────────────────────────────────────────────

    /// Record an execution as referencing the server and arm its timeout
    /// watchdog. Revives a soft-closed entry and cancels any pending
    /// grace-window close.
    pub async fn register_execution(
        &self,
        server_id: &ServerId,
        execution_id: &ExecutionId,
    ) -> Result<()> {
        let _admission = self.inner.admission.lock().await;
        let entry = self.require(server_id)?;
        let mut state = entry.state.lock().await;
        state.abort_deferred_close();
        if state.phase == ServerPhase::SoftClosed {
            state.phase = ServerPhase::Active;
        }
        if state.executions.insert(execution_id.clone()) {
            let watchdog = tokio::spawn(execution_watchdog(
                self.downgrade(),
                server_id.clone(),
                execution_id.clone(),
                self.inner.config.execution_timeout(),
            ));
            if let Some(stale) = state.watchdogs.insert(execution_id.clone(), watchdog) {
                stale.abort();
            }
            debug!(server_id = %server_id, execution_id = %execution_id, "execution registered");
        }
        drop(state);
        entry.touch();
        Ok(())
    }

    /// Release an execution's reference. The last reference leaving an
    /// exclusive server schedules a grace-window close, giving a racing
    /// registration a moment to land before teardown.
    pub async fn unregister_execution(
        &self,
        server_id: &ServerId,
        execution_id: &ExecutionId,
    ) -> Result<()> {
        let _admission = self.inner.admission.lock().await;
        let entry = self.require(server_id)?;
        let mut state = entry.state.lock().await;
        let removed = state.executions.remove(execution_id);
        state.abort_watchdog(execution_id);
        // No awaits below this point: when the watchdog itself is the
        // caller, the abort above lands at its next yield.
        if removed {
            debug!(server_id = %server_id, execution_id = %execution_id, "execution released");
            self.maybe_schedule_deferred_close(server_id, &entry, &mut state);
        }
        drop(state);
        entry.touch();
        Ok(())
    }

    /// Record a workflow as referencing the server. Revives a soft-closed
    /// entry and cancels any pending grace-window close.
    pub async fn register_workflow(
        &self,
        server_id: &ServerId,
        workflow_id: &WorkflowId,
    ) -> Result<()> {
        let _admission = self.inner.admission.lock().await;
        let entry = self.require(server_id)?;
        let mut state = entry.state.lock().await;
        state.abort_deferred_close();
        if state.phase == ServerPhase::SoftClosed {
            state.phase = ServerPhase::Active;
        }
        if state.workflows.insert(workflow_id.clone()) {
            debug!(server_id = %server_id, workflow_id = %workflow_id, "workflow registered");
        }
        drop(state);
        entry.touch();
        Ok(())
    }

    /// Release a workflow's reference, scheduling a grace-window close when
    /// it was the last reference on an exclusive server.
    pub async fn unregister_workflow(
        &self,
        server_id: &ServerId,
        workflow_id: &WorkflowId,
    ) -> Result<()> {
        let _admission = self.inner.admission.lock().await;
        let entry = self.require(server_id)?;
        let mut state = entry.state.lock().await;
        if state.workflows.remove(workflow_id) {
            debug!(server_id = %server_id, workflow_id = %workflow_id, "workflow released");
            self.maybe_schedule_deferred_close(server_id, &entry, &mut state);
        }
        drop(state);
        entry.touch();
        Ok(())
    }

    fn maybe_schedule_deferred_close(
        &self,
        server_id: &ServerId,
        entry: &Arc<ServerEntry>,
        state: &mut EntryState,
    ) {
        if entry.config.sharing != SharingMode::Exclusive
            || state.has_refs()
            || state.deferred_close.is_some()
        {
            return;
        }
        let grace = self.inner.config.close_grace();
        debug!(server_id = %server_id, grace = ?grace, "last reference released, close scheduled");
        state.deferred_close = Some(tokio::spawn(deferred_close_task(
            self.downgrade(),
            Arc::downgrade(entry),
            server_id.clone(),
            grace,
        )));
    }

    // ── closing ─────────────────────────────────────────────────────────

    /// Close a server.
    ///
    /// `options.execution_id` releases that execution's reference first.
    /// The entry is then torn down entirely unless it is shared, still
    /// referenced, and the caller asked to keep clients alive, in which
    /// case it is only marked soft-closed.
    #[instrument(skip_all, fields(server_id = %server_id))]
    pub async fn close_server(&self, server_id: &ServerId, options: CloseOptions) -> Result<()> {
        let _admission = self.inner.admission.lock().await;
        let entry = self.require(server_id)?;

        let mut state = entry.state.lock().await;
        if let Some(execution_id) = &options.execution_id {
            let _ = state.executions.remove(execution_id);
            state.abort_watchdog(execution_id);
        }
        let hard = should_hard_close(
            entry.config.sharing,
            !state.executions.is_empty(),
            !state.workflows.is_empty(),
            options.keep_clients_alive,
        );

        if hard {
            drop(state);
            self.hard_close_entry(&entry, options.reason.as_deref().unwrap_or("close requested"))
                .await;
        } else {
            state.phase = ServerPhase::SoftClosed;
            drop(state);
            entry.touch();
            counter!(names::SERVER_CLOSES_TOTAL, "kind" => "soft").increment(1);
            info!(
                reason = options.reason.as_deref().unwrap_or("close requested"),
                "soft close: references remain, listener and clients kept"
            );
        }
        Ok(())
    }

    /// Tear an entry down: remove it, disconnect clients with a normal
    /// close, end its tasks.
    ///
    /// Callers must hold the admission lock.
    async fn hard_close_entry(&self, entry: &Arc<ServerEntry>, reason: &str) {
        info!(server_id = %entry.id, reason, "hard closing server");
        let _ = self.inner.servers.remove(&entry.id);
        gauge!(names::SERVERS_ACTIVE).decrement(1.0);
        counter!(names::SERVER_CLOSES_TOTAL, "kind" => "hard").increment(1);

        {
            let mut state = entry.state.lock().await;
            state.phase = ServerPhase::Closed;
            state.abort_all_tasks();
        }

        // Stop the listener accepting and the heartbeat ticking.
        entry.shutdown.shutdown();

        // Ask each session to complete a close handshake; a session whose
        // queue cannot take the frame is ended directly.
        for conn in entry.clients.drain().await {
            if conn.enqueue(OutboundFrame::Close).is_err() {
                conn.kill();
            }
            entry.emit(ServerEvent::client_disconnected(
                entry.id.clone(),
                conn.id().clone(),
                DisconnectReason::ServerClosed,
            ));
        }

        let handles = entry.take_task_handles();
        entry
            .shutdown
            .graceful_shutdown(handles, Some(self.inner.config.unbind_timeout()))
            .await;
        info!(server_id = %entry.id, "server closed");
    }

    // ── delivery ────────────────────────────────────────────────────────

    /// Deliver a payload to one client, with the dispatcher's retry budget.
    pub async fn send_to_client(
        &self,
        server_id: &ServerId,
        client_id: &ClientId,
        payload: &str,
    ) -> Result<DispatchReceipt> {
        let entry = self.require(server_id)?;
        let receipt = self
            .inner
            .dispatcher
            .send_to_client(server_id, &entry.clients, client_id, payload)
            .await?;
        entry.touch();
        Ok(receipt)
    }

    /// Queue a payload for every client of a server, returning how many
    /// accepted it.
    pub async fn broadcast_to_server(&self, server_id: &ServerId, payload: &str) -> Result<usize> {
        let entry = self.require(server_id)?;
        let outcome = self.inner.dispatcher.broadcast(&entry.clients, payload).await;
        entry.touch();
        if outcome.failed > 0 {
            warn!(
                server_id = %server_id,
                failed = outcome.failed,
                "broadcast skipped some clients"
            );
        }
        Ok(outcome.sent)
    }

    // ── observability ───────────────────────────────────────────────────

    /// Diagnostic rows for every registered server, sorted by id.
    ///
    /// Read-only: unlike `get_server`, enumeration does not refresh any
    /// activity clock, so monitoring cannot keep an idle server alive.
    pub async fn list_servers(&self) -> Vec<ServerInfo> {
        let entries: Vec<Arc<ServerEntry>> = self
            .inner
            .servers
            .iter()
            .map(|kv| kv.value().clone())
            .collect();
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            infos.push(entry.describe().await);
        }
        infos.sort_by(|a, b| a.server_id.as_str().cmp(b.server_id.as_str()));
        infos
    }

    /// Write the diagnostic snapshot file.
    pub async fn export_snapshot(&self, path: &Path) -> std::io::Result<()> {
        let servers = self.list_servers().await;
        snapshot::write_snapshot(path, &servers).await
    }

    // ── orchestrator surface ────────────────────────────────────────────

    /// Attach a workflow execution to a server, creating the server if
    /// needed, and return the handle the orchestrator drives it with.
    #[instrument(skip_all, fields(server_id = %server_id, execution_id = %execution_id))]
    pub async fn trigger(
        &self,
        server_id: &ServerId,
        config: ServerConfig,
        workflow_id: &WorkflowId,
        execution_id: &ExecutionId,
    ) -> Result<TriggerHandle> {
        let handle = self.get_or_create_server(server_id, config).await?;
        self.register_workflow(server_id, workflow_id).await?;
        if let Err(err) = self.register_execution(server_id, execution_id).await {
            let _ = self.unregister_workflow(server_id, workflow_id).await;
            return Err(err);
        }
        let events = self
            .subscribe(server_id)
            .ok_or_else(|| RegistryError::ServerNotFound {
                server_id: server_id.clone(),
            })?;
        Ok(TriggerHandle::new(
            server_id.clone(),
            workflow_id.clone(),
            execution_id.clone(),
            handle.ws_url(),
            self.clone(),
            events,
        ))
    }

    // ── maintenance ─────────────────────────────────────────────────────

    /// One idle-sweep pass: hard-close every server with no clients, no
    /// references, and no activity inside the idle window. Returns how many
    /// closed.
    pub(crate) async fn sweep_idle_once(&self) -> usize {
        let threshold = self.inner.config.idle_timeout();
        let candidates: Vec<Arc<ServerEntry>> = self
            .inner
            .servers
            .iter()
            .map(|kv| kv.value().clone())
            .collect();

        let mut closed = 0;
        for entry in candidates {
            if entry.idle_for() < threshold || !entry.clients.is_empty() {
                continue;
            }
            let _admission = self.inner.admission.lock().await;
            if !self.inner.servers.contains_key(&entry.id) {
                continue;
            }
            let state = entry.state.lock().await;
            let unreferenced = !state.has_refs();
            drop(state);
            if unreferenced && entry.clients.is_empty() && entry.idle_for() >= threshold {
                self.hard_close_entry(&entry, "idle timeout").await;
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "idle sweep closed servers");
        }
        closed
    }

    /// Close every server and stop the sweep. Safe to call twice.
    pub async fn shutdown(&self) {
        info!("registry shutting down");
        self.inner.shutdown.shutdown();

        {
            let _admission = self.inner.admission.lock().await;
            let ids: Vec<ServerId> = self
                .inner
                .servers
                .iter()
                .map(|kv| kv.key().clone())
                .collect();
            for id in ids {
                if let Some(entry) = self.lookup(&id) {
                    self.hard_close_entry(&entry, "registry shutdown").await;
                }
            }
        }

        let sweep_handle = self.inner.sweep.lock().take();
        if let Some(handle) = sweep_handle {
            self.inner
                .shutdown
                .graceful_shutdown(vec![handle], Some(Duration::from_secs(5)))
                .await;
        }
        info!("registry shut down");
    }
}

// ── background tasks ────────────────────────────────────────────────────

/// Close `server_id` after the grace window, unless a reference arrived or
/// the entry was replaced in the meantime.
async fn deferred_close_task(
    inner: Weak<RegistryInner>,
    entry: Weak<ServerEntry>,
    server_id: ServerId,
    grace: Duration,
) {
    tokio::time::sleep(grace).await;
    let Some(inner) = inner.upgrade() else { return };
    let registry = ServerRegistry::from_inner(inner);
    let Some(entry) = entry.upgrade() else { return };

    let _admission = registry.inner.admission.lock().await;
    let still_current = registry
        .lookup(&server_id)
        .is_some_and(|current| Arc::ptr_eq(&current, &entry));
    if !still_current {
        return;
    }

    let mut state = entry.state.lock().await;
    // Detach our own handle first: the close path below aborts whatever
    // sits in this slot, and that must not be us.
    state.deferred_close = None;
    if state.has_refs() || state.phase == ServerPhase::Closed {
        return;
    }
    drop(state);

    info!(server_id = %server_id, "grace window elapsed with no references");
    registry
        .hard_close_entry(&entry, "exclusive server released")
        .await;
}

/// Release an execution's reference when its timeout elapses, feeding the
/// same close path an explicit unregister would.
async fn execution_watchdog(
    inner: Weak<RegistryInner>,
    server_id: ServerId,
    execution_id: ExecutionId,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;
    let Some(inner) = inner.upgrade() else { return };
    let registry = ServerRegistry::from_inner(inner);
    warn!(
        server_id = %server_id,
        execution_id = %execution_id,
        "execution timed out, releasing its registration"
    );
    if let Err(err) = registry.unregister_execution(&server_id, &execution_id).await {
        debug!(error = %err, "timed-out execution already released");
    }
}
