//! Axum listener: upgrade handling, authentication, and the route surface.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use switchboard_core::{AuthError, ClientId, RegistryError, Result, ServerId};

use crate::config::{AuthMode, BindMode, ServerConfig};
use crate::entry::ServerEntry;
use crate::session;

/// Upgrade-time credential check.
///
/// Called with the raw request head before the handshake completes, only for
/// servers whose config demands authentication. Rejecting leaves the client
/// without an id or a table slot; nothing has been allocated yet.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    /// Allow the upgrade, or reject it with an HTTP-style status.
    async fn verify(&self, request: &Parts) -> std::result::Result<(), AuthError>;
}

/// State handed to the upgrade handler.
///
/// Holds the entry weakly: the router must not keep a torn-down server
/// alive, and an upgrade that races a hard close simply finds the entry
/// gone.
#[derive(Clone)]
pub(crate) struct ListenerState {
    entry: Weak<ServerEntry>,
    auth: Option<Arc<dyn AuthVerifier>>,
}

impl ListenerState {
    pub(crate) fn new(entry: Weak<ServerEntry>, auth: Option<Arc<dyn AuthVerifier>>) -> Self {
        Self { entry, auth }
    }
}

/// Build the route surface for one server: a single GET route at the
/// configured path that upgrades to WebSocket. Any other path falls through
/// to the router's 404.
pub(crate) fn build_router(path: &str, state: ListenerState) -> Router {
    Router::new()
        .route(path, get(upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upgrade_handler(
    State(state): State<ListenerState>,
    parts: Parts,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(entry) = state.entry.upgrade() else {
        // Server torn down while the router was still reachable.
        return StatusCode::GONE.into_response();
    };

    if entry.config.auth == AuthMode::Required {
        let verdict = match state.auth.as_deref() {
            Some(verifier) => verifier.verify(&parts).await,
            None => Err(AuthError::internal(
                "authentication required but no verifier configured",
            )),
        };
        if let Err(err) = verdict {
            warn!(
                server_id = %entry.id,
                status = err.status,
                "upgrade rejected: {}", err.message
            );
            let status = StatusCode::from_u16(err.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return (status, err.message).into_response();
        }
    }

    if entry.clients.len() >= entry.tuning.max_clients {
        warn!(
            server_id = %entry.id,
            max_clients = entry.tuning.max_clients,
            "upgrade refused: client capacity reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "client capacity reached").into_response();
    }

    let client_id = ClientId::generate();
    debug!(server_id = %entry.id, client_id = %client_id, "accepting upgrade");
    ws.max_message_size(entry.tuning.max_message_bytes)
        .on_upgrade(move |socket| session::run_client_session(socket, entry, client_id))
}

/// Bind the configured address, resolving port 0 to the actual port.
pub(crate) async fn bind_socket(
    server_id: &ServerId,
    config: &ServerConfig,
) -> Result<(TcpListener, SocketAddr)> {
    let addr = format!("{}:{}", config.host, config.port);
    let tcp = TcpListener::bind(&addr)
        .await
        .map_err(|err| RegistryError::Bind {
            server_id: server_id.clone(),
            addr: addr.clone(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })?;
    let local = tcp.local_addr().map_err(|err| RegistryError::Bind {
        server_id: server_id.clone(),
        addr,
        message: err.to_string(),
        source: Some(Box::new(err)),
    })?;
    Ok((tcp, local))
}

/// One server's listener: either a socket this crate serves, or a router
/// parked for a host process to mount on its own listener.
pub(crate) struct Listener {
    host: String,
    port: u16,
    path: String,
    mode: BindMode,
    serve: Mutex<Option<JoinHandle<()>>>,
    router: Mutex<Option<Router>>,
}

impl Listener {
    /// Serve a bound socket until `cancel` fires.
    pub(crate) fn serve_on(
        tcp: TcpListener,
        addr: SocketAddr,
        config: &ServerConfig,
        state: ListenerState,
        cancel: CancellationToken,
    ) -> Self {
        let path = config.route_path();
        let router = build_router(&path, state);
        let serve = tokio::spawn(async move {
            if let Err(err) = axum::serve(tcp, router)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                error!(error = %err, "listener serve loop failed");
            }
        });
        Self {
            host: config.host.clone(),
            port: addr.port(),
            path,
            mode: BindMode::Direct,
            serve: Mutex::new(Some(serve)),
            router: Mutex::new(None),
        }
    }

    /// Build the router without binding; the host process mounts it on its
    /// own listener and owns the socket.
    pub(crate) fn handoff(config: &ServerConfig, state: ListenerState) -> Self {
        let path = config.route_path();
        let router = build_router(&path, state);
        Self {
            host: config.host.clone(),
            port: config.port,
            path,
            mode: BindMode::Handoff,
            serve: Mutex::new(None),
            router: Mutex::new(Some(router)),
        }
    }

    /// Bound (or host-owned) port.
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Route path, with leading slash.
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    /// Whether this listener expects a host to mount its router.
    pub(crate) fn is_handoff(&self) -> bool {
        self.mode == BindMode::Handoff
    }

    /// Caller-facing handle.
    pub(crate) fn handle(&self, server_id: ServerId) -> ListenerHandle {
        ListenerHandle {
            server_id,
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
        }
    }

    /// Take the parked router, in handoff mode. `None` after the first call
    /// or in direct mode.
    pub(crate) fn take_router(&self) -> Option<Router> {
        self.router.lock().take()
    }

    /// Take the serve task for a graceful join.
    pub(crate) fn take_serve(&self) -> Option<JoinHandle<()>> {
        self.serve.lock().take()
    }
}

/// Address of a registered server, returned to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerHandle {
    server_id: ServerId,
    host: String,
    port: u16,
    path: String,
}

impl ListenerHandle {
    /// Server this handle points at.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Host the listener is reachable on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port the listener is reachable on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Route path, with leading slash.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// URL clients should dial.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}
