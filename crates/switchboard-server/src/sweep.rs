//! Background maintenance: the idle sweep and snapshot refresh loop.

use std::path::PathBuf;
use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::registry::{RegistryInner, ServerRegistry};

/// Spawn the maintenance loop for `registry`.
///
/// The loop holds only a weak handle, so dropping every `ServerRegistry`
/// clone ends it on its own; registry shutdown ends it promptly via the
/// cancellation token.
pub(crate) fn spawn(registry: &ServerRegistry) -> JoinHandle<()> {
    let tuning = registry.tuning();
    tokio::spawn(run_sweep(
        registry.downgrade(),
        tuning.sweep_interval(),
        tuning.snapshot_path.clone(),
        registry.shutdown_token(),
    ))
}

async fn run_sweep(
    inner: Weak<RegistryInner>,
    period: Duration,
    snapshot_path: Option<PathBuf>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick resolves immediately; a fresh registry has nothing to
    // sweep yet.
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let registry = ServerRegistry::from_inner(inner);
                let closed = registry.sweep_idle_once().await;
                debug!(closed, "maintenance pass finished");
                if let Some(path) = &snapshot_path {
                    // Maintenance failures are logged, never raised: a full
                    // disk must not take the registry down.
                    if let Err(err) = registry.export_snapshot(path).await {
                        error!(error = %err, path = %path.display(), "snapshot write failed");
                    }
                }
            }
            () = cancel.cancelled() => break,
        }
    }
    debug!("maintenance loop stopped");
}

#[cfg(test)]
mod tests {
    use crate::config::{BindMode, RegistryConfig, ServerConfig};
    use crate::registry::ServerRegistry;
    use std::time::Duration;
    use switchboard_core::ServerId;

    fn handoff(port: u16) -> ServerConfig {
        ServerConfig {
            port,
            bind: BindMode::Handoff,
            ..ServerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_closes_idle_server_on_schedule() {
        let registry = ServerRegistry::new(RegistryConfig {
            sweep_interval_secs: 60,
            idle_timeout_secs: 120,
            ..RegistryConfig::default()
        });
        let id = ServerId::from_port(8200);
        let _ = registry
            .get_or_create_server(&id, handoff(8200))
            .await
            .unwrap();

        // First pass at 60s leaves it alone, second pass at 120s closes it.
        // Enumeration is the probe here: `get_server` would reset the idle
        // clock and keep the entry alive forever.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.list_servers().await.len(), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.list_servers().await.is_empty());
    }

    #[tokio::test]
    async fn loop_refreshes_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = ServerRegistry::new(RegistryConfig {
            sweep_interval_secs: 1,
            snapshot_path: Some(path.clone()),
            ..RegistryConfig::default()
        });
        let _ = registry
            .get_or_create_server(&ServerId::from_port(8201), handoff(8201))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let snap = crate::snapshot::read_snapshot(&path).await.unwrap();
        assert_eq!(snap.servers.len(), 1);
        assert_eq!(snap.servers[0].server_id.as_str(), "ws-8201");
        registry.shutdown().await;
    }
}
