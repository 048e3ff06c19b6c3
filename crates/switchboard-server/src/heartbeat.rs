//! Heartbeat ping/pong liveness sweeping over a server's client table.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use switchboard_core::{DisconnectReason, ServerEvent, ServerId};

use crate::client_table::ClientTable;
use crate::connection::{EnqueueError, OutboundFrame};
use crate::metrics as names;

/// Drive liveness checks for one server until cancelled.
///
/// Each tick queues a ping for every client that answered the previous one
/// and evicts every client that did not. A single missed pong is enough: a
/// peer that cannot answer a ping cannot be trusted to complete a close
/// handshake either, so eviction tears the session down without a close
/// frame.
pub(crate) async fn run_heartbeat(
    server_id: ServerId,
    table: Arc<ClientTable>,
    events: broadcast::Sender<ServerEvent>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = time::interval(interval);
    // A stalled loop must not burst catch-up ticks; back-to-back ticks would
    // evict clients that had no window to pong.
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                let evicted = sweep_once(&server_id, &table, &events).await;
                if evicted > 0 {
                    debug!(server_id = %server_id, evicted, "heartbeat sweep evicted clients");
                }
            }
            () = cancel.cancelled() => {
                debug!(server_id = %server_id, "heartbeat loop stopped");
                return;
            }
        }
    }
}

/// One liveness pass: evict clients that missed the previous ping, queue a
/// new ping for the rest. Returns the number of evictions.
async fn sweep_once(
    server_id: &ServerId,
    table: &ClientTable,
    events: &broadcast::Sender<ServerEvent>,
) -> usize {
    let mut evicted = 0;
    for conn in table.snapshot().await {
        if conn.check_alive() {
            match conn.enqueue(OutboundFrame::Ping) {
                // A closed queue means the session is already tearing down.
                Ok(()) | Err(EnqueueError::Closed) => {}
                Err(EnqueueError::Full) => {
                    warn!(client_id = %conn.id(), "outbound buffer full, ping skipped");
                }
            }
            continue;
        }

        let Some(conn) = table.remove(conn.id()).await else {
            // Session cleanup removed it between snapshot and here.
            continue;
        };
        conn.kill();
        counter!(names::CLIENT_EVICTIONS_TOTAL).increment(1);
        warn!(
            server_id = %server_id,
            client_id = %conn.id(),
            "evicting unresponsive client after missed pong"
        );
        let _ = events.send(ServerEvent::client_disconnected(
            server_id.clone(),
            conn.id().clone(),
            DisconnectReason::HeartbeatTimeout,
        ));
        evicted += 1;
    }
    evicted
}
