//! Payload delivery with bounded retry.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use switchboard_core::{ClientId, RegistryError, Result, RetryConfig, ServerId};

use crate::client_table::{BroadcastOutcome, ClientTable};
use crate::connection::{EnqueueError, OutboundFrame};
use crate::metrics as names;

/// Proof of delivery, with the attempt count that got it there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchReceipt {
    /// Server the payload went through.
    pub server_id: ServerId,
    /// Client that accepted the payload.
    pub client_id: ClientId,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Delivers payloads to clients, retrying transient failures.
///
/// A missing client fails immediately: retrying cannot make an id reappear.
/// A closed or congested connection gets up to the configured attempt budget
/// with a fixed delay between tries; exhausting the budget surfaces the last
/// underlying failure.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    retry: RetryConfig,
}

impl Dispatcher {
    /// Build a dispatcher with the given retry budget.
    #[must_use]
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    /// Retry configuration in effect.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Deliver `payload` to one client, retrying transient failures.
    pub async fn send_to_client(
        &self,
        server_id: &ServerId,
        table: &ClientTable,
        client_id: &ClientId,
        payload: &str,
    ) -> Result<DispatchReceipt> {
        let budget = self.retry.effective_attempts();
        let shared = Arc::new(payload.to_owned());
        let mut last_err = None;

        for attempt in 1..=budget {
            match try_once(server_id, table, client_id, &shared).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(client_id = %client_id, attempt, "delivery succeeded after retry");
                    }
                    return Ok(DispatchReceipt {
                        server_id: server_id.clone(),
                        client_id: client_id.clone(),
                        attempts: attempt,
                    });
                }
                Err(err @ RegistryError::ClientNotFound { .. }) => return Err(err),
                Err(err) if err.retryable() && attempt < budget => {
                    counter!(names::SEND_RETRIES_TOTAL).increment(1);
                    warn!(
                        client_id = %client_id,
                        attempt,
                        error = %err,
                        "send attempt failed, retrying"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(self.retry.delay()).await;
                }
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            }
        }

        counter!(names::SEND_FAILURES_TOTAL).increment(1);
        Err(RegistryError::SendFailed {
            server_id: server_id.clone(),
            client_id: client_id.clone(),
            attempts: budget,
            source: last_err
                .map(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>),
        })
    }

    /// Queue `payload` for every client in the table, best-effort, no
    /// retries.
    pub async fn broadcast(&self, table: &ClientTable, payload: &str) -> BroadcastOutcome {
        table.broadcast(payload).await
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// One delivery attempt. Looks the client up fresh so a disconnect during
/// the retry window surfaces as `ClientNotFound` rather than another retry.
async fn try_once(
    server_id: &ServerId,
    table: &ClientTable,
    client_id: &ClientId,
    payload: &Arc<String>,
) -> Result<()> {
    let Some(conn) = table.get(client_id).await else {
        return Err(RegistryError::ClientNotFound {
            server_id: server_id.clone(),
            client_id: client_id.clone(),
        });
    };
    if !conn.is_open() {
        return Err(RegistryError::ConnectionNotOpen {
            server_id: server_id.clone(),
            client_id: client_id.clone(),
        });
    }
    match conn.enqueue(OutboundFrame::Message(payload.clone())) {
        Ok(()) => Ok(()),
        Err(EnqueueError::Closed) => Err(RegistryError::ConnectionNotOpen {
            server_id: server_id.clone(),
            client_id: client_id.clone(),
        }),
        Err(EnqueueError::Full) => Err(RegistryError::SendFailed {
            server_id: server_id.clone(),
            client_id: client_id.clone(),
            attempts: 1,
            source: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::connection::ClientConnection;

    fn make_client(capacity: usize) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(ClientConnection::new(
            ClientId::generate(),
            tx,
            CancellationToken::new(),
        ));
        (conn, rx)
    }

    fn server_id() -> ServerId {
        ServerId::from("ws-5680")
    }

    #[tokio::test]
    async fn first_attempt_success_records_one() {
        let table = ClientTable::new();
        let (conn, mut rx) = make_client(8);
        let client_id = conn.id().clone();
        let _ = table.insert(conn).await;

        let receipt = Dispatcher::default()
            .send_to_client(&server_id(), &table, &client_id, "hi")
            .await
            .unwrap();
        assert_eq!(receipt.attempts, 1);
        assert_eq!(receipt.client_id, client_id);
        assert_eq!(receipt.server_id, server_id());
        assert_matches!(rx.recv().await.unwrap(), OutboundFrame::Message(m) if *m == "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_records_three_attempts() {
        let table = ClientTable::new();
        let (conn, mut rx) = make_client(1);
        let client_id = conn.id().clone();
        conn.enqueue(OutboundFrame::Ping).unwrap(); // jam the queue
        let _ = table.insert(conn).await;

        // Free the queue between the second and third attempts, then keep
        // receiving so the channel stays open.
        let drainer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(750)).await;
            while rx.recv().await.is_some() {}
        });

        let receipt = Dispatcher::default()
            .send_to_client(&server_id(), &table, &client_id, "eventually")
            .await
            .unwrap();
        assert_eq!(receipt.attempts, 3);
        drainer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_send_failed_with_last_cause() {
        let table = ClientTable::new();
        let (conn, _rx) = make_client(1);
        let client_id = conn.id().clone();
        conn.enqueue(OutboundFrame::Ping).unwrap(); // stays jammed
        let _ = table.insert(conn).await;

        let err = Dispatcher::default()
            .send_to_client(&server_id(), &table, &client_id, "never")
            .await
            .unwrap_err();
        assert_matches!(err, RegistryError::SendFailed { attempts: 3, .. });
        assert!(err.source().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_client_fails_without_retrying() {
        let table = ClientTable::new();
        let before = tokio::time::Instant::now();

        let err = Dispatcher::default()
            .send_to_client(&server_id(), &table, &ClientId::generate(), "to nobody")
            .await
            .unwrap_err();
        assert_matches!(err, RegistryError::ClientNotFound { .. });
        // No retry delay was taken.
        assert_eq!(tokio::time::Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_retries_then_fails() {
        let table = ClientTable::new();
        let (conn, rx) = make_client(8);
        let client_id = conn.id().clone();
        drop(rx); // session gone, connection no longer open
        let _ = table.insert(conn).await;

        let err = Dispatcher::default()
            .send_to_client(&server_id(), &table, &client_id, "gone")
            .await
            .unwrap_err();
        assert_matches!(err, RegistryError::SendFailed { attempts: 3, .. });
        let cause = err.source().unwrap().to_string();
        assert!(cause.contains("not open"), "unexpected cause: {cause}");
    }

    #[tokio::test(start_paused = true)]
    async fn client_removed_mid_retry_surfaces_not_found() {
        let table = Arc::new(ClientTable::new());
        let (conn, _rx) = make_client(1);
        let client_id = conn.id().clone();
        conn.enqueue(OutboundFrame::Ping).unwrap();
        let _ = table.insert(conn).await;

        let table2 = table.clone();
        let removed_id = client_id.clone();
        let remover = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let _ = table2.remove(&removed_id).await;
        });

        let err = Dispatcher::default()
            .send_to_client(&server_id(), &table, &client_id, "vanishing")
            .await
            .unwrap_err();
        assert_matches!(err, RegistryError::ClientNotFound { .. });
        remover.await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_counts_all_clients() {
        let table = ClientTable::new();
        let (c1, _rx1) = make_client(8);
        let (c2, _rx2) = make_client(8);
        let _ = table.insert(c1).await;
        let _ = table.insert(c2).await;

        let outcome = Dispatcher::default().broadcast(&table, "pong").await;
        assert_eq!(outcome.sent, 2);
        assert_eq!(outcome.failed, 0);
    }
}
