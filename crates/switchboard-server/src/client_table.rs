//! Per-server mapping of client id to live connection handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::{counter, gauge};
use tokio::sync::RwLock;
use tracing::warn;

use switchboard_core::ClientId;

use crate::connection::{ClientConnection, EnqueueError, OutboundFrame};
use crate::metrics as names;

/// Result of a best-effort broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Clients whose outbound queue accepted the frame.
    pub sent: usize,
    /// Clients that could not take the frame (buffer full or session gone).
    pub failed: usize,
}

/// Live clients of one server.
///
/// The table changes only through explicit connect/disconnect handling; it is
/// never rebuilt by inference from the socket set.
pub struct ClientTable {
    clients: RwLock<HashMap<ClientId, Arc<ClientConnection>>>,
    /// Mirror of the map size, readable without awaiting the lock.
    count: AtomicUsize,
}

impl ClientTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            count: AtomicUsize::new(0),
        }
    }

    /// Add a connection. Returns the displaced handle if the id was already
    /// present, which generated ids make vanishingly unlikely.
    pub async fn insert(&self, connection: Arc<ClientConnection>) -> Option<Arc<ClientConnection>> {
        let mut clients = self.clients.write().await;
        let displaced = clients.insert(connection.id().clone(), connection);
        if displaced.is_none() {
            let _ = self.count.fetch_add(1, Ordering::Relaxed);
            gauge!(names::CLIENTS_ACTIVE).increment(1.0);
        }
        displaced
    }

    /// Remove a connection by id.
    pub async fn remove(&self, id: &ClientId) -> Option<Arc<ClientConnection>> {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(id);
        if removed.is_some() {
            let _ = self.count.fetch_sub(1, Ordering::Relaxed);
            gauge!(names::CLIENTS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Look up a connection by id.
    pub async fn get(&self, id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.clients.read().await.get(id).cloned()
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether the table has no clients.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all connected clients.
    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// Handles of all connected clients.
    pub async fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Queue `payload` for every client, serializing it once.
    ///
    /// Best-effort: a client that cannot take the frame is counted and
    /// logged, never aborts the loop.
    pub async fn broadcast(&self, payload: &str) -> BroadcastOutcome {
        let shared = Arc::new(payload.to_owned());
        let clients = self.clients.read().await;
        let mut outcome = BroadcastOutcome::default();
        for conn in clients.values() {
            match conn.enqueue(OutboundFrame::Message(shared.clone())) {
                Ok(()) => outcome.sent += 1,
                Err(EnqueueError::Full) => {
                    outcome.failed += 1;
                    counter!(names::BROADCAST_DROPS_TOTAL).increment(1);
                    warn!(client_id = %conn.id(), "broadcast dropped: outbound buffer full");
                }
                Err(EnqueueError::Closed) => {
                    outcome.failed += 1;
                    warn!(client_id = %conn.id(), "broadcast skipped: session gone");
                }
            }
        }
        outcome
    }

    /// Empty the table, returning every handle for teardown.
    pub async fn drain(&self) -> Vec<Arc<ClientConnection>> {
        let mut clients = self.clients.write().await;
        let drained: Vec<_> = clients.drain().map(|(_, conn)| conn).collect();
        self.count.store(0, Ordering::Relaxed);
        if !drained.is_empty() {
            gauge!(names::CLIENTS_ACTIVE).decrement(drained.len() as f64);
        }
        drained
    }
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn make_client(capacity: usize) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(ClientConnection::new(
            ClientId::generate(),
            tx,
            CancellationToken::new(),
        ));
        (conn, rx)
    }

    #[tokio::test]
    async fn insert_and_count() {
        let table = ClientTable::new();
        assert!(table.is_empty());

        let (c1, _rx1) = make_client(8);
        let (c2, _rx2) = make_client(8);
        assert!(table.insert(c1).await.is_none());
        assert!(table.insert(c2).await.is_none());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn remove_connection() {
        let table = ClientTable::new();
        let (conn, _rx) = make_client(8);
        let id = conn.id().clone();
        let _ = table.insert(conn).await;

        assert!(table.remove(&id).await.is_some());
        assert!(table.remove(&id).await.is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn get_returns_handle() {
        let table = ClientTable::new();
        let (conn, _rx) = make_client(8);
        let id = conn.id().clone();
        let _ = table.insert(conn).await;

        let found = table.get(&id).await.unwrap();
        assert_eq!(found.id(), &id);
        assert!(table.get(&ClientId::generate()).await.is_none());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_clients() {
        let table = ClientTable::new();
        let (c1, mut rx1) = make_client(8);
        let (c2, mut rx2) = make_client(8);
        let _ = table.insert(c1).await;
        let _ = table.insert(c2).await;

        let outcome = table.broadcast("pong").await;
        assert_eq!(outcome, BroadcastOutcome { sent: 2, failed: 0 });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                OutboundFrame::Message(m) => assert_eq!(*m, "pong"),
                other => panic!("expected message frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn broadcast_counts_full_buffers() {
        let table = ClientTable::new();
        let (healthy, mut rx) = make_client(8);
        let (stuck, _stuck_rx) = make_client(1);
        stuck.enqueue(OutboundFrame::Ping).unwrap(); // fill the buffer
        let _ = table.insert(healthy).await;
        let _ = table.insert(stuck).await;

        let outcome = table.broadcast("hello").await;
        assert_eq!(outcome.sent, 1);
        assert_eq!(outcome.failed, 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            OutboundFrame::Message(_)
        ));
    }

    #[tokio::test]
    async fn broadcast_empty_table() {
        let table = ClientTable::new();
        let outcome = table.broadcast("anyone?").await;
        assert_eq!(outcome, BroadcastOutcome::default());
    }

    #[tokio::test]
    async fn drain_empties_table() {
        let table = ClientTable::new();
        let (c1, _rx1) = make_client(8);
        let (c2, _rx2) = make_client(8);
        let _ = table.insert(c1).await;
        let _ = table.insert(c2).await;

        let drained = table.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        assert!(table.client_ids().await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_lists_handles() {
        let table = ClientTable::new();
        let (c1, _rx1) = make_client(8);
        let id = c1.id().clone();
        let _ = table.insert(c1).await;

        let snap = table.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id(), &id);
    }
}
