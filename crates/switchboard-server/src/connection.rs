//! Per-client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use switchboard_core::ClientId;

/// A frame queued for delivery to one client.
///
/// Heartbeat pings and server-initiated closes travel through the same
/// bounded channel as payload messages, so per-connection ordering is strict
/// FIFO across all three.
#[derive(Clone, Debug)]
pub enum OutboundFrame {
    /// Application payload. Shared so a broadcast serializes once.
    Message(Arc<String>),
    /// Heartbeat probe.
    Ping,
    /// Close the socket with a normal closure code and end the session.
    Close,
}

/// Why an enqueue failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The outbound buffer is full. Transient; the frame was dropped.
    Full,
    /// The session has shut down its receive side.
    Closed,
}

/// Handle for one accepted WebSocket client.
///
/// The session loop owns the socket; everything else (heartbeat, dispatcher,
/// broadcast) talks to the client exclusively through this handle.
pub struct ClientConnection {
    id: ClientId,
    /// Channel into the session's outbound pump.
    tx: mpsc::Sender<OutboundFrame>,
    connected_at: Instant,
    /// Whether the client has responded since the last heartbeat check.
    is_alive: AtomicBool,
    /// When the last pong (or any liveness signal) was received.
    last_pong: Mutex<Instant>,
    /// Frames dropped because the outbound buffer was full.
    dropped_frames: AtomicU64,
    /// Cancelling this terminates the session without a close handshake.
    kill: CancellationToken,
}

impl ClientConnection {
    /// Create a handle over the session's outbound channel.
    #[must_use]
    pub fn new(id: ClientId, tx: mpsc::Sender<OutboundFrame>, kill: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
            kill,
        }
    }

    /// The generated client id.
    #[must_use]
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Queue a frame for delivery.
    ///
    /// Never blocks. A full buffer drops the frame and bumps the drop
    /// counter; a closed channel means the session is gone.
    pub fn enqueue(&self, frame: OutboundFrame) -> Result<(), EnqueueError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Whether the session is still consuming frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Mark the connection alive (pong or inbound activity).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag for the heartbeat cycle.
    ///
    /// Returns `true` if the client showed life since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Duration since the last liveness signal.
    #[must_use]
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Total frames dropped for this connection.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Connection age.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Terminate the session forcibly, skipping the close handshake.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Token the session loop selects on for forcible termination.
    #[must_use]
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}
