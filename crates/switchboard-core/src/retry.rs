//! Dispatch retry configuration.
//!
//! Delivery to a client retries on transient failures with a fixed delay
//! between attempts. The async retry loop itself lives in the server crate
//! (which has access to tokio); this module holds the portable knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default total delivery attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default fixed delay between attempts in milliseconds.
pub const DEFAULT_DELAY_MS: u64 = 500;

/// Configuration for dispatch retry logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total delivery attempts including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts in ms (default: 500). No backoff.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl RetryConfig {
    /// Delay between attempts as a [`Duration`].
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Attempt budget, clamped so a zero config still tries once.
    #[must_use]
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
