//! Endpoint identity and registry tuning.
//!
//! Two layers: [`ServerConfig`] identifies one endpoint (what to bind, how
//! it may be shared) and travels with every trigger attachment, while
//! [`RegistryConfig`] tunes the registry as a whole (timeouts, buffers,
//! limits) and is fixed at construction.
//!
//! Loading flow for [`RegistryConfig::load_from_path`]:
//! 1. Start with compiled defaults
//! 2. Deep-merge the JSON file over them, when present
//! 3. Apply `SWITCHBOARD_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use switchboard_core::RetryConfig;

/// How a bound endpoint may be shared between workflows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingMode {
    /// Independent workflows may multiplex one listener.
    #[default]
    Shared,
    /// One workflow owns the listener; any teardown request fully closes it.
    Exclusive,
}

/// Whether upgrade requests must pass the host-supplied verifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Accept every upgrade on the configured path.
    #[default]
    None,
    /// Run the [`AuthVerifier`](crate::listener::AuthVerifier) before
    /// completing the handshake; rejected upgrades allocate nothing.
    Required,
}

/// Who owns the TCP socket for an endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    /// Bind a dedicated listener on `host:port`.
    #[default]
    Direct,
    /// Own no socket; the host mounts the upgrade route on its own listener.
    Handoff,
}

/// Identity of one WebSocket endpoint.
///
/// A bind conflict on `host:port` fails the call; there is no fallback port
/// scanning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Upgrade path (default `"/ws"`).
    pub path: String,
    /// Sharing mode consulted by lifecycle decisions.
    pub sharing: SharingMode,
    /// Whether upgrades must pass the auth verifier.
    pub auth: AuthMode,
    /// Socket ownership.
    pub bind: BindMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            path: "/ws".into(),
            sharing: SharingMode::default(),
            auth: AuthMode::default(),
            bind: BindMode::default(),
        }
    }
}

impl ServerConfig {
    /// Whether `other` describes the same binding, so an existing listener
    /// can be reused as-is. Any difference forces the old listener to be
    /// fully closed before a fresh one is created.
    #[must_use]
    pub fn same_binding(&self, other: &ServerConfig) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.route_path() == other.route_path()
            && self.sharing == other.sharing
            && self.auth == other.auth
            && self.bind == other.bind
    }

    /// Upgrade path with a guaranteed leading slash.
    #[must_use]
    pub fn route_path(&self) -> String {
        if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        }
    }
}

/// Registry-wide tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Seconds between heartbeat ping cycles.
    pub heartbeat_interval_secs: u64,
    /// Seconds between idle sweep passes.
    pub sweep_interval_secs: u64,
    /// Seconds of inactivity before an unreferenced, clientless server is
    /// reclaimed by the sweep.
    pub idle_timeout_secs: u64,
    /// Bound on waiting for a listener to unbind during hard close.
    pub unbind_timeout_secs: u64,
    /// Grace window before a deferred close fires, so registration races
    /// settle first.
    pub close_grace_ms: u64,
    /// Watchdog timeout for a registered execution.
    pub execution_timeout_secs: u64,
    /// Dispatcher retry policy.
    pub retry: RetryConfig,
    /// Outbound frames buffered per client connection.
    pub send_buffer: usize,
    /// Server events buffered per subscriber.
    pub event_buffer: usize,
    /// Maximum concurrent clients per server; upgrades beyond this are
    /// refused with `503`.
    pub max_clients: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_bytes: usize,
    /// Where the diagnostic snapshot is written, if anywhere.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            sweep_interval_secs: 300,
            idle_timeout_secs: 1800,
            unbind_timeout_secs: 5,
            close_grace_ms: 1000,
            execution_timeout_secs: 30,
            retry: RetryConfig::default(),
            send_buffer: 1024,
            event_buffer: 256,
            max_clients: 256,
            max_message_bytes: 16 * 1024 * 1024, // 16 MiB
            snapshot_path: None,
        }
    }
}

impl RegistryConfig {
    /// Interval between heartbeat cycles.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Interval between idle sweep passes.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Inactivity threshold for the idle sweep.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Bound on listener unbind during hard close.
    #[must_use]
    pub fn unbind_timeout(&self) -> Duration {
        Duration::from_secs(self.unbind_timeout_secs)
    }

    /// Grace window for deferred closes.
    #[must_use]
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Watchdog timeout for registered executions.
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// Load from `path` with environment overrides applied on top.
    ///
    /// A missing file yields defaults; an unreadable or invalid file is an
    /// error so a typo never silently reverts tuning to defaults.
    pub fn load_from_path(path: &Path) -> Result<RegistryConfig, ConfigError> {
        let defaults = serde_json::to_value(RegistryConfig::default())?;

        let merged = if path.exists() {
            debug!(?path, "loading registry config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        } else {
            debug!(?path, "config file not found, using defaults");
            defaults
        };

        let mut config: RegistryConfig = serde_json::from_value(merged)?;
        apply_env_overrides(&mut config);
        Ok(config)
    }
}

/// Errors from loading a [`RegistryConfig`] file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The file or the merged document does not deserialize.
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per-key with `source` winning; arrays and primitives are
/// replaced entirely; null values in `source` are skipped so a file can
/// never unset a default.
#[must_use]
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SWITCHBOARD_*` environment overrides.
///
/// Integers must parse and fall within their documented range; invalid
/// values are logged and ignored rather than propagated.
pub fn apply_env_overrides(config: &mut RegistryConfig) {
    // ── Timing ──────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("SWITCHBOARD_HEARTBEAT_INTERVAL_SECS", 1, 3600) {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = read_env_u64("SWITCHBOARD_SWEEP_INTERVAL_SECS", 1, 86_400) {
        config.sweep_interval_secs = v;
    }
    if let Some(v) = read_env_u64("SWITCHBOARD_IDLE_TIMEOUT_SECS", 1, 604_800) {
        config.idle_timeout_secs = v;
    }
    if let Some(v) = read_env_u64("SWITCHBOARD_UNBIND_TIMEOUT_SECS", 1, 300) {
        config.unbind_timeout_secs = v;
    }
    if let Some(v) = read_env_u64("SWITCHBOARD_CLOSE_GRACE_MS", 0, 60_000) {
        config.close_grace_ms = v;
    }
    if let Some(v) = read_env_u64("SWITCHBOARD_EXECUTION_TIMEOUT_SECS", 1, 86_400) {
        config.execution_timeout_secs = v;
    }

    // ── Capacity ────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("SWITCHBOARD_MAX_CLIENTS", 1, 100_000) {
        config.max_clients = v;
    }
    if let Some(v) = read_env_usize("SWITCHBOARD_MAX_MESSAGE_BYTES", 1024, 1_073_741_824) {
        config.max_message_bytes = v;
    }

    // ── Snapshot ────────────────────────────────────────────────────
    if let Some(v) = read_env_string("SWITCHBOARD_SNAPSHOT_PATH") {
        config.snapshot_path = Some(PathBuf::from(v));
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u64` within a range.
#[must_use]
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
#[must_use]
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
