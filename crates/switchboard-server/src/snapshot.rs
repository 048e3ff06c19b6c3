//! Diagnostic snapshot of the registry.
//!
//! The snapshot file exists for humans and monitoring. The in-memory
//! registry is the only source of truth: nothing here is ever read back to
//! reconstruct a listener, because a listed port says nothing about whether
//! the process still holds it.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use switchboard_core::ServerId;

use crate::lifecycle::ServerPhase;

/// One server's diagnostic row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Registered id.
    pub server_id: ServerId,
    /// Bound (or host-owned) port.
    pub port: u16,
    /// Route path, with leading slash.
    pub path: String,
    /// Lifecycle phase at capture time.
    pub phase: ServerPhase,
    /// Connected clients.
    pub clients: usize,
    /// Registered executions.
    pub executions: usize,
    /// Registered workflows.
    pub workflows: usize,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    /// Seconds since the last recorded activity.
    pub idle_secs: u64,
}

/// Snapshot file contents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    /// ISO 8601 capture timestamp.
    pub taken_at: String,
    /// All registered servers at capture time.
    pub servers: Vec<ServerInfo>,
}

/// Write a snapshot of `servers` to `path`, creating parent directories.
pub async fn write_snapshot(path: &Path, servers: &[ServerInfo]) -> io::Result<()> {
    let snapshot = RegistrySnapshot {
        taken_at: chrono::Utc::now().to_rfc3339(),
        servers: servers.to_vec(),
    };
    let bytes = serde_json::to_vec_pretty(&snapshot).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}

/// Read a snapshot back, for diagnostics and tests only.
pub async fn read_snapshot(path: &Path) -> io::Result<RegistrySnapshot> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_info(port: u16) -> ServerInfo {
        ServerInfo {
            server_id: ServerId::from_port(port),
            port,
            path: "/ws".into(),
            phase: ServerPhase::Active,
            clients: 2,
            executions: 1,
            workflows: 1,
            created_at: chrono::Utc::now().to_rfc3339(),
            idle_secs: 7,
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let servers = vec![make_info(5680), make_info(5681)];
        write_snapshot(&path, &servers).await.unwrap();

        let back = read_snapshot(&path).await.unwrap();
        assert_eq!(back.servers, servers);
        assert!(chrono::DateTime::parse_from_rfc3339(&back.taken_at).is_ok());
    }

    #[tokio::test]
    async fn snapshot_file_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        write_snapshot(&path, &[make_info(5680)]).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert!(raw.get("takenAt").is_some());
        let row = &raw["servers"][0];
        assert_eq!(row["serverId"], "ws-5680");
        assert_eq!(row["port"], 5680);
        assert_eq!(row["phase"], "active");
        assert!(row.get("createdAt").is_some());
        assert!(row.get("idleSecs").is_some());
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/servers.json");
        write_snapshot(&path, &[]).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn read_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(read_snapshot(&path).await.is_err());
    }
}
