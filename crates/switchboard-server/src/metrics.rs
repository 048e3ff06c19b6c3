//! Metric name constants.
//!
//! Every metric the registry records is named here so dashboards and alerts
//! have a single source of truth. The crate only records values; installing
//! a recorder/exporter is up to the host process.

/// Number of live server entries (gauge).
pub const SERVERS_ACTIVE: &str = "ws_servers_active";

/// Number of currently connected clients across all servers (gauge).
pub const CLIENTS_ACTIVE: &str = "ws_clients_active";

/// Total server entries created (counter).
pub const SERVER_CREATES_TOTAL: &str = "ws_server_creates_total";

/// Total server closes (counter, labels: kind = hard|soft).
pub const SERVER_CLOSES_TOTAL: &str = "ws_server_closes_total";

/// Total client connections accepted (counter).
pub const CLIENTS_TOTAL: &str = "ws_clients_total";

/// Clients evicted by the heartbeat monitor (counter).
pub const CLIENT_EVICTIONS_TOTAL: &str = "ws_client_evictions_total";

/// Inbound frames normalized into message events (counter).
pub const MESSAGES_RECEIVED_TOTAL: &str = "ws_messages_received_total";

/// Outbound payload frames written to sockets (counter).
pub const MESSAGES_SENT_TOTAL: &str = "ws_messages_sent_total";

/// Dispatcher retry attempts beyond the first (counter).
pub const SEND_RETRIES_TOTAL: &str = "ws_send_retries_total";

/// Dispatcher sends that exhausted their retry budget (counter).
pub const SEND_FAILURES_TOTAL: &str = "ws_send_failures_total";

/// Frames dropped because a client's outbound buffer was full (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";

/// Lifetime of a client connection from accept to removal (histogram, seconds).
pub const CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            SERVERS_ACTIVE,
            CLIENTS_ACTIVE,
            SERVER_CREATES_TOTAL,
            SERVER_CLOSES_TOTAL,
            CLIENTS_TOTAL,
            CLIENT_EVICTIONS_TOTAL,
            MESSAGES_RECEIVED_TOTAL,
            MESSAGES_SENT_TOTAL,
            SEND_RETRIES_TOTAL,
            SEND_FAILURES_TOTAL,
            BROADCAST_DROPS_TOTAL,
            CONNECTION_DURATION_SECONDS,
        ];
        for name in names {
            assert!(
                name.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
                "metric name {name} is not snake_case"
            );
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let names = [
            SERVERS_ACTIVE,
            CLIENTS_ACTIVE,
            SERVER_CREATES_TOTAL,
            SERVER_CLOSES_TOTAL,
            CLIENTS_TOTAL,
            CLIENT_EVICTIONS_TOTAL,
            MESSAGES_RECEIVED_TOTAL,
            MESSAGES_SENT_TOTAL,
            SEND_RETRIES_TOTAL,
            SEND_FAILURES_TOTAL,
            BROADCAST_DROPS_TOTAL,
            CONNECTION_DURATION_SECONDS,
        ];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
