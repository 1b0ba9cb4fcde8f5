use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "uniroom_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "uniroom_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "uniroom_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "uniroom_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "uniroom_connections_rejected_total";

/// Gauge: number of active campuses (loaded engines).
pub const CAMPUSES_ACTIVE: &str = "uniroom_campuses_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "uniroom_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "uniroom_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "uniroom_wal_flush_batch_size";

// ── Domain counters ─────────────────────────────────────────────

/// Counter: contested booking outcomes. Labels: kind
/// (base_schedule, teacher_or_admin, student_blocked).
pub const RESERVATION_CONFLICTS_TOTAL: &str = "uniroom_reservation_conflicts_total";

/// Counter: reservations displaced by a higher-priority requester.
pub const OVERRIDES_TOTAL: &str = "uniroom_overrides_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertClassBlock { .. } => "insert_class_block",
        Command::DeleteClassBlock { .. } => "delete_class_block",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectRooms => "select_rooms",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectMyReservations => "select_my_reservations",
        Command::SelectRoomDay { .. } => "select_room_day",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectOverrides => "select_overrides",
    }
}
