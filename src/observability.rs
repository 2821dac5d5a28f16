use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomshare_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomshare_query_duration_seconds";

// ── Connection metrics ──────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomshare_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomshare_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomshare_connections_rejected_total";

// ── Workflow metrics ────────────────────────────────────────────

/// Counter: approval decisions. Labels: outcome (approved, rejected).
pub const APPROVALS_TOTAL: &str = "roomshare_approvals_total";

/// Counter: transitions made by the background sweep.
/// Labels: kind (expired, moved_in, moved_out).
pub const SWEEP_TRANSITIONS_TOTAL: &str = "roomshare_sweep_transitions_total";

/// Gauge: rooms currently able to take a booking.
pub const ROOMS_AVAILABLE: &str = "roomshare_rooms_available";

// ── Storage metrics ─────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomshare_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomshare_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "roomshare_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::InsertProperty { .. } => "insert_property",
        Command::UpdateProperty { .. } => "update_property",
        Command::UpdateProfile { .. } => "update_profile",
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertRequest { .. } => "insert_request",
        Command::DecideRequest { accept: true, .. } => "approve_request",
        Command::DecideRequest { accept: false, .. } => "decline_request",
        Command::RecordDeparture { .. } => "record_departure",
        Command::InsertGuardianLink { .. } => "insert_guardian_link",
        Command::RespondGuardianLink { .. } => "respond_guardian_link",
        Command::SelectProperties { .. } => "select_properties",
        Command::SelectProfile => "select_profile",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectOccupancies { .. } => "select_occupancies",
        Command::SelectRequests { .. } => "select_requests",
        Command::SelectPendingCount => "select_pending_count",
        Command::SelectStays { .. } => "select_stays",
        Command::SelectGuardianLinks => "select_guardian_links",
        Command::Listen { .. } => "listen",
    }
}
