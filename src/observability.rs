use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotkeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotkeeper_query_duration_seconds";

/// Histogram: slot generation time in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "slotkeeper_slot_query_duration_seconds";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: appointments created. Labels: channel.
pub const RESERVATIONS_TOTAL: &str = "slotkeeper_reservations_total";

/// Counter: writes rejected because the staff member was busy. Labels: op.
pub const CONFLICTS_TOTAL: &str = "slotkeeper_conflicts_total";

pub const MOVES_TOTAL: &str = "slotkeeper_moves_total";

/// Counter: status changes. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "slotkeeper_transitions_total";

/// Counter: waitlist writes. Labels: op.
pub const WAITLIST_MUTATIONS_TOTAL: &str = "slotkeeper_waitlist_mutations_total";

/// Counter: notifications the sink failed to deliver. Labels: kind.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "slotkeeper_notification_failures_total";

// ── Gateway ─────────────────────────────────────────────────────

/// Counter: retried attempts after a transient store failure. Labels: op.
pub const GATEWAY_RETRIES_TOTAL: &str = "slotkeeper_gateway_retries_total";

/// Counter: calls that hit the deadline. Labels: op.
pub const GATEWAY_TIMEOUTS_TOTAL: &str = "slotkeeper_gateway_timeouts_total";

/// Counter: confirms answered from an earlier call with the same call id.
pub const IDEMPOTENT_REPLAYS_TOTAL: &str = "slotkeeper_idempotent_replays_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotkeeper_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertLocation { .. } => "upsert_location",
        Command::UpsertService { .. } => "upsert_service",
        Command::UpsertStaff { .. } => "upsert_staff",
        Command::InsertTimeOff { .. } => "insert_time_off",
        Command::DeleteTimeOff { .. } => "delete_time_off",
        Command::SelectSlots { .. } => "select_slots",
        Command::ConfirmAppointment { .. } => "confirm_appointment",
        Command::MoveAppointment { .. } => "move_appointment",
        Command::TransitionAppointment { .. } => "transition_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::JoinWaitlist { .. } => "join_waitlist",
        Command::UpdateWaitlist { .. } => "update_waitlist",
        Command::ReorderWaitlist { .. } => "reorder_waitlist",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectWaitlistEntry { .. } => "select_waitlist_entry",
    }
}
