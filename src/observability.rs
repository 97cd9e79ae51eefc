use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "barre_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "barre_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "barre_bookings_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "barre_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "barre_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "barre_connections_rejected_total";

/// Counter: login names that are not a known account ULID.
pub const AUTH_FAILURES_TOTAL: &str = "barre_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "barre_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "barre_wal_flush_batch_size";

// ── Sweep ───────────────────────────────────────────────────────

/// Counter: bookings moved from booked to missed by the sweep.
pub const RECONCILED_TOTAL: &str = "barre_reconciled_total";

/// Histogram: duration of one full sweep in seconds.
pub const RECONCILE_DURATION_SECONDS: &str = "barre_reconcile_duration_seconds";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::InsertAccount { .. } => "insert_account",
        Command::InsertStyle { .. } => "insert_style",
        Command::UpdateStyle { .. } => "update_style",
        Command::DeleteStyle { .. } => "delete_style",
        Command::InsertTrainer { .. } => "insert_trainer",
        Command::SetTrainerStyles { .. } => "set_trainer_styles",
        Command::InsertSchedule { .. } => "insert_schedule",
        Command::InsertRecurring { .. } => "insert_recurring",
        Command::UpdateSchedule { .. } => "update_schedule",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::MarkBookings { .. } => "mark_bookings",
        Command::SweepMissed => "sweep_missed",
        Command::SelectOccurrences { .. } => "select_occurrences",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectRoster { .. } => "select_roster",
        Command::SelectOwnBookings => "select_own_bookings",
        Command::SelectBookingStats => "select_booking_stats",
        Command::SelectStyles => "select_styles",
        Command::SelectTrainers => "select_trainers",
    }
}
