use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roombook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roombook_query_duration_seconds";

// ── Admission outcomes ──────────────────────────────────────────

/// Counter: bookings admitted.
pub const BOOKINGS_ADMITTED_TOTAL: &str = "roombook_bookings_admitted_total";

/// Counter: booking requests turned away. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "roombook_bookings_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roombook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roombook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roombook_connections_rejected_total";

/// Counter: logins refused (unknown, inactive or wrong password).
pub const AUTH_FAILURES_TOTAL: &str = "roombook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a Command variant.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::DeactivateRoom { .. } => "deactivate_room",
        Command::SelectRooms => "select_rooms",
        Command::InsertUser { .. } => "insert_user",
        Command::DeactivateUser { .. } => "deactivate_user",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
    }
}

/// Label for a rejected booking request.
pub fn rejection_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::Conflict(reason) => reason.code(),
        EngineError::NotFound(..) => "not_found",
        EngineError::Forbidden => "forbidden",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::AlreadyExists(_) | EngineError::EmailTaken(_) => "already_exists",
        EngineError::InvalidInput(_) => "invalid_input",
        EngineError::WalError(_) => "internal",
    }
}
