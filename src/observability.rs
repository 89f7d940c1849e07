use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "clinicslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "clinicslot_query_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (booked, conflict, invalid, error).
pub const BOOKINGS_TOTAL: &str = "clinicslot_bookings_total";

/// Counter: committed status changes. Labels: status.
pub const STATUS_CHANGES_TOTAL: &str = "clinicslot_status_changes_total";

/// Counter: slot queries answered empty because storage was unavailable.
pub const SLOT_QUERIES_DEGRADED_TOTAL: &str = "clinicslot_slot_queries_degraded_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "clinicslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "clinicslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "clinicslot_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "clinicslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "clinicslot_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "clinicslot_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None;
/// a failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertClinic { .. } => "insert_clinic",
        Command::InsertOpeningHours { .. } => "insert_opening_hours",
        Command::DeleteOpeningHours { .. } => "delete_opening_hours",
        Command::SelectOpeningHours { .. } => "select_opening_hours",
        Command::InsertClosure { .. } => "insert_closure",
        Command::DeleteClosure { .. } => "delete_closure",
        Command::SelectClosures { .. } => "select_closures",
        Command::InsertProfessional(_) => "insert_professional",
        Command::SelectProfessionals { .. } => "select_professionals",
        Command::InsertPatient(_) => "insert_patient",
        Command::InsertAppointmentType(_) => "insert_appointment_type",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::UpdateAppointmentStatus { .. } => "update_appointment_status",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
    }
}
