use std::net::SocketAddr;

use crate::command::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: host commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "reserva_commands_total";

/// Histogram: host command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "reserva_command_duration_seconds";

// ── Admission ───────────────────────────────────────────────────

/// Counter: admission decisions. Labels: op, outcome.
pub const ADMISSIONS_TOTAL: &str = "reserva_admissions_total";

/// Counter: check-and-write attempts lost to a concurrent writer.
pub const ADMISSION_RETRIES_TOTAL: &str = "reserva_admission_retries_total";

/// Counter: pending reservations cancelled by the expiry sweep.
pub const AUTO_EXPIRED_TOTAL: &str = "reserva_auto_expired_total";

/// Counter: negative availability observed. Should stay at zero.
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "reserva_invariant_violations_total";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reserva_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reserva_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::CreateResource { .. } => "create_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::SetResourceActive { .. } => "set_resource_active",
        Command::GetResource { .. } => "get_resource",
        Command::ListResources => "list_resources",
        Command::Submit(_) => "submit",
        Command::Approve { .. } => "approve",
        Command::Reject { .. } => "reject",
        Command::Cancel { .. } => "cancel",
        Command::Edit { .. } => "edit",
        Command::GetReservation { .. } => "get_reservation",
        Command::ListByResource { .. } => "list_by_resource",
        Command::ListPending => "list_pending",
        Command::GetRequester { .. } => "get_requester",
        Command::GlobalAvailable { .. } => "global_available",
        Command::WindowAvailable { .. } => "window_available",
        Command::Conflicts { .. } => "conflicts",
        Command::FreeWindows { .. } => "free_windows",
        Command::Compact => "compact",
    }
}
