use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "interviewd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "interviewd_query_duration_seconds";

/// Counter: committed or rejected mutations. Labels: op, outcome.
pub const MUTATIONS_TOTAL: &str = "interviewd_mutations_total";

/// Counter: creates/updates rejected because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "interviewd_slot_conflicts_total";

/// Counter: writes refused by the authorization guard. Labels: action.
pub const AUTH_DENIALS_TOTAL: &str = "interviewd_auth_denials_total";

/// Counter: audit entries appended.
pub const AUDIT_ENTRIES_TOTAL: &str = "interviewd_audit_entries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "interviewd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "interviewd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "interviewd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "interviewd_tenants_active";

/// Counter: connections that could not be bound to an actor or tenant.
pub const AUTH_FAILURES_TOTAL: &str = "interviewd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "interviewd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "interviewd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEvent { .. } => "insert_event",
        Command::UpdateEvent { .. } => "update_event",
        Command::DeleteEvent { .. } => "delete_event",
        Command::GetEvent { .. } => "get_event",
        Command::SelectEvents { .. } => "select_events",
        Command::SelectConflict { .. } => "select_conflict",
        Command::SelectAudit { .. } => "select_audit",
        Command::SelectAuditStats => "select_audit_stats",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
