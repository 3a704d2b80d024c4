use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "rosterd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "rosterd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rosterd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rosterd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rosterd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "rosterd_tenants_active";

/// Counter: tenant resolution failures at connection setup.
pub const TENANT_ERRORS_TOTAL: &str = "rosterd_tenant_errors_total";

/// Counter: sessions that crossed their lock cutoff.
pub const SESSIONS_LOCKED_TOTAL: &str = "rosterd_sessions_locked_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rosterd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rosterd_wal_flush_batch_size";

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
        Command::InsertUser { .. } => "insert_user",
        Command::InsertSession { .. } => "insert_session",
        Command::InsertSignup { .. } => "insert_signup",
        Command::InsertParticipant { .. } => "insert_participant",
        Command::DeleteSignup { .. } => "delete_signup",
        Command::DeleteParticipant { .. } => "delete_participant",
        Command::DeleteWaitlisted { .. } => "delete_waitlisted",
        Command::DeleteSession { .. } => "delete_session",
        Command::UpdateSlots { .. } => "update_slots",
        Command::UpdateDate { .. } => "update_date",
        Command::UpdateShuttles { .. } => "update_shuttles",
        Command::UpdateOrder { .. } => "update_order",
        Command::SelectSessions { .. } => "select_sessions",
        Command::SelectParticipants { .. } => "select_participants",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectRoster { .. } => "select_roster",
        Command::SelectUsers { .. } => "select_users",
        Command::Listen { .. } => "listen",
    }
}
