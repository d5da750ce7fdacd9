use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing_subscriber::EnvFilter;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "spincycle_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "spincycle_request_duration_seconds";

/// Counter: reservations created. Labels: category.
pub const RESERVATIONS_CREATED_TOTAL: &str = "spincycle_reservations_created_total";

/// Counter: create requests refused. Labels: kind.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "spincycle_reservations_rejected_total";

/// Counter: reservations moved to cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "spincycle_reservations_cancelled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "spincycle_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "spincycle_connections_total";

/// Counter: connections refused at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spincycle_connections_rejected_total";

/// Counter: failed connection authentications.
pub const AUTH_FAILURES_TOTAL: &str = "spincycle_auth_failures_total";

/// Counter: events an observer missed because it lagged.
pub const OBSERVER_EVENTS_DROPPED_TOTAL: &str = "spincycle_observer_events_dropped_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spincycle_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spincycle_wal_flush_batch_size";

/// Install the fmt subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request variant.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::Auth { .. } => "auth",
        Request::Create { .. } => "create",
        Request::Cancel { .. } => "cancel",
        Request::ListActive { .. } => "list_active",
        Request::Quota { .. } => "quota",
        Request::Machines => "machines",
        Request::RegisterMachine { .. } => "register_machine",
        Request::Subscribe { .. } => "subscribe",
    }
}
