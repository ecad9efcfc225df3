use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{Router, http::StatusCode, routing::get};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // try_init so embedding callers that already installed a subscriber keep theirs.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .try_init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                warn!(%err, "metrics recorder already installed; metrics will not be exported");
            }
            handle
        })
        .clone()
}

/// Register an existing Prometheus handle without installing a new recorder.
pub fn register_metrics_handle(handle: PrometheusHandle) -> PrometheusHandle {
    METRICS_HANDLE.get_or_init(|| handle).clone()
}

pub async fn serve_metrics_with_shutdown<S>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "metrics server listening");
    axum::serve(listener, metrics_router(handle))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    )
}

pub fn record_cycle_result(result: &str) {
    counter!(
        "dockate_cycle_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_cycle_duration(result: &str, duration: Duration) {
    histogram!(
        "dockate_cycle_duration_ms",
        "result" => result.to_string()
    )
    .record(duration.as_secs_f64() * 1000.0);
}

pub fn record_snapshot(services: usize, nodes: usize) {
    gauge!("dockate_snapshot_services").set(services as f64);
    gauge!("dockate_snapshot_nodes").set(nodes as f64);
}

pub fn record_constraint_dropped(reason: &str) {
    counter!(
        "dockate_constraints_dropped_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_orphan_task() {
    counter!("dockate_orphan_tasks_total").increment(1);
}

pub fn record_orchestrator_request(operation: &str, result: &str) {
    counter!(
        "dockate_orchestrator_requests_total",
        "operation" => operation.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}
