//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::InMemoryQueue;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: PrometheusHandle,
    pub queue: InMemoryQueue,
}

/// GET /metrics: samples queue depth and returns Prometheus-formatted metrics.
pub async fn get(State(state): State<MetricsState>) -> impl IntoResponse {
    metrics::gauge!("saga_queue_pending").set(state.queue.pending() as f64);
    metrics::gauge!("saga_queue_in_flight").set(state.queue.in_flight() as f64);
    metrics::gauge!("saga_dead_letters").set(state.queue.dead_letters().len() as f64);

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.handle.render(),
    )
}
