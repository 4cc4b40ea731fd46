//! Saga worker host with HTTP diagnostics.
//!
//! Runs the saga worker pool against an in-process queue and exposes
//! message intake, saga lookup, lock diagnostics, structured logging
//! (tracing) and Prometheus metrics over HTTP.

pub mod config;
pub mod counter;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InMemoryQueue, SagaConfig, SagaDispatcher, SagaError, SagaRegistry};
use saga_locks::{InMemorySagaLocks, SagaLocks};
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::metrics::MetricsState;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub queue: InMemoryQueue,
    pub dispatcher: Arc<SagaDispatcher>,
    pub store: Arc<dyn SagaStore>,
    pub locks: Arc<dyn SagaLocks>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(MetricsState {
            handle: metrics_handle,
            queue: state.queue.clone(),
        });

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/messages", post(routes::messages::send))
        .route("/locks", get(routes::locks::list))
        .route("/sagas/{id}", get(routes::sagas::get))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state around `store`, with the demo counter
/// saga registered and an in-memory lock backend.
pub fn create_default_state(
    config: &SagaConfig,
    store: Arc<dyn SagaStore>,
) -> Result<Arc<AppState>, SagaError> {
    let mut registry = SagaRegistry::new();
    registry.register(counter::CounterSaga)?;

    let locks: Arc<dyn SagaLocks> = Arc::new(InMemorySagaLocks::new());
    let dispatcher = Arc::new(SagaDispatcher::new(
        registry,
        Arc::clone(&store),
        Arc::clone(&locks),
        config,
    ));

    Ok(Arc::new(AppState {
        queue: InMemoryQueue::new(config.max_delivery_attempts),
        dispatcher,
        store,
        locks,
    }))
}
