//! Saga host entry point.

use std::sync::Arc;

use saga::SagaWorkerPool;
use saga_host::config::{Config, LogFormat};
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn open_store(config: &Config) -> Result<Arc<dyn SagaStore>, Box<dyn std::error::Error>> {
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::PgPool::connect(url).await?;
            let store = PostgresSagaStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL saga store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("using in-memory saga store");
            Ok(Arc::new(InMemorySagaStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);
    config.saga.validate()?;

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Build the saga runtime
    let store = open_store(&config).await?;
    let state = saga_host::create_default_state(&config.saga, store)?;
    let pool = SagaWorkerPool::start(
        &config.saga,
        Arc::new(state.queue.clone()),
        Arc::clone(&state.dispatcher),
    )?;

    // 4. Build the application
    let app = saga_host::create_app(Arc::clone(&state), metrics_handle);

    // 5. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting saga host");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Stop intake and drain in-flight dispatches
    state.queue.close();
    pool.shutdown().await;
    tracing::info!(
        pending = state.queue.pending(),
        dead_letters = state.queue.dead_letters().len(),
        "saga host shut down gracefully"
    );
    Ok(())
}
