//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use saga::{RecoveryScanner, SagaExecutor};
use sqlx::postgres::PgPoolOptions;
use step_log::{InMemoryStepLog, PostgresStepLog, SagaStore};
use tokio::signal;
use tokio::sync::watch;
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
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn open_step_log(config: &Config) -> (Arc<dyn SagaStore>, &'static str) {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to DATABASE_URL");
            let store = PostgresStepLog::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run step log migrations");
            tracing::info!("using PostgreSQL step log");
            (Arc::new(store), "postgres")
        }
        None => {
            tracing::warn!("DATABASE_URL not set, step log is in memory and will not survive a restart");
            (Arc::new(InMemoryStepLog::new()), "memory")
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Open the step log and build the application state
    let (store, backend) = open_step_log(&config).await;
    let state = api::create_default_state(store, backend, &config);

    // 4. Resume anything a previous process left unfinished
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor: SagaExecutor<dyn SagaStore> = state.coordinator.executor().clone();
    let scanner = Arc::new(RecoveryScanner::new(executor, config.recovery_config()));
    let recovery = scanner.spawn(shutdown_rx);

    // 5. Build the application
    let app = api::create_app(state, metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, worker_id = %config.worker_id, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Stop the recovery loop; in-flight sagas keep their leases and are
    // picked up after the TTL by the next process.
    let _ = shutdown_tx.send(true);
    if let Err(err) = recovery.await {
        tracing::error!(error = %err, "recovery task panicked");
    }

    tracing::info!("server shut down gracefully");
}
