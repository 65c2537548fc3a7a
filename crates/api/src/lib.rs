//! HTTP API server with observability for the saga coordinator.
//!
//! Provides REST endpoints for submitting and observing sagas plus a demo
//! payment saga, with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    ActionRegistry, InMemoryAccountService, InMemoryInventoryService, InMemoryOrderService,
    SagaCoordinator, SagaExecutor, register_payment_actions,
};
use step_log::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::sagas::AppState;

/// Account seeded into the demo services at startup.
pub const DEMO_ACCOUNT: &str = "acct-1";
/// Product seeded into the demo inventory at startup.
pub const DEMO_PRODUCT: &str = "SKU-001";

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/sagas", post(routes::sagas::submit))
        .route("/sagas", get(routes::sagas::list))
        .route("/sagas/{id}", get(routes::sagas::get))
        .route("/sagas/{id}/outcome", get(routes::sagas::outcome))
        .route("/payments", post(routes::payments::create))
        .route("/accounts/{id}", get(routes::payments::account))
        .route("/orders/{id}", get(routes::payments::order))
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

/// Creates the application state: payment participants registered against
/// `store`, with a funded demo account and stocked demo product.
pub fn create_default_state(
    store: Arc<dyn SagaStore>,
    backend: &'static str,
    config: &Config,
) -> Arc<AppState> {
    let orders = InMemoryOrderService::new();
    let accounts = InMemoryAccountService::new();
    let inventory = InMemoryInventoryService::new();
    accounts.deposit(DEMO_ACCOUNT, 100_000);
    inventory.add_stock(DEMO_PRODUCT, 100);

    let mut registry = ActionRegistry::new();
    register_payment_actions(
        &mut registry,
        orders.clone(),
        accounts.clone(),
        inventory.clone(),
    );

    let executor = SagaExecutor::new(store, Arc::new(registry), config.executor_config());
    let coordinator = SagaCoordinator::new(executor, config.worker_id.clone());

    Arc::new(AppState {
        coordinator,
        orders,
        accounts,
        inventory,
        backend,
    })
}
