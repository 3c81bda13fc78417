pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod models;
pub mod services;

use std::sync::Arc;

use crate::services::{
    BookingOrchestrator, HttpInventoryGateway, PgBookingRepository, PgRefundOutbox, PgSeatLedger,
    ReconciliationService,
};

// Shared state для всего приложения
#[derive(Clone)]
pub struct AppState {
    pub config: config::Config,
    pub orchestrator: Arc<BookingOrchestrator>,
    pub reconciliation: Arc<ReconciliationService>,
}

impl AppState {
    /// Боевая сборка: Postgres + HTTP-клиент сервиса событий.
    pub fn new(config: config::Config, db: &database::Database) -> anyhow::Result<Arc<Self>> {
        let inventory = HttpInventoryGateway::from_config(&config.inventory, &config.circuit_breaker)?;

        let orchestrator = Arc::new(BookingOrchestrator::new(
            Arc::new(PgSeatLedger::new(db.pool.clone())),
            Arc::new(PgBookingRepository::new(db.pool.clone())),
            Arc::new(inventory),
            Arc::new(PgRefundOutbox::new(db.pool.clone())),
            config.booking.default_currency.clone(),
        ));

        Ok(Self::with_orchestrator(config, orchestrator))
    }

    pub fn with_orchestrator(
        config: config::Config,
        orchestrator: Arc<BookingOrchestrator>,
    ) -> Arc<Self> {
        let reconciliation = Arc::new(ReconciliationService::new(
            orchestrator.clone(),
            config.reconciliation.clone(),
        ));

        Arc::new(Self {
            config,
            orchestrator,
            reconciliation,
        })
    }
}

/// Роутер без слоёв трассировки - их навешивает `main`.
pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::get(|| async { "Booking Service v1.0" }))
        .route("/health", axum::routing::get(|| async { "OK" }))
        .nest("/api", controllers::routes())
        .with_state(state)
}
