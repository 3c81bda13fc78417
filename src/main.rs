use anyhow::Context;
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use booking_service::{
    config::{AppConfig, Config, LogFormat},
    database::Database,
    router, AppState,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn init_tracing(app: &AppConfig) {
    let filter = EnvFilter::try_new(&app.rust_log).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match app.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;

    init_tracing(&config.app);
    info!(
        "Starting booking service ({} environment)",
        config.app.environment
    );

    let db = Database::connect(&config.database)
        .await
        .context("failed to connect to database")?;

    db.run_migrations()
        .await
        .context("failed to run migrations")?;

    let state = AppState::new(config.clone(), &db)?;

    // --- Start background tasks ---

    // Сверка неизвестных исходов изменения ёмкости
    task::spawn(state.reconciliation.clone().run());
    info!(
        "Reconciliation scheduled every {}s",
        config.reconciliation.interval_seconds
    );

    // --- Start the web server ---

    let app = router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .context("invalid HOST/PORT")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}
