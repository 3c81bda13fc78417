use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;

/// Пул соединений с журналом мест и броней.
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            // ожидание соединения дольше - уже сбой, а не очередь
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await?;

        info!("Connected to Postgres (pool size {})", config.pool_size);
        Ok(Database { pool })
    }

    /// Схема встроена в бинарник из `src/migrations`.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./src/migrations").run(&self.pool).await?;
        info!("Booking schema is up to date");
        Ok(())
    }
}

/// Нарушение уникального ключа (Postgres 23505).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}
