use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub inventory: InventoryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub reconciliation: ReconciliationConfig,
    pub booking: BookingConfig,
}

// Настройки приложения
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

// Настройки базы данных
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

// Настройки удалённого сервиса событий (ёмкость)
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl InventoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

// Настройки Circuit Breaker
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

// Фоновая сверка неизвестных исходов
#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    pub interval_seconds: u64,
    pub grace_seconds: i64,
    pub batch_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookingConfig {
    pub default_currency: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn or_default(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed<T>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = or_default(name, default);
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value: value.clone(),
        reason: e.to_string(),
    })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config {
            app: AppConfig {
                host: or_default("HOST", "0.0.0.0"),
                port: parsed("PORT", "8000")?,
                environment: or_default("ENVIRONMENT", "development"),
                rust_log: or_default("RUST_LOG", "booking_service=debug,tower_http=debug"),
                log_format: parsed("LOG_FORMAT", "pretty")?,
            },
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                pool_size: parsed("DB_POOL_SIZE", "20")?,
            },
            inventory: InventoryConfig {
                base_url: or_default(
                    "INVENTORY_SERVICE_URL",
                    "http://localhost:8080/event-servlet/api",
                ),
                timeout_seconds: parsed("INVENTORY_TIMEOUT_SECONDS", "10")?,
                max_attempts: parsed("INVENTORY_MAX_ATTEMPTS", "3")?,
                backoff_ms: parsed("INVENTORY_BACKOFF_MS", "100")?,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: parsed("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "5")?,
                timeout_seconds: parsed("CIRCUIT_BREAKER_TIMEOUT_SECONDS", "60")?,
            },
            reconciliation: ReconciliationConfig {
                interval_seconds: parsed("RECONCILE_INTERVAL_SECONDS", "30")?,
                grace_seconds: parsed("RECONCILE_GRACE_SECONDS", "60")?,
                batch_size: parsed("RECONCILE_BATCH_SIZE", "100")?,
            },
            booking: BookingConfig {
                default_currency: or_default("DEFAULT_CURRENCY", "USD").to_ascii_uppercase(),
            },
        };

        if config.inventory.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "INVENTORY_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        if config.booking.default_currency.len() != 3 {
            return Err(ConfigError::Invalid {
                name: "DEFAULT_CURRENCY",
                value: config.booking.default_currency.clone(),
                reason: "expected a 3-letter ISO 4217 code".to_string(),
            });
        }

        Ok(config)
    }
}
