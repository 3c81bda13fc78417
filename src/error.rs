use thiserror::Error;

use crate::models::BookingStatus;

/// Ошибки хранилища (места, брони). Никакой компенсации на этом уровне.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("booking reference '{0}' already exists")]
    DuplicateReference(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Ошибки обращения к удалённому сервису ёмкости.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("event {0} not found")]
    NotFound(i64),
    /// Таймаут, 5xx, обрыв соединения - можно повторить.
    #[error("transient inventory failure: {0}")]
    Transient(String),
    /// 4xx и прочие не-200 ответы - повторять нельзя.
    #[error("inventory rejected request (status {status}): {message}")]
    Permanent { status: u16, message: String },
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Типизированные ошибки оркестратора, которые видит вызывающий.
#[derive(Debug, Error)]
pub enum BookingError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("seat {seat_id} is already taken")]
    SeatTaken { seat_id: i64 },
    #[error("booking reference '{0}' was already used for a different request")]
    ReferenceMismatch(String),
    #[error("booking {0} not found")]
    NotFound(i64),
    #[error("booking {booking_id} is {status}, operation not allowed")]
    InvalidTransition {
        booking_id: i64,
        status: BookingStatus,
    },
    /// Временный сбой после исчерпания ретраев; клиент может повторить с той же ссылкой.
    #[error("temporarily unavailable: {0}")]
    TransientInfrastructure(String),
    /// Компенсация уже выполнена.
    #[error("booking failed and was rolled back: {0}")]
    PermanentInfrastructure(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BookingError {
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BookingError::SeatTaken { .. } | BookingError::ReferenceMismatch(_)
        )
    }
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => BookingError::TransientInfrastructure(msg),
            StoreError::Database(sqlx::Error::PoolTimedOut) => {
                BookingError::TransientInfrastructure("database pool timed out".to_string())
            }
            StoreError::Database(sqlx::Error::Io(e)) => {
                BookingError::TransientInfrastructure(format!("database io: {}", e))
            }
            other => BookingError::Internal(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for BookingError {
    fn from(errors: validator::ValidationErrors) -> Self {
        BookingError::Validation(errors.to_string())
    }
}
