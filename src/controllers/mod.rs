pub mod bookings;
pub mod payment;

use axum::{http::StatusCode, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::BookingError;

pub fn routes() -> Router<Arc<crate::AppState>> {
    Router::new()
        .merge(bookings::routes())
        .merge(payment::routes())
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    success: bool,
    message: String,
}

pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn to_api_error(status: StatusCode, message: &str) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            success: false,
            message: message.to_string(),
        }),
    )
}

pub fn status_for(err: &BookingError) -> StatusCode {
    match err {
        BookingError::Validation(_) => StatusCode::BAD_REQUEST,
        BookingError::NotFound(_) => StatusCode::NOT_FOUND,
        BookingError::SeatTaken { .. }
        | BookingError::ReferenceMismatch(_)
        | BookingError::InvalidTransition { .. } => StatusCode::CONFLICT,
        BookingError::TransientInfrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
        BookingError::PermanentInfrastructure(_) => StatusCode::BAD_GATEWAY,
        BookingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Внутренние детали наружу не отдаём.
pub fn booking_error(err: BookingError) -> (StatusCode, Json<ApiError>) {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Booking request failed: {}", err);
    } else {
        warn!("Booking request rejected: {}", err);
    }

    match err {
        BookingError::Internal(_) => to_api_error(status, "internal error"),
        other => to_api_error(status, &other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookingStatus;

    #[test]
    fn errors_map_to_http_statuses() {
        assert_eq!(
            status_for(&BookingError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&BookingError::SeatTaken { seat_id: 1 }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&BookingError::InvalidTransition {
                booking_id: 1,
                status: BookingStatus::Failed
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&BookingError::TransientInfrastructure("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&BookingError::PermanentInfrastructure("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&BookingError::NotFound(3)),
            StatusCode::NOT_FOUND
        );
    }
}
