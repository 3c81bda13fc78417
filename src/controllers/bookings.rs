use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use std::sync::Arc;

use super::{booking_error, to_api_error, ApiResult};
use crate::models::BookingRequest;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/user/{buyer_id}", get(list_bookings))
        .route("/bookings/{id}/cancel", patch(cancel_booking))
}

/* ---------- BOOKINGS ---------- */

// POST /api/bookings
async fn create_booking(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BookingRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state
        .orchestrator
        .create_booking(req)
        .await
        .map_err(booking_error)?;

    // повтор с той же ссылкой - 200, новая бронь - 201
    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(receipt)))
}

// GET /api/bookings/{id}
async fn get_booking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    if id <= 0 {
        return Err(to_api_error(StatusCode::BAD_REQUEST, "booking id must be > 0"));
    }

    let details = state
        .orchestrator
        .get_booking(id)
        .await
        .map_err(booking_error)?;
    Ok(Json(details))
}

// GET /api/bookings/user/{buyer_id}
async fn list_bookings(
    State(state): State<Arc<AppState>>,
    Path(buyer_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let bookings = state
        .orchestrator
        .list_bookings(buyer_id)
        .await
        .map_err(booking_error)?;
    Ok(Json(bookings))
}

// PATCH /api/bookings/{id}/cancel
async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let details = state
        .orchestrator
        .cancel_booking(id)
        .await
        .map_err(booking_error)?;
    Ok(Json(details))
}
