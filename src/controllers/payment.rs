use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::put,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::{booking_error, ApiResult};
use crate::models::PaymentOutcome;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/bookings/{id}/payment", put(confirm_payment))
}

/// PUT /api/bookings/{id}/payment
///
/// Итог оплаты от внешнего платёжного потока: completed, failed или refunded.
pub async fn confirm_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(outcome): Json<PaymentOutcome>,
) -> ApiResult<impl IntoResponse> {
    info!(
        "Payment outcome for booking {}: {}",
        id, outcome.payment_status
    );

    let details = state
        .orchestrator
        .confirm_payment(id, outcome)
        .await
        .map_err(booking_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": details,
    })))
}
