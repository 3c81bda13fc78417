//! Outbox возвратов. Сам возврат делает внешний платёжный провайдер,
//! здесь только фиксируется заявка - не больше одной на бронь.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use crate::error::StoreError;
use crate::models::{Booking, Payment};

#[async_trait]
pub trait RefundScheduler: Send + Sync {
    async fn schedule_refund(&self, booking: &Booking, payment: &Payment)
        -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgRefundOutbox {
    pool: PgPool,
}

impl PgRefundOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefundScheduler for PgRefundOutbox {
    async fn schedule_refund(
        &self,
        booking: &Booking,
        payment: &Payment,
    ) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO refund_requests (booking_id, payment_id, amount_cents, currency, status)
            VALUES ($1, $2, $3, $4, 'REQUESTED')
            ON CONFLICT (booking_id) DO NOTHING
            "#,
        )
        .bind(booking.id)
        .bind(payment.id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            info!(
                "Refund of {} {} requested for booking {}",
                payment.amount_cents, payment.currency, booking.booking_reference
            );
        }
        Ok(())
    }
}
