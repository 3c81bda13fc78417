//! Локальное хранилище броней.
//!
//! Бронь, её позиции, платёж и строка списания ёмкости пишутся одной
//! транзакцией: либо всё, либо ничего. Смена статуса - только через
//! compare-and-swap по ожидаемому текущему статусу.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::database::is_unique_violation;
use crate::error::StoreError;
use crate::models::{
    AdjustmentKind, AdjustmentStatus, Booking, BookingDetails, BookingDraft, BookingItem,
    BookingStatus, CapacityAdjustment, NewAdjustment, Payment, PaymentStatus,
};

/// Результат CAS-перехода.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied,
    /// Текущий статус не совпал с ожидаемым - переход выиграл кто-то другой.
    Stale,
}

impl StatusUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, StatusUpdate::Applied)
    }
}

#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn create_booking(&self, draft: &BookingDraft) -> Result<i64, StoreError>;

    async fn find_by_id(&self, booking_id: i64) -> Result<Option<BookingDetails>, StoreError>;

    async fn find_by_reference(&self, reference: &str)
        -> Result<Option<BookingDetails>, StoreError>;

    async fn list_for_buyer(&self, buyer_id: i64) -> Result<Vec<Booking>, StoreError>;

    async fn update_status(
        &self,
        booking_id: i64,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<StatusUpdate, StoreError>;

    /// CAS `CAPACITY_ADJUSTED -> PAYMENT_CONFIRMED` вместе с отметкой платежа.
    async fn confirm_payment(
        &self,
        booking_id: i64,
        transaction_id: Option<&str>,
    ) -> Result<StatusUpdate, StoreError>;

    /// Возвращает `false`, если у брони нет платежа.
    async fn update_payment_status(
        &self,
        booking_id: i64,
        status: PaymentStatus,
        transaction_id: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Вставляет запись, если её ещё нет, и возвращает актуальную.
    async fn record_adjustment(
        &self,
        booking_id: i64,
        adjustment: &NewAdjustment,
    ) -> Result<CapacityAdjustment, StoreError>;

    async fn mark_adjustment(
        &self,
        idempotency_key: &str,
        status: AdjustmentStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn find_adjustment(
        &self,
        booking_id: i64,
        kind: AdjustmentKind,
    ) -> Result<Option<CapacityAdjustment>, StoreError>;

    /// `UNKNOWN` любого возраста и `PENDING`, не обновлявшиеся с `stale_before`.
    async fn unresolved_adjustments(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CapacityAdjustment>, StoreError>;
}

const BOOKING_COLUMNS: &str = "id, buyer_id, event_id, booking_reference, request_hash, hold_token, \
     total_amount_cents, currency, status, created_at, updated_at, confirmed_at, cancelled_at";

const ADJUSTMENT_COLUMNS: &str = "id, booking_id, event_id, delta, kind, idempotency_key, status, \
     attempts, last_error, created_at, updated_at";

#[derive(Clone)]
pub struct PgBookingRepository {
    pool: PgPool,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_details(&self, booking: Booking) -> Result<BookingDetails, StoreError> {
        let items = sqlx::query_as::<_, BookingItem>(
            r#"
            SELECT id, booking_id, ticket_type_id, seat_id, quantity, unit_price_cents, total_price_cents
            FROM booking_items
            WHERE booking_id = $1
            ORDER BY id
            "#,
        )
        .bind(booking.id)
        .fetch_all(&self.pool)
        .await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, booking_id, amount_cents, currency, method, status, transaction_id,
                   created_at, updated_at, paid_at, refunded_at
            FROM payments
            WHERE booking_id = $1
            "#,
        )
        .bind(booking.id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(BookingDetails {
            booking,
            items,
            payment,
        })
    }
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn create_booking(&self, draft: &BookingDraft) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        // 1) Сама бронь. Уникальность ссылки сериализует повторы одного запроса.
        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO bookings
                (buyer_id, event_id, booking_reference, request_hash, hold_token,
                 total_amount_cents, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(draft.buyer_id)
        .bind(draft.event_id)
        .bind(&draft.booking_reference)
        .bind(&draft.request_hash)
        .bind(draft.hold_token)
        .bind(draft.total_amount_cents)
        .bind(&draft.currency)
        .bind(BookingStatus::Pending.as_str())
        .fetch_one(&mut *tx)
        .await;

        let booking_id = match inserted {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateReference(draft.booking_reference.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        // 2) Позиции
        for line in &draft.lines {
            sqlx::query(
                r#"
                INSERT INTO booking_items
                    (booking_id, ticket_type_id, seat_id, quantity, unit_price_cents, total_price_cents)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(booking_id)
            .bind(line.ticket_type_id())
            .bind(line.seat_id())
            .bind(line.quantity())
            .bind(line.unit_price_cents())
            .bind(line.total_price_cents())
            .execute(&mut *tx)
            .await?;
        }

        // 3) Платёж в статусе pending
        if let Some(method) = &draft.payment_method {
            sqlx::query(
                r#"
                INSERT INTO payments (booking_id, amount_cents, currency, method, status)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(booking_id)
            .bind(draft.total_amount_cents)
            .bind(&draft.currency)
            .bind(method)
            .bind(PaymentStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;
        }

        // 4) Строка списания ёмкости - если процесс упадёт до удалённого вызова,
        //    её подберёт сверка.
        let adjustment = &draft.capacity_adjustment;
        sqlx::query(
            r#"
            INSERT INTO capacity_adjustments
                (booking_id, event_id, delta, kind, idempotency_key, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(booking_id)
        .bind(adjustment.event_id)
        .bind(adjustment.delta)
        .bind(adjustment.kind.as_str())
        .bind(&adjustment.idempotency_key)
        .bind(adjustment.status.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            "Booking {} persisted with reference {} ({} items)",
            booking_id,
            draft.booking_reference,
            draft.lines.len()
        );
        Ok(booking_id)
    }

    async fn find_by_id(&self, booking_id: i64) -> Result<Option<BookingDetails>, StoreError> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {} FROM bookings WHERE id = $1",
            BOOKING_COLUMNS
        ))
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;

        match booking {
            Some(booking) => Ok(Some(self.load_details(booking).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<BookingDetails>, StoreError> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {} FROM bookings WHERE booking_reference = $1",
            BOOKING_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        match booking {
            Some(booking) => Ok(Some(self.load_details(booking).await?)),
            None => Ok(None),
        }
    }

    async fn list_for_buyer(&self, buyer_id: i64) -> Result<Vec<Booking>, StoreError> {
        let bookings = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {} FROM bookings WHERE buyer_id = $1 ORDER BY created_at DESC, id DESC",
            BOOKING_COLUMNS
        ))
        .bind(buyer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(bookings)
    }

    async fn update_status(
        &self,
        booking_id: i64,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<StatusUpdate, StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE bookings
            SET status = $3::text,
                updated_at = NOW(),
                confirmed_at = CASE WHEN $3::text = 'PAYMENT_CONFIRMED' THEN NOW() ELSE confirmed_at END,
                cancelled_at = CASE WHEN $3::text = 'CANCELLED' THEN NOW() ELSE cancelled_at END
            WHERE id = $1 AND status = $2::text
            "#,
        )
        .bind(booking_id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 1 {
            debug!("Booking {}: {} -> {}", booking_id, expected, next);
            Ok(StatusUpdate::Applied)
        } else {
            debug!(
                "Booking {}: stale transition {} -> {}",
                booking_id, expected, next
            );
            Ok(StatusUpdate::Stale)
        }
    }

    async fn confirm_payment(
        &self,
        booking_id: i64,
        transaction_id: Option<&str>,
    ) -> Result<StatusUpdate, StoreError> {
        let mut tx = self.pool.begin().await?;

        let affected = sqlx::query(
            r#"
            UPDATE bookings
            SET status = $2::text, confirmed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = $3::text
            "#,
        )
        .bind(booking_id)
        .bind(BookingStatus::PaymentConfirmed.as_str())
        .bind(BookingStatus::CapacityAdjusted.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Ok(StatusUpdate::Stale);
        }

        sqlx::query(
            r#"
            UPDATE payments
            SET status = $2,
                transaction_id = COALESCE($3, transaction_id),
                paid_at = NOW(),
                updated_at = NOW()
            WHERE booking_id = $1
            "#,
        )
        .bind(booking_id)
        .bind(PaymentStatus::Completed.as_str())
        .bind(transaction_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(StatusUpdate::Applied)
    }

    async fn update_payment_status(
        &self,
        booking_id: i64,
        status: PaymentStatus,
        transaction_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2::text,
                transaction_id = COALESCE($3, transaction_id),
                refunded_at = CASE WHEN $2::text = 'refunded' THEN NOW() ELSE refunded_at END,
                updated_at = NOW()
            WHERE booking_id = $1
            "#,
        )
        .bind(booking_id)
        .bind(status.as_str())
        .bind(transaction_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn record_adjustment(
        &self,
        booking_id: i64,
        adjustment: &NewAdjustment,
    ) -> Result<CapacityAdjustment, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO capacity_adjustments
                (booking_id, event_id, delta, kind, idempotency_key, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(booking_id)
        .bind(adjustment.event_id)
        .bind(adjustment.delta)
        .bind(adjustment.kind.as_str())
        .bind(&adjustment.idempotency_key)
        .bind(adjustment.status.as_str())
        .execute(&self.pool)
        .await?;

        let stored = sqlx::query_as::<_, CapacityAdjustment>(&format!(
            "SELECT {} FROM capacity_adjustments WHERE idempotency_key = $1",
            ADJUSTMENT_COLUMNS
        ))
        .bind(&adjustment.idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn mark_adjustment(
        &self,
        idempotency_key: &str,
        status: AdjustmentStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE capacity_adjustments
            SET status = $2, last_error = $3, attempts = attempts + 1, updated_at = NOW()
            WHERE idempotency_key = $1
            "#,
        )
        .bind(idempotency_key)
        .bind(status.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_adjustment(
        &self,
        booking_id: i64,
        kind: AdjustmentKind,
    ) -> Result<Option<CapacityAdjustment>, StoreError> {
        let adjustment = sqlx::query_as::<_, CapacityAdjustment>(&format!(
            "SELECT {} FROM capacity_adjustments WHERE booking_id = $1 AND kind = $2",
            ADJUSTMENT_COLUMNS
        ))
        .bind(booking_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(adjustment)
    }

    async fn unresolved_adjustments(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CapacityAdjustment>, StoreError> {
        let adjustments = sqlx::query_as::<_, CapacityAdjustment>(&format!(
            r#"
            SELECT {}
            FROM capacity_adjustments
            WHERE status = 'UNKNOWN'
               OR (status = 'PENDING' AND updated_at < $1)
            ORDER BY kind DESC, updated_at
            LIMIT $2
            "#,
            ADJUSTMENT_COLUMNS
        ))
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(adjustments)
    }
}
