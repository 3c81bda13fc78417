//! Журнал резервирования мест.
//!
//! Единственный примитив - условный UPDATE "занять, если свободно". Первый
//! писатель выигрывает, остальные получают `AlreadyTaken` и сразу сдаются.
//! Никаких блокировок в памяти: гонки разрешает база, в том числе между
//! разными экземплярами сервиса.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    AlreadyTaken,
    /// Места с таким id нет.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Место и так свободно или удерживается другой оркестрацией.
    NotReserved,
}

#[async_trait]
pub trait SeatLedger: Send + Sync {
    async fn try_reserve(&self, seat_id: i64, hold: Uuid) -> Result<ReserveOutcome, StoreError>;

    /// Компенсирующее действие. Идемпотентно.
    async fn release(&self, seat_id: i64, hold: Uuid) -> Result<ReleaseOutcome, StoreError>;
}

#[derive(Clone)]
pub struct PgSeatLedger {
    pool: PgPool,
}

impl PgSeatLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SeatLedger for PgSeatLedger {
    async fn try_reserve(&self, seat_id: i64, hold: Uuid) -> Result<ReserveOutcome, StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE seats
            SET is_available = FALSE, held_by = $2, updated_at = NOW()
            WHERE id = $1 AND is_available = TRUE
            "#,
        )
        .bind(seat_id)
        .bind(hold)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 1 {
            debug!("Seat {} reserved by hold {}", seat_id, hold);
            return Ok(ReserveOutcome::Reserved);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM seats WHERE id = $1)")
            .bind(seat_id)
            .fetch_one(&self.pool)
            .await?;

        if exists {
            warn!("Seat {} is already taken", seat_id);
            Ok(ReserveOutcome::AlreadyTaken)
        } else {
            Ok(ReserveOutcome::Missing)
        }
    }

    async fn release(&self, seat_id: i64, hold: Uuid) -> Result<ReleaseOutcome, StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE seats
            SET is_available = TRUE, held_by = NULL, updated_at = NOW()
            WHERE id = $1 AND held_by = $2
            "#,
        )
        .bind(seat_id)
        .bind(hold)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 1 {
            debug!("Seat {} released by hold {}", seat_id, hold);
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::NotReserved)
        }
    }
}
