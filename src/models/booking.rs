use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

use crate::error::BookingError;
use crate::models::adjustment::NewAdjustment;

/// Статусы бронирования.
///
/// `Draft` и `SeatsReserved` живут только в памяти во время оркестрации,
/// в базу бронь попадает сразу в `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Draft,
    SeatsReserved,
    Pending,
    CapacityUnknown,
    CapacityAdjusted,
    PaymentConfirmed,
    Cancelled,
    Failed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Draft => "DRAFT",
            BookingStatus::SeatsReserved => "SEATS_RESERVED",
            BookingStatus::Pending => "PENDING",
            BookingStatus::CapacityUnknown => "CAPACITY_UNKNOWN",
            BookingStatus::CapacityAdjusted => "CAPACITY_ADJUSTED",
            BookingStatus::PaymentConfirmed => "PAYMENT_CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Failed)
    }

    /// Отмена разрешена от сохранённой брони до оплаченной включительно.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            BookingStatus::SeatsReserved
                | BookingStatus::Pending
                | BookingStatus::CapacityUnknown
                | BookingStatus::CapacityAdjusted
                | BookingStatus::PaymentConfirmed
        )
    }

    /// Удалённая ёмкость могла быть (или точно была) списана.
    pub fn may_hold_capacity(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending
                | BookingStatus::CapacityUnknown
                | BookingStatus::CapacityAdjusted
                | BookingStatus::PaymentConfirmed
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(BookingStatus::Draft),
            "SEATS_RESERVED" => Ok(BookingStatus::SeatsReserved),
            "PENDING" => Ok(BookingStatus::Pending),
            "CAPACITY_UNKNOWN" => Ok(BookingStatus::CapacityUnknown),
            "CAPACITY_ADJUSTED" => Ok(BookingStatus::CapacityAdjusted),
            "PAYMENT_CONFIRMED" => Ok(BookingStatus::PaymentConfirmed),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            "FAILED" => Ok(BookingStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for BookingStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

impl TryFrom<String> for PaymentStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Booking {
    pub id: i64,
    pub buyer_id: i64,
    pub event_id: i64,
    pub booking_reference: String,
    #[serde(skip)]
    pub request_hash: String,
    #[serde(skip)]
    pub hold_token: Uuid,
    pub total_amount_cents: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Позиция брони: количество, цена за единицу и итог.
///
/// Итог нельзя задать напрямую - он всегда пересчитывается из
/// `quantity * unit_price_cents`, поэтому поля закрыты.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct ItemLine {
    ticket_type_id: Option<i64>,
    seat_id: Option<i64>,
    quantity: i32,
    unit_price_cents: i64,
    total_price_cents: i64,
}

impl ItemLine {
    pub fn new(
        ticket_type_id: Option<i64>,
        seat_id: Option<i64>,
        quantity: i32,
        unit_price_cents: i64,
    ) -> Result<Self, BookingError> {
        let total_price_cents = line_total(quantity, unit_price_cents)?;
        Ok(Self {
            ticket_type_id,
            seat_id,
            quantity,
            unit_price_cents,
            total_price_cents,
        })
    }

    pub fn ticket_type_id(&self) -> Option<i64> {
        self.ticket_type_id
    }

    pub fn seat_id(&self) -> Option<i64> {
        self.seat_id
    }

    pub fn quantity(&self) -> i32 {
        self.quantity
    }

    pub fn unit_price_cents(&self) -> i64 {
        self.unit_price_cents
    }

    pub fn total_price_cents(&self) -> i64 {
        self.total_price_cents
    }

    /// При ошибке позиция остаётся без изменений.
    pub fn set_quantity(&mut self, quantity: i32) -> Result<(), BookingError> {
        self.total_price_cents = line_total(quantity, self.unit_price_cents)?;
        self.quantity = quantity;
        Ok(())
    }

    pub fn set_unit_price_cents(&mut self, unit_price_cents: i64) -> Result<(), BookingError> {
        self.total_price_cents = line_total(self.quantity, unit_price_cents)?;
        self.unit_price_cents = unit_price_cents;
        Ok(())
    }
}

fn line_total(quantity: i32, unit_price_cents: i64) -> Result<i64, BookingError> {
    if quantity <= 0 {
        return Err(BookingError::Validation(format!(
            "quantity must be positive, got {}",
            quantity
        )));
    }
    if unit_price_cents < 0 {
        return Err(BookingError::Validation(format!(
            "unit price must not be negative, got {}",
            unit_price_cents
        )));
    }
    i64::from(quantity)
        .checked_mul(unit_price_cents)
        .ok_or_else(|| BookingError::Validation("item total price overflows".to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct BookingItem {
    pub id: i64,
    pub booking_id: i64,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub line: ItemLine,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Payment {
    pub id: i64,
    pub booking_id: i64,
    pub amount_cents: i64,
    pub currency: String,
    pub method: String,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

/// Бронь вместе с позициями и платежом - то, что отдаётся наружу.
#[derive(Debug, Clone, Serialize)]
pub struct BookingDetails {
    #[serde(flatten)]
    pub booking: Booking,
    pub items: Vec<BookingItem>,
    pub payment: Option<Payment>,
}

impl BookingDetails {
    pub fn id(&self) -> i64 {
        self.booking.id
    }

    pub fn status(&self) -> BookingStatus {
        self.booking.status
    }

    pub fn seat_ids(&self) -> Vec<i64> {
        self.items.iter().filter_map(|item| item.line.seat_id()).collect()
    }
}

/// Всё, что нужно репозиторию, чтобы одной транзакцией записать бронь.
#[derive(Debug, Clone)]
pub struct BookingDraft {
    pub buyer_id: i64,
    pub event_id: i64,
    pub booking_reference: String,
    pub request_hash: String,
    pub hold_token: Uuid,
    pub currency: String,
    pub total_amount_cents: i64,
    pub lines: Vec<ItemLine>,
    pub payment_method: Option<String>,
    pub capacity_adjustment: NewAdjustment,
}

/// Входящий запрос на бронирование.
#[derive(Debug, Clone, Serialize, Deserialize, validator::Validate)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    #[validate(range(min = 1))]
    pub buyer_id: i64,
    #[validate(range(min = 1))]
    pub event_id: i64,
    #[serde(default)]
    pub booking_reference: Option<String>,
    #[serde(default)]
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1, max = 32))]
    pub payment_method: Option<String>,
    #[validate(length(min = 1, max = 50))]
    #[validate(nested)]
    pub items: Vec<BookingItemRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, validator::Validate)]
#[serde(rename_all = "camelCase")]
pub struct BookingItemRequest {
    #[serde(default)]
    pub ticket_type_id: Option<i64>,
    #[serde(default)]
    pub seat_id: Option<i64>,
    #[validate(range(min = 1, max = 100))]
    pub quantity: i32,
    /// Если не задана, берётся базовая цена события.
    #[serde(default)]
    #[validate(range(min = 0, max = 100_000_000))]
    pub unit_price_cents: Option<i64>,
}

impl BookingRequest {
    pub fn total_quantity(&self) -> i64 {
        self.items.iter().map(|item| i64::from(item.quantity)).sum()
    }
}

/// Итог оплаты, приходящий от внешнего платёжного потока.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// Результат `create_booking`: бронь и признак повторного запроса.
#[derive(Debug, Clone, Serialize)]
pub struct BookingReceipt {
    #[serde(flatten)]
    pub details: BookingDetails,
    pub replayed: bool,
}
