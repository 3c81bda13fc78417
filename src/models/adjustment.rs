use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::models::booking::UnknownStatus;

/// Направление изменения удалённой ёмкости.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentKind {
    /// Списание мест при создании брони.
    Reserve,
    /// Возврат мест при отмене.
    Release,
}

impl AdjustmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentKind::Reserve => "RESERVE",
            AdjustmentKind::Release => "RELEASE",
        }
    }
}

impl fmt::Display for AdjustmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for AdjustmentKind {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "RESERVE" => Ok(AdjustmentKind::Reserve),
            "RELEASE" => Ok(AdjustmentKind::Release),
            _ => Err(UnknownStatus(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentStatus {
    /// Записано, но удалённый вызов ещё не завершён.
    Pending,
    Applied,
    /// Ретраи исчерпаны, исход неизвестен - нужна сверка.
    Unknown,
    Rejected,
}

impl AdjustmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentStatus::Pending => "PENDING",
            AdjustmentStatus::Applied => "APPLIED",
            AdjustmentStatus::Unknown => "UNKNOWN",
            AdjustmentStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, AdjustmentStatus::Applied | AdjustmentStatus::Rejected)
    }
}

impl fmt::Display for AdjustmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdjustmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AdjustmentStatus::Pending),
            "APPLIED" => Ok(AdjustmentStatus::Applied),
            "UNKNOWN" => Ok(AdjustmentStatus::Unknown),
            "REJECTED" => Ok(AdjustmentStatus::Rejected),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for AdjustmentStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Запись о каждом изменении удалённой ёмкости.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CapacityAdjustment {
    pub id: i64,
    pub booking_id: i64,
    pub event_id: i64,
    pub delta: i32,
    #[sqlx(try_from = "String")]
    pub kind: AdjustmentKind,
    pub idempotency_key: String,
    #[sqlx(try_from = "String")]
    pub status: AdjustmentStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAdjustment {
    pub event_id: i64,
    pub delta: i32,
    pub kind: AdjustmentKind,
    pub idempotency_key: String,
    pub status: AdjustmentStatus,
}
