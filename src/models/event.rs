use serde::{Deserialize, Serialize};

/// Статус события в удалённом сервисе. Бронировать можно только `ACTIVE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventStatus {
    Active,
    Other(String),
}

impl EventStatus {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("ACTIVE") {
            EventStatus::Active
        } else {
            EventStatus::Other(raw.to_string())
        }
    }

    pub fn is_bookable(&self) -> bool {
        matches!(self, EventStatus::Active)
    }
}

/// Снимок события на момент проверки. Ёмкость не кешируется -
/// снимок живёт только в рамках одной оркестрации.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSnapshot {
    pub event_id: i64,
    pub title: Option<String>,
    pub status: EventStatus,
    pub remaining_capacity: Option<i64>,
    pub base_price_cents: Option<i64>,
}

/// Ответ `GET /events/{id}` удалённого сервиса.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub remaining_capacity: Option<i64>,
    #[serde(default)]
    pub max_attendees: Option<i64>,
    #[serde(default)]
    pub capacity: Option<i64>,
    #[serde(default)]
    pub base_price: Option<f64>,
    #[serde(default)]
    pub ticket_price: Option<f64>,
}

impl EventPayload {
    pub fn into_snapshot(self, event_id: i64) -> EventSnapshot {
        let price = self.base_price.or(self.ticket_price);
        EventSnapshot {
            event_id,
            title: self.title,
            status: EventStatus::parse(self.status.as_deref().unwrap_or_default()),
            // старые версии сервиса отдают только maxAttendees/capacity
            remaining_capacity: self
                .remaining_capacity
                .or(self.max_attendees)
                .or(self.capacity),
            base_price_cents: price.map(|p| (p * 100.0).round() as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_falls_back_to_max_attendees_and_ticket_price() {
        let payload: EventPayload = serde_json::from_str(
            r#"{"title":"Concert","status":"active","maxAttendees":40,"ticketPrice":12.5}"#,
        )
        .unwrap();
        let snapshot = payload.into_snapshot(9);
        assert_eq!(snapshot.status, EventStatus::Active);
        assert_eq!(snapshot.remaining_capacity, Some(40));
        assert_eq!(snapshot.base_price_cents, Some(1250));
    }

    #[test]
    fn missing_status_is_not_bookable() {
        let payload: EventPayload = serde_json::from_str(r#"{"remainingCapacity":3}"#).unwrap();
        let snapshot = payload.into_snapshot(1);
        assert!(!snapshot.status.is_bookable());
        assert_eq!(snapshot.remaining_capacity, Some(3));
    }
}
