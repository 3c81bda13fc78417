#![allow(dead_code)]

use std::sync::Arc;

use booking_service::config::{
    AppConfig, BookingConfig, CircuitBreakerConfig, Config, DatabaseConfig, InventoryConfig,
    LogFormat, ReconciliationConfig,
};
use booking_service::models::{BookingItemRequest, BookingRequest};
use booking_service::services::memory::{
    InMemoryBookingRepository, InMemoryInventory, InMemorySeatLedger, RecordingRefunds,
};
use booking_service::services::{BookingOrchestrator, ReconciliationService};

pub const EVENT: i64 = 1;
pub const PRICE: i64 = 2_500;

pub struct Harness {
    pub ledger: Arc<InMemorySeatLedger>,
    pub repository: Arc<InMemoryBookingRepository>,
    pub inventory: Arc<InMemoryInventory>,
    pub refunds: Arc<RecordingRefunds>,
    pub orchestrator: Arc<BookingOrchestrator>,
}

impl Harness {
    pub fn new(seats: impl IntoIterator<Item = i64>, inventory: InMemoryInventory) -> Self {
        let ledger = Arc::new(InMemorySeatLedger::with_seats(seats));
        let repository = Arc::new(InMemoryBookingRepository::new());
        let inventory = Arc::new(inventory);
        let refunds = Arc::new(RecordingRefunds::new());

        let orchestrator = Arc::new(BookingOrchestrator::new(
            ledger.clone(),
            repository.clone(),
            inventory.clone(),
            refunds.clone(),
            "USD",
        ));

        Self {
            ledger,
            repository,
            inventory,
            refunds,
            orchestrator,
        }
    }

    /// Событие `EVENT` с заданной ёмкостью и местами 1..=seats.
    pub fn with_capacity(seats: i64, capacity: i64) -> Self {
        Self::new(1..=seats, InMemoryInventory::new().with_event(EVENT, capacity, PRICE))
    }

    pub fn reconciliation(&self, grace_seconds: i64) -> ReconciliationService {
        ReconciliationService::new(
            self.orchestrator.clone(),
            ReconciliationConfig {
                interval_seconds: 30,
                grace_seconds,
                batch_size: 100,
            },
        )
    }
}

pub fn seated_request(seats: &[i64], reference: Option<&str>) -> BookingRequest {
    BookingRequest {
        buyer_id: 42,
        event_id: EVENT,
        booking_reference: reference.map(str::to_string),
        currency: None,
        payment_method: Some("card".to_string()),
        items: seats
            .iter()
            .map(|&seat_id| BookingItemRequest {
                ticket_type_id: None,
                seat_id: Some(seat_id),
                quantity: 1,
                unit_price_cents: None,
            })
            .collect(),
    }
}

pub fn general_admission(quantity: i32, reference: Option<&str>) -> BookingRequest {
    BookingRequest {
        buyer_id: 42,
        event_id: EVENT,
        booking_reference: reference.map(str::to_string),
        currency: Some("EUR".to_string()),
        payment_method: None,
        items: vec![BookingItemRequest {
            ticket_type_id: Some(7),
            seat_id: None,
            quantity,
            unit_price_cents: Some(1_000),
        }],
    }
}

pub fn test_config() -> Config {
    Config {
        app: AppConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: "test".to_string(),
            rust_log: "booking_service=debug".to_string(),
            log_format: LogFormat::Pretty,
        },
        database: DatabaseConfig {
            url: "postgres://localhost/unused".to_string(),
            pool_size: 1,
        },
        inventory: InventoryConfig {
            base_url: "http://localhost:0".to_string(),
            timeout_seconds: 1,
            max_attempts: 1,
            backoff_ms: 1,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            timeout_seconds: 60,
        },
        reconciliation: ReconciliationConfig {
            interval_seconds: 30,
            grace_seconds: 0,
            batch_size: 100,
        },
        booking: BookingConfig {
            default_currency: "USD".to_string(),
        },
    }
}
