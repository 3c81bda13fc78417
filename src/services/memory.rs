//! In-memory реализации хранилищ и шлюза.
//!
//! Нужны для тестов оркестратора и сверки без Postgres и без удалённого
//! сервиса. Каждая реализация держит состояние под одним мьютексом, так что
//! CAS-семантика та же, что у SQL-версий, но только в пределах процесса.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::error::{GatewayError, StoreError};
use crate::models::{
    AdjustmentKind, AdjustmentStatus, Booking, BookingDetails, BookingDraft, BookingItem,
    BookingStatus, CapacityAdjustment, EventSnapshot, EventStatus, NewAdjustment, Payment,
    PaymentStatus,
};
use crate::services::inventory::{InventoryGateway, RemoteAdjustment};
use crate::services::ledger::{ReleaseOutcome, ReserveOutcome, SeatLedger};
use crate::services::refunds::RefundScheduler;
use crate::services::repository::{BookingRepository, StatusUpdate};

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable("in-memory store lock poisoned".to_string())
}

// --- места ---

#[derive(Debug, Default)]
pub struct InMemorySeatLedger {
    /// seat_id -> токен удержания (None - свободно)
    seats: Mutex<HashMap<i64, Option<Uuid>>>,
}

impl InMemorySeatLedger {
    pub fn with_seats(seat_ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            seats: Mutex::new(seat_ids.into_iter().map(|id| (id, None)).collect()),
        }
    }

    pub fn is_available(&self, seat_id: i64) -> bool {
        self.holder(seat_id).is_none()
    }

    pub fn holder(&self, seat_id: i64) -> Option<Uuid> {
        self.seats
            .lock()
            .ok()
            .and_then(|seats| seats.get(&seat_id).copied().flatten())
    }
}

#[async_trait]
impl SeatLedger for InMemorySeatLedger {
    async fn try_reserve(&self, seat_id: i64, hold: Uuid) -> Result<ReserveOutcome, StoreError> {
        let mut seats = self.seats.lock().map_err(poison_err)?;
        match seats.get_mut(&seat_id) {
            None => Ok(ReserveOutcome::Missing),
            Some(Some(_)) => Ok(ReserveOutcome::AlreadyTaken),
            Some(slot) => {
                *slot = Some(hold);
                Ok(ReserveOutcome::Reserved)
            }
        }
    }

    async fn release(&self, seat_id: i64, hold: Uuid) -> Result<ReleaseOutcome, StoreError> {
        let mut seats = self.seats.lock().map_err(poison_err)?;
        match seats.get_mut(&seat_id) {
            Some(slot) if *slot == Some(hold) => {
                *slot = None;
                Ok(ReleaseOutcome::Released)
            }
            _ => Ok(ReleaseOutcome::NotReserved),
        }
    }
}

// --- брони ---

#[derive(Debug, Default)]
struct RepoState {
    bookings: HashMap<i64, Booking>,
    items: Vec<BookingItem>,
    payments: HashMap<i64, Payment>,
    adjustments: Vec<CapacityAdjustment>,
    next_id: i64,
}

impl RepoState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn details(&self, booking: &Booking) -> BookingDetails {
        BookingDetails {
            booking: booking.clone(),
            items: self
                .items
                .iter()
                .filter(|item| item.booking_id == booking.id)
                .cloned()
                .collect(),
            payment: self.payments.get(&booking.id).cloned(),
        }
    }

    fn new_adjustment(&mut self, booking_id: i64, adjustment: &NewAdjustment) -> CapacityAdjustment {
        let now = Utc::now();
        CapacityAdjustment {
            id: self.next_id(),
            booking_id,
            event_id: adjustment.event_id,
            delta: adjustment.delta,
            kind: adjustment.kind,
            idempotency_key: adjustment.idempotency_key.clone(),
            status: adjustment.status,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBookingRepository {
    state: Mutex<RepoState>,
    fail_next_create: AtomicBool,
}

impl InMemoryBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Следующий `create_booking` упадёт перед "коммитом".
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn booking_count(&self) -> usize {
        self.state.lock().map(|s| s.bookings.len()).unwrap_or_default()
    }

    pub fn item_count(&self) -> usize {
        self.state.lock().map(|s| s.items.len()).unwrap_or_default()
    }

    pub fn payment_count(&self) -> usize {
        self.state.lock().map(|s| s.payments.len()).unwrap_or_default()
    }

    pub fn adjustments(&self) -> Vec<CapacityAdjustment> {
        self.state
            .lock()
            .map(|s| s.adjustments.clone())
            .unwrap_or_default()
    }

    /// Сдвигает `updated_at` всех записей в прошлое, как будто прошло время.
    pub fn age_adjustments(&self, by: chrono::Duration) {
        if let Ok(mut state) = self.state.lock() {
            for adjustment in &mut state.adjustments {
                adjustment.updated_at -= by;
            }
        }
    }
}

#[async_trait]
impl BookingRepository for InMemoryBookingRepository {
    async fn create_booking(&self, draft: &BookingDraft) -> Result<i64, StoreError> {
        let mut state = self.state.lock().map_err(poison_err)?;

        if state
            .bookings
            .values()
            .any(|b| b.booking_reference == draft.booking_reference)
        {
            return Err(StoreError::DuplicateReference(
                draft.booking_reference.clone(),
            ));
        }

        // Всё собирается в локальные переменные и попадает в состояние разом.
        let now = Utc::now();
        let booking_id = state.next_id();
        let booking = Booking {
            id: booking_id,
            buyer_id: draft.buyer_id,
            event_id: draft.event_id,
            booking_reference: draft.booking_reference.clone(),
            request_hash: draft.request_hash.clone(),
            hold_token: draft.hold_token,
            total_amount_cents: draft.total_amount_cents,
            currency: draft.currency.clone(),
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
            cancelled_at: None,
        };

        let mut items = Vec::with_capacity(draft.lines.len());
        for line in &draft.lines {
            items.push(BookingItem {
                id: state.next_id(),
                booking_id,
                line: line.clone(),
            });
        }

        let payment = match &draft.payment_method {
            Some(method) => Some(Payment {
                id: state.next_id(),
                booking_id,
                amount_cents: draft.total_amount_cents,
                currency: draft.currency.clone(),
                method: method.clone(),
                status: PaymentStatus::Pending,
                transaction_id: None,
                created_at: now,
                updated_at: now,
                paid_at: None,
                refunded_at: None,
            }),
            None => None,
        };

        let adjustment = state.new_adjustment(booking_id, &draft.capacity_adjustment);

        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "injected failure before commit".to_string(),
            ));
        }

        state.bookings.insert(booking_id, booking);
        state.items.extend(items);
        if let Some(payment) = payment {
            state.payments.insert(booking_id, payment);
        }
        state.adjustments.push(adjustment);

        Ok(booking_id)
    }

    async fn find_by_id(&self, booking_id: i64) -> Result<Option<BookingDetails>, StoreError> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.bookings.get(&booking_id).map(|b| state.details(b)))
    }

    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<BookingDetails>, StoreError> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state
            .bookings
            .values()
            .find(|b| b.booking_reference == reference)
            .map(|b| state.details(b)))
    }

    async fn list_for_buyer(&self, buyer_id: i64) -> Result<Vec<Booking>, StoreError> {
        let state = self.state.lock().map_err(poison_err)?;
        let mut bookings: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.buyer_id == buyer_id)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(bookings)
    }

    async fn update_status(
        &self,
        booking_id: i64,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<StatusUpdate, StoreError> {
        let mut state = self.state.lock().map_err(poison_err)?;
        match state.bookings.get_mut(&booking_id) {
            Some(booking) if booking.status == expected => {
                let now = Utc::now();
                booking.status = next;
                booking.updated_at = now;
                match next {
                    BookingStatus::PaymentConfirmed => booking.confirmed_at = Some(now),
                    BookingStatus::Cancelled => booking.cancelled_at = Some(now),
                    _ => {}
                }
                Ok(StatusUpdate::Applied)
            }
            _ => Ok(StatusUpdate::Stale),
        }
    }

    async fn confirm_payment(
        &self,
        booking_id: i64,
        transaction_id: Option<&str>,
    ) -> Result<StatusUpdate, StoreError> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let now = Utc::now();

        match state.bookings.get_mut(&booking_id) {
            Some(booking) if booking.status == BookingStatus::CapacityAdjusted => {
                booking.status = BookingStatus::PaymentConfirmed;
                booking.confirmed_at = Some(now);
                booking.updated_at = now;
            }
            _ => return Ok(StatusUpdate::Stale),
        }

        if let Some(payment) = state.payments.get_mut(&booking_id) {
            payment.status = PaymentStatus::Completed;
            if let Some(txn) = transaction_id {
                payment.transaction_id = Some(txn.to_string());
            }
            payment.paid_at = Some(now);
            payment.updated_at = now;
        }
        Ok(StatusUpdate::Applied)
    }

    async fn update_payment_status(
        &self,
        booking_id: i64,
        status: PaymentStatus,
        transaction_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let Some(payment) = state.payments.get_mut(&booking_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        payment.status = status;
        if let Some(txn) = transaction_id {
            payment.transaction_id = Some(txn.to_string());
        }
        if status == PaymentStatus::Refunded {
            payment.refunded_at = Some(now);
        }
        payment.updated_at = now;
        Ok(true)
    }

    async fn record_adjustment(
        &self,
        booking_id: i64,
        adjustment: &NewAdjustment,
    ) -> Result<CapacityAdjustment, StoreError> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if let Some(existing) = state.adjustments.iter().find(|a| {
            a.idempotency_key == adjustment.idempotency_key
                || (a.booking_id == booking_id && a.kind == adjustment.kind)
        }) {
            return Ok(existing.clone());
        }
        let created = state.new_adjustment(booking_id, adjustment);
        state.adjustments.push(created.clone());
        Ok(created)
    }

    async fn mark_adjustment(
        &self,
        idempotency_key: &str,
        status: AdjustmentStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if let Some(adjustment) = state
            .adjustments
            .iter_mut()
            .find(|a| a.idempotency_key == idempotency_key)
        {
            adjustment.status = status;
            adjustment.last_error = last_error.map(str::to_string);
            adjustment.attempts += 1;
            adjustment.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_adjustment(
        &self,
        booking_id: i64,
        kind: AdjustmentKind,
    ) -> Result<Option<CapacityAdjustment>, StoreError> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state
            .adjustments
            .iter()
            .find(|a| a.booking_id == booking_id && a.kind == kind)
            .cloned())
    }

    async fn unresolved_adjustments(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CapacityAdjustment>, StoreError> {
        let state = self.state.lock().map_err(poison_err)?;
        let mut unresolved: Vec<CapacityAdjustment> = state
            .adjustments
            .iter()
            .filter(|a| match a.status {
                AdjustmentStatus::Unknown => true,
                AdjustmentStatus::Pending => a.updated_at <= stale_before,
                _ => false,
            })
            .cloned()
            .collect();
        // RESERVE раньше RELEASE, внутри - по давности
        unresolved.sort_by(|a, b| {
            (a.kind != AdjustmentKind::Reserve)
                .cmp(&(b.kind != AdjustmentKind::Reserve))
                .then(a.updated_at.cmp(&b.updated_at))
        });
        unresolved.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(unresolved)
    }
}

// --- удалённая ёмкость ---

/// Заготовленный ответ на следующий `adjust_capacity`.
#[derive(Debug, Clone)]
pub enum ScriptedAdjust {
    /// Вызов до сервиса не дошёл.
    Fail(GatewayError),
    /// Сервис применил изменение, но ответ потерялся.
    ApplyThenFail(GatewayError),
}

#[derive(Debug, Default)]
struct InventoryState {
    events: HashMap<i64, EventSnapshot>,
    applied: HashMap<String, i32>,
    script: VecDeque<ScriptedAdjust>,
    validate_failure: Option<GatewayError>,
}

#[derive(Debug, Default)]
pub struct InMemoryInventory {
    state: Mutex<InventoryState>,
    adjust_calls: AtomicUsize,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event(self, event_id: i64, remaining_capacity: i64, base_price_cents: i64) -> Self {
        self.put_event(EventSnapshot {
            event_id,
            title: Some(format!("Event {}", event_id)),
            status: EventStatus::Active,
            remaining_capacity: Some(remaining_capacity),
            base_price_cents: Some(base_price_cents),
        });
        self
    }

    pub fn put_event(&self, snapshot: EventSnapshot) {
        if let Ok(mut state) = self.state.lock() {
            state.events.insert(snapshot.event_id, snapshot);
        }
    }

    pub fn script(&self, response: ScriptedAdjust) {
        if let Ok(mut state) = self.state.lock() {
            state.script.push_back(response);
        }
    }

    pub fn fail_validation(&self, error: GatewayError) {
        if let Ok(mut state) = self.state.lock() {
            state.validate_failure = Some(error);
        }
    }

    pub fn remaining(&self, event_id: i64) -> Option<i64> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.events.get(&event_id).and_then(|e| e.remaining_capacity))
    }

    pub fn adjust_calls(&self) -> usize {
        self.adjust_calls.load(Ordering::SeqCst)
    }

    pub fn is_applied(&self, idempotency_key: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.applied.contains_key(idempotency_key))
            .unwrap_or(false)
    }

    fn apply(state: &mut InventoryState, event_id: i64, delta: i32, key: &str) -> Result<(), GatewayError> {
        if state.applied.contains_key(key) {
            return Ok(());
        }
        let event = state
            .events
            .get_mut(&event_id)
            .ok_or(GatewayError::NotFound(event_id))?;
        if let Some(remaining) = event.remaining_capacity.as_mut() {
            let next = *remaining - i64::from(delta);
            if next < 0 {
                return Err(GatewayError::Permanent {
                    status: 409,
                    message: "insufficient capacity".to_string(),
                });
            }
            *remaining = next;
        }
        state.applied.insert(key.to_string(), delta);
        Ok(())
    }
}

fn lock_failure<T>(_: PoisonError<T>) -> GatewayError {
    GatewayError::Transient("in-memory inventory lock poisoned".to_string())
}

#[async_trait]
impl InventoryGateway for InMemoryInventory {
    async fn validate(&self, event_id: i64) -> Result<EventSnapshot, GatewayError> {
        let state = self.state.lock().map_err(lock_failure)?;
        if let Some(error) = &state.validate_failure {
            return Err(error.clone());
        }
        state
            .events
            .get(&event_id)
            .cloned()
            .ok_or(GatewayError::NotFound(event_id))
    }

    async fn adjust_capacity(
        &self,
        event_id: i64,
        delta: i32,
        idempotency_key: &str,
    ) -> Result<(), GatewayError> {
        self.adjust_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().map_err(lock_failure)?;
        match state.script.pop_front() {
            Some(ScriptedAdjust::Fail(error)) => Err(error),
            Some(ScriptedAdjust::ApplyThenFail(error)) => {
                Self::apply(&mut state, event_id, delta, idempotency_key)?;
                Err(error)
            }
            None => Self::apply(&mut state, event_id, delta, idempotency_key),
        }
    }

    async fn adjustment_status(
        &self,
        _event_id: i64,
        idempotency_key: &str,
    ) -> Result<RemoteAdjustment, GatewayError> {
        let state = self.state.lock().map_err(lock_failure)?;
        if state.applied.contains_key(idempotency_key) {
            Ok(RemoteAdjustment::Applied)
        } else {
            Ok(RemoteAdjustment::NotApplied)
        }
    }
}

// --- возвраты ---

#[derive(Debug, Default)]
pub struct RecordingRefunds {
    requests: Mutex<Vec<(i64, i64)>>,
}

impl RecordingRefunds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Пары (booking_id, amount_cents).
    pub fn requests(&self) -> Vec<(i64, i64)> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RefundScheduler for RecordingRefunds {
    async fn schedule_refund(
        &self,
        booking: &Booking,
        payment: &Payment,
    ) -> Result<(), StoreError> {
        let mut requests = self.requests.lock().map_err(poison_err)?;
        if !requests.iter().any(|(id, _)| *id == booking.id) {
            requests.push((booking.id, payment.amount_cents));
        }
        Ok(())
    }
}
