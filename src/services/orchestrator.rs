//! Оркестратор бронирования.
//!
//! Локальное хранилище и удалённый счётчик ёмкости не делят транзакцию,
//! поэтому бронь проводится как сага:
//!
//! 1. повтор по ссылке возвращает уже созданную бронь;
//! 2. событие проверяется в удалённом сервисе (только чтение);
//! 3. места занимаются условным UPDATE под токеном этой попытки;
//! 4. бронь, позиции, платёж и строка списания пишутся одной транзакцией;
//! 5. после коммита списывается удалённая ёмкость.
//!
//! Любой отказ откатывает уже сделанные шаги в обратном порядке. Исчерпанные
//! ретраи на шаге 5 - не ошибка: бронь остаётся в `CAPACITY_UNKNOWN`, и её
//! дорешает сверка.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::error::{BookingError, GatewayError, StoreError};
use crate::models::{
    AdjustmentKind, AdjustmentStatus, Booking, BookingDetails, BookingDraft, BookingReceipt,
    BookingRequest, BookingStatus, CapacityAdjustment, ItemLine, NewAdjustment, PaymentOutcome,
    PaymentStatus,
};
use crate::services::inventory::InventoryGateway;
use crate::services::ledger::{ReserveOutcome, SeatLedger};
use crate::services::reference::{idempotency_key, request_hash, ReferenceGenerator};
use crate::services::refunds::RefundScheduler;
use crate::services::repository::{BookingRepository, StatusUpdate};

/// Сколько раз отмена перечитывает бронь после проигранного CAS.
const CANCEL_CAS_ATTEMPTS: usize = 3;

/// Чем закончилось списание ёмкости для брони.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Adjusted,
    Unknown,
    Rejected(String),
}

enum Cancellation {
    Applied(BookingDetails),
    AlreadyTerminal(BookingDetails),
}

pub struct BookingOrchestrator {
    ledger: Arc<dyn SeatLedger>,
    repository: Arc<dyn BookingRepository>,
    inventory: Arc<dyn InventoryGateway>,
    refunds: Arc<dyn RefundScheduler>,
    references: ReferenceGenerator,
    default_currency: String,
}

impl BookingOrchestrator {
    pub fn new(
        ledger: Arc<dyn SeatLedger>,
        repository: Arc<dyn BookingRepository>,
        inventory: Arc<dyn InventoryGateway>,
        refunds: Arc<dyn RefundScheduler>,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            repository,
            inventory,
            refunds,
            references: ReferenceGenerator,
            default_currency: default_currency.into(),
        }
    }

    pub(crate) fn repository(&self) -> &dyn BookingRepository {
        self.repository.as_ref()
    }

    pub(crate) fn inventory(&self) -> &dyn InventoryGateway {
        self.inventory.as_ref()
    }

    pub async fn create_booking(
        &self,
        request: BookingRequest,
    ) -> Result<BookingReceipt, BookingError> {
        // 0) DRAFT: форма запроса
        request.validate()?;
        check_items(&request)?;
        let reference = self
            .references
            .generate(request.booking_reference.as_deref())?;
        let request_hash = request_hash(&request)?;

        // 1) Повтор того же логического запроса
        if let Some(existing) = self.repository.find_by_reference(&reference).await? {
            return replay(existing, &request_hash);
        }

        // 2) Событие существует и открыто для продажи
        let snapshot = match self.inventory.validate(request.event_id).await {
            Ok(snapshot) => snapshot,
            Err(GatewayError::NotFound(event_id)) => {
                return Err(BookingError::Validation(format!(
                    "event {} not found",
                    event_id
                )));
            }
            Err(GatewayError::Transient(message)) => {
                return Err(BookingError::TransientInfrastructure(message));
            }
            Err(e) => return Err(BookingError::PermanentInfrastructure(e.to_string())),
        };

        if !snapshot.status.is_bookable() {
            return Err(BookingError::Validation(format!(
                "event {} is not open for booking",
                request.event_id
            )));
        }

        let quantity = request.total_quantity();
        let lines = build_lines(&request, snapshot.base_price_cents)?;
        let total_amount_cents = lines
            .iter()
            .try_fold(0i64, |acc, line| acc.checked_add(line.total_price_cents()))
            .ok_or_else(|| BookingError::Validation("booking total overflows".to_string()))?;
        let delta = i32::try_from(quantity)
            .map_err(|_| BookingError::Validation("requested quantity too large".to_string()))?;

        // 3) SEATS_RESERVED
        let hold = Uuid::new_v4();
        let seat_ids: Vec<i64> = request.items.iter().filter_map(|item| item.seat_id).collect();
        self.reserve_seats(&seat_ids, hold).await?;

        // Ёмкость проверяется после мест: гонка за место - конфликт, а не "распродано".
        if let Some(remaining) = snapshot.remaining_capacity {
            if remaining < quantity {
                self.release_seats(&seat_ids, hold).await;
                return Err(BookingError::Validation(format!(
                    "event {} has {} seats left, {} requested",
                    request.event_id, remaining, quantity
                )));
            }
        }

        // 4) PENDING: одна локальная транзакция
        let draft = BookingDraft {
            buyer_id: request.buyer_id,
            event_id: request.event_id,
            booking_reference: reference.clone(),
            request_hash: request_hash.clone(),
            hold_token: hold,
            currency: request
                .currency
                .as_deref()
                .map(str::to_uppercase)
                .unwrap_or_else(|| self.default_currency.clone()),
            total_amount_cents,
            lines,
            payment_method: request.payment_method.clone(),
            capacity_adjustment: NewAdjustment {
                event_id: request.event_id,
                delta,
                kind: AdjustmentKind::Reserve,
                idempotency_key: idempotency_key(&reference, AdjustmentKind::Reserve),
                status: AdjustmentStatus::Pending,
            },
        };

        let booking_id = match self.repository.create_booking(&draft).await {
            Ok(id) => id,
            Err(StoreError::DuplicateReference(_)) => {
                // параллельный повтор успел раньше
                self.release_seats(&seat_ids, hold).await;
                warn!("Booking {} was created concurrently, replaying", reference);
                let winner = self
                    .repository
                    .find_by_reference(&reference)
                    .await?
                    .ok_or_else(|| {
                        BookingError::Internal(format!(
                            "booking {} vanished after duplicate insert",
                            reference
                        ))
                    })?;
                return replay(winner, &request_hash);
            }
            Err(e) => {
                error!("Failed to persist booking {}: {}", reference, e);
                self.release_seats(&seat_ids, hold).await;
                return Err(e.into());
            }
        };

        // 5) Удалённая ёмкость
        let booking = self.load(booking_id).await?.booking;
        let outcome = self
            .settle_forward(
                &booking,
                &seat_ids,
                &draft.capacity_adjustment.idempotency_key,
                BookingStatus::Pending,
                self.inventory
                    .adjust_capacity(
                        draft.event_id,
                        delta,
                        &draft.capacity_adjustment.idempotency_key,
                    )
                    .await,
            )
            .await?;

        if let ForwardOutcome::Rejected(reason) = outcome {
            return Err(BookingError::PermanentInfrastructure(reason));
        }

        // 6)
        let details = self.load(booking_id).await?;
        info!(
            "Booking {} ({}) created in status {}",
            booking_id,
            reference,
            details.status()
        );
        Ok(BookingReceipt {
            details,
            replayed: false,
        })
    }

    pub async fn get_booking(&self, booking_id: i64) -> Result<BookingDetails, BookingError> {
        self.load(booking_id).await
    }

    pub async fn list_bookings(&self, buyer_id: i64) -> Result<Vec<Booking>, BookingError> {
        Ok(self.repository.list_for_buyer(buyer_id).await?)
    }

    pub async fn confirm_payment(
        &self,
        booking_id: i64,
        outcome: PaymentOutcome,
    ) -> Result<BookingDetails, BookingError> {
        let details = self.load(booking_id).await?;
        let transaction_id = outcome.transaction_id.as_deref();

        match outcome.payment_status {
            PaymentStatus::Completed => {
                match self
                    .repository
                    .confirm_payment(booking_id, transaction_id)
                    .await?
                {
                    StatusUpdate::Applied => {
                        info!("Booking {}: payment confirmed", booking_id);
                        self.load(booking_id).await
                    }
                    StatusUpdate::Stale => {
                        let current = self.load(booking_id).await?;
                        warn!(
                            "Booking {}: payment confirmation rejected in status {}",
                            booking_id,
                            current.status()
                        );
                        Err(BookingError::InvalidTransition {
                            booking_id,
                            status: current.status(),
                        })
                    }
                }
            }
            PaymentStatus::Failed => match self.cancel_once(booking_id, false).await? {
                Cancellation::Applied(_) => {
                    self.repository
                        .update_payment_status(booking_id, PaymentStatus::Failed, transaction_id)
                        .await?;
                    info!("Booking {}: payment failed, booking cancelled", booking_id);
                    self.load(booking_id).await
                }
                // оплата уже завершённой брони не меняется
                Cancellation::AlreadyTerminal(current) => Err(BookingError::InvalidTransition {
                    booking_id,
                    status: current.status(),
                }),
            },
            PaymentStatus::Refunded => {
                if details.status() != BookingStatus::Cancelled {
                    return Err(BookingError::InvalidTransition {
                        booking_id,
                        status: details.status(),
                    });
                }
                let Some(payment) = &details.payment else {
                    return Err(BookingError::Validation(format!(
                        "booking {} has no payment to refund",
                        booking_id
                    )));
                };
                match payment.status {
                    PaymentStatus::Refunded => return Ok(details),
                    PaymentStatus::Completed => {}
                    _ => {
                        return Err(BookingError::InvalidTransition {
                            booking_id,
                            status: details.status(),
                        })
                    }
                }
                self.repository
                    .update_payment_status(booking_id, PaymentStatus::Refunded, transaction_id)
                    .await?;
                info!("Booking {}: payment refunded", booking_id);
                self.load(booking_id).await
            }
            PaymentStatus::Pending => Err(BookingError::Validation(
                "payment outcome must be completed, failed or refunded".to_string(),
            )),
        }
    }

    /// CAS в `CANCELLED` - точка линеаризации против подтверждения оплаты.
    /// Места и ёмкость возвращаются уже после.
    pub async fn cancel_booking(&self, booking_id: i64) -> Result<BookingDetails, BookingError> {
        match self.cancel_once(booking_id, true).await? {
            Cancellation::Applied(details) | Cancellation::AlreadyTerminal(details) => Ok(details),
        }
    }

    /// `allow_paid = false` запрещает отменять оплаченную бронь.
    async fn cancel_once(
        &self,
        booking_id: i64,
        allow_paid: bool,
    ) -> Result<Cancellation, BookingError> {
        let mut details = self.load(booking_id).await?;

        for _ in 0..CANCEL_CAS_ATTEMPTS {
            let status = details.status();
            if status.is_terminal() {
                info!("Booking {} already {}, nothing to cancel", booking_id, status);
                return Ok(Cancellation::AlreadyTerminal(details));
            }
            if !status.is_cancellable() || (!allow_paid && status == BookingStatus::PaymentConfirmed)
            {
                return Err(BookingError::InvalidTransition { booking_id, status });
            }

            match self
                .repository
                .update_status(booking_id, status, BookingStatus::Cancelled)
                .await?
            {
                StatusUpdate::Applied => {
                    info!("Booking {}: {} -> CANCELLED", booking_id, status);
                    let details = self.finish_cancellation(details, status).await?;
                    return Ok(Cancellation::Applied(details));
                }
                StatusUpdate::Stale => {
                    details = self.load(booking_id).await?;
                }
            }
        }

        Err(BookingError::InvalidTransition {
            booking_id,
            status: details.status(),
        })
    }

    async fn finish_cancellation(
        &self,
        details: BookingDetails,
        previous: BookingStatus,
    ) -> Result<BookingDetails, BookingError> {
        let booking = &details.booking;
        self.release_seats(&details.seat_ids(), booking.hold_token)
            .await;

        if previous.may_hold_capacity() {
            self.reverse_capacity(booking).await?;
        }

        if previous == BookingStatus::PaymentConfirmed {
            if let Some(payment) = &details.payment {
                self.refunds.schedule_refund(booking, payment).await?;
            }
        }

        self.load(booking.id).await
    }

    /// Фиксирует исход списания ёмкости. `from` - статус, в котором бронь
    /// находилась, когда исход был получен.
    pub(crate) async fn settle_forward(
        &self,
        booking: &Booking,
        seat_ids: &[i64],
        key: &str,
        from: BookingStatus,
        result: Result<(), GatewayError>,
    ) -> Result<ForwardOutcome, BookingError> {
        match result {
            Ok(()) => {
                self.repository
                    .mark_adjustment(key, AdjustmentStatus::Applied, None)
                    .await?;
                let update = self
                    .repository
                    .update_status(booking.id, from, BookingStatus::CapacityAdjusted)
                    .await?;
                if update == StatusUpdate::Stale {
                    // отмена выиграла гонку, пока шёл удалённый вызов
                    let current = self.load(booking.id).await?;
                    warn!(
                        "Booking {} became {} while capacity was adjusted",
                        booking.id,
                        current.status()
                    );
                    if current.status().is_terminal() {
                        self.reverse_capacity(&current.booking).await?;
                    }
                }
                Ok(ForwardOutcome::Adjusted)
            }
            Err(e) if e.is_transient() => {
                let message = e.to_string();
                self.repository
                    .mark_adjustment(key, AdjustmentStatus::Unknown, Some(&message))
                    .await?;
                if from != BookingStatus::CapacityUnknown {
                    let update = self
                        .repository
                        .update_status(booking.id, from, BookingStatus::CapacityUnknown)
                        .await?;
                    if update == StatusUpdate::Stale {
                        warn!(
                            "Booking {} changed status before capacity outcome was recorded",
                            booking.id
                        );
                    }
                }
                warn!(
                    "Booking {}: capacity adjustment outcome unknown ({})",
                    booking.id, message
                );
                Ok(ForwardOutcome::Unknown)
            }
            Err(e) => {
                let message = e.to_string();
                error!(
                    "Booking {}: capacity adjustment rejected: {}",
                    booking.id, message
                );
                self.release_seats(seat_ids, booking.hold_token).await;
                self.repository
                    .mark_adjustment(key, AdjustmentStatus::Rejected, Some(&message))
                    .await?;
                let update = self
                    .repository
                    .update_status(booking.id, from, BookingStatus::Failed)
                    .await?;
                if update == StatusUpdate::Stale {
                    warn!(
                        "Booking {} changed status before it could be marked FAILED",
                        booking.id
                    );
                }
                Ok(ForwardOutcome::Rejected(message))
            }
        }
    }

    /// Возврат ёмкости после отмены. Шлётся только если списание точно
    /// применено, иначе строка `RELEASE` ждёт сверку.
    pub(crate) async fn reverse_capacity(&self, booking: &Booking) -> Result<(), BookingError> {
        let Some(forward) = self
            .repository
            .find_adjustment(booking.id, AdjustmentKind::Reserve)
            .await?
        else {
            return Ok(());
        };

        let release = self
            .repository
            .record_adjustment(
                booking.id,
                &NewAdjustment {
                    event_id: forward.event_id,
                    delta: -forward.delta,
                    kind: AdjustmentKind::Release,
                    idempotency_key: idempotency_key(
                        &booking.booking_reference,
                        AdjustmentKind::Release,
                    ),
                    status: AdjustmentStatus::Pending,
                },
            )
            .await?;

        if release.status.is_resolved() {
            return Ok(());
        }

        match forward.status {
            AdjustmentStatus::Applied => {
                self.send_release(&release).await?;
            }
            AdjustmentStatus::Rejected => {
                self.repository
                    .mark_adjustment(
                        &release.idempotency_key,
                        AdjustmentStatus::Rejected,
                        Some("forward adjustment was never applied"),
                    )
                    .await?;
            }
            AdjustmentStatus::Pending | AdjustmentStatus::Unknown => {
                info!(
                    "Booking {}: capacity release deferred until forward adjustment is resolved",
                    booking.id
                );
            }
        }
        Ok(())
    }

    pub(crate) async fn send_release(
        &self,
        release: &CapacityAdjustment,
    ) -> Result<AdjustmentStatus, BookingError> {
        let result = self
            .inventory
            .adjust_capacity(release.event_id, release.delta, &release.idempotency_key)
            .await;

        let (status, message) = match result {
            Ok(()) => {
                info!(
                    "Booking {}: released {} seats of capacity",
                    release.booking_id, -release.delta
                );
                (AdjustmentStatus::Applied, None)
            }
            Err(e) if e.is_transient() => {
                warn!(
                    "Booking {}: capacity release outcome unknown: {}",
                    release.booking_id, e
                );
                (AdjustmentStatus::Unknown, Some(e.to_string()))
            }
            Err(e) => {
                error!(
                    "Booking {}: capacity release rejected, counter needs manual attention: {}",
                    release.booking_id, e
                );
                (AdjustmentStatus::Rejected, Some(e.to_string()))
            }
        };

        self.repository
            .mark_adjustment(&release.idempotency_key, status, message.as_deref())
            .await?;
        Ok(status)
    }

    async fn reserve_seats(&self, seat_ids: &[i64], hold: Uuid) -> Result<(), BookingError> {
        let mut reserved = Vec::with_capacity(seat_ids.len());

        for &seat_id in seat_ids {
            let outcome = match self.ledger.try_reserve(seat_id, hold).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.release_seats(&reserved, hold).await;
                    return Err(e.into());
                }
            };

            match outcome {
                ReserveOutcome::Reserved => reserved.push(seat_id),
                ReserveOutcome::AlreadyTaken => {
                    self.release_seats(&reserved, hold).await;
                    return Err(BookingError::SeatTaken { seat_id });
                }
                ReserveOutcome::Missing => {
                    self.release_seats(&reserved, hold).await;
                    return Err(BookingError::Validation(format!(
                        "seat {} does not exist",
                        seat_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Компенсация не должна падать: ошибки только логируются.
    pub(crate) async fn release_seats(&self, seat_ids: &[i64], hold: Uuid) {
        for &seat_id in seat_ids {
            if let Err(e) = self.ledger.release(seat_id, hold).await {
                error!("Failed to release seat {} (hold {}): {}", seat_id, hold, e);
            }
        }
    }

    pub(crate) async fn load(&self, booking_id: i64) -> Result<BookingDetails, BookingError> {
        self.repository
            .find_by_id(booking_id)
            .await?
            .ok_or(BookingError::NotFound(booking_id))
    }
}

fn replay(existing: BookingDetails, request_hash: &str) -> Result<BookingReceipt, BookingError> {
    if existing.booking.request_hash != request_hash {
        return Err(BookingError::ReferenceMismatch(
            existing.booking.booking_reference,
        ));
    }
    info!(
        "Replaying booking {} for reference {}",
        existing.id(),
        existing.booking.booking_reference
    );
    Ok(BookingReceipt {
        details: existing,
        replayed: true,
    })
}

/// Место - штучный товар: одна позиция на место, количество ровно 1.
fn check_items(request: &BookingRequest) -> Result<(), BookingError> {
    let mut seen = HashSet::new();
    for item in &request.items {
        if let Some(seat_id) = item.seat_id {
            if item.quantity != 1 {
                return Err(BookingError::Validation(format!(
                    "seated item {} must have quantity 1",
                    seat_id
                )));
            }
            if !seen.insert(seat_id) {
                return Err(BookingError::Validation(format!(
                    "seat {} requested twice",
                    seat_id
                )));
            }
        }
    }
    Ok(())
}

fn build_lines(
    request: &BookingRequest,
    base_price_cents: Option<i64>,
) -> Result<Vec<ItemLine>, BookingError> {
    request
        .items
        .iter()
        .map(|item| {
            let unit_price = item.unit_price_cents.or(base_price_cents).ok_or_else(|| {
                BookingError::Validation(
                    "item has no unit price and event has no base price".to_string(),
                )
            })?;
            ItemLine::new(item.ticket_type_id, item.seat_id, item.quantity, unit_price)
        })
        .collect()
}
