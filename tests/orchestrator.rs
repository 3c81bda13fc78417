mod common;

use booking_service::error::{BookingError, GatewayError};
use booking_service::models::{
    AdjustmentKind, AdjustmentStatus, BookingStatus, EventSnapshot, EventStatus, PaymentOutcome,
    PaymentStatus,
};
use booking_service::services::memory::{InMemoryInventory, ScriptedAdjust};
use booking_service::services::SeatLedger;
use common::{general_admission, seated_request, Harness, EVENT, PRICE};
use uuid::Uuid;

fn outcome(status: PaymentStatus, txn: Option<&str>) -> PaymentOutcome {
    PaymentOutcome {
        payment_status: status,
        transaction_id: txn.map(str::to_string),
    }
}

#[tokio::test]
async fn booking_reserves_seats_and_capacity() {
    let h = Harness::with_capacity(3, 10);

    let receipt = h
        .orchestrator
        .create_booking(seated_request(&[1, 2], None))
        .await
        .unwrap();

    assert!(!receipt.replayed);
    let details = receipt.details;
    assert_eq!(details.status(), BookingStatus::CapacityAdjusted);
    assert_eq!(details.booking.total_amount_cents, 2 * PRICE);
    assert_eq!(details.booking.currency, "USD");
    assert_eq!(details.items.len(), 2);
    assert!(details.booking.booking_reference.starts_with("BK"));
    assert_eq!(
        details.payment.as_ref().map(|p| p.status),
        Some(PaymentStatus::Pending)
    );

    assert!(!h.ledger.is_available(1));
    assert!(!h.ledger.is_available(2));
    assert!(h.ledger.is_available(3));
    assert_eq!(h.inventory.remaining(EVENT), Some(8));

    let adjustments = h.repository.adjustments();
    assert_eq!(adjustments.len(), 1);
    assert_eq!(adjustments[0].kind, AdjustmentKind::Reserve);
    assert_eq!(adjustments[0].status, AdjustmentStatus::Applied);
    assert_eq!(adjustments[0].delta, 2);
}

#[tokio::test]
async fn same_reference_twice_returns_same_booking() {
    let h = Harness::with_capacity(2, 10);

    let first = h
        .orchestrator
        .create_booking(seated_request(&[1], Some("BK123")))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .create_booking(seated_request(&[1], Some("BK123")))
        .await
        .unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.details.id(), second.details.id());
    assert_eq!(second.details.booking.booking_reference, "BK123");
    assert_eq!(h.repository.booking_count(), 1);
    assert_eq!(h.repository.item_count(), 1);
    assert_eq!(h.inventory.adjust_calls(), 1);
    assert_eq!(h.inventory.remaining(EVENT), Some(9));
}

#[tokio::test]
async fn reused_reference_with_different_payload_conflicts() {
    let h = Harness::with_capacity(2, 10);

    h.orchestrator
        .create_booking(seated_request(&[1], Some("BK200")))
        .await
        .unwrap();
    let err = h
        .orchestrator
        .create_booking(seated_request(&[2], Some("BK200")))
        .await
        .unwrap_err();

    assert!(matches!(err, BookingError::ReferenceMismatch(ref r) if r == "BK200"));
    assert!(err.is_conflict());
    assert!(h.ledger.is_available(2));
    assert_eq!(h.repository.booking_count(), 1);
}

#[tokio::test]
async fn retry_with_different_currency_case_replays() {
    let h = Harness::with_capacity(0, 10);

    let mut lower = general_admission(1, Some("BK-CUR"));
    lower.currency = Some("eur".to_string());
    let first = h.orchestrator.create_booking(lower).await.unwrap();
    let second = h
        .orchestrator
        .create_booking(general_admission(1, Some("BK-CUR")))
        .await
        .unwrap();

    assert!(second.replayed);
    assert_eq!(first.details.id(), second.details.id());
    assert_eq!(second.details.booking.currency, "EUR");
    assert_eq!(h.inventory.adjust_calls(), 1);
}

#[tokio::test]
async fn partial_conflict_releases_only_own_seats() {
    let h = Harness::with_capacity(3, 10);
    let other = Uuid::new_v4();
    h.ledger.try_reserve(3, other).await.unwrap();

    let err = h
        .orchestrator
        .create_booking(seated_request(&[1, 2, 3], None))
        .await
        .unwrap_err();

    assert!(matches!(err, BookingError::SeatTaken { seat_id: 3 }));
    assert!(h.ledger.is_available(1));
    assert!(h.ledger.is_available(2));
    assert_eq!(h.ledger.holder(3), Some(other));
    assert_eq!(h.repository.booking_count(), 0);
    assert_eq!(h.inventory.adjust_calls(), 0);
}

#[tokio::test]
async fn unknown_seat_is_a_validation_error() {
    let h = Harness::with_capacity(1, 10);

    let err = h
        .orchestrator
        .create_booking(seated_request(&[1, 99], None))
        .await
        .unwrap_err();

    assert!(matches!(err, BookingError::Validation(_)));
    assert!(h.ledger.is_available(1));
}

#[tokio::test]
async fn persistence_failure_leaves_nothing_behind() {
    let h = Harness::with_capacity(2, 10);
    h.repository.fail_next_create();

    let err = h
        .orchestrator
        .create_booking(seated_request(&[1, 2], None))
        .await
        .unwrap_err();

    assert!(matches!(err, BookingError::TransientInfrastructure(_)));
    assert_eq!(h.repository.booking_count(), 0);
    assert_eq!(h.repository.item_count(), 0);
    assert_eq!(h.repository.payment_count(), 0);
    assert!(h.repository.adjustments().is_empty());
    assert!(h.ledger.is_available(1));
    assert!(h.ledger.is_available(2));
    assert_eq!(h.inventory.adjust_calls(), 0);
}

#[tokio::test]
async fn permanent_rejection_compensates_and_fails_booking() {
    let h = Harness::with_capacity(2, 10);
    h.inventory.script(ScriptedAdjust::Fail(GatewayError::Permanent {
        status: 422,
        message: "event closed".to_string(),
    }));

    let err = h
        .orchestrator
        .create_booking(seated_request(&[1, 2], Some("BK-PERM")))
        .await
        .unwrap_err();

    assert!(matches!(err, BookingError::PermanentInfrastructure(_)));
    assert!(h.ledger.is_available(1));
    assert!(h.ledger.is_available(2));
    assert_eq!(h.inventory.remaining(EVENT), Some(10));

    let adjustments = h.repository.adjustments();
    assert_eq!(adjustments[0].status, AdjustmentStatus::Rejected);

    // бронь остаётся в журнале как FAILED, повтор её просто возвращает
    let replay = h
        .orchestrator
        .create_booking(seated_request(&[1, 2], Some("BK-PERM")))
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.details.status(), BookingStatus::Failed);
}

#[tokio::test]
async fn exhausted_retries_leave_capacity_unknown() {
    let h = Harness::with_capacity(1, 10);
    h.inventory
        .script(ScriptedAdjust::Fail(GatewayError::Transient("timeout".to_string())));

    let receipt = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap();

    assert_eq!(receipt.details.status(), BookingStatus::CapacityUnknown);
    assert!(!h.ledger.is_available(1));

    let adjustments = h.repository.adjustments();
    assert_eq!(adjustments[0].status, AdjustmentStatus::Unknown);
    assert_eq!(adjustments[0].last_error.as_deref(), Some("transient inventory failure: timeout"));
}

#[tokio::test]
async fn event_checks_reject_before_side_effects() {
    let h = Harness::with_capacity(2, 1);

    let sold_out = h
        .orchestrator
        .create_booking(general_admission(2, None))
        .await
        .unwrap_err();
    assert!(matches!(sold_out, BookingError::Validation(_)));

    let mut unknown_event = general_admission(1, None);
    unknown_event.event_id = 404;
    let missing = h
        .orchestrator
        .create_booking(unknown_event)
        .await
        .unwrap_err();
    assert!(matches!(missing, BookingError::Validation(_)));

    h.inventory.put_event(EventSnapshot {
        event_id: 5,
        title: None,
        status: EventStatus::Other("CANCELLED".to_string()),
        remaining_capacity: Some(100),
        base_price_cents: Some(100),
    });
    let mut closed = general_admission(1, None);
    closed.event_id = 5;
    let closed = h.orchestrator.create_booking(closed).await.unwrap_err();
    assert!(matches!(closed, BookingError::Validation(_)));

    assert_eq!(h.repository.booking_count(), 0);
    assert_eq!(h.inventory.adjust_calls(), 0);
}

#[tokio::test]
async fn unreachable_inventory_is_transient() {
    let h = Harness::with_capacity(1, 10);
    h.inventory
        .fail_validation(GatewayError::Transient("connection refused".to_string()));

    let err = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap_err();

    assert!(matches!(err, BookingError::TransientInfrastructure(_)));
    assert!(h.ledger.is_available(1));
}

#[tokio::test]
async fn invalid_request_shape_is_rejected() {
    let h = Harness::with_capacity(2, 10);

    let mut empty = general_admission(1, None);
    empty.items.clear();
    assert!(matches!(
        h.orchestrator.create_booking(empty).await,
        Err(BookingError::Validation(_))
    ));

    let duplicated = seated_request(&[1, 1], None);
    assert!(matches!(
        h.orchestrator.create_booking(duplicated).await,
        Err(BookingError::Validation(_))
    ));

    let mut bad_currency = general_admission(1, None);
    bad_currency.currency = Some("EURO".to_string());
    assert!(matches!(
        h.orchestrator.create_booking(bad_currency).await,
        Err(BookingError::Validation(_))
    ));
}

#[tokio::test]
async fn general_admission_uses_request_price_and_currency() {
    let h = Harness::with_capacity(0, 10);

    let receipt = h
        .orchestrator
        .create_booking(general_admission(3, None))
        .await
        .unwrap();

    assert_eq!(receipt.details.booking.total_amount_cents, 3_000);
    assert_eq!(receipt.details.booking.currency, "EUR");
    assert!(receipt.details.payment.is_none());
    assert_eq!(h.inventory.remaining(EVENT), Some(7));
}

#[tokio::test]
async fn completed_payment_confirms_booking() {
    let h = Harness::with_capacity(1, 10);
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();

    let details = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Completed, Some("txn-1")))
        .await
        .unwrap();

    assert_eq!(details.status(), BookingStatus::PaymentConfirmed);
    assert!(details.booking.confirmed_at.is_some());
    let payment = details.payment.unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.transaction_id.as_deref(), Some("txn-1"));
}

#[tokio::test]
async fn payment_confirmation_requires_adjusted_capacity() {
    let h = Harness::with_capacity(2, 10);
    h.inventory
        .script(ScriptedAdjust::Fail(GatewayError::Transient("timeout".to_string())));
    let unknown = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();

    let err = h
        .orchestrator
        .confirm_payment(unknown, outcome(PaymentStatus::Completed, None))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::InvalidTransition {
            status: BookingStatus::CapacityUnknown,
            ..
        }
    ));

    let missing = h
        .orchestrator
        .confirm_payment(999, outcome(PaymentStatus::Completed, None))
        .await
        .unwrap_err();
    assert!(matches!(missing, BookingError::NotFound(999)));
}

#[tokio::test]
async fn payment_on_terminal_booking_is_rejected() {
    let h = Harness::with_capacity(1, 10);
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();
    h.orchestrator.cancel_booking(id).await.unwrap();

    let err = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Completed, Some("late")))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BookingError::InvalidTransition {
            status: BookingStatus::Cancelled,
            ..
        }
    ));
    let details = h.orchestrator.get_booking(id).await.unwrap();
    assert_eq!(details.status(), BookingStatus::Cancelled);
    assert_eq!(
        details.payment.map(|p| p.status),
        Some(PaymentStatus::Pending)
    );
}

#[tokio::test]
async fn pending_payment_outcome_is_not_accepted() {
    let h = Harness::with_capacity(1, 10);
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();

    let err = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Pending, None))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));
}

#[tokio::test]
async fn failed_payment_cancels_booking() {
    let h = Harness::with_capacity(1, 10);
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();

    let details = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Failed, Some("declined")))
        .await
        .unwrap();

    assert_eq!(details.status(), BookingStatus::Cancelled);
    assert_eq!(
        details.payment.map(|p| p.status),
        Some(PaymentStatus::Failed)
    );
    assert!(h.ledger.is_available(1));
    assert_eq!(h.inventory.remaining(EVENT), Some(10));
    assert!(h.refunds.requests().is_empty());
}

#[tokio::test]
async fn cancelling_paid_booking_releases_everything_and_requests_refund() {
    let h = Harness::with_capacity(2, 10);
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1, 2], None))
        .await
        .unwrap()
        .details
        .id();
    h.orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Completed, Some("txn-9")))
        .await
        .unwrap();

    let cancelled = h.orchestrator.cancel_booking(id).await.unwrap();

    assert_eq!(cancelled.status(), BookingStatus::Cancelled);
    assert!(cancelled.booking.cancelled_at.is_some());
    assert!(h.ledger.is_available(1));
    assert!(h.ledger.is_available(2));
    assert_eq!(h.inventory.remaining(EVENT), Some(10));
    assert_eq!(h.refunds.requests(), vec![(id, 2 * PRICE)]);

    let release = h
        .repository
        .adjustments()
        .into_iter()
        .find(|a| a.kind == AdjustmentKind::Release)
        .unwrap();
    assert_eq!(release.delta, -2);
    assert_eq!(release.status, AdjustmentStatus::Applied);

    let refunded = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Refunded, None))
        .await
        .unwrap();
    let payment = refunded.payment.unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);
    assert!(payment.refunded_at.is_some());
}

#[tokio::test]
async fn refund_requires_cancelled_booking() {
    let h = Harness::with_capacity(1, 10);
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();

    let err = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Refunded, None))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::InvalidTransition { .. }));
}

#[tokio::test]
async fn refund_of_unpaid_cancelled_booking_is_rejected() {
    let h = Harness::with_capacity(1, 10);
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();
    h.orchestrator.cancel_booking(id).await.unwrap();

    let err = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Refunded, Some("rf-1")))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BookingError::InvalidTransition {
            status: BookingStatus::Cancelled,
            ..
        }
    ));
    let payment = h.orchestrator.get_booking(id).await.unwrap().payment.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.refunded_at.is_none());
    assert!(h.refunds.requests().is_empty());
}

#[tokio::test]
async fn repeated_refund_keeps_first_refund() {
    let h = Harness::with_capacity(1, 10);
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();
    h.orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Completed, Some("txn-1")))
        .await
        .unwrap();
    h.orchestrator.cancel_booking(id).await.unwrap();

    let first = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Refunded, Some("rf-1")))
        .await
        .unwrap()
        .payment
        .unwrap();
    let second = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Refunded, Some("rf-2")))
        .await
        .unwrap()
        .payment
        .unwrap();

    assert_eq!(second.status, PaymentStatus::Refunded);
    assert_eq!(second.refunded_at, first.refunded_at);
    assert_eq!(second.transaction_id.as_deref(), Some("rf-1"));
}

#[tokio::test]
async fn failed_payment_after_refund_is_rejected() {
    let h = Harness::with_capacity(1, 10);
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();
    h.orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Completed, Some("txn-1")))
        .await
        .unwrap();
    h.orchestrator.cancel_booking(id).await.unwrap();
    h.orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Refunded, Some("rf-1")))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Failed, Some("late-decline")))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BookingError::InvalidTransition {
            status: BookingStatus::Cancelled,
            ..
        }
    ));
    let payment = h.orchestrator.get_booking(id).await.unwrap().payment.unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);
    assert_eq!(payment.transaction_id.as_deref(), Some("rf-1"));
    assert!(payment.refunded_at.is_some());
}

#[tokio::test]
async fn failed_payment_on_failed_booking_is_rejected() {
    let h = Harness::with_capacity(1, 10);
    h.inventory.script(ScriptedAdjust::Fail(GatewayError::Permanent {
        status: 422,
        message: "event closed".to_string(),
    }));
    h.orchestrator
        .create_booking(seated_request(&[1], Some("BK-FAILED")))
        .await
        .unwrap_err();
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], Some("BK-FAILED")))
        .await
        .unwrap()
        .details
        .id();

    let err = h
        .orchestrator
        .confirm_payment(id, outcome(PaymentStatus::Failed, Some("declined")))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BookingError::InvalidTransition {
            status: BookingStatus::Failed,
            ..
        }
    ));
    let details = h.orchestrator.get_booking(id).await.unwrap();
    assert_eq!(details.status(), BookingStatus::Failed);
    assert_eq!(
        details.payment.map(|p| p.status),
        Some(PaymentStatus::Pending)
    );
}

#[tokio::test]
async fn cancelling_twice_is_a_no_op() {
    let h = Harness::with_capacity(1, 10);
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();

    h.orchestrator.cancel_booking(id).await.unwrap();
    let again = h.orchestrator.cancel_booking(id).await.unwrap();

    assert_eq!(again.status(), BookingStatus::Cancelled);
    // одно списание и один возврат
    assert_eq!(h.inventory.adjust_calls(), 2);
    assert_eq!(h.inventory.remaining(EVENT), Some(10));
}

#[tokio::test]
async fn cancel_with_unknown_capacity_defers_release() {
    let h = Harness::with_capacity(1, 10);
    h.inventory
        .script(ScriptedAdjust::Fail(GatewayError::Transient("timeout".to_string())));
    let id = h
        .orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap()
        .details
        .id();

    let cancelled = h.orchestrator.cancel_booking(id).await.unwrap();

    assert_eq!(cancelled.status(), BookingStatus::Cancelled);
    assert!(h.ledger.is_available(1));
    // возврат не отправлялся: неизвестно, было ли списание
    assert_eq!(h.inventory.adjust_calls(), 1);
    let release = h
        .repository
        .adjustments()
        .into_iter()
        .find(|a| a.kind == AdjustmentKind::Release)
        .unwrap();
    assert_eq!(release.status, AdjustmentStatus::Pending);
}

#[tokio::test]
async fn cancel_unknown_booking_is_not_found() {
    let h = Harness::new(Vec::new(), InMemoryInventory::new());
    assert!(matches!(
        h.orchestrator.cancel_booking(7).await,
        Err(BookingError::NotFound(7))
    ));
}

#[tokio::test]
async fn bookings_are_listed_per_buyer() {
    let h = Harness::with_capacity(3, 10);
    h.orchestrator
        .create_booking(seated_request(&[1], None))
        .await
        .unwrap();
    h.orchestrator
        .create_booking(seated_request(&[2], None))
        .await
        .unwrap();

    assert_eq!(h.orchestrator.list_bookings(42).await.unwrap().len(), 2);
    assert!(h.orchestrator.list_bookings(7).await.unwrap().is_empty());
}

#[tokio::test]
async fn insufficient_capacity_releases_reserved_seats() {
    let h = Harness::with_capacity(2, 1);

    let err = h
        .orchestrator
        .create_booking(seated_request(&[1, 2], None))
        .await
        .unwrap_err();

    assert!(matches!(err, BookingError::Validation(_)));
    assert!(h.ledger.is_available(1));
    assert!(h.ledger.is_available(2));
    assert_eq!(h.repository.booking_count(), 0);
}
