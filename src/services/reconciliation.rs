//! Фоновая сверка неизвестных исходов изменения ёмкости.
//!
//! Подбирает записи `UNKNOWN` и зависшие дольше grace-периода `PENDING`,
//! переспрашивает удалённый сервис по ключу идемпотентности и доводит бронь
//! до согласованного состояния.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ReconciliationConfig;
use crate::error::BookingError;
use crate::models::{AdjustmentKind, AdjustmentStatus, BookingStatus, CapacityAdjustment};
use crate::services::inventory::RemoteAdjustment;
use crate::services::orchestrator::{BookingOrchestrator, ForwardOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Applied,
    Rejected,
    /// Списание отклонено, бронь компенсирована и переведена в `FAILED`.
    Compensated,
    Unresolved,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub examined: usize,
    pub applied: usize,
    pub rejected: usize,
    pub compensated: usize,
    pub unresolved: usize,
    pub errors: usize,
}

pub struct ReconciliationService {
    orchestrator: Arc<BookingOrchestrator>,
    config: ReconciliationConfig,
}

impl ReconciliationService {
    pub fn new(orchestrator: Arc<BookingOrchestrator>, config: ReconciliationConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Один проход по пачке нерешённых записей.
    pub async fn run_once(&self) -> Result<ReconciliationReport, BookingError> {
        let stale_before = Utc::now() - chrono::Duration::seconds(self.config.grace_seconds);
        let batch = self
            .orchestrator
            .repository()
            .unresolved_adjustments(stale_before, self.config.batch_size)
            .await?;

        let mut report = ReconciliationReport::default();
        if batch.is_empty() {
            debug!("No capacity adjustments to reconcile");
            return Ok(report);
        }

        info!("Reconciling {} capacity adjustments", batch.len());

        for adjustment in batch {
            report.examined += 1;
            let result = match adjustment.kind {
                AdjustmentKind::Reserve => self.reconcile_reserve(&adjustment).await,
                AdjustmentKind::Release => self.reconcile_release(&adjustment).await,
            };

            match result {
                Ok(Resolution::Applied) => report.applied += 1,
                Ok(Resolution::Rejected) => report.rejected += 1,
                Ok(Resolution::Compensated) => report.compensated += 1,
                Ok(Resolution::Unresolved) => report.unresolved += 1,
                Err(e) => {
                    error!(
                        "Failed to reconcile adjustment {} of booking {}: {}",
                        adjustment.id, adjustment.booking_id, e
                    );
                    report.errors += 1;
                }
            }
        }

        info!(
            "Reconciliation finished: {} examined, {} applied, {} rejected, {} compensated, {} unresolved, {} errors",
            report.examined,
            report.applied,
            report.rejected,
            report.compensated,
            report.unresolved,
            report.errors
        );
        Ok(report)
    }

    /// Бесконечный цикл с фиксированным интервалом.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.interval_seconds.max(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!("Reconciliation pass failed: {}", e);
            }
        }
    }

    async fn reconcile_reserve(
        &self,
        adjustment: &CapacityAdjustment,
    ) -> Result<Resolution, BookingError> {
        let repository = self.orchestrator.repository();
        let key = adjustment.idempotency_key.as_str();

        let Some(details) = repository.find_by_id(adjustment.booking_id).await? else {
            warn!(
                "Adjustment {} references missing booking {}",
                adjustment.id, adjustment.booking_id
            );
            return Ok(Resolution::Unresolved);
        };
        let status = details.status();

        let remote = match self
            .orchestrator
            .inventory()
            .adjustment_status(adjustment.event_id, key)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                warn!(
                    "Cannot query adjustment of booking {}: {}",
                    adjustment.booking_id, e
                );
                repository
                    .mark_adjustment(key, adjustment.status, Some(&e.to_string()))
                    .await?;
                return Ok(Resolution::Unresolved);
            }
        };

        match (remote, status) {
            (
                RemoteAdjustment::Applied,
                BookingStatus::Pending | BookingStatus::CapacityUnknown,
            ) => {
                info!(
                    "Booking {}: capacity was applied, completing booking",
                    details.id()
                );
                self.orchestrator
                    .settle_forward(&details.booking, &details.seat_ids(), key, status, Ok(()))
                    .await?;
                Ok(Resolution::Applied)
            }
            (
                RemoteAdjustment::Applied,
                BookingStatus::CapacityAdjusted | BookingStatus::PaymentConfirmed,
            ) => {
                repository
                    .mark_adjustment(key, AdjustmentStatus::Applied, None)
                    .await?;
                Ok(Resolution::Applied)
            }
            (RemoteAdjustment::Applied, BookingStatus::Cancelled | BookingStatus::Failed) => {
                info!(
                    "Booking {} is {} but capacity was applied, reversing",
                    details.id(),
                    status
                );
                repository
                    .mark_adjustment(key, AdjustmentStatus::Applied, None)
                    .await?;
                self.orchestrator.reverse_capacity(&details.booking).await?;
                Ok(Resolution::Applied)
            }
            (RemoteAdjustment::NotApplied, BookingStatus::Cancelled | BookingStatus::Failed) => {
                let reason = format!("not applied before booking became {}", status);
                repository
                    .mark_adjustment(key, AdjustmentStatus::Rejected, Some(&reason))
                    .await?;
                Ok(Resolution::Rejected)
            }
            (
                RemoteAdjustment::NotApplied,
                BookingStatus::Pending | BookingStatus::CapacityUnknown,
            ) => {
                // тот же ключ - повтор не спишет дважды
                let result = self
                    .orchestrator
                    .inventory()
                    .adjust_capacity(adjustment.event_id, adjustment.delta, key)
                    .await;
                let outcome = self
                    .orchestrator
                    .settle_forward(&details.booking, &details.seat_ids(), key, status, result)
                    .await?;
                Ok(match outcome {
                    ForwardOutcome::Adjusted => Resolution::Applied,
                    ForwardOutcome::Unknown => Resolution::Unresolved,
                    ForwardOutcome::Rejected(_) => Resolution::Compensated,
                })
            }
            (RemoteAdjustment::NotApplied, _) => {
                error!(
                    "Booking {} is {} but inventory has no record of adjustment {}",
                    details.id(),
                    status,
                    key
                );
                repository
                    .mark_adjustment(
                        key,
                        adjustment.status,
                        Some("inventory has no record of this adjustment"),
                    )
                    .await?;
                Ok(Resolution::Unresolved)
            }
            (RemoteAdjustment::Applied, _) => Ok(Resolution::Unresolved),
        }
    }

    async fn reconcile_release(
        &self,
        adjustment: &CapacityAdjustment,
    ) -> Result<Resolution, BookingError> {
        let repository = self.orchestrator.repository();

        // за этот же проход её мог уже отправить откат списания
        let Some(current) = repository
            .find_adjustment(adjustment.booking_id, AdjustmentKind::Release)
            .await?
        else {
            return Ok(Resolution::Unresolved);
        };
        match current.status {
            AdjustmentStatus::Applied => return Ok(Resolution::Applied),
            AdjustmentStatus::Rejected => return Ok(Resolution::Rejected),
            AdjustmentStatus::Pending | AdjustmentStatus::Unknown => {}
        }

        let forward = repository
            .find_adjustment(adjustment.booking_id, AdjustmentKind::Reserve)
            .await?;

        match forward.map(|f| f.status) {
            Some(AdjustmentStatus::Applied) => {
                Ok(match self.orchestrator.send_release(&current).await? {
                    AdjustmentStatus::Applied => Resolution::Applied,
                    AdjustmentStatus::Rejected => Resolution::Rejected,
                    AdjustmentStatus::Pending | AdjustmentStatus::Unknown => {
                        Resolution::Unresolved
                    }
                })
            }
            Some(AdjustmentStatus::Rejected) | None => {
                repository
                    .mark_adjustment(
                        &current.idempotency_key,
                        AdjustmentStatus::Rejected,
                        Some("forward adjustment was never applied"),
                    )
                    .await?;
                Ok(Resolution::Rejected)
            }
            Some(AdjustmentStatus::Pending | AdjustmentStatus::Unknown) => {
                debug!(
                    "Release for booking {} waits for its forward adjustment",
                    adjustment.booking_id
                );
                Ok(Resolution::Unresolved)
            }
        }
    }
}
