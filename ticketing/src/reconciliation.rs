//! Repair of derived state.
//!
//! Three kinds of residue can survive a crash or a storage failure between
//! writes: `sold` counters that no longer match the line items of active
//! reservations, reservations still `PENDING_PAYMENT` although a payment for
//! them succeeded, and payments left `PENDING` after their charge finished.
//! [`Reconciler`] fixes all of them.
//!
//! Payment attempts run under the reservation lock, so a `PENDING` payment
//! seen while holding that lock has no charge in flight and is marked
//! `FAILED`.
//!
//! Counters are rebuilt from persisted line items, so capacity reserved by a
//! reservation whose line items are not yet written is not counted. Run
//! reconciliation while bookings for the event are paused, for example from
//! the `ticketing-reconcile` binary during maintenance.

use crate::error::{Result, StorageContext};
use crate::locks::ReservationLocks;
use crate::metrics;
use crate::payments;
use crate::repository::TicketingRepository;
use crate::types::{
    EventId, PaymentId, PaymentStatus, ReservationId, ReservationStatus, Tier, TierMap,
};
use serde::Serialize;
use std::sync::Arc;

/// What reconciliation changed for one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// Event reconciled
    pub event_id: EventId,
    /// Sold counters before
    pub sold_before: TierMap<u32>,
    /// Sold counters after
    pub sold_after: TierMap<u32>,
    /// Tiers whose active line items exceed capacity
    pub overcommitted: Vec<Tier>,
    /// Reservations confirmed because a payment had already succeeded
    pub confirmed: Vec<ReservationId>,
    /// Payments left `PENDING` and now marked `FAILED`
    pub failed_payments: Vec<PaymentId>,
}

/// Repairs applied to one reservation.
#[derive(Debug, Default)]
struct Settlement {
    confirmed: bool,
    failed_payments: Vec<PaymentId>,
}

impl ReconciliationReport {
    /// Whether anything was corrected.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.sold_before != self.sold_after
            || !self.confirmed.is_empty()
            || !self.failed_payments.is_empty()
    }

    fn corrected_tiers(&self) -> u64 {
        Tier::ALL
            .into_iter()
            .filter(|tier| self.sold_before.get(*tier) != self.sold_after.get(*tier))
            .count() as u64
    }
}

/// Rebuilds counters, finishes interrupted confirmations and fails stale
/// payments.
pub struct Reconciler {
    repository: Arc<dyn TicketingRepository>,
    locks: ReservationLocks,
}

impl Reconciler {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(repository: Arc<dyn TicketingRepository>, locks: ReservationLocks) -> Self {
        Self { repository, locks }
    }

    /// Reconcile one event.
    ///
    /// # Errors
    ///
    /// [`crate::TicketingError::NotFound`] for an unknown event, or storage
    /// failures.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_event(&self, event_id: EventId) -> Result<ReconciliationReport> {
        let recount = self
            .repository
            .recompute_sold(event_id)
            .await
            .context("recompute sold")?;
        let overcommitted = recount.overcommitted();
        if !overcommitted.is_empty() {
            tracing::error!(
                ?overcommitted,
                held = ?recount.held,
                capacity = ?recount.capacity,
                "Active reservations exceed capacity"
            );
        }

        let mut confirmed = Vec::new();
        let mut failed_payments = Vec::new();
        let reservations = self
            .repository
            .list_reservations_by_event(event_id)
            .await
            .context("list reservations by event")?;
        for reservation in reservations {
            let settlement = self.settle(reservation.id).await?;
            if settlement.confirmed {
                confirmed.push(reservation.id);
            }
            failed_payments.extend(settlement.failed_payments);
        }

        let report = ReconciliationReport {
            event_id,
            sold_before: recount.before,
            sold_after: recount.after,
            overcommitted,
            confirmed,
            failed_payments,
        };
        metrics::record_reconciliation_corrections(report.corrected_tiers());
        if report.changed() {
            tracing::warn!(
                sold_before = ?report.sold_before,
                sold_after = ?report.sold_after,
                confirmed = report.confirmed.len(),
                failed_payments = report.failed_payments.len(),
                "Reconciliation corrected event"
            );
        } else {
            tracing::debug!("Event consistent");
        }
        Ok(report)
    }

    async fn settle(&self, reservation_id: ReservationId) -> Result<Settlement> {
        let _guard = self.locks.lock(reservation_id).await;
        let mut settlement = Settlement::default();

        let attempts = self
            .repository
            .list_payments(reservation_id)
            .await
            .context("list payments")?;
        for mut payment in attempts {
            if payment.status != PaymentStatus::Pending {
                continue;
            }
            payment.fail("abandoned: no recorded gateway outcome")?;
            self.repository
                .save_payment(payment.clone())
                .await
                .context("fail stale payment")?;
            tracing::warn!(%reservation_id, payment_id = %payment.id, "Marked stale payment failed");
            settlement.failed_payments.push(payment.id);
        }

        let reservation = self
            .repository
            .load_reservation(reservation_id)
            .await
            .context("load reservation")?;
        if reservation.status == ReservationStatus::PendingPayment
            && payments::succeeded_payment(self.repository.as_ref(), reservation_id)
                .await?
                .is_some()
        {
            payments::confirm_paid(self.repository.as_ref(), reservation).await?;
            settlement.confirmed = true;
        }
        Ok(settlement)
    }

    /// Reconcile every event, in storage order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing event.
    pub async fn reconcile_all(&self) -> Result<Vec<ReconciliationReport>> {
        let events = self
            .repository
            .list_events()
            .await
            .context("list events")?;
        let mut reports = Vec::with_capacity(events.len());
        for event in events {
            reports.push(self.reconcile_event(event.id).await?);
        }
        tracing::info!(
            events = reports.len(),
            changed = reports.iter().filter(|report| report.changed()).count(),
            "Reconciliation finished"
        );
        Ok(reports)
    }
}
