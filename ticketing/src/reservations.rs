//! Reservation lifecycle: create, cancel and query.
//!
//! Creation validates input, checks the booking window, prices the request
//! against the event's current prices, reserves every tier all-or-nothing and
//! persists the reservation with its line items. A persistence failure after
//! capacity was reserved releases that capacity again before the error is
//! returned.
//!
//! Cancellation and payment of the same reservation are serialized through
//! [`ReservationLocks`].

use crate::config::BookingRules;
use crate::error::{Result, StorageContext, TicketingError};
use crate::inventory::Inventory;
use crate::locks::ReservationLocks;
use crate::metrics;
use crate::payments;
use crate::pricing;
use crate::repository::TicketingRepository;
use crate::types::{
    ClientId, Event, EventCategory, EventId, Payment, Reservation, ReservationId,
    ReservationStatus, TierQuantities,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ticketing_core::environment::Clock;

/// Request to reserve tickets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    /// Client making the reservation
    pub client_id: ClientId,
    /// Event to book
    pub event_id: EventId,
    /// Tickets per tier
    pub quantities: TierQuantities,
    /// Caller intends to pay right away.
    ///
    /// Creation always yields `PENDING_PAYMENT`; the flag is recorded and
    /// honored by [`crate::TicketingService::book`], which runs the payment
    /// immediately after creation.
    pub pay_immediately: bool,
}

/// Display data of the reserved event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    /// Event id
    pub id: EventId,
    /// Display name
    pub name: String,
    /// Venue
    pub venue: String,
    /// Category with attributes
    pub category: EventCategory,
    /// Scheduled start
    pub starts_at: DateTime<Utc>,
}

impl From<&Event> for EventSummary {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            name: event.name.clone(),
            venue: event.venue.clone(),
            category: event.category.clone(),
            starts_at: event.starts_at,
        }
    }
}

/// Reservation with its event and payment history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationDetails {
    /// Reservation with line items
    pub reservation: Reservation,
    /// Event being attended
    pub event: EventSummary,
    /// Payment attempts, oldest first
    pub payments: Vec<Payment>,
}

fn cutoff_instant(starts_at: DateTime<Utc>, cutoff: Duration) -> DateTime<Utc> {
    starts_at
        .checked_sub_signed(cutoff)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Creates, cancels and looks up reservations.
pub struct ReservationManager {
    repository: Arc<dyn TicketingRepository>,
    inventory: Inventory,
    clock: Arc<dyn Clock>,
    rules: BookingRules,
    locks: ReservationLocks,
}

impl ReservationManager {
    /// Creates a new manager.
    #[must_use]
    pub fn new(
        repository: Arc<dyn TicketingRepository>,
        clock: Arc<dyn Clock>,
        rules: BookingRules,
        locks: ReservationLocks,
    ) -> Self {
        Self {
            inventory: Inventory::new(Arc::clone(&repository)),
            repository,
            clock,
            rules,
            locks,
        }
    }

    /// Whether `event` still accepts bookings at `now`.
    ///
    /// Bookings close `booking_cutoff` before the start; the cutoff instant
    /// itself is already closed.
    #[must_use]
    pub fn booking_open(&self, event: &Event, now: DateTime<Utc>) -> bool {
        event.active && now < cutoff_instant(event.starts_at, self.rules.booking_cutoff())
    }

    fn validate_quantities(&self, quantities: &TierQuantities) -> Result<()> {
        let total = quantities.total();
        if total == 0 {
            return Err(TicketingError::Validation(
                "reservation must include at least one ticket".to_string(),
            ));
        }
        let max = u64::from(self.rules.max_tickets_per_reservation);
        if total > max {
            return Err(TicketingError::Validation(format!(
                "at most {max} tickets per reservation, requested {total}"
            )));
        }
        Ok(())
    }

    /// Reserve tickets for a client.
    ///
    /// The new reservation is `PENDING_PAYMENT` and carries one line item per
    /// requested tier, priced at the event's current prices.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::Validation`] for an empty or oversized request
    /// - [`TicketingError::NotFound`] for an unknown event
    /// - [`TicketingError::BookingWindowClosed`] inside the pre-event cutoff
    ///   or for an inactive event
    /// - [`TicketingError::InsufficientCapacity`] naming the first short tier
    /// - [`TicketingError::Storage`] if persistence fails (capacity is
    ///   released again)
    #[tracing::instrument(
        skip_all,
        fields(event_id = %request.event_id, client_id = %request.client_id)
    )]
    pub async fn create_reservation(&self, request: ReservationRequest) -> Result<Reservation> {
        let ReservationRequest {
            client_id,
            event_id,
            quantities,
            pay_immediately,
        } = request;

        if let Err(err) = self.validate_quantities(&quantities) {
            metrics::record_reservation_rejected();
            return Err(err);
        }

        let event = self
            .repository
            .load_event(event_id)
            .await
            .context("load event")?;
        let now = self.clock.now();
        if !self.booking_open(&event, now) {
            tracing::info!(starts_at = %event.starts_at, active = event.active, "Booking window closed");
            metrics::record_reservation_rejected();
            return Err(TicketingError::BookingWindowClosed {
                event_id,
                starts_at: event.starts_at,
            });
        }

        let reservation_id = ReservationId::new();
        let quote = pricing::quote(reservation_id, &quantities, &event.prices)?;

        if let Err(err) = self.inventory.reserve_all(event_id, &quantities).await {
            if matches!(err, TicketingError::InsufficientCapacity { .. }) {
                metrics::record_reservation_rejected();
            }
            return Err(err);
        }

        let reservation = Reservation {
            id: reservation_id,
            client_id,
            event_id,
            created_at: now,
            cancelled_at: None,
            status: ReservationStatus::PendingPayment,
            total_amount: quote.total,
            line_items: quote.line_items,
        };

        if let Err(err) = self.persist_new(&reservation).await {
            if let Err(release_err) = self.inventory.release_all(event_id, &quantities).await {
                tracing::error!(
                    %reservation_id,
                    error = %release_err,
                    "Failed to release capacity after persistence failure; reconciliation required"
                );
            }
            return Err(err);
        }

        metrics::record_reservation_created(quantities.total());
        tracing::info!(
            %reservation_id,
            total = %reservation.total_amount,
            tickets = quantities.total(),
            pay_immediately,
            "Reservation created"
        );
        Ok(reservation)
    }

    async fn persist_new(&self, reservation: &Reservation) -> Result<()> {
        self.repository
            .create_reservation(reservation.clone())
            .await
            .context("create reservation")?;

        if let Err(err) = self
            .repository
            .create_line_items(reservation.line_items.clone())
            .await
            .context("create line items")
        {
            // A header without items would hold nothing; retire it.
            let mut orphan = reservation.clone();
            if orphan.cancel(self.clock.now()).is_ok() {
                if let Err(save_err) = self.repository.save_reservation(orphan).await {
                    tracing::error!(
                        reservation_id = %reservation.id,
                        error = %save_err,
                        "Failed to retire reservation without line items"
                    );
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Cancel a reservation on behalf of its owner and release its capacity.
    ///
    /// Allowed until `cancellation_cutoff` before the event; the deadline
    /// instant itself is still allowed. A `PENDING_PAYMENT` reservation with
    /// a succeeded payment is confirmed first, so the cancellation is recorded
    /// as one of a paid booking.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::NotFound`] for an unknown reservation
    /// - [`TicketingError::Unauthorized`] if `requester` is not the owner
    /// - [`TicketingError::AlreadyCancelled`] if already cancelled
    /// - [`TicketingError::LateCancellation`] past the deadline
    #[tracing::instrument(skip_all, fields(%reservation_id, %requester))]
    pub async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
        requester: ClientId,
    ) -> Result<Reservation> {
        let _guard = self.locks.lock(reservation_id).await;

        let mut reservation = self
            .repository
            .load_reservation(reservation_id)
            .await
            .context("load reservation")?;
        if reservation.client_id != requester {
            tracing::warn!("Cancellation refused: requester does not own reservation");
            return Err(TicketingError::Unauthorized {
                resource: format!("reservation {reservation_id}"),
            });
        }
        if reservation.status == ReservationStatus::Cancelled {
            return Err(TicketingError::AlreadyCancelled(reservation_id));
        }
        if reservation.status == ReservationStatus::PendingPayment {
            if let Some(paid) =
                payments::succeeded_payment(self.repository.as_ref(), reservation_id).await?
            {
                tracing::warn!(payment_id = %paid.id, "Reservation already paid; confirming before cancellation");
                reservation = payments::confirm_paid(self.repository.as_ref(), reservation).await?;
            }
        }

        let event = self
            .repository
            .load_event(reservation.event_id)
            .await
            .context("load event")?;
        let now = self.clock.now();
        let deadline = cutoff_instant(event.starts_at, self.rules.cancellation_cutoff());
        if now > deadline {
            tracing::info!(%deadline, "Cancellation refused: too late");
            return Err(TicketingError::LateCancellation {
                starts_at: event.starts_at,
                deadline,
            });
        }

        let previous = reservation.status;
        reservation.cancel(now)?;
        self.inventory
            .release_for_cancellation(reservation.clone())
            .await?;

        metrics::record_reservation_cancelled();
        tracing::info!(from = %previous, "Reservation cancelled");
        Ok(reservation)
    }

    /// Reservations of one client, newest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn reservations_for_client(&self, client_id: ClientId) -> Result<Vec<Reservation>> {
        self.repository
            .list_reservations_by_client(client_id)
            .await
            .context("list reservations by client")
    }

    /// One reservation with its event and payments, for its owner.
    ///
    /// # Errors
    ///
    /// [`TicketingError::NotFound`] or [`TicketingError::Unauthorized`].
    pub async fn reservation_details(
        &self,
        reservation_id: ReservationId,
        requester: ClientId,
    ) -> Result<ReservationDetails> {
        let reservation = self
            .repository
            .load_reservation(reservation_id)
            .await
            .context("load reservation")?;
        if reservation.client_id != requester {
            return Err(TicketingError::Unauthorized {
                resource: format!("reservation {reservation_id}"),
            });
        }

        let event = self
            .repository
            .load_event(reservation.event_id)
            .await
            .context("load event")?;
        let payments = self
            .repository
            .list_payments(reservation_id)
            .await
            .context("list payments")?;

        Ok(ReservationDetails {
            event: EventSummary::from(&event),
            reservation,
            payments,
        })
    }

    /// Capacity operations used by this manager.
    #[must_use]
    pub const fn inventory(&self) -> &Inventory {
        &self.inventory
    }
}
