//! Persistence gateway.
//!
//! [`TicketingRepository`] is the only path to storage. Capacity changes go
//! through the atomic [`reserve_capacity`](TicketingRepository::reserve_capacity)
//! and [`release_capacity`](TicketingRepository::release_capacity) primitives;
//! `save_event` never writes sold counters.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryTicketingRepository`]: mutex-guarded maps, for tests and demos
//! - [`PostgresTicketingRepository`]: `sqlx` on `PostgreSQL`

use crate::types::{
    ClientId, Event, EventId, Payment, Reservation, ReservationId, ReservationLineItem, Tier,
    TierMap,
};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::{InMemoryTicketingRepository, RepositoryOperation};
pub use postgres::PostgresTicketingRepository;

/// Errors from the persistence layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Row does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Identifier looked up
        id: String,
    },

    /// Write rejected because it would break a stored invariant
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Driver or connection failure
    #[error("Database error: {0}")]
    Database(String),

    /// Stored value could not be mapped to a domain type
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Result type for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Boxed future returned by every repository method.
pub type RepositoryFuture<'a, T> = Pin<Box<dyn Future<Output = RepositoryResult<T>> + Send + 'a>>;

/// Outcome of an atomic capacity reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Quantity committed
    Reserved {
        /// Remaining capacity after the increment
        remaining: u32,
    },
    /// Nothing changed
    Insufficient {
        /// Remaining capacity at the time of the attempt
        available: u32,
    },
}

/// Result of recomputing sold counters from active line items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoldRecount {
    /// Counters before the recount
    pub before: TierMap<u32>,
    /// Counters stored after the recount (clamped to capacity)
    pub after: TierMap<u32>,
    /// Raw sum of quantities held by non-cancelled reservations
    pub held: TierMap<u32>,
    /// Capacity per tier
    pub capacity: TierMap<u32>,
}

impl SoldRecount {
    /// Tiers where held quantity exceeds capacity.
    #[must_use]
    pub fn overcommitted(&self) -> Vec<Tier> {
        Tier::ALL
            .into_iter()
            .filter(|tier| self.held.get(*tier) > self.capacity.get(*tier))
            .collect()
    }

    /// Whether the stored counters changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Storage abstraction for events, reservations, line items and payments.
///
/// Methods take owned values so that implementations can move them into the
/// returned future.
pub trait TicketingRepository: Send + Sync {
    /// Insert a new event, including its initial sold counters.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Conflict`] if the id exists.
    fn create_event(&self, event: Event) -> RepositoryFuture<'_, ()>;

    /// Load an event with its current counters.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] if absent.
    fn load_event(&self, event_id: EventId) -> RepositoryFuture<'_, Event>;

    /// Update descriptive fields, capacities and prices. Sold counters are
    /// left untouched.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Conflict`] if a new capacity is below the current
    /// sold counter.
    fn save_event(&self, event: Event) -> RepositoryFuture<'_, ()>;

    /// All events ordered by start time.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_events(&self) -> RepositoryFuture<'_, Vec<Event>>;

    /// Atomically add `quantity` to the sold counter of one tier if it fits.
    ///
    /// Concurrent calls on the same (event, tier) are linearizable.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] if the event is absent.
    fn reserve_capacity(
        &self,
        event_id: EventId,
        tier: Tier,
        quantity: u32,
    ) -> RepositoryFuture<'_, ReserveOutcome>;

    /// Atomically subtract `quantity`, flooring at zero. Returns the amount
    /// actually released.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] if the event is absent.
    fn release_capacity(
        &self,
        event_id: EventId,
        tier: Tier,
        quantity: u32,
    ) -> RepositoryFuture<'_, u32>;

    /// Insert a reservation header. Line items are written separately.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn create_reservation(&self, reservation: Reservation) -> RepositoryFuture<'_, ()>;

    /// Insert line items.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] if the reservation header is absent.
    fn create_line_items(&self, items: Vec<ReservationLineItem>) -> RepositoryFuture<'_, ()>;

    /// Persist status and `cancelled_at`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Conflict`] if the stored reservation is cancelled.
    fn save_reservation(&self, reservation: Reservation) -> RepositoryFuture<'_, ()>;

    /// Load a reservation with its line items.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] if absent.
    fn load_reservation(&self, reservation_id: ReservationId) -> RepositoryFuture<'_, Reservation>;

    /// Line items of one reservation, in tier order.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn load_line_items(
        &self,
        reservation_id: ReservationId,
    ) -> RepositoryFuture<'_, Vec<ReservationLineItem>>;

    /// Persist a cancelled reservation and release the capacity held by its
    /// stored line items, as one atomic unit.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Conflict`] if the stored reservation is already
    /// cancelled. Nothing is released in that case.
    fn cancel_reservation(&self, reservation: Reservation) -> RepositoryFuture<'_, ()>;

    /// Insert a payment record.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] if the reservation is absent.
    fn create_payment(&self, payment: Payment) -> RepositoryFuture<'_, ()>;

    /// Persist payment status, reference and failure reason.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] if the payment is absent.
    fn save_payment(&self, payment: Payment) -> RepositoryFuture<'_, ()>;

    /// Payments for one reservation, oldest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_payments(&self, reservation_id: ReservationId) -> RepositoryFuture<'_, Vec<Payment>>;

    /// Reservations of one client, newest first, with line items.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_reservations_by_client(
        &self,
        client_id: ClientId,
    ) -> RepositoryFuture<'_, Vec<Reservation>>;

    /// Reservations for one event, oldest first, with line items.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_reservations_by_event(
        &self,
        event_id: EventId,
    ) -> RepositoryFuture<'_, Vec<Reservation>>;

    /// Recompute sold counters from the line items of non-cancelled
    /// reservations and store them, atomically with respect to
    /// reserve/release on the same event.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] if the event is absent.
    fn recompute_sold(&self, event_id: EventId) -> RepositoryFuture<'_, SoldRecount>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recount_reports_overcommitted_tiers() {
        let recount = SoldRecount {
            before: TierMap::new(5, 2, 0),
            after: TierMap::new(5, 2, 0),
            held: TierMap::new(7, 2, 0),
            capacity: TierMap::new(5, 2, 1),
        };
        assert_eq!(recount.overcommitted(), vec![Tier::Standard]);
        assert!(!recount.changed());
    }
}
