//! Error taxonomy for the ticketing services.
//!
//! Business outcomes (capacity, cutoffs, ownership, payment validation and
//! declines) are ordinary variants that callers are expected to match on.
//! Storage and gateway failures are technical: they are logged where they
//! happen and keep their cause as the error `source`.

use crate::payment_gateway::GatewayError;
use crate::repository::RepositoryError;
use crate::types::{EventId, PaymentId, ReservationId, ReservationStatus, Tier, TransitionError};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = TicketingError> = std::result::Result<T, E>;

/// Errors returned by the ticketing services.
#[derive(Error, Debug)]
pub enum TicketingError {
    /// Malformed input, rejected before inventory is touched.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Not enough remaining capacity in one tier. Retry with fewer tickets.
    #[error("Insufficient capacity for {tier} tier: requested {requested}, available {available}")]
    InsufficientCapacity {
        /// Tier that ran out
        tier: Tier,
        /// Quantity requested for that tier
        requested: u32,
        /// Quantity remaining when the request was evaluated
        available: u32,
    },

    /// Event started, is inside the pre-event cutoff, or is not on sale.
    #[error("Booking is closed for event {event_id} (starts {starts_at})")]
    BookingWindowClosed {
        /// Event being booked
        event_id: EventId,
        /// Scheduled start
        starts_at: DateTime<Utc>,
    },

    /// Cancellation attempted inside the cutoff before the event.
    #[error("Too late to cancel: event starts {starts_at}, cancellations closed at {deadline}")]
    LateCancellation {
        /// Scheduled start
        starts_at: DateTime<Utc>,
        /// Last instant a cancellation was accepted
        deadline: DateTime<Utc>,
    },

    /// Requester does not own the resource.
    #[error("Requester is not allowed to act on {resource}")]
    Unauthorized {
        /// Resource description, e.g. `reservation <id>`
        resource: String,
    },

    /// Reservation is already cancelled.
    #[error("Reservation {0} is already cancelled")]
    AlreadyCancelled(ReservationId),

    /// Operation needs a different reservation status.
    #[error("Reservation {reservation_id} is {status}, expected {expected}")]
    InvalidState {
        /// Reservation involved
        reservation_id: ReservationId,
        /// Current status
        status: ReservationStatus,
        /// Status the operation requires
        expected: ReservationStatus,
    },

    /// State machine refused a transition.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Reservation total is zero.
    #[error("Reservation {0} has nothing to pay")]
    NothingToPay(ReservationId),

    /// Malformed payment input.
    #[error("Invalid payment details: {0}")]
    PaymentInvalid(String),

    /// Gateway declined the charge. The reservation stays `PENDING_PAYMENT`.
    #[error("Payment {payment_id} declined: {reason}")]
    PaymentDeclined {
        /// Failed payment record
        payment_id: PaymentId,
        /// Gateway message
        reason: String,
    },

    /// Gateway errored or timed out. The reservation stays `PENDING_PAYMENT`.
    #[error("Payment gateway failure for payment {payment_id}")]
    PaymentGateway {
        /// Failed payment record
        payment_id: PaymentId,
        /// Underlying gateway error
        #[source]
        source: GatewayError,
    },

    /// Background payment worker is no longer running.
    #[error("Payment worker is shut down")]
    WorkerShutdown,

    /// Persistence failure.
    #[error("Storage failure")]
    Storage(#[source] RepositoryError),
}

impl TicketingError {
    /// Technical failures (storage, gateway, worker) as opposed to business
    /// outcomes.
    #[must_use]
    pub const fn is_technical(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::PaymentGateway { .. } | Self::WorkerShutdown
        )
    }

    /// Whether the same request may succeed if retried unchanged later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::PaymentGateway { .. }
                | Self::PaymentDeclined { .. }
                | Self::InsufficientCapacity { .. }
        )
    }
}

impl From<RepositoryError> for TicketingError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Storage(other),
        }
    }
}

/// Attach an operation name to repository failures and log them.
pub(crate) trait StorageContext<T> {
    fn context(self, operation: &'static str) -> Result<T>;
}

impl<T> StorageContext<T> for std::result::Result<T, RepositoryError> {
    fn context(self, operation: &'static str) -> Result<T> {
        self.map_err(|err| {
            if !matches!(err, RepositoryError::NotFound { .. }) {
                tracing::error!(operation, error = %err, "Storage operation failed");
            }
            TicketingError::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn not_found_is_not_a_storage_failure() {
        let err = TicketingError::from(RepositoryError::NotFound {
            entity: "event",
            id: "42".to_string(),
        });
        assert!(matches!(err, TicketingError::NotFound { entity: "event", .. }));
        assert!(!err.is_technical());
    }

    #[test]
    fn storage_failure_keeps_its_cause() {
        let err = TicketingError::from(RepositoryError::Database("connection reset".to_string()));
        assert!(err.is_technical());
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("Database error: connection reset"));
    }

    #[test]
    fn capacity_message_names_tier_and_amounts() {
        let err = TicketingError::InsufficientCapacity {
            tier: Tier::Vip,
            requested: 3,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient capacity for vip tier: requested 3, available 1"
        );
        assert!(err.is_retryable());
        assert!(!err.is_technical());
    }
}
