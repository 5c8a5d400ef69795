//! Domain types for the ticketing system.
//!
//! Value objects (identifiers, [`Money`], [`Tier`], [`TierMap`]) and the four
//! persisted entities: [`Event`], [`Reservation`], [`ReservationLineItem`] and
//! [`Payment`]. Status enums own their transition tables so that no caller can
//! set a status arbitrarily.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an event
    EventId
);
uuid_id!(
    /// Unique identifier for a reservation
    ReservationId
);
uuid_id!(
    /// Unique identifier for a payment
    PaymentId
);
uuid_id!(
    /// Identifier of the client who owns a reservation
    ClientId
);
uuid_id!(
    /// Identifier of the organizer who owns an event
    OrganizerId
);

// ============================================================================
// Money Value Object (cents-based to avoid floating point errors)
// ============================================================================

/// Represents money in cents to avoid floating-point arithmetic errors
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` value from whole currency units, `None` on overflow
    #[must_use]
    pub const fn checked_from_units(units: u64) -> Option<Self> {
        match units.checked_mul(100) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Multiplies money by a quantity with overflow checking
    #[must_use]
    pub const fn checked_multiply(self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as u64) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Tiers
// ============================================================================

/// Ticket category with its own capacity and price.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Standard admission
    Standard,
    /// VIP admission
    Vip,
    /// Premium admission
    Premium,
}

impl Tier {
    /// Every tier, in line-item order.
    pub const ALL: [Self; 3] = [Self::Standard, Self::Vip, Self::Premium];

    /// Stable lowercase name, used as the storage key.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Vip => "vip",
            Self::Premium => "premium",
        }
    }

    /// Parse the storage key produced by [`Tier::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::Standard),
            "vip" => Some(Self::Vip),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierMap<T> {
    /// Value for [`Tier::Standard`]
    pub standard: T,
    /// Value for [`Tier::Vip`]
    pub vip: T,
    /// Value for [`Tier::Premium`]
    pub premium: T,
}

impl<T> TierMap<T> {
    /// Build a map from explicit per-tier values.
    #[must_use]
    pub const fn new(standard: T, vip: T, premium: T) -> Self {
        Self {
            standard,
            vip,
            premium,
        }
    }

    /// Borrow the value for `tier`.
    #[must_use]
    pub const fn get(&self, tier: Tier) -> &T {
        match tier {
            Tier::Standard => &self.standard,
            Tier::Vip => &self.vip,
            Tier::Premium => &self.premium,
        }
    }

    /// Mutably borrow the value for `tier`.
    pub const fn get_mut(&mut self, tier: Tier) -> &mut T {
        match tier {
            Tier::Standard => &mut self.standard,
            Tier::Vip => &mut self.vip,
            Tier::Premium => &mut self.premium,
        }
    }

    /// Iterate in tier order.
    pub fn iter(&self) -> impl Iterator<Item = (Tier, &T)> {
        Tier::ALL.into_iter().map(move |tier| (tier, self.get(tier)))
    }

    /// Apply `f` to every tier.
    #[must_use]
    pub fn map<U>(&self, mut f: impl FnMut(Tier, &T) -> U) -> TierMap<U> {
        TierMap {
            standard: f(Tier::Standard, &self.standard),
            vip: f(Tier::Vip, &self.vip),
            premium: f(Tier::Premium, &self.premium),
        }
    }
}

impl<T: Copy> TierMap<T> {
    /// Same value for every tier.
    #[must_use]
    pub const fn uniform(value: T) -> Self {
        Self::new(value, value, value)
    }
}

/// Requested quantity per tier.
pub type TierQuantities = TierMap<u32>;

impl TierQuantities {
    /// Sum over all tiers (widened so it cannot overflow).
    #[must_use]
    pub fn total(&self) -> u64 {
        self.iter().map(|(_, q)| u64::from(*q)).sum()
    }

    /// Tiers with a non-zero quantity, in tier order.
    pub fn requested(&self) -> impl Iterator<Item = (Tier, u32)> + '_ {
        self.iter().filter(|(_, q)| **q > 0).map(|(t, q)| (t, *q))
    }
}

// ============================================================================
// Events
// ============================================================================

/// Category of an event, with the attributes that only make sense for it.
///
/// Pricing and capacity never depend on the category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum EventCategory {
    /// Live music
    Concert {
        /// Headlining performer
        performer: String,
        /// Optional genre
        genre: Option<String>,
    },
    /// Sports fixture
    Sports {
        /// Home team
        home_team: String,
        /// Away team
        away_team: String,
    },
    /// Talks and workshops
    Conference {
        /// Main topic
        topic: String,
        /// Announced speakers
        speakers: Vec<String>,
    },
    /// Stage production
    Theatre {
        /// Production title
        production: String,
    },
    /// Anything else
    General,
}

impl EventCategory {
    /// Category tag without attributes.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Concert { .. } => "concert",
            Self::Sports { .. } => "sports",
            Self::Conference { .. } => "conference",
            Self::Theatre { .. } => "theatre",
            Self::General => "general",
        }
    }
}

/// A scheduled event with tiered capacity.
///
/// `sold` is only ever changed through inventory operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: EventId,
    /// Organizer who created the event
    pub organizer_id: OrganizerId,
    /// Display name
    pub name: String,
    /// Venue name
    pub venue: String,
    /// Category and category-specific attributes
    pub category: EventCategory,
    /// Maximum sellable quantity per tier
    pub capacity: TierMap<u32>,
    /// Quantity currently committed per tier
    pub sold: TierMap<u32>,
    /// Current unit price per tier
    pub prices: TierMap<Money>,
    /// Scheduled start
    pub starts_at: DateTime<Utc>,
    /// Inactive events accept no bookings
    pub active: bool,
    /// When the event was created
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Remaining capacity for `tier`.
    #[must_use]
    pub fn remaining(&self, tier: Tier) -> u32 {
        self.capacity.get(tier).saturating_sub(*self.sold.get(tier))
    }

    /// Remaining capacity for every tier.
    #[must_use]
    pub fn remaining_by_tier(&self) -> TierMap<u32> {
        self.capacity.map(|tier, _| self.remaining(tier))
    }

    /// `0 <= sold <= capacity` for every tier.
    #[must_use]
    pub fn counters_consistent(&self) -> bool {
        Tier::ALL
            .into_iter()
            .all(|tier| self.sold.get(tier) <= self.capacity.get(tier))
    }
}

// ============================================================================
// Status transitions
// ============================================================================

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity} cannot move from {from} to {to}")]
pub struct TransitionError {
    /// Entity kind ("reservation" or "payment")
    pub entity: &'static str,
    /// Current status
    pub from: &'static str,
    /// Requested status
    pub to: &'static str,
}

/// Reservation status.
///
/// `PendingPayment <-> Confirmed`, and either of them `-> Cancelled`, which is
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Capacity held, waiting for a successful payment
    PendingPayment,
    /// Paid
    Confirmed,
    /// Cancelled; capacity released
    Cancelled,
}

impl ReservationStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPayment => "PENDING_PAYMENT",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_PAYMENT" => Some(Self::PendingPayment),
            "CONFIRMED" => Some(Self::Confirmed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether the state machine allows `self -> next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::PendingPayment, Self::Confirmed | Self::Cancelled)
                | (Self::Confirmed, Self::PendingPayment | Self::Cancelled)
        )
    }

    /// Reservations that still hold capacity.
    #[must_use]
    pub const fn holds_capacity(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Reservations
// ============================================================================

/// Purchase record for one tier of a reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLineItem {
    /// Owning reservation
    pub reservation_id: ReservationId,
    /// Tier purchased
    pub tier: Tier,
    /// Quantity, always > 0
    pub quantity: u32,
    /// Unit price at the time of reservation
    pub unit_price: Money,
    /// `quantity * unit_price`
    pub subtotal: Money,
}

/// A client's hold on tiered capacity for one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique reservation identifier
    pub id: ReservationId,
    /// Owning client
    pub client_id: ClientId,
    /// Event reserved
    pub event_id: EventId,
    /// When the reservation was created
    pub created_at: DateTime<Utc>,
    /// When the reservation was cancelled
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Current status
    pub status: ReservationStatus,
    /// Sum of line item subtotals
    pub total_amount: Money,
    /// One line item per purchased tier, in tier order
    pub line_items: Vec<ReservationLineItem>,
}

impl Reservation {
    fn transition(&mut self, next: ReservationStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: "reservation",
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// `PendingPayment -> Confirmed`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] from any other status.
    pub fn confirm(&mut self) -> Result<(), TransitionError> {
        self.transition(ReservationStatus::Confirmed)
    }

    /// Move to `Cancelled` and stamp the cancellation time.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if already cancelled.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ReservationStatus::Cancelled)?;
        self.cancelled_at = Some(at);
        Ok(())
    }

    /// Quantity held for `tier` (0 when there is no line item).
    #[must_use]
    pub fn quantity_for(&self, tier: Tier) -> u32 {
        self.line_items
            .iter()
            .filter(|item| item.tier == tier)
            .map(|item| item.quantity)
            .sum()
    }

    /// Quantities held, per tier.
    #[must_use]
    pub fn quantities(&self) -> TierQuantities {
        TierMap::new(
            self.quantity_for(Tier::Standard),
            self.quantity_for(Tier::Vip),
            self.quantity_for(Tier::Premium),
        )
    }

    /// `total_amount == Σ quantity × unit_price` over the line items.
    #[must_use]
    pub fn total_matches_line_items(&self) -> bool {
        self.line_items
            .iter()
            .try_fold(Money::ZERO, |acc, item| {
                item.unit_price
                    .checked_multiply(item.quantity)
                    .and_then(|subtotal| acc.checked_add(subtotal))
            })
            .is_some_and(|sum| sum == self.total_amount)
    }
}

// ============================================================================
// Payments
// ============================================================================

/// Payment status. `Pending` moves exactly once to a terminal status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Created, gateway not answered yet
    Pending,
    /// Charged
    Succeeded,
    /// Declined or errored
    Failed,
}

impl PaymentStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a payment was made, without sensitive card data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentMethodSummary {
    /// Card payment
    Card {
        /// Last four digits of the card number
        last_four: String,
    },
    /// Pre-tokenized payment from the gateway's own client
    GatewayToken,
}

impl fmt::Display for PaymentMethodSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Card { last_four } => write!(f, "card ****{last_four}"),
            Self::GatewayToken => f.write_str("gateway token"),
        }
    }
}

/// A charge attempt against a reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Unique payment identifier
    pub id: PaymentId,
    /// Reservation being paid
    pub reservation_id: ReservationId,
    /// Amount charged (the reservation total)
    pub amount: Money,
    /// When the attempt started
    pub created_at: DateTime<Utc>,
    /// Current status
    pub status: PaymentStatus,
    /// Payment method used
    pub method: PaymentMethodSummary,
    /// Gateway reference on success, synthetic reference on failure
    pub transaction_reference: Option<String>,
    /// Gateway or transport message for failed attempts
    pub failure_reason: Option<String>,
}

impl Payment {
    /// Creates a new `Pending` payment
    #[must_use]
    pub fn pending(
        reservation_id: ReservationId,
        amount: Money,
        method: PaymentMethodSummary,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            reservation_id,
            amount,
            created_at,
            status: PaymentStatus::Pending,
            method,
            transaction_reference: None,
            failure_reason: None,
        }
    }

    fn ensure_pending(&self, to: PaymentStatus) -> Result<(), TransitionError> {
        if self.status == PaymentStatus::Pending {
            Ok(())
        } else {
            Err(TransitionError {
                entity: "payment",
                from: self.status.as_str(),
                to: to.as_str(),
            })
        }
    }

    /// `Pending -> Succeeded` with the gateway's reference.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the payment is already terminal.
    pub fn succeed(&mut self, transaction_reference: String) -> Result<(), TransitionError> {
        self.ensure_pending(PaymentStatus::Succeeded)?;
        self.status = PaymentStatus::Succeeded;
        self.transaction_reference = Some(transaction_reference);
        Ok(())
    }

    /// `Pending -> Failed` with a synthetic `FAILED-<payment id>` reference.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the payment is already terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_pending(PaymentStatus::Failed)?;
        self.status = PaymentStatus::Failed;
        self.transaction_reference = Some(format!("FAILED-{}", self.id));
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}
