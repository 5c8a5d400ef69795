//! Event inventory: remaining capacity and atomic reserve/release per tier.
//!
//! Every mutation goes through the repository's conditional primitives, so
//! `0 <= sold <= capacity` holds under any interleaving of concurrent
//! requests.

use crate::error::{Result, StorageContext, TicketingError};
use crate::metrics;
use crate::repository::{RepositoryError, ReserveOutcome, TicketingRepository};
use crate::types::{EventId, Reservation, Tier, TierMap, TierQuantities};
use std::sync::Arc;

/// Capacity operations over a [`TicketingRepository`].
#[derive(Clone)]
pub struct Inventory {
    repository: Arc<dyn TicketingRepository>,
}

impl Inventory {
    /// Creates a new inventory over `repository`
    #[must_use]
    pub fn new(repository: Arc<dyn TicketingRepository>) -> Self {
        Self { repository }
    }

    /// Remaining capacity for one tier.
    ///
    /// # Errors
    ///
    /// [`TicketingError::NotFound`] for an unknown event.
    pub async fn remaining(&self, event_id: EventId, tier: Tier) -> Result<u32> {
        let event = self
            .repository
            .load_event(event_id)
            .await
            .context("load event")?;
        Ok(event.remaining(tier))
    }

    /// Remaining capacity for every tier.
    ///
    /// # Errors
    ///
    /// [`TicketingError::NotFound`] for an unknown event.
    pub async fn remaining_by_tier(&self, event_id: EventId) -> Result<TierMap<u32>> {
        let event = self
            .repository
            .load_event(event_id)
            .await
            .context("load event")?;
        Ok(event.remaining_by_tier())
    }

    /// Commit `quantity` tickets of one tier, or change nothing.
    ///
    /// # Errors
    ///
    /// [`TicketingError::InsufficientCapacity`] if the tier cannot fit the
    /// quantity, [`TicketingError::NotFound`] for an unknown event.
    pub async fn reserve(&self, event_id: EventId, tier: Tier, quantity: u32) -> Result<()> {
        if quantity == 0 {
            return Ok(());
        }
        let outcome = self
            .repository
            .reserve_capacity(event_id, tier, quantity)
            .await
            .context("reserve capacity")?;

        match outcome {
            ReserveOutcome::Reserved { remaining } => {
                tracing::debug!(%event_id, %tier, quantity, remaining, "Capacity reserved");
                Ok(())
            }
            ReserveOutcome::Insufficient { available } => {
                tracing::info!(
                    %event_id,
                    %tier,
                    requested = quantity,
                    available,
                    "Insufficient capacity"
                );
                metrics::record_capacity_rejection(tier);
                Err(TicketingError::InsufficientCapacity {
                    tier,
                    requested: quantity,
                    available,
                })
            }
        }
    }

    /// Return `quantity` tickets of one tier, flooring the counter at zero.
    ///
    /// # Errors
    ///
    /// [`TicketingError::NotFound`] for an unknown event.
    pub async fn release(&self, event_id: EventId, tier: Tier, quantity: u32) -> Result<()> {
        if quantity == 0 {
            return Ok(());
        }
        let released = self
            .repository
            .release_capacity(event_id, tier, quantity)
            .await
            .context("release capacity")?;

        if released < quantity {
            tracing::warn!(
                %event_id,
                %tier,
                requested = quantity,
                released,
                "Release exceeded sold counter; floored at zero"
            );
        }
        Ok(())
    }

    /// Reserve every requested tier, all or nothing.
    ///
    /// Tiers are reserved in order; on the first failure the tiers already
    /// reserved are released again before the error is returned.
    ///
    /// # Errors
    ///
    /// The first [`TicketingError::InsufficientCapacity`] (or storage error)
    /// encountered.
    pub async fn reserve_all(&self, event_id: EventId, quantities: &TierQuantities) -> Result<()> {
        let mut reserved: Vec<(Tier, u32)> = Vec::with_capacity(Tier::ALL.len());

        for (tier, quantity) in quantities.requested() {
            if let Err(err) = self.reserve(event_id, tier, quantity).await {
                for (done_tier, done_quantity) in reserved {
                    if let Err(release_err) = self.release(event_id, done_tier, done_quantity).await {
                        tracing::error!(
                            %event_id,
                            tier = %done_tier,
                            quantity = done_quantity,
                            error = %release_err,
                            "Failed to roll back partial reservation"
                        );
                    }
                }
                return Err(err);
            }
            reserved.push((tier, quantity));
        }
        Ok(())
    }

    /// Release every tier in `quantities`. Failures are logged and the
    /// remaining tiers are still released; the first error is returned.
    ///
    /// # Errors
    ///
    /// The first storage error encountered.
    pub async fn release_all(&self, event_id: EventId, quantities: &TierQuantities) -> Result<()> {
        let mut first_error = None;
        for (tier, quantity) in quantities.requested() {
            if let Err(err) = self.release(event_id, tier, quantity).await {
                tracing::error!(%event_id, %tier, quantity, error = %err, "Failed to release capacity");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Persist a cancelled reservation and return its capacity in one atomic
    /// step.
    ///
    /// # Errors
    ///
    /// [`TicketingError::AlreadyCancelled`] if the stored reservation was
    /// cancelled concurrently, storage errors otherwise.
    pub async fn release_for_cancellation(&self, reservation: Reservation) -> Result<()> {
        let reservation_id = reservation.id;
        match self.repository.cancel_reservation(reservation).await {
            Err(RepositoryError::Conflict(_)) => {
                Err(TicketingError::AlreadyCancelled(reservation_id))
            }
            other => other.context("cancel reservation"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::repository::InMemoryTicketingRepository;
    use crate::types::{Event, EventCategory, Money, OrganizerId};
    use chrono::Utc;
    use proptest::prelude::*;

    async fn setup(capacity: TierMap<u32>) -> (Inventory, EventId) {
        let repo = Arc::new(InMemoryTicketingRepository::new());
        let event = Event {
            id: EventId::new(),
            organizer_id: OrganizerId::new(),
            name: "Inventory".to_string(),
            venue: "Hall".to_string(),
            category: EventCategory::General,
            capacity,
            sold: TierMap::uniform(0),
            prices: TierMap::uniform(Money::from_cents(1000)),
            starts_at: Utc::now(),
            active: true,
            created_at: Utc::now(),
        };
        let id = event.id;
        repo.create_event(event).await.unwrap();
        (Inventory::new(repo), id)
    }

    #[tokio::test]
    async fn reserve_then_release_restores_remaining() {
        let (inventory, id) = setup(TierMap::new(10, 5, 2)).await;

        inventory.reserve(id, Tier::Vip, 3).await.unwrap();
        assert_eq!(inventory.remaining(id, Tier::Vip).await.unwrap(), 2);

        inventory.release(id, Tier::Vip, 3).await.unwrap();
        assert_eq!(inventory.remaining(id, Tier::Vip).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn zero_quantity_is_a_no_op() {
        let (inventory, id) = setup(TierMap::new(0, 0, 0)).await;
        inventory.reserve(id, Tier::Premium, 0).await.unwrap();
        inventory.release(id, Tier::Premium, 0).await.unwrap();
    }

    #[tokio::test]
    async fn release_past_zero_floors() {
        let (inventory, id) = setup(TierMap::new(10, 5, 2)).await;
        inventory.reserve(id, Tier::Standard, 1).await.unwrap();
        inventory.release(id, Tier::Standard, 4).await.unwrap();
        assert_eq!(inventory.remaining(id, Tier::Standard).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn reserve_all_rolls_back_on_shortfall() {
        let (inventory, id) = setup(TierMap::new(10, 1, 0)).await;

        let err = inventory
            .reserve_all(id, &TierQuantities::new(4, 2, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TicketingError::InsufficientCapacity {
                tier: Tier::Vip,
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(
            inventory.remaining_by_tier(id).await.unwrap(),
            TierMap::new(10, 1, 0)
        );
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let (inventory, _) = setup(TierMap::new(1, 1, 1)).await;
        let err = inventory
            .reserve(EventId::new(), Tier::Standard, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketingError::NotFound { entity: "event", .. }));
    }

    proptest! {
        #[test]
        fn counters_follow_a_floored_model(
            ops in proptest::collection::vec((any::<bool>(), 0usize..3, 0u32..6), 1..40)
        ) {
            let capacity = TierMap::new(5_u32, 3, 1);
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let (inventory, id) = setup(capacity).await;
                let mut sold = TierMap::uniform(0_u32);

                for (reserve, index, quantity) in ops {
                    let tier = Tier::ALL[index];
                    let slot = sold.get_mut(tier);
                    if reserve {
                        let fits = *slot + quantity <= *capacity.get(tier);
                        let result = inventory.reserve(id, tier, quantity).await;
                        assert_eq!(result.is_ok(), fits);
                        if fits {
                            *slot += quantity;
                        }
                    } else {
                        inventory.release(id, tier, quantity).await.unwrap();
                        *slot = slot.saturating_sub(quantity);
                    }
                }

                let expected = capacity.map(|tier, cap| cap - sold.get(tier));
                assert_eq!(inventory.remaining_by_tier(id).await.unwrap(), expected);
            });
        }
    }
}
