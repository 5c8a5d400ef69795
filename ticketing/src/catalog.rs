//! Event catalog: organizers create and edit events.
//!
//! Edits never touch `sold`. Price changes apply to future reservations
//! only; existing line items keep their snapshot.

use crate::error::{Result, StorageContext, TicketingError};
use crate::inventory::Inventory;
use crate::metrics;
use crate::repository::{RepositoryError, TicketingRepository};
use crate::types::{Event, EventCategory, EventId, Money, OrganizerId, Tier, TierMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ticketing_core::environment::Clock;

/// Data for a new event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Display name
    pub name: String,
    /// Venue name
    pub venue: String,
    /// Category and its attributes
    pub category: EventCategory,
    /// Capacity per tier
    pub capacity: TierMap<u32>,
    /// Unit price per tier
    pub prices: TierMap<Money>,
    /// Scheduled start
    pub starts_at: DateTime<Utc>,
}

/// Partial edit of an event. `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventUpdate {
    /// New name
    pub name: Option<String>,
    /// New venue
    pub venue: Option<String>,
    /// New category
    pub category: Option<EventCategory>,
    /// New capacity; may not drop below sold
    pub capacity: Option<TierMap<u32>>,
    /// New prices for future reservations
    pub prices: Option<TierMap<Money>>,
    /// New start
    pub starts_at: Option<DateTime<Utc>>,
    /// Open or close the event for bookings
    pub active: Option<bool>,
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TicketingError::Validation(format!("{field} is required")));
    }
    Ok(())
}

/// Organizer-facing event management.
#[derive(Clone)]
pub struct EventCatalog {
    repository: Arc<dyn TicketingRepository>,
    inventory: Inventory,
    clock: Arc<dyn Clock>,
}

impl EventCatalog {
    /// Creates a new catalog.
    #[must_use]
    pub fn new(repository: Arc<dyn TicketingRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inventory: Inventory::new(Arc::clone(&repository)),
            repository,
            clock,
        }
    }

    /// Create an active event with nothing sold.
    ///
    /// # Errors
    ///
    /// [`TicketingError::Validation`] for a blank name or venue, or a start
    /// that is not in the future.
    #[tracing::instrument(skip_all, fields(%organizer_id, name = %new_event.name))]
    pub async fn create_event(
        &self,
        organizer_id: OrganizerId,
        new_event: NewEvent,
    ) -> Result<Event> {
        require_text("name", &new_event.name)?;
        require_text("venue", &new_event.venue)?;
        let now = self.clock.now();
        if new_event.starts_at <= now {
            return Err(TicketingError::Validation(
                "event must start in the future".to_string(),
            ));
        }

        let event = Event {
            id: EventId::new(),
            organizer_id,
            name: new_event.name,
            venue: new_event.venue,
            category: new_event.category,
            capacity: new_event.capacity,
            sold: TierMap::uniform(0),
            prices: new_event.prices,
            starts_at: new_event.starts_at,
            active: true,
            created_at: now,
        };
        self.repository
            .create_event(event.clone())
            .await
            .context("create event")?;

        metrics::record_event_created();
        tracing::info!(event_id = %event.id, category = event.category.tag(), "Event created");
        Ok(event)
    }

    /// Apply `update` on behalf of the event's organizer.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::NotFound`] for an unknown event
    /// - [`TicketingError::Unauthorized`] for anyone but the organizer
    /// - [`TicketingError::Validation`] for blank text or capacity below sold
    #[tracing::instrument(skip_all, fields(%organizer_id, %event_id))]
    pub async fn update_event(
        &self,
        organizer_id: OrganizerId,
        event_id: EventId,
        update: EventUpdate,
    ) -> Result<Event> {
        let mut event = self
            .repository
            .load_event(event_id)
            .await
            .context("load event")?;
        if event.organizer_id != organizer_id {
            tracing::warn!("Event update refused: requester is not the organizer");
            return Err(TicketingError::Unauthorized {
                resource: format!("event {event_id}"),
            });
        }

        if let Some(name) = update.name {
            require_text("name", &name)?;
            event.name = name;
        }
        if let Some(venue) = update.venue {
            require_text("venue", &venue)?;
            event.venue = venue;
        }
        if let Some(category) = update.category {
            event.category = category;
        }
        if let Some(capacity) = update.capacity {
            if let Some(tier) = Tier::ALL
                .into_iter()
                .find(|tier| capacity.get(*tier) < event.sold.get(*tier))
            {
                return Err(TicketingError::Validation(format!(
                    "{tier} capacity {} is below {} already sold",
                    capacity.get(tier),
                    event.sold.get(tier)
                )));
            }
            event.capacity = capacity;
        }
        if let Some(prices) = update.prices {
            event.prices = prices;
        }
        if let Some(starts_at) = update.starts_at {
            event.starts_at = starts_at;
        }
        if let Some(active) = update.active {
            event.active = active;
        }

        match self.repository.save_event(event).await {
            // Sold moved between our load and the save.
            Err(RepositoryError::Conflict(message)) => {
                return Err(TicketingError::Validation(message));
            }
            other => other.context("save event")?,
        }

        let saved = self
            .repository
            .load_event(event_id)
            .await
            .context("load event")?;
        tracing::info!("Event updated");
        Ok(saved)
    }

    /// One event.
    ///
    /// # Errors
    ///
    /// [`TicketingError::NotFound`] for an unknown event.
    pub async fn event(&self, event_id: EventId) -> Result<Event> {
        self.repository
            .load_event(event_id)
            .await
            .context("load event")
    }

    /// Every event.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn list_events(&self) -> Result<Vec<Event>> {
        self.repository.list_events().await.context("list events")
    }

    /// Remaining capacity per tier.
    ///
    /// # Errors
    ///
    /// [`TicketingError::NotFound`] for an unknown event.
    pub async fn availability(&self, event_id: EventId) -> Result<TierMap<u32>> {
        self.inventory.remaining_by_tier(event_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ticketing_testing::FixedClock;

    fn catalog() -> EventCatalog {
        EventCatalog::new(
            Arc::new(crate::repository::InMemoryTicketingRepository::new()),
            Arc::new(FixedClock::new(ticketing_testing::test_clock().now())),
        )
    }

    fn concert(starts_at: DateTime<Utc>) -> NewEvent {
        NewEvent {
            name: "Night Shift".to_string(),
            venue: "Paradiso".to_string(),
            category: EventCategory::Concert {
                performer: "The Clocks".to_string(),
                genre: Some("jazz".to_string()),
            },
            capacity: TierMap::new(100, 20, 5),
            prices: TierMap::new(
                Money::from_cents(3000),
                Money::from_cents(7500),
                Money::from_cents(15000),
            ),
            starts_at,
        }
    }

    #[tokio::test]
    async fn create_then_edit_by_organizer() {
        let catalog = catalog();
        let organizer = OrganizerId::new();
        let starts_at = ticketing_testing::test_clock().now() + Duration::days(30);
        let event = catalog.create_event(organizer, concert(starts_at)).await.unwrap();
        assert!(event.active);
        assert_eq!(event.sold, TierMap::uniform(0));
        assert_eq!(catalog.availability(event.id).await.unwrap(), TierMap::new(100, 20, 5));

        let updated = catalog
            .update_event(
                organizer,
                event.id,
                EventUpdate {
                    venue: Some("Melkweg".to_string()),
                    active: Some(false),
                    ..EventUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.venue, "Melkweg");
        assert!(!updated.active);
        assert_eq!(updated.name, "Night Shift");
    }

    #[tokio::test]
    async fn only_organizer_may_edit() {
        let catalog = catalog();
        let starts_at = ticketing_testing::test_clock().now() + Duration::days(30);
        let event = catalog
            .create_event(OrganizerId::new(), concert(starts_at))
            .await
            .unwrap();

        let err = catalog
            .update_event(OrganizerId::new(), event.id, EventUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TicketingError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn capacity_cannot_drop_below_sold() {
        let catalog = catalog();
        let organizer = OrganizerId::new();
        let starts_at = ticketing_testing::test_clock().now() + Duration::days(30);
        let event = catalog.create_event(organizer, concert(starts_at)).await.unwrap();
        catalog.inventory.reserve(event.id, Tier::Vip, 8).await.unwrap();

        let err = catalog
            .update_event(
                organizer,
                event.id,
                EventUpdate {
                    capacity: Some(TierMap::new(100, 7, 5)),
                    ..EventUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TicketingError::Validation(_)));

        let shrunk = catalog
            .update_event(
                organizer,
                event.id,
                EventUpdate {
                    capacity: Some(TierMap::new(50, 8, 5)),
                    ..EventUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(shrunk.sold.vip, 8);
        assert_eq!(shrunk.remaining(Tier::Vip), 0);
    }

    #[tokio::test]
    async fn rejects_past_start_and_blank_name() {
        let catalog = catalog();
        let past = ticketing_testing::test_clock().now() - Duration::hours(1);
        let err = catalog
            .create_event(OrganizerId::new(), concert(past))
            .await
            .unwrap_err();
        assert!(matches!(err, TicketingError::Validation(_)));

        let mut blank = concert(past + Duration::days(2));
        blank.name = " ".to_string();
        assert!(catalog.create_event(OrganizerId::new(), blank).await.is_err());
    }
}
