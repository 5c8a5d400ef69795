//! In-memory repository for tests and demos.
//!
//! All state sits behind one mutex, which makes every operation atomic and
//! gives the same linearizable reserve/release semantics as the conditional
//! `UPDATE` in the `PostgreSQL` implementation.

use super::{
    RepositoryError, RepositoryFuture, RepositoryResult, ReserveOutcome, SoldRecount,
    TicketingRepository,
};
use crate::types::{
    ClientId, Event, EventId, Payment, Reservation, ReservationId, ReservationLineItem,
    ReservationStatus, Tier, TierMap,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Repository operations that can be made to fail once, for exercising
/// compensation paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RepositoryOperation {
    /// [`TicketingRepository::create_reservation`]
    CreateReservation,
    /// [`TicketingRepository::create_line_items`]
    CreateLineItems,
    /// [`TicketingRepository::save_reservation`]
    SaveReservation,
    /// [`TicketingRepository::cancel_reservation`]
    CancelReservation,
    /// [`TicketingRepository::create_payment`]
    CreatePayment,
    /// [`TicketingRepository::save_payment`]
    SavePayment,
    /// [`TicketingRepository::reserve_capacity`]
    ReserveCapacity,
}

#[derive(Debug, Default)]
struct Store {
    events: HashMap<EventId, Event>,
    reservations: HashMap<ReservationId, Reservation>,
    reservation_order: Vec<ReservationId>,
    line_items: HashMap<ReservationId, Vec<ReservationLineItem>>,
    payments: Vec<Payment>,
    failures: HashSet<RepositoryOperation>,
}

impl Store {
    fn inject(&mut self, operation: RepositoryOperation) -> RepositoryResult<()> {
        if self.failures.remove(&operation) {
            return Err(RepositoryError::Database(format!(
                "injected failure in {operation:?}"
            )));
        }
        Ok(())
    }

    fn event_mut(&mut self, event_id: EventId) -> RepositoryResult<&mut Event> {
        self.events
            .get_mut(&event_id)
            .ok_or_else(|| RepositoryError::not_found("event", event_id))
    }

    fn assembled(&self, reservation: &Reservation) -> Reservation {
        let mut full = reservation.clone();
        full.line_items = self
            .line_items
            .get(&reservation.id)
            .cloned()
            .unwrap_or_default();
        full
    }

    fn held_by_active(&self, event_id: EventId) -> TierMap<u32> {
        let mut held = TierMap::uniform(0_u32);
        for reservation in self.reservations.values() {
            if reservation.event_id != event_id || !reservation.status.holds_capacity() {
                continue;
            }
            for item in self.line_items.get(&reservation.id).into_iter().flatten() {
                let slot = held.get_mut(item.tier);
                *slot = slot.saturating_add(item.quantity);
            }
        }
        held
    }

    fn create_event(&mut self, event: Event) -> RepositoryResult<()> {
        if self.events.contains_key(&event.id) {
            return Err(RepositoryError::Conflict(format!("event {} exists", event.id)));
        }
        self.events.insert(event.id, event);
        Ok(())
    }

    fn save_event(&mut self, event: Event) -> RepositoryResult<()> {
        let stored = self.event_mut(event.id)?;
        if let Some(tier) = Tier::ALL
            .into_iter()
            .find(|tier| event.capacity.get(*tier) < stored.sold.get(*tier))
        {
            return Err(RepositoryError::Conflict(format!(
                "{tier} capacity {} is below sold {}",
                event.capacity.get(tier),
                stored.sold.get(tier)
            )));
        }
        let sold = stored.sold;
        *stored = Event { sold, ..event };
        Ok(())
    }

    fn reserve(
        &mut self,
        event_id: EventId,
        tier: Tier,
        quantity: u32,
    ) -> RepositoryResult<ReserveOutcome> {
        self.inject(RepositoryOperation::ReserveCapacity)?;
        let event = self.event_mut(event_id)?;
        let available = event.remaining(tier);
        if quantity > available {
            return Ok(ReserveOutcome::Insufficient { available });
        }
        *event.sold.get_mut(tier) += quantity;
        Ok(ReserveOutcome::Reserved {
            remaining: available - quantity,
        })
    }

    fn release(&mut self, event_id: EventId, tier: Tier, quantity: u32) -> RepositoryResult<u32> {
        let sold = self.event_mut(event_id)?.sold.get_mut(tier);
        let released = quantity.min(*sold);
        *sold -= released;
        Ok(released)
    }

    fn create_reservation(&mut self, reservation: Reservation) -> RepositoryResult<()> {
        self.inject(RepositoryOperation::CreateReservation)?;
        if self.reservations.contains_key(&reservation.id) {
            return Err(RepositoryError::Conflict(format!(
                "reservation {} exists",
                reservation.id
            )));
        }
        let header = Reservation {
            line_items: Vec::new(),
            ..reservation
        };
        self.reservation_order.push(header.id);
        self.reservations.insert(header.id, header);
        Ok(())
    }

    fn create_line_items(&mut self, items: Vec<ReservationLineItem>) -> RepositoryResult<()> {
        self.inject(RepositoryOperation::CreateLineItems)?;
        for item in &items {
            if !self.reservations.contains_key(&item.reservation_id) {
                return Err(RepositoryError::not_found("reservation", item.reservation_id));
            }
            let duplicate = self
                .line_items
                .get(&item.reservation_id)
                .is_some_and(|stored| stored.iter().any(|existing| existing.tier == item.tier));
            if duplicate {
                return Err(RepositoryError::Conflict(format!(
                    "line item for {} exists on reservation {}",
                    item.tier, item.reservation_id
                )));
            }
        }
        for item in items {
            let stored = self.line_items.entry(item.reservation_id).or_default();
            stored.push(item);
            stored.sort_by_key(|existing| existing.tier);
        }
        Ok(())
    }

    fn active_reservation_mut(
        &mut self,
        reservation_id: ReservationId,
    ) -> RepositoryResult<&mut Reservation> {
        let stored = self
            .reservations
            .get_mut(&reservation_id)
            .ok_or_else(|| RepositoryError::not_found("reservation", reservation_id))?;
        if stored.status == ReservationStatus::Cancelled {
            return Err(RepositoryError::Conflict(format!(
                "reservation {reservation_id} is cancelled"
            )));
        }
        Ok(stored)
    }

    fn save_reservation(&mut self, reservation: &Reservation) -> RepositoryResult<()> {
        self.inject(RepositoryOperation::SaveReservation)?;
        let stored = self.active_reservation_mut(reservation.id)?;
        stored.status = reservation.status;
        stored.cancelled_at = reservation.cancelled_at;
        Ok(())
    }

    fn cancel_reservation(&mut self, reservation: &Reservation) -> RepositoryResult<()> {
        self.inject(RepositoryOperation::CancelReservation)?;
        let event_id = self.active_reservation_mut(reservation.id)?.event_id;
        let held = self
            .line_items
            .get(&reservation.id)
            .cloned()
            .unwrap_or_default();

        let event = self.event_mut(event_id)?;
        for item in &held {
            let sold = event.sold.get_mut(item.tier);
            *sold = sold.saturating_sub(item.quantity);
        }

        let stored = self.active_reservation_mut(reservation.id)?;
        stored.status = ReservationStatus::Cancelled;
        stored.cancelled_at = reservation.cancelled_at;
        Ok(())
    }

    fn create_payment(&mut self, payment: Payment) -> RepositoryResult<()> {
        self.inject(RepositoryOperation::CreatePayment)?;
        if !self.reservations.contains_key(&payment.reservation_id) {
            return Err(RepositoryError::not_found("reservation", payment.reservation_id));
        }
        self.payments.push(payment);
        Ok(())
    }

    fn save_payment(&mut self, payment: Payment) -> RepositoryResult<()> {
        self.inject(RepositoryOperation::SavePayment)?;
        let stored = self
            .payments
            .iter_mut()
            .find(|stored| stored.id == payment.id)
            .ok_or_else(|| RepositoryError::not_found("payment", payment.id))?;
        *stored = payment;
        Ok(())
    }

    fn recompute_sold(&mut self, event_id: EventId) -> RepositoryResult<SoldRecount> {
        let held = self.held_by_active(event_id);
        let event = self.event_mut(event_id)?;
        let before = event.sold;
        let capacity = event.capacity;
        event.sold = held.map(|tier, held| (*held).min(*capacity.get(tier)));
        Ok(SoldRecount {
            before,
            after: event.sold,
            held,
            capacity,
        })
    }
}

/// Mutex-guarded in-memory [`TicketingRepository`].
///
/// Clones share state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTicketingRepository {
    store: Arc<Mutex<Store>>,
}

fn ready<T: Send + 'static>(result: RepositoryResult<T>) -> RepositoryFuture<'static, T> {
    Box::pin(futures::future::ready(result))
}

impl InMemoryTicketingRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `operation` fail with a database error.
    pub fn fail_next(&self, operation: RepositoryOperation) {
        self.store().failures.insert(operation);
    }

    /// Overwrite the sold counter of one tier, bypassing inventory.
    ///
    /// Lets tests simulate drift for reconciliation.
    pub fn force_sold(&self, event_id: EventId, tier: Tier, sold: u32) {
        if let Some(event) = self.store().events.get_mut(&event_id) {
            *event.sold.get_mut(tier) = sold;
        }
    }

    /// Number of stored payments across all reservations.
    #[must_use]
    pub fn payment_count(&self) -> usize {
        self.store().payments.len()
    }
}

impl TicketingRepository for InMemoryTicketingRepository {
    fn create_event(&self, event: Event) -> RepositoryFuture<'_, ()> {
        ready(self.store().create_event(event))
    }

    fn load_event(&self, event_id: EventId) -> RepositoryFuture<'_, Event> {
        ready(
            self.store()
                .events
                .get(&event_id)
                .cloned()
                .ok_or_else(|| RepositoryError::not_found("event", event_id)),
        )
    }

    fn save_event(&self, event: Event) -> RepositoryFuture<'_, ()> {
        ready(self.store().save_event(event))
    }

    fn list_events(&self) -> RepositoryFuture<'_, Vec<Event>> {
        let mut events: Vec<Event> = self.store().events.values().cloned().collect();
        events.sort_by_key(|event| (event.starts_at, event.id));
        ready(Ok(events))
    }

    fn reserve_capacity(
        &self,
        event_id: EventId,
        tier: Tier,
        quantity: u32,
    ) -> RepositoryFuture<'_, ReserveOutcome> {
        ready(self.store().reserve(event_id, tier, quantity))
    }

    fn release_capacity(
        &self,
        event_id: EventId,
        tier: Tier,
        quantity: u32,
    ) -> RepositoryFuture<'_, u32> {
        ready(self.store().release(event_id, tier, quantity))
    }

    fn create_reservation(&self, reservation: Reservation) -> RepositoryFuture<'_, ()> {
        ready(self.store().create_reservation(reservation))
    }

    fn create_line_items(&self, items: Vec<ReservationLineItem>) -> RepositoryFuture<'_, ()> {
        ready(self.store().create_line_items(items))
    }

    fn save_reservation(&self, reservation: Reservation) -> RepositoryFuture<'_, ()> {
        ready(self.store().save_reservation(&reservation))
    }

    fn load_reservation(&self, reservation_id: ReservationId) -> RepositoryFuture<'_, Reservation> {
        let store = self.store();
        let result = store
            .reservations
            .get(&reservation_id)
            .map(|reservation| store.assembled(reservation))
            .ok_or_else(|| RepositoryError::not_found("reservation", reservation_id));
        ready(result)
    }

    fn load_line_items(
        &self,
        reservation_id: ReservationId,
    ) -> RepositoryFuture<'_, Vec<ReservationLineItem>> {
        ready(Ok(self
            .store()
            .line_items
            .get(&reservation_id)
            .cloned()
            .unwrap_or_default()))
    }

    fn cancel_reservation(&self, reservation: Reservation) -> RepositoryFuture<'_, ()> {
        ready(self.store().cancel_reservation(&reservation))
    }

    fn create_payment(&self, payment: Payment) -> RepositoryFuture<'_, ()> {
        ready(self.store().create_payment(payment))
    }

    fn save_payment(&self, payment: Payment) -> RepositoryFuture<'_, ()> {
        ready(self.store().save_payment(payment))
    }

    fn list_payments(&self, reservation_id: ReservationId) -> RepositoryFuture<'_, Vec<Payment>> {
        ready(Ok(self
            .store()
            .payments
            .iter()
            .filter(|payment| payment.reservation_id == reservation_id)
            .cloned()
            .collect()))
    }

    fn list_reservations_by_client(
        &self,
        client_id: ClientId,
    ) -> RepositoryFuture<'_, Vec<Reservation>> {
        let store = self.store();
        let mut reservations: Vec<Reservation> = store
            .reservation_order
            .iter()
            .rev()
            .filter_map(|id| store.reservations.get(id))
            .filter(|reservation| reservation.client_id == client_id)
            .map(|reservation| store.assembled(reservation))
            .collect();
        reservations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        ready(Ok(reservations))
    }

    fn list_reservations_by_event(
        &self,
        event_id: EventId,
    ) -> RepositoryFuture<'_, Vec<Reservation>> {
        let store = self.store();
        let mut reservations: Vec<Reservation> = store
            .reservation_order
            .iter()
            .filter_map(|id| store.reservations.get(id))
            .filter(|reservation| reservation.event_id == event_id)
            .map(|reservation| store.assembled(reservation))
            .collect();
        reservations.sort_by_key(|reservation| reservation.created_at);
        ready(Ok(reservations))
    }

    fn recompute_sold(&self, event_id: EventId) -> RepositoryFuture<'_, SoldRecount> {
        ready(self.store().recompute_sold(event_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{EventCategory, Money, OrganizerId, ReservationStatus};
    use chrono::Utc;

    fn event(capacity: TierMap<u32>) -> Event {
        Event {
            id: EventId::new(),
            organizer_id: OrganizerId::new(),
            name: "Test".to_string(),
            venue: "Hall".to_string(),
            category: EventCategory::General,
            capacity,
            sold: TierMap::uniform(0),
            prices: TierMap::uniform(Money::from_cents(1000)),
            starts_at: Utc::now(),
            active: true,
            created_at: Utc::now(),
        }
    }

    fn reservation(event_id: EventId, status: ReservationStatus) -> Reservation {
        Reservation {
            id: ReservationId::new(),
            client_id: ClientId::new(),
            event_id,
            created_at: Utc::now(),
            cancelled_at: None,
            status,
            total_amount: Money::from_cents(2000),
            line_items: Vec::new(),
        }
    }

    fn item(reservation_id: ReservationId, tier: Tier, quantity: u32) -> ReservationLineItem {
        ReservationLineItem {
            reservation_id,
            tier,
            quantity,
            unit_price: Money::from_cents(1000),
            subtotal: Money::from_cents(1000 * u64::from(quantity)),
        }
    }

    #[tokio::test]
    async fn reserve_respects_capacity() {
        let repo = InMemoryTicketingRepository::new();
        let event = event(TierMap::new(10, 0, 0));
        let id = event.id;
        repo.create_event(event).await.unwrap();

        let first = repo.reserve_capacity(id, Tier::Standard, 9).await.unwrap();
        assert_eq!(first, ReserveOutcome::Reserved { remaining: 1 });

        let second = repo.reserve_capacity(id, Tier::Standard, 3).await.unwrap();
        assert_eq!(second, ReserveOutcome::Insufficient { available: 1 });

        let stored = repo.load_event(id).await.unwrap();
        assert_eq!(stored.sold.standard, 9);
    }

    #[tokio::test]
    async fn release_floors_at_zero() {
        let repo = InMemoryTicketingRepository::new();
        let event = event(TierMap::new(10, 5, 0));
        let id = event.id;
        repo.create_event(event).await.unwrap();
        repo.reserve_capacity(id, Tier::Vip, 2).await.unwrap();

        assert_eq!(repo.release_capacity(id, Tier::Vip, 5).await.unwrap(), 2);
        assert_eq!(repo.release_capacity(id, Tier::Vip, 1).await.unwrap(), 0);
        assert_eq!(repo.load_event(id).await.unwrap().sold.vip, 0);
    }

    #[tokio::test]
    async fn save_event_keeps_sold_and_guards_capacity() {
        let repo = InMemoryTicketingRepository::new();
        let event = event(TierMap::new(10, 0, 0));
        let id = event.id;
        repo.create_event(event.clone()).await.unwrap();
        repo.reserve_capacity(id, Tier::Standard, 4).await.unwrap();

        let renamed = Event {
            name: "Renamed".to_string(),
            ..event.clone()
        };
        repo.save_event(renamed).await.unwrap();
        let stored = repo.load_event(id).await.unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.sold.standard, 4);

        let shrunk = Event {
            capacity: TierMap::new(3, 0, 0),
            ..event
        };
        let err = repo.save_event(shrunk).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_releases_stored_items_once() {
        let repo = InMemoryTicketingRepository::new();
        let event = event(TierMap::new(10, 5, 0));
        let event_id = event.id;
        repo.create_event(event).await.unwrap();
        repo.reserve_capacity(event_id, Tier::Standard, 2).await.unwrap();
        repo.reserve_capacity(event_id, Tier::Vip, 1).await.unwrap();

        let mut r = reservation(event_id, ReservationStatus::PendingPayment);
        repo.create_reservation(r.clone()).await.unwrap();
        repo.create_line_items(vec![item(r.id, Tier::Vip, 1), item(r.id, Tier::Standard, 2)])
            .await
            .unwrap();

        let loaded = repo.load_reservation(r.id).await.unwrap();
        assert_eq!(loaded.line_items[0].tier, Tier::Standard);

        r.cancel(Utc::now()).unwrap();
        repo.cancel_reservation(r.clone()).await.unwrap();
        let stored = repo.load_event(event_id).await.unwrap();
        assert_eq!(stored.sold, TierMap::uniform(0));

        let err = repo.cancel_reservation(r.clone()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        let err = repo.save_reservation(r).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn recompute_ignores_cancelled_reservations() {
        let repo = InMemoryTicketingRepository::new();
        let event = event(TierMap::new(10, 5, 0));
        let event_id = event.id;
        repo.create_event(event).await.unwrap();

        let active = reservation(event_id, ReservationStatus::Confirmed);
        let cancelled = reservation(event_id, ReservationStatus::Cancelled);
        for r in [&active, &cancelled] {
            repo.create_reservation(r.clone()).await.unwrap();
            repo.create_line_items(vec![item(r.id, Tier::Standard, 3)])
                .await
                .unwrap();
        }
        repo.force_sold(event_id, Tier::Standard, 7);

        let recount = repo.recompute_sold(event_id).await.unwrap();
        assert_eq!(recount.before.standard, 7);
        assert_eq!(recount.after.standard, 3);
        assert!(recount.changed());
        assert!(recount.overcommitted().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let repo = InMemoryTicketingRepository::new();
        let event = event(TierMap::new(10, 0, 0));
        let r = reservation(event.id, ReservationStatus::PendingPayment);
        repo.create_event(event).await.unwrap();

        repo.fail_next(RepositoryOperation::CreateReservation);
        assert!(matches!(
            repo.create_reservation(r.clone()).await,
            Err(RepositoryError::Database(_))
        ));
        repo.create_reservation(r).await.unwrap();
    }
}
