//! Reservation lifecycle tests.
//!
//! Create, pay, cancel and query reservations through `TicketingService`
//! against the in-memory repository, with a movable clock for the booking
//! and cancellation cutoffs.
//!
//! Run with: `cargo test --test reservation_lifecycle_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use chrono::Duration;
use std::sync::Arc;
use ticketing::{
    ClientId, Config, Event, EventCategory, EventUpdate, InMemoryTicketingRepository, Money,
    NewEvent, OrganizerId, PayerDetails, PaymentMethod, ReservationRequest, ReservationStatus,
    ScriptedPaymentGateway, Tier, TicketingError, TicketingService, TierMap, TierQuantities,
};
use ticketing_core::environment::Clock;
use ticketing_testing::{MockClock, init_test_tracing, test_clock};

struct Harness {
    service: TicketingService,
    clock: MockClock,
    organizer: OrganizerId,
}

fn harness() -> Harness {
    init_test_tracing();
    let clock = MockClock::new(test_clock().now());
    let mut config = Config::default();
    config.payment.retry_max = 0;
    let service = TicketingService::new(
        Arc::new(InMemoryTicketingRepository::new()),
        Arc::new(ScriptedPaymentGateway::new()),
        Arc::new(clock.clone()),
        &config,
    );
    Harness {
        service,
        clock,
        organizer: OrganizerId::new(),
    }
}

impl Harness {
    async fn event(&self, capacity: TierMap<u32>, starts_in: Duration) -> Event {
        self.service
            .catalog()
            .create_event(
                self.organizer,
                NewEvent {
                    name: "Symphony No. 9".to_string(),
                    venue: "Concertgebouw".to_string(),
                    category: EventCategory::Concert {
                        performer: "Residentie Orkest".to_string(),
                        genre: Some("classical".to_string()),
                    },
                    capacity,
                    prices: TierMap::new(
                        Money::from_cents(1000),
                        Money::from_cents(2500),
                        Money::from_cents(9900),
                    ),
                    starts_at: self.clock.now() + starts_in,
                },
            )
            .await
            .expect("event created")
    }

    async fn remaining(&self, event: &Event) -> TierMap<u32> {
        self.service.catalog().availability(event.id).await.unwrap()
    }

    async fn pay(&self, reservation_id: ticketing::ReservationId) {
        self.service
            .process_payment(
                reservation_id,
                PayerDetails {
                    name: "Ada Lovelace".to_string(),
                    email: None,
                },
                PaymentMethod::GatewayToken {
                    token: "tok_visa".to_string(),
                },
            )
            .await
            .expect("payment succeeds");
    }
}

fn request(client_id: ClientId, event: &Event, quantities: TierQuantities) -> ReservationRequest {
    ReservationRequest {
        client_id,
        event_id: event.id,
        quantities,
        pay_immediately: false,
    }
}

#[tokio::test]
async fn totals_line_items_and_cancel_restores_capacity() {
    let h = harness();
    let event = h.event(TierMap::new(10, 5, 2), Duration::days(7)).await;
    let client = ClientId::new();

    let reservation = h
        .service
        .create_reservation(request(client, &event, TierQuantities::new(2, 1, 0)))
        .await
        .unwrap();

    assert_eq!(reservation.status, ReservationStatus::PendingPayment);
    assert_eq!(reservation.total_amount, Money::from_cents(4500));
    assert_eq!(reservation.total_amount.to_string(), "45.00");
    assert_eq!(reservation.line_items.len(), 2);
    assert_eq!(reservation.line_items[0].tier, Tier::Standard);
    assert_eq!(reservation.line_items[0].subtotal, Money::from_cents(2000));
    assert_eq!(reservation.line_items[1].tier, Tier::Vip);
    assert_eq!(reservation.line_items[1].unit_price, Money::from_cents(2500));
    assert!(reservation.total_matches_line_items());
    assert_eq!(h.remaining(&event).await, TierMap::new(8, 4, 2));

    let cancelled = h
        .service
        .cancel_reservation(reservation.id, client)
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.cancelled_at, Some(h.clock.now()));
    assert_eq!(h.remaining(&event).await, TierMap::new(10, 5, 2));
}

#[tokio::test]
async fn booking_closes_exactly_at_cutoff() {
    let h = harness();
    let event = h.event(TierMap::new(10, 0, 0), Duration::hours(2)).await;
    let client = ClientId::new();

    h.clock.set(event.starts_at - Duration::minutes(30));
    let err = h
        .service
        .create_reservation(request(client, &event, TierQuantities::new(1, 0, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, TicketingError::BookingWindowClosed { .. }));
    assert_eq!(h.remaining(&event).await.standard, 10);

    h.clock
        .set(event.starts_at - Duration::minutes(30) - Duration::seconds(1));
    h.service
        .create_reservation(request(client, &event, TierQuantities::new(1, 0, 0)))
        .await
        .unwrap();
    assert_eq!(h.remaining(&event).await.standard, 9);
}

#[tokio::test]
async fn cancellation_deadline_is_inclusive() {
    let h = harness();
    let event = h.event(TierMap::new(10, 0, 0), Duration::days(3)).await;
    let client = ClientId::new();
    let on_time = h
        .service
        .create_reservation(request(client, &event, TierQuantities::new(2, 0, 0)))
        .await
        .unwrap();
    let too_late = h
        .service
        .create_reservation(request(client, &event, TierQuantities::new(3, 0, 0)))
        .await
        .unwrap();

    h.clock.set(event.starts_at - Duration::hours(24));
    h.service.cancel_reservation(on_time.id, client).await.unwrap();

    h.clock.advance(Duration::seconds(1));
    let err = h
        .service
        .cancel_reservation(too_late.id, client)
        .await
        .unwrap_err();
    match err {
        TicketingError::LateCancellation {
            starts_at,
            deadline,
        } => {
            assert_eq!(starts_at, event.starts_at);
            assert_eq!(deadline, event.starts_at - Duration::hours(24));
        }
        other => panic!("expected late cancellation, got {other:?}"),
    }

    let details = h
        .service
        .reservation_details(too_late.id, client)
        .await
        .unwrap();
    assert_eq!(details.reservation.status, ReservationStatus::PendingPayment);
    assert_eq!(h.remaining(&event).await.standard, 7);
}

#[tokio::test]
async fn confirmed_reservation_cancels_only_inside_window() {
    let h = harness();
    let event = h.event(TierMap::new(10, 5, 0), Duration::days(5)).await;
    let client = ClientId::new();

    let early = h
        .service
        .create_reservation(request(client, &event, TierQuantities::new(1, 1, 0)))
        .await
        .unwrap();
    let late = h
        .service
        .create_reservation(request(client, &event, TierQuantities::new(2, 0, 0)))
        .await
        .unwrap();
    h.pay(early.id).await;
    h.pay(late.id).await;

    let cancelled = h.service.cancel_reservation(early.id, client).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(h.remaining(&event).await, TierMap::new(8, 5, 0));

    h.clock.set(event.starts_at - Duration::hours(1));
    let err = h.service.cancel_reservation(late.id, client).await.unwrap_err();
    assert!(matches!(err, TicketingError::LateCancellation { .. }));
    let details = h.service.reservation_details(late.id, client).await.unwrap();
    assert_eq!(details.reservation.status, ReservationStatus::Confirmed);
    assert_eq!(details.payments.len(), 1);
}

#[tokio::test]
async fn only_owner_cancels_and_only_once() {
    let h = harness();
    let event = h.event(TierMap::new(10, 0, 0), Duration::days(5)).await;
    let owner = ClientId::new();
    let reservation = h
        .service
        .create_reservation(request(owner, &event, TierQuantities::new(4, 0, 0)))
        .await
        .unwrap();

    let err = h
        .service
        .cancel_reservation(reservation.id, ClientId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TicketingError::Unauthorized { .. }));

    h.service.cancel_reservation(reservation.id, owner).await.unwrap();
    let err = h
        .service
        .cancel_reservation(reservation.id, owner)
        .await
        .unwrap_err();
    assert!(matches!(err, TicketingError::AlreadyCancelled(id) if id == reservation.id));
    assert_eq!(h.remaining(&event).await.standard, 10);
}

#[tokio::test]
async fn shortfall_names_tier_and_reserves_nothing() {
    let h = harness();
    let event = h.event(TierMap::new(10, 1, 0), Duration::days(5)).await;

    let err = h
        .service
        .create_reservation(request(ClientId::new(), &event, TierQuantities::new(2, 2, 0)))
        .await
        .unwrap_err();
    match err {
        TicketingError::InsufficientCapacity {
            tier,
            requested,
            available,
        } => {
            assert_eq!(tier, Tier::Vip);
            assert_eq!(requested, 2);
            assert_eq!(available, 1);
        }
        other => panic!("expected insufficient capacity, got {other:?}"),
    }
    assert_eq!(h.remaining(&event).await, TierMap::new(10, 1, 0));
}

#[tokio::test]
async fn price_changes_leave_existing_line_items_alone() {
    let h = harness();
    let event = h.event(TierMap::new(10, 5, 0), Duration::days(5)).await;
    let client = ClientId::new();
    let before = h
        .service
        .create_reservation(request(client, &event, TierQuantities::new(1, 0, 0)))
        .await
        .unwrap();

    h.service
        .catalog()
        .update_event(
            h.organizer,
            event.id,
            EventUpdate {
                prices: Some(TierMap::new(
                    Money::from_cents(1500),
                    Money::from_cents(2500),
                    Money::from_cents(9900),
                )),
                ..EventUpdate::default()
            },
        )
        .await
        .unwrap();

    let after = h
        .service
        .create_reservation(request(client, &event, TierQuantities::new(1, 0, 0)))
        .await
        .unwrap();
    assert_eq!(after.total_amount, Money::from_cents(1500));

    let details = h.service.reservation_details(before.id, client).await.unwrap();
    assert_eq!(details.reservation.total_amount, Money::from_cents(1000));
    assert_eq!(
        details.reservation.line_items[0].unit_price,
        Money::from_cents(1000)
    );
}

#[tokio::test]
async fn client_history_is_newest_first() {
    let h = harness();
    let event = h.event(TierMap::new(10, 5, 0), Duration::days(5)).await;
    let client = ClientId::new();

    let first = h
        .service
        .create_reservation(request(client, &event, TierQuantities::new(1, 0, 0)))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(1));
    let second = h
        .service
        .create_reservation(request(client, &event, TierQuantities::new(0, 1, 0)))
        .await
        .unwrap();
    h.service
        .create_reservation(request(ClientId::new(), &event, TierQuantities::new(1, 0, 0)))
        .await
        .unwrap();

    let history = h.service.reservations_for_client(client).await.unwrap();
    let ids: Vec<_> = history.iter().map(|reservation| reservation.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert!(history.iter().all(|reservation| !reservation.line_items.is_empty()));
}

#[tokio::test]
async fn immediate_payment_requires_details() {
    let h = harness();
    let event = h.event(TierMap::new(10, 0, 0), Duration::days(5)).await;
    let mut req = request(ClientId::new(), &event, TierQuantities::new(1, 0, 0));
    req.pay_immediately = true;

    let err = h.service.book(req.clone(), None).await.unwrap_err();
    assert!(matches!(err, TicketingError::Validation(_)));
    assert_eq!(h.remaining(&event).await.standard, 10);

    req.pay_immediately = false;
    let outcome = h.service.book(req, None).await.unwrap();
    assert!(outcome.payment.is_none());
    assert!(!outcome.is_confirmed());
    assert_eq!(outcome.reservation.status, ReservationStatus::PendingPayment);
}

#[tokio::test]
async fn unknown_reservation_is_not_found() {
    let h = harness();
    let err = h
        .service
        .cancel_reservation(ticketing::ReservationId::new(), ClientId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TicketingError::NotFound { entity: "reservation", .. }));
}
