//! Ticketing Demo
//!
//! Walks through the reservation lifecycle against the in-memory repository
//! and the mock payment gateway:
//! - Event creation by an organizer
//! - Booking with immediate payment
//! - A declined payment followed by a successful retry
//! - Cancellation releasing capacity
//! - Capacity rejection when a tier runs out
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ticketing-demo
//! ```

use chrono::{Duration, Utc};
use std::sync::Arc;
use ticketing::{
    ClientId, Config, EventCategory, InMemoryTicketingRepository, MockPaymentGateway, Money,
    NewEvent, OrganizerId, PayerDetails, PaymentMethod, ReservationRequest, TicketingService,
    TierMap, TierQuantities,
};
use ticketing_core::SystemClock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn card(number: &str) -> PaymentMethod {
    PaymentMethod::Card {
        number: number.to_string(),
        cvv: "123".to_string(),
        expiry_month: 12,
        expiry_year: 2099,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ticketing=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("\n============================================");
    println!("   Ticketing - Live Demo");
    println!("============================================\n");

    let config = Config::from_env();
    ticketing::metrics::register_business_metrics();
    let service = TicketingService::new(
        Arc::new(InMemoryTicketingRepository::new()),
        MockPaymentGateway::shared(),
        Arc::new(SystemClock),
        &config,
    );

    // ========== Event ==========

    let organizer = OrganizerId::new();
    let event = service
        .catalog()
        .create_event(
            organizer,
            NewEvent {
                name: "Rust Conf Live".to_string(),
                venue: "Main Hall".to_string(),
                category: EventCategory::Conference {
                    topic: "Systems programming".to_string(),
                    speakers: vec!["Ferris".to_string()],
                },
                capacity: TierMap::new(100, 10, 2),
                prices: TierMap::new(
                    Money::from_cents(1000),
                    Money::from_cents(2500),
                    Money::from_cents(9900),
                ),
                starts_at: Utc::now() + Duration::days(14),
            },
        )
        .await?;
    println!("Created event '{}' ({})", event.name, event.id);

    // ========== Booking with immediate payment ==========

    let alice = ClientId::new();
    let outcome = service
        .book_and_pay(
            ReservationRequest {
                client_id: alice,
                event_id: event.id,
                quantities: TierQuantities::new(2, 1, 0),
                pay_immediately: true,
            },
            PayerDetails {
                name: "Alice".to_string(),
                email: Some("alice@example.com".to_string()),
            },
            card("4242 4242 4242 4242"),
        )
        .await?;
    println!(
        "Alice booked 2 standard + 1 VIP: total {} -> {}",
        outcome.reservation.total_amount, outcome.reservation.status
    );

    // ========== Declined payment, then retry ==========

    let bob = ClientId::new();
    let reservation = service
        .create_reservation(ReservationRequest {
            client_id: bob,
            event_id: event.id,
            quantities: TierQuantities::new(0, 0, 1),
            pay_immediately: false,
        })
        .await?;
    let payer = PayerDetails {
        name: "Bob".to_string(),
        email: None,
    };
    let declined = service
        .process_payment(
            reservation.id,
            payer.clone(),
            PaymentMethod::GatewayToken {
                token: format!("{}_insufficient_funds", MockPaymentGateway::DECLINE_PREFIX),
            },
        )
        .await;
    if let Err(err) = declined {
        println!("Bob's first payment failed: {err}");
    }
    let payment = service
        .process_payment(reservation.id, payer, card("5555-5555-5555-4444"))
        .await?;
    println!(
        "Bob's retry succeeded: {} ({})",
        payment.amount,
        payment.transaction_reference.unwrap_or_default()
    );

    // ========== Cancellation ==========

    let cancelled = service.cancel_reservation(outcome.reservation.id, alice).await?;
    println!("Alice cancelled: {}", cancelled.status);
    let remaining = service.catalog().availability(event.id).await?;
    println!(
        "Remaining: standard {}, vip {}, premium {}",
        remaining.standard, remaining.vip, remaining.premium
    );

    // ========== Capacity rejection ==========

    let rejected = service
        .create_reservation(ReservationRequest {
            client_id: ClientId::new(),
            event_id: event.id,
            quantities: TierQuantities::new(0, 0, 2),
            pay_immediately: false,
        })
        .await;
    if let Err(err) = rejected {
        println!("Premium request rejected: {err}");
    }

    // ========== History ==========

    let details = service.reservation_details(reservation.id, bob).await?;
    println!(
        "Bob's reservation for '{}': {} with {} payment attempt(s)",
        details.event.name,
        details.reservation.status,
        details.payments.len()
    );

    let reports = service.reconciler().reconcile_all().await?;
    println!(
        "Reconciliation: {} event(s), {} corrected",
        reports.len(),
        reports.iter().filter(|report| report.changed()).count()
    );

    println!("\nDemo complete.");
    Ok(())
}
