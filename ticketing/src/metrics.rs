//! Business metrics for the ticketing services.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding application installs a recorder.
//!
//! # Recorded Metrics
//!
//! ## Counters
//! - `ticketing_reservations_total{status}` - reservations by outcome
//!   (`created`, `confirmed`, `cancelled`, `rejected`)
//! - `ticketing_payments_total{status}` - payments by outcome
//!   (`succeeded`, `declined`, `gateway_error`)
//! - `ticketing_payment_revenue_cents_total` - revenue from successful payments
//! - `ticketing_tickets_sold_total` - tickets committed by new reservations
//! - `ticketing_capacity_rejections_total{tier}` - reservations refused for capacity
//! - `ticketing_events_created_total` - events created through the catalog
//! - `ticketing_reconciliation_corrections_total` - tiers whose counters drifted
//!
//! ## Histograms
//! - `ticketing_payment_duration_seconds` - time spent waiting on the gateway

use crate::types::Tier;
use metrics::{describe_counter, describe_histogram};

/// Register descriptions for every business metric.
///
/// Call once at startup, after installing a recorder.
pub fn register_business_metrics() {
    describe_counter!(
        "ticketing_reservations_total",
        "Total number of reservations by status (created, confirmed, cancelled, rejected)"
    );
    describe_counter!(
        "ticketing_payments_total",
        "Total number of payment attempts by status (succeeded, declined, gateway_error)"
    );
    describe_counter!(
        "ticketing_payment_revenue_cents_total",
        "Total revenue from successful payments in cents"
    );
    describe_histogram!(
        "ticketing_payment_duration_seconds",
        "Time spent waiting for the payment gateway"
    );
    describe_counter!(
        "ticketing_tickets_sold_total",
        "Total number of tickets committed by reservations"
    );
    describe_counter!(
        "ticketing_capacity_rejections_total",
        "Reservations refused because a tier was out of capacity"
    );
    describe_counter!(
        "ticketing_events_created_total",
        "Total number of events created"
    );
    describe_counter!(
        "ticketing_reconciliation_corrections_total",
        "Tier counters corrected by reconciliation"
    );

    tracing::info!("Business metrics registered");
}

/// Record a newly created reservation holding `tickets` tickets.
pub fn record_reservation_created(tickets: u64) {
    metrics::counter!("ticketing_reservations_total", "status" => "created").increment(1);
    metrics::counter!("ticketing_tickets_sold_total").increment(tickets);
}

/// Record a reservation confirmed by a successful payment.
pub fn record_reservation_confirmed() {
    metrics::counter!("ticketing_reservations_total", "status" => "confirmed").increment(1);
}

/// Record a cancelled reservation.
pub fn record_reservation_cancelled() {
    metrics::counter!("ticketing_reservations_total", "status" => "cancelled").increment(1);
}

/// Record a reservation request refused by a business rule.
pub fn record_reservation_rejected() {
    metrics::counter!("ticketing_reservations_total", "status" => "rejected").increment(1);
}

/// Record a capacity rejection for `tier`.
pub fn record_capacity_rejection(tier: Tier) {
    metrics::counter!("ticketing_capacity_rejections_total", "tier" => tier.as_str()).increment(1);
}

/// Record a successful payment.
pub fn record_payment_succeeded(amount_cents: u64, duration_secs: f64) {
    metrics::counter!("ticketing_payments_total", "status" => "succeeded").increment(1);
    metrics::counter!("ticketing_payment_revenue_cents_total").increment(amount_cents);
    metrics::histogram!("ticketing_payment_duration_seconds").record(duration_secs);
    tracing::debug!(amount_cents, duration_secs, "Recorded payment_succeeded metric");
}

/// Record a failed payment. `status` is `declined` or `gateway_error`.
pub fn record_payment_failed(status: &'static str, duration_secs: f64) {
    metrics::counter!("ticketing_payments_total", "status" => status).increment(1);
    metrics::histogram!("ticketing_payment_duration_seconds").record(duration_secs);
    tracing::debug!(status, duration_secs, "Recorded payment_failed metric");
}

/// Record an event created through the catalog.
pub fn record_event_created() {
    metrics::counter!("ticketing_events_created_total").increment(1);
}

/// Record `tiers` tier counters corrected by reconciliation.
pub fn record_reconciliation_corrections(tiers: u64) {
    if tiers > 0 {
        metrics::counter!("ticketing_reconciliation_corrections_total").increment(tiers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        register_business_metrics();
        record_reservation_created(3);
        record_capacity_rejection(Tier::Premium);
        record_payment_failed("declined", 0.01);
        record_reconciliation_corrections(0);
    }
}
