//! Totals and line items.
//!
//! Pure functions over a price snapshot. The snapshot is taken from the event
//! when the reservation is created, so later price edits never reach existing
//! reservations.

use crate::error::{Result, TicketingError};
use crate::types::{Money, ReservationId, ReservationLineItem, Tier, TierMap, TierQuantities};

/// Line items and total for one reservation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriceQuote {
    /// One item per tier with quantity > 0, in tier order
    pub line_items: Vec<ReservationLineItem>,
    /// Sum of the item subtotals
    pub total: Money,
}

/// Build the line item for one tier, `None` for a zero quantity.
///
/// # Errors
///
/// Returns [`TicketingError::Validation`] if the subtotal overflows.
pub fn line_item(
    reservation_id: ReservationId,
    tier: Tier,
    quantity: u32,
    unit_price: Money,
) -> Result<Option<ReservationLineItem>> {
    if quantity == 0 {
        return Ok(None);
    }
    let subtotal = unit_price
        .checked_multiply(quantity)
        .ok_or_else(|| TicketingError::Validation(format!("subtotal overflow for {tier} tier")))?;

    Ok(Some(ReservationLineItem {
        reservation_id,
        tier,
        quantity,
        unit_price,
        subtotal,
    }))
}

/// Price `quantities` against `prices`.
///
/// Zero-price tiers still produce a line item.
///
/// # Errors
///
/// Returns [`TicketingError::Validation`] on arithmetic overflow.
pub fn quote(
    reservation_id: ReservationId,
    quantities: &TierQuantities,
    prices: &TierMap<Money>,
) -> Result<PriceQuote> {
    let mut line_items = Vec::with_capacity(Tier::ALL.len());
    let mut total = Money::ZERO;

    for (tier, quantity) in quantities.requested() {
        if let Some(item) = line_item(reservation_id, tier, quantity, *prices.get(tier))? {
            total = total
                .checked_add(item.subtotal)
                .ok_or_else(|| TicketingError::Validation("reservation total overflow".to_string()))?;
            line_items.push(item);
        }
    }

    Ok(PriceQuote { line_items, total })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn prices(standard: u64, vip: u64, premium: u64) -> TierMap<Money> {
        TierMap::new(
            Money::from_cents(standard),
            Money::from_cents(vip),
            Money::from_cents(premium),
        )
    }

    #[test]
    fn two_standard_and_one_vip() {
        let quote = quote(
            ReservationId::new(),
            &TierQuantities::new(2, 1, 0),
            &prices(1000, 2500, 9900),
        )
        .unwrap();

        assert_eq!(quote.total, Money::from_cents(4500));
        assert_eq!(quote.line_items.len(), 2);
        assert_eq!(quote.line_items[0].tier, Tier::Standard);
        assert_eq!(quote.line_items[0].subtotal, Money::from_cents(2000));
        assert_eq!(quote.line_items[1].tier, Tier::Vip);
    }

    #[test]
    fn free_tier_still_produces_line_item() {
        let quote = quote(
            ReservationId::new(),
            &TierQuantities::new(3, 0, 0),
            &prices(0, 2500, 9900),
        )
        .unwrap();

        assert_eq!(quote.total, Money::ZERO);
        assert_eq!(quote.line_items.len(), 1);
        assert_eq!(quote.line_items[0].quantity, 3);
    }

    #[test]
    fn overflow_is_a_validation_error() {
        let err = quote(
            ReservationId::new(),
            &TierQuantities::new(2, 0, 0),
            &prices(u64::MAX, 0, 0),
        )
        .unwrap_err();
        assert!(matches!(err, TicketingError::Validation(_)));
    }

    proptest! {
        #[test]
        fn total_is_sum_of_line_items(
            q in (0u32..20, 0u32..20, 0u32..20),
            p in (0u64..100_000, 0u64..100_000, 0u64..100_000),
        ) {
            let quantities = TierQuantities::new(q.0, q.1, q.2);
            let quote = quote(ReservationId::new(), &quantities, &prices(p.0, p.1, p.2)).unwrap();

            let expected = u64::from(q.0) * p.0 + u64::from(q.1) * p.1 + u64::from(q.2) * p.2;
            prop_assert_eq!(quote.total.cents(), expected);

            let nonzero = [q.0, q.1, q.2].iter().filter(|x| **x > 0).count();
            prop_assert_eq!(quote.line_items.len(), nonzero);
            prop_assert!(quote.line_items.iter().all(|item| item.quantity > 0));
        }
    }
}
