//! Fixed-precision price and quantity arithmetic
//!
//! All prices and quantities are `rust_decimal::Decimal` values rounded at the
//! token's native precision, so nothing here goes through binary floating point.

use rust_decimal::{Decimal, RoundingStrategy};

/// Largest token precision the exchange supports
pub const MAX_PRECISION: u32 = 18;

/// Result of sizing an order against a price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedAmount {
    /// Bid-token quantity (committed size of a SELL)
    pub quantity: Decimal,
    /// Ask-token total (committed spend of a BUY)
    pub adjusted_total: Decimal,
}

/// Round half away from zero at `precision` decimal places
pub fn round_to(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(
        precision.min(MAX_PRECISION),
        RoundingStrategy::MidpointAwayFromZero,
    )
}

/// `10^precision` as a decimal
pub fn multiplier(precision: u32) -> Decimal {
    Decimal::from(10u64.pow(precision.min(MAX_PRECISION)))
}

/// Smallest representable increment at `precision`
pub fn increment(precision: u32) -> Decimal {
    Decimal::new(1, precision.min(MAX_PRECISION))
}

/// Size an order of `total_cost` bid-token units at `price`.
///
/// `adjusted_total = round(total_cost * price, ask_precision)` and
/// `quantity = round(adjusted_total / price, bid_precision)`. A BUY commits
/// `adjusted_total` of the ask token, a SELL commits `quantity` of the bid token.
/// `price` must be nonzero; a zero price yields a zero quantity.
pub fn quantity_and_adjusted_total(
    price: Decimal,
    total_cost: Decimal,
    bid_precision: u32,
    ask_precision: u32,
) -> SizedAmount {
    debug_assert!(!price.is_zero(), "price must be nonzero");

    let adjusted_total = round_to(total_cost * price, ask_precision);
    let quantity = adjusted_total
        .checked_div(price)
        .map(|q| round_to(q, bid_precision))
        .unwrap_or(Decimal::ZERO);

    SizedAmount {
        quantity,
        adjusted_total,
    }
}

/// Absolute change from `reference` to `current`, in percent of `reference`
pub fn percent_drift(current: Decimal, reference: Decimal) -> Option<Decimal> {
    (current - reference)
        .abs()
        .checked_div(reference)
        .map(|ratio| ratio * Decimal::ONE_HUNDRED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_to_half_away_from_zero() {
        assert_eq!(round_to(dec!(0.0051595), 6), dec!(0.005160));
        assert_eq!(round_to(dec!(0.0051594), 6), dec!(0.005159));
        assert_eq!(round_to(dec!(12.5), 0), dec!(13));
        assert_eq!(round_to(dec!(1.25), 30), dec!(1.25));
    }

    #[test]
    fn test_multiplier_and_increment() {
        assert_eq!(multiplier(0), dec!(1));
        assert_eq!(multiplier(4), dec!(10000));
        assert_eq!(multiplier(18), dec!(1000000000000000000));
        assert_eq!(increment(6), dec!(0.000001));
    }

    #[test]
    fn test_quantity_exact_inverse() {
        let sized = quantity_and_adjusted_total(dec!(0.005150), dec!(5250), 4, 6);
        assert_eq!(sized.adjusted_total, dec!(27.0375));
        assert_eq!(sized.quantity, dec!(5250));
    }

    #[test]
    fn test_quantity_inflated_amount() {
        let sized = quantity_and_adjusted_total(dec!(0.005177), dec!(5261.75), 4, 6);
        assert_eq!(sized.adjusted_total, dec!(27.24008));
        assert_eq!(sized.quantity, dec!(5261.75));
    }

    #[test]
    fn test_adjusted_total_round_trips_within_one_increment() {
        let cases = [
            (dec!(0.005177), dec!(5250), 4u32, 6u32),
            (dec!(0.005141), dec!(1234.5678), 4, 6),
            (dec!(0.9876), dec!(333), 8, 6),
            (dec!(12.5), dec!(7.77), 8, 4),
            (dec!(0.000123), dec!(1000000), 4, 8),
            (dec!(1.0001), dec!(99.99), 6, 6),
        ];

        for (price, total, bid_precision, ask_precision) in cases {
            let sized = quantity_and_adjusted_total(price, total, bid_precision, ask_precision);
            let recomputed = round_to(sized.quantity * price, ask_precision);
            let diff = (recomputed - sized.adjusted_total).abs();
            assert!(
                diff <= increment(ask_precision),
                "price={price} total={total}: {recomputed} vs {}",
                sized.adjusted_total
            );
        }
    }

    #[test]
    fn test_percent_drift() {
        assert_eq!(percent_drift(dec!(102), dec!(100)), Some(dec!(2)));
        assert_eq!(percent_drift(dec!(99.5), dec!(100)), Some(dec!(0.5)));
        assert_eq!(percent_drift(dec!(1), Decimal::ZERO), None);
    }
}
