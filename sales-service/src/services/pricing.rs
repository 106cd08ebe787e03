//! Line and header price arithmetic.
//!
//! Pure functions over `Decimal`. Every persisted amount is rounded to
//! [`MONEY_SCALE`] places, half away from zero.
//!
//! Line totals do not share one formula. A line priced when an order is
//! created totals `(price + discount) * qty`; a line priced by an order update
//! or by a return totals `(price - discount) * qty`. All three are kept exactly
//! as the stored documents have always been computed.

use rust_decimal::{Decimal, RoundingStrategy};
use validator::ValidationError;

/// Decimal places kept for money and percentage columns (`NUMERIC(_, 4)`).
pub const MONEY_SCALE: u32 = 4;

/// Exclusive bound of a `NUMERIC(20, 4)` column: 10^16.
pub const MONEY_LIMIT: Decimal = Decimal::from_parts(0x6FC1_0000, 0x0023_86F2, 0, false, 0);

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

pub fn is_storable(value: Decimal) -> bool {
    value.abs() < MONEY_LIMIT
}

/// Caller-supplied price or discount amount: non-negative and storable.
pub fn validate_money(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO || !is_storable(*value) {
        return Err(ValidationError::new("money"));
    }
    Ok(())
}

pub fn validate_percentage(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO || *value > HUNDRED {
        return Err(ValidationError::new("percentage"));
    }
    Ok(())
}

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Unit price and discount pair of a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinePrice {
    pub unit_price: Decimal,
    pub discount_amount: Decimal,
    pub discount_percentage: Decimal,
}

impl LinePrice {
    /// Resolve the discount pair: a positive percentage recomputes the amount
    /// from the unit price, otherwise the amount is kept verbatim.
    pub fn new(unit_price: Decimal, discount_amount: Decimal, discount_percentage: Decimal) -> Self {
        Self {
            unit_price: round_money(unit_price),
            discount_amount: line_discount(unit_price, discount_amount, discount_percentage),
            discount_percentage: round_money(discount_percentage),
        }
    }

    /// Total of a line priced while creating an order.
    pub fn order_total(&self, quantity: i32) -> Decimal {
        order_line_total(self.unit_price, self.discount_amount, quantity)
    }

    /// Total of a line priced by an order update or a return.
    pub fn net_total(&self, quantity: i32) -> Decimal {
        net_line_total(self.unit_price, self.discount_amount, quantity)
    }
}

/// Per-unit discount of a line.
pub fn line_discount(unit_price: Decimal, amount: Decimal, percentage: Decimal) -> Decimal {
    if percentage > Decimal::ZERO {
        round_money(unit_price * percentage / HUNDRED)
    } else {
        round_money(amount)
    }
}

pub fn order_line_total(unit_price: Decimal, discount_amount: Decimal, quantity: i32) -> Decimal {
    round_money((unit_price + discount_amount) * Decimal::from(quantity))
}

pub fn net_line_total(unit_price: Decimal, discount_amount: Decimal, quantity: i32) -> Decimal {
    round_money((unit_price - discount_amount) * Decimal::from(quantity))
}

/// Computed header price fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderTotals {
    pub price: Decimal,
    pub discount_amount: Decimal,
    pub discount_percentage: Decimal,
    pub total_price: Decimal,
}

/// Header discount over the sum of line totals. A positive percentage drives
/// the amount; otherwise the amount is taken as given.
pub fn header_discount(line_sum: Decimal, amount: Decimal, percentage: Decimal) -> Decimal {
    if percentage > Decimal::ZERO {
        round_money(line_sum * percentage / HUNDRED)
    } else {
        round_money(amount)
    }
}

pub fn header_totals(line_sum: Decimal, amount: Decimal, percentage: Decimal) -> HeaderTotals {
    let price = round_money(line_sum);
    let discount_amount = header_discount(price, amount, percentage);
    HeaderTotals {
        price,
        discount_amount,
        discount_percentage: round_money(percentage),
        total_price: price - discount_amount,
    }
}

/// Share of a flat order discount carried by a partial return.
///
/// `order_discount / ordered_qty * returned_qty`, capped by what earlier
/// returns have not yet consumed and never negative. An order without
/// quantity allocates nothing.
pub fn proportional_return_discount(
    order_discount: Decimal,
    ordered_qty: i64,
    returned_qty: i64,
    already_allocated: Decimal,
) -> Decimal {
    if ordered_qty <= 0 {
        return Decimal::ZERO;
    }

    let candidate = order_discount / Decimal::from(ordered_qty) * Decimal::from(returned_qty);
    let remaining = order_discount - already_allocated;

    round_money(candidate.min(remaining).max(Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_percentage_discount_overrides_amount() {
        let price = LinePrice::new(dec!(100), dec!(7), dec!(10));
        assert_eq!(price.discount_amount, dec!(10));
        assert_eq!(price.discount_percentage, dec!(10));
    }

    #[test]
    fn test_flat_discount_kept_when_no_percentage() {
        let price = LinePrice::new(dec!(100), dec!(7), Decimal::ZERO);
        assert_eq!(price.discount_amount, dec!(7));
    }

    #[test]
    fn test_order_and_return_line_formulas_differ_in_sign() {
        let price = LinePrice::new(dec!(100), dec!(5), Decimal::ZERO);
        assert_eq!(price.order_total(3), dec!(315));
        assert_eq!(price.net_total(3), dec!(285));
    }

    #[test]
    fn test_percentage_discount_under_each_line_formula() {
        // 10% of 100 resolves to a per-unit discount of 10.
        let price = LinePrice::new(dec!(100), Decimal::ZERO, dec!(10));
        assert_eq!(price.order_total(3), dec!(330));
        assert_eq!(price.net_total(3), dec!(270));
        assert_eq!(net_line_total(dec!(100), dec!(10), 3), dec!(270));
    }

    #[test]
    fn test_money_limit_is_numeric_column_bound() {
        assert_eq!(MONEY_LIMIT, dec!(10000000000000000));
        assert!(is_storable(dec!(9999999999999999.9999)));
        assert!(!is_storable(MONEY_LIMIT));
        assert!(!is_storable(-MONEY_LIMIT));
    }

    #[test]
    fn test_input_bounds() {
        assert!(validate_money(&dec!(0)).is_ok());
        assert!(validate_money(&dec!(250000.5)).is_ok());
        assert!(validate_money(&dec!(-1)).is_err());
        assert!(validate_money(&Decimal::MAX).is_err());

        assert!(validate_percentage(&dec!(0)).is_ok());
        assert!(validate_percentage(&dec!(100)).is_ok());
        assert!(validate_percentage(&dec!(100.0001)).is_err());
        assert!(validate_percentage(&dec!(-5)).is_err());
    }

    #[test]
    fn test_line_without_discount() {
        let price = LinePrice::new(dec!(100), Decimal::ZERO, Decimal::ZERO);
        assert_eq!(price.order_total(10), dec!(1000));
        assert_eq!(price.net_total(4), dec!(400));
    }

    #[test]
    fn test_header_percentage_discount() {
        let totals = header_totals(dec!(1000), Decimal::ZERO, dec!(10));
        assert_eq!(totals.price, dec!(1000));
        assert_eq!(totals.discount_amount, dec!(100));
        assert_eq!(totals.total_price, dec!(900));
    }

    #[test]
    fn test_header_flat_discount() {
        let totals = header_totals(dec!(1000), dec!(100), Decimal::ZERO);
        assert_eq!(totals.discount_amount, dec!(100));
        assert_eq!(totals.discount_percentage, Decimal::ZERO);
        assert_eq!(totals.total_price, dec!(900));
    }

    #[test]
    fn test_header_total_matches_line_sum_minus_discount() {
        let lines = [
            LinePrice::new(dec!(19.99), dec!(1.5), Decimal::ZERO).order_total(3),
            LinePrice::new(dec!(7.35), Decimal::ZERO, dec!(12.5)).order_total(11),
        ];
        let sum: Decimal = lines.iter().copied().sum();
        let totals = header_totals(sum, Decimal::ZERO, dec!(3));
        assert_eq!(totals.price - totals.discount_amount, totals.total_price);
    }

    #[test]
    fn test_proportional_discount_first_return() {
        assert_eq!(
            proportional_return_discount(dec!(100), 10, 4, Decimal::ZERO),
            dec!(40)
        );
    }

    #[test]
    fn test_proportional_discount_capped_by_prior_returns() {
        assert_eq!(
            proportional_return_discount(dec!(100), 10, 4, dec!(80)),
            dec!(20)
        );
    }

    #[test]
    fn test_proportional_discount_never_negative() {
        assert_eq!(
            proportional_return_discount(dec!(100), 10, 4, dec!(120)),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_proportional_discount_zero_ordered_quantity() {
        assert_eq!(
            proportional_return_discount(dec!(100), 0, 4, Decimal::ZERO),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_rounding_half_away_from_zero() {
        assert_eq!(round_money(dec!(1.00005)), dec!(1.0001));
        assert_eq!(round_money(dec!(-1.00005)), dec!(-1.0001));
        assert_eq!(
            proportional_return_discount(dec!(100), 3, 1, Decimal::ZERO),
            dec!(33.3333)
        );
    }
}
