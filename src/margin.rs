//! Purchase profitability. Pure decimal arithmetic, no side effects.
//!
//! Callers must guard against non-positive sale prices and VAT multipliers
//! before calling; division by zero is undefined input here.

use rust_decimal::Decimal;

/// `cost_local / net_sale` where `cost_local = cost_eur * fx_rate` and
/// `net_sale = sale_price_local / vat_multiplier`.
pub fn cost_ratio(
    cost_eur: Decimal,
    sale_price_local: Decimal,
    fx_rate: Decimal,
    vat_multiplier: Decimal,
) -> Decimal {
    let cost_local = cost_eur * fx_rate;
    let net_sale = sale_price_local / vat_multiplier;
    cost_local / net_sale
}

/// Profit margin in percent, rounded to 2 decimal places.
pub fn margin(
    cost_eur: Decimal,
    sale_price_local: Decimal,
    fx_rate: Decimal,
    vat_multiplier: Decimal,
) -> Decimal {
    let ratio = cost_ratio(cost_eur, sale_price_local, fx_rate, vat_multiplier);
    ((Decimal::ONE - ratio) * Decimal::ONE_HUNDRED).round_dp(2)
}

/// Strict `<` on the cost ratio: a candidate sitting exactly on the
/// threshold is rejected.
pub fn is_acceptable(
    cost_eur: Decimal,
    sale_price_local: Decimal,
    fx_rate: Decimal,
    vat_multiplier: Decimal,
    max_cost_ratio: Decimal,
) -> bool {
    cost_ratio(cost_eur, sale_price_local, fx_rate, vat_multiplier) < max_cost_ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn computes_margin_for_reference_scenario() {
        // 10 EUR cost, 100 RON sale, fx 5.1, vat 1.21:
        // cost_local = 51, net_sale = 82.64..., ratio ~ 0.617
        let m = margin(dec!(10), dec!(100), dec!(5.1), dec!(1.21));
        assert_eq!(m, dec!(38.29));
        assert!(is_acceptable(
            dec!(10),
            dec!(100),
            dec!(5.1),
            dec!(1.21),
            dec!(0.88)
        ));
    }

    #[test]
    fn rejects_unprofitable_reference_scenario() {
        // Same cost against a 40 RON sale: ratio ~ 1.54.
        assert!(!is_acceptable(
            dec!(10),
            dec!(40),
            dec!(5.1),
            dec!(1.21),
            dec!(0.88)
        ));
        assert!(margin(dec!(10), dec!(40), dec!(5.1), dec!(1.21)) < Decimal::ZERO);
    }

    #[test]
    fn boundary_ratio_is_rejected() {
        // fx = vat = 1, cost 88, sale 100 -> ratio exactly 0.88.
        assert_eq!(
            cost_ratio(dec!(88), dec!(100), Decimal::ONE, Decimal::ONE),
            dec!(0.88)
        );
        assert!(!is_acceptable(
            dec!(88),
            dec!(100),
            Decimal::ONE,
            Decimal::ONE,
            dec!(0.88)
        ));
        assert!(is_acceptable(
            dec!(87.99),
            dec!(100),
            Decimal::ONE,
            Decimal::ONE,
            dec!(0.88)
        ));
    }

    #[test]
    fn margin_decreases_as_cost_increases() {
        let mut last = margin(dec!(1), dec!(100), dec!(5.1), dec!(1.21));
        for cost in 2..20 {
            let m = margin(Decimal::from(cost), dec!(100), dec!(5.1), dec!(1.21));
            assert!(m < last, "margin must fall as cost rises");
            last = m;
        }
    }

    #[test]
    fn acceptance_matches_margin_threshold() {
        // is_acceptable <=> margin > (1 - ratio) * 100, with equality rejected.
        let threshold = (Decimal::ONE - dec!(0.88)) * Decimal::ONE_HUNDRED;
        for cost in [dec!(50), dec!(70.54), dec!(72.72), dec!(73), dec!(90)] {
            let accepted = is_acceptable(cost, dec!(100), Decimal::ONE, dec!(1.21), dec!(0.88));
            let ratio = cost_ratio(cost, dec!(100), Decimal::ONE, dec!(1.21));
            let m = (Decimal::ONE - ratio) * Decimal::ONE_HUNDRED;
            assert_eq!(accepted, m > threshold);
        }
    }
}
