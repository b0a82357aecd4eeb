// src/core/sizing.rs
use crate::errors::ValidationError;
use crate::types::SymbolRules;
use crate::utils::precision::{ceil_to_step, floor_to_step};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy)]
pub struct SizingInput {
    pub balance: Decimal,
    pub leverage: u8,
    pub risk_fraction: Decimal,
    pub price: Decimal,
}

/// Entry quantity for the given balance and risk budget.
///
/// raw = balance * fraction * leverage / price, floored to the step size and
/// raised to `min_qty`. An order whose notional stays under `min_notional` is
/// either rejected or, with `bump_to_min_notional`, raised to the smallest
/// step-aligned quantity that clears it. Nothing may exceed balance * leverage.
pub fn size_order(
    input: SizingInput,
    rules: &SymbolRules,
    bump_to_min_notional: bool,
) -> Result<Decimal, ValidationError> {
    let SizingInput {
        balance,
        leverage,
        risk_fraction,
        price,
    } = input;

    if price <= Decimal::ZERO {
        return Err(ValidationError::InvalidPrice(price));
    }
    if balance <= Decimal::ZERO {
        return Err(ValidationError::InsufficientBalance(balance));
    }

    let leverage = Decimal::from(leverage);
    let capacity = balance * leverage;
    let raw_qty = balance * risk_fraction * leverage / price;

    let mut qty = floor_to_step(raw_qty, rules.step_size).max(rules.min_qty);

    if qty * price < rules.min_notional {
        if !bump_to_min_notional {
            return Err(ValidationError::BelowMinNotional {
                notional: qty * price,
                min_notional: rules.min_notional,
            });
        }
        qty = ceil_to_step(rules.min_notional / price, rules.step_size).max(rules.min_qty);
    }

    if qty <= Decimal::ZERO {
        return Err(ValidationError::QuantityBelowMinimum {
            qty,
            min_qty: rules.min_qty,
        });
    }
    if qty * price > capacity {
        return Err(ValidationError::ExceedsMargin {
            required: qty * price / leverage,
            available: balance,
        });
    }
    if qty * price < rules.min_notional {
        return Err(ValidationError::BelowMinNotional {
            notional: qty * price,
            min_notional: rules.min_notional,
        });
    }
    Ok(qty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn rules() -> SymbolRules {
        SymbolRules {
            symbol: "BTCUSDT".into(),
            step_size: dec!(0.001),
            tick_size: dec!(0.1),
            min_qty: dec!(0.001),
            min_notional: dec!(5),
        }
    }

    fn input(balance: Decimal, leverage: u8, fraction: Decimal, price: Decimal) -> SizingInput {
        SizingInput {
            balance,
            leverage,
            risk_fraction: fraction,
            price,
        }
    }

    #[test]
    fn full_budget_scenario() {
        // 1000 * 1.0 * 10 / 100 = 100
        let qty = size_order(input(dec!(1000), 10, dec!(1.0), dec!(100)), &rules(), false).unwrap();
        assert_eq!(qty, dec!(100.000));
    }

    #[test]
    fn floors_to_step() {
        let qty = size_order(input(dec!(1000), 3, dec!(0.5), dec!(42123.4)), &rules(), false).unwrap();
        // 1500 / 42123.4 = 0.03560...
        assert_eq!(qty, dec!(0.035));
    }

    #[test]
    fn undersized_order_is_rejected() {
        let err = size_order(input(dec!(1), 1, dec!(0.5), dec!(3)), &rules(), false).unwrap_err();
        assert!(matches!(err, ValidationError::BelowMinNotional { .. }));
    }

    #[test]
    fn undersized_order_can_be_bumped() {
        let r = SymbolRules {
            min_notional: dec!(100),
            ..rules()
        };
        // 20 * 0.1 * 10 = 20 notional -> needs 100
        let qty = size_order(input(dec!(20), 10, dec!(0.1), dec!(3)), &r, true).unwrap();
        assert_eq!(qty, dec!(33.334));
        assert!(qty * dec!(3) >= dec!(100));
    }

    #[test]
    fn bump_never_exceeds_margin() {
        let r = SymbolRules {
            min_notional: dec!(100),
            ..rules()
        };
        let err = size_order(input(dec!(5), 10, dec!(0.1), dec!(3)), &r, true).unwrap_err();
        assert!(matches!(err, ValidationError::ExceedsMargin { .. }));
    }

    #[test]
    fn empty_balance_is_rejected() {
        let err = size_order(input(Decimal::ZERO, 10, dec!(1), dec!(100)), &rules(), false).unwrap_err();
        assert_eq!(err, ValidationError::InsufficientBalance(Decimal::ZERO));
    }

    proptest! {
        #[test]
        fn accepted_orders_clear_min_notional(
            balance in 1u32..1_000_000u32,
            leverage in 1u8..=125u8,
            fraction_pct in 1u32..=100u32,
            price_cents in 1u64..10_000_000u64,
            bump in any::<bool>(),
        ) {
            let price = Decimal::new(price_cents as i64, 2);
            let fraction = Decimal::new(fraction_pct as i64, 2);
            let balance = Decimal::from(balance);
            let r = rules();
            if let Ok(qty) = size_order(input(balance, leverage, fraction, price), &r, bump) {
                prop_assert!(qty * price >= r.min_notional);
                prop_assert!(qty >= r.min_qty);
                prop_assert!(qty * price <= balance * Decimal::from(leverage));
                prop_assert_eq!(floor_to_step(qty, r.step_size), qty);
            }
        }

        #[test]
        fn sufficient_budget_is_always_sized(
            balance in 10u32..1_000_000u32,
            leverage in 1u8..=125u8,
            fraction_pct in 1u32..=100u32,
            price_cents in 1u64..10_000_000u64,
        ) {
            let price = Decimal::new(price_cents as i64, 2);
            let fraction = Decimal::new(fraction_pct as i64, 2);
            let balance = Decimal::from(balance);
            let r = rules();
            let budget = balance * fraction * Decimal::from(leverage);
            prop_assume!(budget >= r.min_notional + price * r.step_size);
            let qty = size_order(input(balance, leverage, fraction, price), &r, false);
            prop_assert!(qty.is_ok());
        }
    }
}
