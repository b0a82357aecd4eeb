// src/utils/precision.rs
use rust_decimal::Decimal;

/// Rounds an amount DOWN to the nearest multiple of `step`.
/// Example: amount=10.999, step=1.0 -> 10.0
pub fn floor_to_step(amount: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return amount;
    }
    (amount / step).floor() * step
}

/// Rounds an amount UP to the nearest multiple of `step`.
pub fn ceil_to_step(amount: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return amount;
    }
    (amount / step).ceil() * step
}

/// Number of decimal places implied by a step or tick size (`-log10(step)`, floored at 0).
/// Example: 0.001 -> 3, 0.5 -> 1, 10 -> 0
pub fn step_precision(step: Decimal) -> u32 {
    if step <= Decimal::ZERO {
        return 0;
    }
    step.normalize().scale()
}

/// Renders a price or quantity with exactly the precision the exchange accepts.
pub fn format_with_step(value: Decimal, step: Decimal) -> String {
    let dp = step_precision(step);
    let mut v = value.round_dp(dp);
    v.rescale(dp);
    v.to_string()
}

/// Where a trigger order must sit relative to the current price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPlacement {
    BelowMarket,
    AboveMarket,
}

/// Rounds a trigger price to the tick grid and pushes it at least
/// `min_ticks` ticks away from `market`, on the side given by `placement`.
/// Returns `None` when no positive price satisfies the constraint.
pub fn guard_trigger_price(
    trigger: Decimal,
    market: Decimal,
    placement: TriggerPlacement,
    tick_size: Decimal,
    min_ticks: u32,
) -> Option<Decimal> {
    let gap = tick_size * Decimal::from(min_ticks);
    let guarded = match placement {
        TriggerPlacement::BelowMarket => {
            let limit = floor_to_step(market - gap, tick_size);
            floor_to_step(trigger, tick_size).min(limit)
        }
        TriggerPlacement::AboveMarket => {
            let limit = ceil_to_step(market + gap, tick_size);
            ceil_to_step(trigger, tick_size).max(limit)
        }
    };
    (guarded > Decimal::ZERO).then_some(guarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn floors_quantities() {
        assert_eq!(floor_to_step(dec!(10.999), dec!(1.0)), dec!(10));
        assert_eq!(floor_to_step(dec!(0.123456), dec!(0.001)), dec!(0.123));
        assert_eq!(floor_to_step(dec!(100), dec!(0.001)), dec!(100.000));
        assert_eq!(floor_to_step(dec!(7), dec!(5)), dec!(5));
    }

    #[test]
    fn ceil_rounds_up_only_when_needed() {
        assert_eq!(ceil_to_step(dec!(0.1231), dec!(0.001)), dec!(0.124));
        assert_eq!(ceil_to_step(dec!(0.123), dec!(0.001)), dec!(0.123));
    }

    #[test]
    fn precision_follows_step_magnitude() {
        assert_eq!(step_precision(dec!(0.001)), 3);
        assert_eq!(step_precision(dec!(0.0100)), 2);
        assert_eq!(step_precision(dec!(1)), 0);
        assert_eq!(step_precision(dec!(10)), 0);
        assert_eq!(step_precision(Decimal::ZERO), 0);
    }

    #[test]
    fn formats_with_exchange_precision() {
        assert_eq!(format_with_step(dec!(100), dec!(0.001)), "100.000");
        assert_eq!(format_with_step(dec!(42123.40), dec!(0.10)), "42123.4");
    }

    #[test]
    fn stop_below_market_keeps_min_distance() {
        // Already far enough: only rounded down to the tick.
        let p = guard_trigger_price(dec!(95.37), dec!(100), TriggerPlacement::BelowMarket, dec!(0.1), 2);
        assert_eq!(p, Some(dec!(95.3)));

        // Too close: pushed to market - 2 ticks.
        let p = guard_trigger_price(dec!(99.95), dec!(100), TriggerPlacement::BelowMarket, dec!(0.1), 2);
        assert_eq!(p, Some(dec!(99.8)));
    }

    #[test]
    fn stop_above_market_keeps_min_distance() {
        let p = guard_trigger_price(dec!(104.01), dec!(100), TriggerPlacement::AboveMarket, dec!(0.1), 2);
        assert_eq!(p, Some(dec!(104.1)));

        let p = guard_trigger_price(dec!(100.05), dec!(100), TriggerPlacement::AboveMarket, dec!(0.1), 2);
        assert_eq!(p, Some(dec!(100.2)));
    }

    #[test]
    fn non_positive_trigger_is_rejected() {
        let p = guard_trigger_price(dec!(-3), dec!(0.1), TriggerPlacement::BelowMarket, dec!(0.1), 2);
        assert_eq!(p, None);
    }

    fn arb_step() -> impl Strategy<Value = Decimal> {
        prop_oneof![
            Just(dec!(0.001)),
            Just(dec!(0.01)),
            Just(dec!(0.5)),
            Just(dec!(1)),
            Just(dec!(5)),
        ]
    }

    proptest! {
        #[test]
        fn floor_is_idempotent_and_never_rounds_up(raw in 0u64..10_000_000_000u64, step in arb_step()) {
            let x = Decimal::new(raw as i64, 6);
            let once = floor_to_step(x, step);
            prop_assert_eq!(floor_to_step(once, step), once);
            prop_assert!(once <= x);
            prop_assert!(x - once < step);
        }
    }
}
