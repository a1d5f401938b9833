//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Signed percentage change from `base` to `value`.
pub fn percentage_change(value: Decimal, base: Decimal) -> Decimal {
    if base == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (value - base) / base * dec!(100)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Fractional hours in a chrono duration, clamped at zero.
pub fn duration_hours(duration: chrono::Duration) -> Decimal {
    let millis = duration.num_milliseconds().max(0);
    Decimal::from(millis) / dec!(3_600_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(1.567), Decimal::ZERO), dec!(1.567));
    }

    #[test]
    fn test_percentage_change() {
        assert_eq!(percentage_change(dec!(110), dec!(100)), dec!(10));
        assert_eq!(percentage_change(dec!(92), dec!(100)), dec!(-8));
        assert_eq!(percentage_change(dec!(92), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(10), dec!(4)), dec!(2.5));
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_duration_hours() {
        assert_eq!(duration_hours(chrono::Duration::minutes(90)), dec!(1.5));
        assert_eq!(duration_hours(chrono::Duration::hours(-3)), Decimal::ZERO);
    }
}
