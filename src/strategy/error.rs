//! Error conditions raised by the strategy engine.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    /// A non-positive price or deposit, or inputs whose derived values
    /// overflow the decimal range.
    #[error("invalid {field}: {value} ({reason})")]
    InvalidInput {
        field: &'static str,
        value: Decimal,
        reason: &'static str,
    },

    /// Hedge sizing would push the hedge sleeve past the leverage cap.
    #[error("required leverage {required:.2}x exceeds maximum {max}x")]
    LeverageExceeded { required: Decimal, max: Decimal },
}
