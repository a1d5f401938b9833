//! Shared helpers.

pub mod decimal;

pub use decimal::{duration_hours, percentage_change, round_down_to_lot, safe_div};
