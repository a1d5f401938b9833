//! Broker capability consumed by the driver.

use super::types::{Balances, Fill, MarketOrder};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Venue-agnostic execution interface for a single pair.
///
/// Failures are reported, never retried here; retry or skip is the
/// caller's decision.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Latest traded price, or `None` when no usable quote is available.
    async fn current_price(&self) -> Result<Option<Decimal>>;

    async fn balances(&self) -> Result<Balances>;

    async fn execute(&self, order: &MarketOrder) -> Result<Fill>;
}
