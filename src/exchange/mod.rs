//! Exchange side of the strategy.
//!
//! - `Broker`: price, balances and market-order execution for one pair
//! - `PaperBroker`: simulated fills against a `PriceFeed`
//! - `OkxTickerFeed` / `ScriptedFeed`: live public ticker or a fixed series

mod broker;
mod feed;
mod paper;
mod types;

pub use broker::Broker;
#[cfg(test)]
pub use broker::MockBroker;
pub use feed::{OkxTickerFeed, PriceFeed, ScriptedFeed};
pub use paper::{PaperAccount, PaperBroker};
pub use types::*;
