//! # Hedge Ladder
//!
//! Holds a spot position in one pair and protects it with a ladder of
//! three short perpetual hedges that open as price falls, buys the dip at
//! the buffer and rebalances when price recovers to the entry.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `strategy`: State model and the engine's transition rules
//! - `analysis`: Funding accrual, P&L, commissions and drawdown
//! - `snapshot`: Flat serializable record of the state
//! - `persistence`: SQLite store for snapshots, trades and P&L history
//! - `exchange`: Broker contract, paper broker and price feeds
//! - `driver`: Polling loop that realizes engine actions through a broker
//! - `replay`: Price files for offline runs
//! - `utils`: Shared utilities and decimal arithmetic

pub mod analysis;
pub mod config;
pub mod driver;
pub mod exchange;
pub mod persistence;
pub mod replay;
pub mod snapshot;
pub mod strategy;
pub mod utils;

pub use config::Config;
