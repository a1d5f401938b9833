//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Strategy state (bands, holdings, hedge ladder, volume totals)
//! - Hedge tier sizing under a leverage cap
//! - Per-cycle guard chain: hedge opening, buy-the-dip, rebalance-at-entry
//! - Full exit with realized P&L

mod engine;
mod error;
mod state;

pub use engine::{
    delta_hedge, delta_spot, realized_hedge_pnl, CycleReport, DegenerateSizing, ExitOutcome, HedgeSizing,
    StrategyAction, StrategyEngine,
};
pub use error::StrategyError;
pub use state::{HedgeLeg, HedgeTier, OpenHedge, State, StrategyStatus, UnknownStatus};
