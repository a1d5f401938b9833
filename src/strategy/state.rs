//! Strategy state: position, bands, hedge ladder and accounting totals.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the three hedge ladder slots. Lower slots trigger at deeper drawdowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HedgeTier {
    H1,
    H2,
    H3,
}

impl HedgeTier {
    /// All tiers in ascending index order.
    pub const ALL: [HedgeTier; 3] = [HedgeTier::H1, HedgeTier::H2, HedgeTier::H3];

    /// Array slot (0..=2).
    pub fn index(self) -> usize {
        match self {
            HedgeTier::H1 => 0,
            HedgeTier::H2 => 1,
            HedgeTier::H3 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HedgeTier::H1 => "h1",
            HedgeTier::H2 => "h2",
            HedgeTier::H3 => "h3",
        }
    }
}

impl fmt::Display for HedgeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry record of an open short hedge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpenHedge {
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
}

/// A single rung of the hedge ladder.
///
/// `size` is the planned (or, while open, the held) short quantity in base
/// units. The leg is active exactly when `position` is set, so an entry price
/// and entry time can only exist together.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HedgeLeg {
    /// Trigger price, fixed at initialization
    pub level: Decimal,
    pub size: Decimal,
    pub position: Option<OpenHedge>,
}

impl HedgeLeg {
    pub fn new(level: Decimal) -> Self {
        Self {
            level,
            size: Decimal::ZERO,
            position: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.position.is_some()
    }

    /// Entry price, or zero while inactive.
    pub fn entry_price(&self) -> Decimal {
        self.position.map(|p| p.entry_price).unwrap_or(Decimal::ZERO)
    }

    pub fn entry_time(&self) -> Option<DateTime<Utc>> {
        self.position.map(|p| p.entry_time)
    }
}

/// Advisory lifecycle tag. Nothing enforces which tag may follow which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    #[default]
    Initializing,
    Scanning,
    Waiting,
    EnteringPosition,
    InPosition,
    ExitingPosition,
    Hedging,
    Rebalancing,
    Stopped,
    Error,
}

impl StrategyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyStatus::Initializing => "initializing",
            StrategyStatus::Scanning => "scanning",
            StrategyStatus::Waiting => "waiting",
            StrategyStatus::EnteringPosition => "entering_position",
            StrategyStatus::InPosition => "in_position",
            StrategyStatus::ExitingPosition => "exiting_position",
            StrategyStatus::Hedging => "hedging",
            StrategyStatus::Rebalancing => "rebalancing",
            StrategyStatus::Stopped => "stopped",
            StrategyStatus::Error => "error",
        }
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown strategy status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for StrategyStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "initializing" => StrategyStatus::Initializing,
            "scanning" => StrategyStatus::Scanning,
            "waiting" => StrategyStatus::Waiting,
            "entering_position" => StrategyStatus::EnteringPosition,
            "in_position" => StrategyStatus::InPosition,
            "exiting_position" => StrategyStatus::ExitingPosition,
            "hedging" => StrategyStatus::Hedging,
            "rebalancing" => StrategyStatus::Rebalancing,
            "stopped" => StrategyStatus::Stopped,
            "error" => StrategyStatus::Error,
            other => return Err(UnknownStatus(other.to_string())),
        };
        Ok(status)
    }
}

/// Complete mutable state of the strategy.
///
/// Owned by a single driver and only changed through `StrategyEngine`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct State {
    pub entry_price: Decimal,
    pub current_price: Decimal,
    /// Initial capital in quote currency
    pub deposit: Decimal,

    // Bands
    pub upper: Decimal,
    pub lower: Decimal,
    pub buffer: Decimal,

    // Holdings
    pub initial_eth: Decimal,
    pub current_eth: Decimal,
    pub current_usd: Decimal,

    /// Hedge ladder indexed by `HedgeTier::index()`
    pub legs: [HedgeLeg; 3],

    // Commission accounting
    pub total_spot_volume: Decimal,
    pub total_futures_volume: Decimal,

    pub status: StrategyStatus,
}

impl State {
    pub fn update_price(&mut self, price: Decimal) {
        self.current_price = price;
    }

    pub fn leg(&self, tier: HedgeTier) -> &HedgeLeg {
        &self.legs[tier.index()]
    }

    pub fn leg_mut(&mut self, tier: HedgeTier) -> &mut HedgeLeg {
        &mut self.legs[tier.index()]
    }

    pub fn is_active(&self, tier: HedgeTier) -> bool {
        self.leg(tier).is_active()
    }

    pub fn active_tiers(&self) -> impl Iterator<Item = HedgeTier> + '_ {
        HedgeTier::ALL.into_iter().filter(|t| self.is_active(*t))
    }

    /// Spot sleeve value in quote currency.
    pub fn total_position_value(&self) -> Decimal {
        self.current_eth * self.current_price + self.current_usd
    }

    /// Notional of all active hedges at the current price.
    pub fn total_hedge_value(&self) -> Decimal {
        self.active_tiers()
            .map(|t| self.leg(t).size * self.current_price)
            .sum()
    }
}
