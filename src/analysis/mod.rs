//! Derived figures: funding carry, P&L, commission estimates and drawdown.

mod drawdown;

pub use drawdown::{DrawdownStats, DrawdownTracker};

use crate::config::StrategyConfig;
use crate::strategy::State;
use crate::utils::{duration_hours, safe_div};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

/// Mark-to-market P&L of the spot sleeve against a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PnlSummary {
    pub total: Decimal,
    /// Percent of the deposit (5 = 5%)
    pub percentage: Decimal,
}

/// Commission estimate from traded volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CommissionSummary {
    pub spot: Decimal,
    pub futures: Decimal,
}

impl CommissionSummary {
    pub fn total(&self) -> Decimal {
        self.spot + self.futures
    }
}

/// Funding accrued on every active hedge since its entry.
///
/// Each tier contributes `size × price × rate × hours / hours_per_funding`.
/// Inactive tiers and entries in the future contribute nothing.
pub fn funding_cost(state: &State, config: &StrategyConfig, now: DateTime<Utc>) -> Decimal {
    let period_hours = Decimal::from(config.hours_per_funding);

    state
        .active_tiers()
        .filter_map(|tier| {
            let leg = state.leg(tier);
            let entry_time = leg.entry_time()?;
            let position_value = leg.size * state.current_price;
            let periods = safe_div(duration_hours(now - entry_time), period_hours);
            Some(position_value * config.funding_rate * periods)
        })
        .sum()
}

/// `current_eth × price + current_usd − initial_deposit`, with its share
/// of the deposit. A non-positive deposit yields a zero percentage.
pub fn pnl(state: &State, initial_deposit: Decimal) -> PnlSummary {
    let total = state.total_position_value() - initial_deposit;
    let percentage = if initial_deposit > Decimal::ZERO {
        total / initial_deposit * dec!(100)
    } else {
        Decimal::ZERO
    };

    PnlSummary { total, percentage }
}

/// Commissions implied by the volume accumulators.
pub fn estimated_commissions(state: &State, config: &StrategyConfig) -> CommissionSummary {
    CommissionSummary {
        spot: state.total_spot_volume * config.spot_commission,
        futures: state.total_futures_volume * config.futures_commission,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{HedgeTier, OpenHedge};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn hedged_state() -> State {
        let mut state = State {
            current_price: dec!(2000),
            current_eth: dec!(0.5),
            current_usd: dec!(250),
            ..State::default()
        };
        state.legs[0].size = dec!(1);
        state.legs[0].position = Some(OpenHedge {
            entry_price: dec!(2100),
            entry_time: t0(),
        });
        // Planned but never opened
        state.legs[1].size = dec!(3);
        state
    }

    #[test]
    fn test_funding_cost_over_one_period() {
        let state = hedged_state();
        let config = StrategyConfig::default();

        let cost = funding_cost(&state, &config, t0() + Duration::hours(8));
        // 1 × 2000 × 0.0001 × 1 period
        assert_eq!(cost, dec!(0.2));

        let half = funding_cost(&state, &config, t0() + Duration::hours(4));
        assert_eq!(half, dec!(0.1));
    }

    #[test]
    fn test_funding_cost_zero_cases() {
        let config = StrategyConfig::default();
        let state = hedged_state();

        // Active tier, no time elapsed
        assert_eq!(funding_cost(&state, &config, t0()), Decimal::ZERO);
        // Clock behind the entry
        assert_eq!(
            funding_cost(&state, &config, t0() - Duration::hours(2)),
            Decimal::ZERO
        );

        // Inactive tiers contribute nothing however long ago
        let mut idle = state.clone();
        idle.legs[HedgeTier::H1.index()].position = None;
        assert_eq!(
            funding_cost(&idle, &config, t0() + Duration::days(365)),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_pnl() {
        let state = hedged_state();
        let summary = pnl(&state, dec!(1000));

        // 0.5 × 2000 + 250 − 1000
        assert_eq!(summary.total, dec!(250));
        assert_eq!(summary.percentage, dec!(25));
    }

    #[test]
    fn test_pnl_zero_deposit_has_zero_percentage() {
        let state = hedged_state();
        let summary = pnl(&state, Decimal::ZERO);

        assert_eq!(summary.total, dec!(1250));
        assert_eq!(summary.percentage, Decimal::ZERO);
    }

    #[test]
    fn test_estimated_commissions() {
        let state = State {
            total_spot_volume: dec!(10000),
            total_futures_volume: dec!(5000),
            ..State::default()
        };
        let summary = estimated_commissions(&state, &StrategyConfig::default());

        assert_eq!(summary.spot, dec!(10));
        assert_eq!(summary.futures, dec!(2));
        assert_eq!(summary.total(), dec!(12));
    }
}
