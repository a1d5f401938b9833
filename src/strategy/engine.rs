//! Strategy engine: initialization, hedge ladder management, buy-the-dip,
//! rebalance-at-entry and full exit.
//!
//! Every sizing transition takes the state through an exclusive reference
//! and is all-or-nothing: work happens on a staged copy that is only written back
//! once leverage validation has passed. Sizing arithmetic is checked, so
//! inputs that overflow the decimal range fail instead of panicking.

use crate::config::StrategyConfig;
use crate::strategy::error::StrategyError;
use crate::strategy::state::{HedgeLeg, HedgeTier, OpenHedge, State, StrategyStatus};
use crate::utils::safe_div;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Position change produced by the engine, to be realized by the driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StrategyAction {
    /// Short `size` base units of futures
    HedgeOpened {
        tier: HedgeTier,
        size: Decimal,
        price: Decimal,
    },
    /// Buy back a short of `size` base units
    HedgeClosed {
        tier: HedgeTier,
        size: Decimal,
        price: Decimal,
        pnl: Decimal,
    },
    /// An open short changes size; `pnl` is realized on the part bought back
    HedgeResized {
        tier: HedgeTier,
        from: Decimal,
        to: Decimal,
        pnl: Decimal,
    },
    SpotBought { quantity: Decimal, price: Decimal },
    SpotSold { quantity: Decimal, price: Decimal },
}

/// Outcome of one evaluation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub price: Decimal,
    /// Committed actions, in the order they were applied
    pub actions: Vec<StrategyAction>,
    /// Set when buy-the-dip or rebalance-at-entry was rolled back
    pub rolled_back: Option<StrategyError>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn was_rolled_back(&self) -> bool {
        self.rolled_back.is_some()
    }

    /// Realized P&L from hedges closed or shrunk in this cycle.
    pub fn realized_hedge_pnl(&self) -> Decimal {
        realized_hedge_pnl(&self.actions)
    }
}

/// Result of closing everything.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitOutcome {
    /// Hedge P&L plus final spot value minus the original deposit
    pub realized_pnl: Decimal,
    pub actions: Vec<StrategyAction>,
}

/// Sizing fell back to zero because its inputs left nothing to divide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegenerateSizing {
    /// No base holding above the buffer to insure
    NoExposure,
    /// Tier level sits at or below the buffer
    LevelAtBuffer(HedgeTier),
}

/// Proposed ladder sizes and the leverage they would require.
#[derive(Debug, Clone, PartialEq)]
pub struct HedgeSizing {
    pub sizes: [Decimal; 3],
    pub required_leverage: Decimal,
    pub warnings: Vec<DegenerateSizing>,
}

/// Fixed-rule policy over a single `State`.
#[derive(Debug, Clone)]
pub struct StrategyEngine {
    config: StrategyConfig,
}

impl StrategyEngine {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Build a fresh state at `current_price` with `deposit` of quote capital.
    ///
    /// The spot sleeve is split between base asset and cash; hedge sizes
    /// start at zero until `recompute_hedge_sizes` is called.
    pub fn initialize(&self, current_price: Decimal, deposit: Decimal) -> Result<State, StrategyError> {
        ensure_positive("price", current_price)?;
        ensure_positive("deposit", deposit)?;

        let cfg = &self.config;
        let spot_sleeve = checked_mul("deposit", deposit, cfg.spot_allocation)?;
        let base_value = checked_mul("deposit", spot_sleeve, cfg.spot_base_fraction)?;
        let initial_eth = checked_div("price", base_value, current_price)?;

        let mut legs = [HedgeLeg::default(); 3];
        for tier in HedgeTier::ALL {
            let level = checked_mul("price", current_price, cfg.hedge_level_mults[tier.index()])?;
            legs[tier.index()] = HedgeLeg::new(level);
        }

        let state = State {
            entry_price: current_price,
            current_price,
            deposit,
            upper: checked_mul("price", current_price, cfg.upper_band_mult)?,
            lower: checked_mul("price", current_price, cfg.lower_band_mult)?,
            buffer: checked_mul("price", current_price, cfg.buffer_mult)?,
            initial_eth,
            current_eth: initial_eth,
            current_usd: spot_sleeve - base_value,
            legs,
            total_spot_volume: Decimal::ZERO,
            total_futures_volume: Decimal::ZERO,
            status: StrategyStatus::Initializing,
        };

        info!(
            entry_price = %state.entry_price,
            %deposit,
            upper = %state.upper,
            lower = %state.lower,
            buffer = %state.buffer,
            initial_eth = %state.initial_eth,
            cash = %state.current_usd,
            "Strategy initialized"
        );

        Ok(state)
    }

    /// Size each tier so the ladder absorbs the loss on the base holding
    /// if price falls to the buffer. Does not touch the state.
    pub fn compute_hedge_sizes(&self, state: &State) -> Result<HedgeSizing, StrategyError> {
        let mut warnings = Vec::new();
        let mut sizes = [Decimal::ZERO; 3];

        let headroom = checked_sub("price", state.current_price, state.buffer)?;
        let max_loss = checked_mul("current_eth", state.current_eth, headroom)?;
        if max_loss <= Decimal::ZERO {
            warnings.push(DegenerateSizing::NoExposure);
        } else {
            for tier in HedgeTier::ALL {
                let distance = checked_sub("level", state.leg(tier).level, state.buffer)?;
                if distance <= Decimal::ZERO {
                    warnings.push(DegenerateSizing::LevelAtBuffer(tier));
                    continue;
                }
                let weighted = checked_mul("current_eth", self.config.hedge_weights[tier.index()], max_loss)?;
                sizes[tier.index()] = checked_div("current_eth", weighted, distance)?;
            }
        }

        let required_leverage = self.required_leverage(state, &sizes)?;
        Ok(HedgeSizing {
            sizes,
            required_leverage,
            warnings,
        })
    }

    /// Leverage the hedge sleeve needs to carry the state's current sizes.
    pub fn validate_leverage(&self, state: &State) -> Result<Decimal, StrategyError> {
        let sizes = state.legs.map(|leg| leg.size);
        self.check_leverage(self.required_leverage(state, &sizes)?)
    }

    /// Recompute all tier sizes, active or not.
    ///
    /// Fails with `LeverageExceeded` without touching the state. Returns a
    /// resize action for every active tier whose size changed.
    pub fn recompute_hedge_sizes(&self, state: &mut State) -> Result<Vec<StrategyAction>, StrategyError> {
        let sizing = self.compute_hedge_sizes(state)?;
        self.check_leverage(sizing.required_leverage)?;

        for warning in &sizing.warnings {
            warn!(
                ?warning,
                price = %state.current_price,
                buffer = %state.buffer,
                eth = %state.current_eth,
                "Degenerate hedge sizing, using zero size"
            );
        }

        let price = state.current_price;
        let mut actions = Vec::new();
        for tier in HedgeTier::ALL {
            let leg = state.leg_mut(tier);
            let to = sizing.sizes[tier.index()];
            if leg.is_active() && leg.size != to {
                let reduced = (leg.size - to).max(Decimal::ZERO);
                let pnl = reduced * (leg.entry_price() - price);
                actions.push(StrategyAction::HedgeResized {
                    tier,
                    from: leg.size,
                    to,
                    pnl,
                });
            }
            leg.size = to;
        }

        debug!(
            h1 = %sizing.sizes[0],
            h2 = %sizing.sizes[1],
            h3 = %sizing.sizes[2],
            leverage = %sizing.required_leverage,
            "Hedge sizes recomputed"
        );

        Ok(actions)
    }

    /// Open every inactive tier whose trigger the current price has reached,
    /// in ascending tier order.
    pub fn manage_hedges(&self, state: &mut State, now: DateTime<Utc>) -> Vec<StrategyAction> {
        let mut actions = Vec::new();
        for tier in HedgeTier::ALL {
            let leg = state.leg(tier);
            if !leg.is_active() && state.current_price <= leg.level {
                actions.push(Self::open_hedge(state, tier, now));
            }
        }
        actions
    }

    fn open_hedge(state: &mut State, tier: HedgeTier, now: DateTime<Utc>) -> StrategyAction {
        let price = state.current_price;
        let leg = state.leg_mut(tier);
        leg.position = Some(OpenHedge {
            entry_price: price,
            entry_time: now,
        });
        let size = leg.size;
        state.total_futures_volume += size * price;

        info!(%tier, %size, %price, "Hedge opened");
        StrategyAction::HedgeOpened { tier, size, price }
    }

    /// Close `tier` and return its realized P&L. Closing an inactive tier
    /// is a no-op that returns zero.
    pub fn close_hedge(&self, state: &mut State, tier: HedgeTier) -> Decimal {
        match Self::take_hedge(state, tier) {
            Some(StrategyAction::HedgeClosed { pnl, .. }) => pnl,
            _ => Decimal::ZERO,
        }
    }

    fn take_hedge(state: &mut State, tier: HedgeTier) -> Option<StrategyAction> {
        let price = state.current_price;
        let leg = state.leg_mut(tier);
        let open = leg.position.take()?;

        let size = leg.size;
        // Short: profit when price is below entry
        let pnl = size * (open.entry_price - price);
        leg.size = Decimal::ZERO;

        info!(%tier, %size, entry = %open.entry_price, %price, %pnl, "Hedge closed");
        Some(StrategyAction::HedgeClosed {
            tier,
            size,
            price,
            pnl,
        })
    }

    /// Deploy all cash into the base asset, then resize the ladder.
    pub fn buy_the_dip(&self, state: &mut State) -> Result<Vec<StrategyAction>, StrategyError> {
        let mut next = state.clone();
        let mut actions = Vec::new();

        let price = next.current_price;
        let quantity = safe_div(next.current_usd, price);
        if quantity > Decimal::ZERO {
            next.current_eth += quantity;
            next.total_spot_volume += quantity * price;
            next.current_usd = Decimal::ZERO;
            actions.push(StrategyAction::SpotBought { quantity, price });
            info!(%quantity, %price, eth = %next.current_eth, "Buy-the-dip: cash deployed");
        }

        actions.extend(self.recompute_hedge_sizes(&mut next)?);
        *state = next;
        Ok(actions)
    }

    /// Sell part of the base holding, unwind tiers 3 then 2, and resize.
    pub fn rebalance_at_entry(&self, state: &mut State) -> Result<Vec<StrategyAction>, StrategyError> {
        let mut next = state.clone();
        let mut actions = Vec::new();

        let price = next.current_price;
        let quantity = next.current_eth * self.config.rebalance_sell_fraction;
        if quantity > Decimal::ZERO {
            let proceeds = quantity * price;
            next.current_eth -= quantity;
            next.current_usd += proceeds;
            next.total_spot_volume += proceeds;
            actions.push(StrategyAction::SpotSold { quantity, price });
            info!(%quantity, %price, cash = %next.current_usd, "Rebalance: base sold");
        }

        // Deepest tier first
        actions.extend(Self::take_hedge(&mut next, HedgeTier::H3));
        actions.extend(Self::take_hedge(&mut next, HedgeTier::H2));

        actions.extend(self.recompute_hedge_sizes(&mut next)?);
        *state = next;
        Ok(actions)
    }

    /// Apply one price sample.
    ///
    /// Runs hedge opening, buy-the-dip and rebalance-at-entry in that order,
    /// each on its own guard, so several may fire in one cycle. Hedge opens
    /// are committed first; a branch that fails (normally on the leverage
    /// limit) is rolled back alone and reported through
    /// `CycleReport::rolled_back`. Errors are only returned before the state
    /// is touched.
    pub fn evaluate(
        &self,
        state: &mut State,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, StrategyError> {
        ensure_positive("price", price)?;
        let ceiling = checked_mul("price", state.entry_price, self.config.rebalance_ceiling_mult)?;

        state.update_price(price);
        let mut actions = Vec::new();
        let mut rolled_back = None;
        let mut status = StrategyStatus::InPosition;

        if state.current_price < state.entry_price {
            let opened = self.manage_hedges(state, now);
            if !opened.is_empty() {
                status = StrategyStatus::Hedging;
            }
            actions.extend(opened);
        }

        if state.current_price <= state.buffer {
            match self.buy_the_dip(state) {
                Ok(bought) => actions.extend(bought),
                Err(e) => {
                    warn!(%price, error = %e, "Buy-the-dip rolled back");
                    rolled_back = Some(e);
                }
            }
        }

        if state.buffer < state.current_price && state.current_price <= ceiling {
            match self.rebalance_at_entry(state) {
                Ok(rebalanced) => {
                    actions.extend(rebalanced);
                    status = StrategyStatus::Rebalancing;
                }
                Err(e) => {
                    warn!(%price, error = %e, "Rebalance rolled back");
                    rolled_back = Some(e);
                }
            }
        }

        state.status = status;

        debug!(%price, actions = actions.len(), status = %status, "Cycle evaluated");
        Ok(CycleReport {
            price,
            actions,
            rolled_back,
        })
    }

    /// Close all hedges (tiers 1, 2, 3), liquidate the base holding and
    /// report P&L against the original deposit.
    pub fn exit_all_positions(&self, state: &mut State) -> ExitOutcome {
        let mut actions: Vec<StrategyAction> = HedgeTier::ALL
            .into_iter()
            .filter_map(|tier| Self::take_hedge(state, tier))
            .collect();

        let hedge_pnl = realized_hedge_pnl(&actions);

        let price = state.current_price;
        let quantity = state.current_eth;
        let eth_value = quantity * price;
        if quantity > Decimal::ZERO {
            actions.push(StrategyAction::SpotSold { quantity, price });
            state.total_spot_volume += eth_value;
        }
        state.current_eth = Decimal::ZERO;
        state.current_usd += eth_value;
        state.status = StrategyStatus::Stopped;

        let realized_pnl = hedge_pnl + state.current_usd - state.deposit;
        info!(%hedge_pnl, %eth_value, cash = %state.current_usd, %realized_pnl, "All positions exited");

        ExitOutcome {
            realized_pnl,
            actions,
        }
    }

    fn required_leverage(&self, state: &State, sizes: &[Decimal; 3]) -> Result<Decimal, StrategyError> {
        let mut notional = Decimal::ZERO;
        for tier in HedgeTier::ALL {
            let leg_notional = checked_mul("size", sizes[tier.index()], state.leg(tier).level)?;
            notional = notional.checked_add(leg_notional).ok_or_else(|| overflow("size", leg_notional))?;
        }
        let margin = checked_mul("deposit", state.deposit, self.config.hedge_allocation)?;
        if margin == Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        checked_div("deposit", notional, margin)
    }

    fn check_leverage(&self, required: Decimal) -> Result<Decimal, StrategyError> {
        if required > self.config.max_leverage {
            return Err(StrategyError::LeverageExceeded {
                required,
                max: self.config.max_leverage,
            });
        }
        Ok(required)
    }
}

/// Hedge P&L realized by a list of actions.
pub fn realized_hedge_pnl(actions: &[StrategyAction]) -> Decimal {
    actions
        .iter()
        .map(|a| match a {
            StrategyAction::HedgeClosed { pnl, .. } | StrategyAction::HedgeResized { pnl, .. } => *pnl,
            _ => Decimal::ZERO,
        })
        .sum()
}

/// Spot value change versus the initial base holding at `initial_price`.
pub fn delta_spot(state: &State, initial_price: Decimal) -> Decimal {
    state.current_eth * state.current_price - state.initial_eth * initial_price
}

/// Unrealized P&L of the active short hedges.
pub fn delta_hedge(state: &State) -> Decimal {
    state
        .active_tiers()
        .map(|t| {
            let leg = state.leg(t);
            leg.size * (leg.entry_price() - state.current_price)
        })
        .sum()
}

fn ensure_positive(field: &'static str, value: Decimal) -> Result<(), StrategyError> {
    if value <= Decimal::ZERO {
        return Err(StrategyError::InvalidInput {
            field,
            value,
            reason: "must be positive",
        });
    }
    Ok(())
}

fn overflow(field: &'static str, value: Decimal) -> StrategyError {
    StrategyError::InvalidInput {
        field,
        value,
        reason: "out of decimal range",
    }
}

fn checked_mul(field: &'static str, a: Decimal, b: Decimal) -> Result<Decimal, StrategyError> {
    a.checked_mul(b).ok_or_else(|| overflow(field, a))
}

fn checked_div(field: &'static str, a: Decimal, b: Decimal) -> Result<Decimal, StrategyError> {
    a.checked_div(b).ok_or_else(|| overflow(field, a))
}

fn checked_sub(field: &'static str, a: Decimal, b: Decimal) -> Result<Decimal, StrategyError> {
    a.checked_sub(b).ok_or_else(|| overflow(field, a))
}
