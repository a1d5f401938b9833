//! Polling loop that connects the strategy engine to a broker.
//!
//! The driver owns the single `State`. Each cycle it:
//! 1. Polls the broker for a price (skips the cycle if none)
//! 2. Runs the engine's guard chain with the clock's time
//! 3. Turns the resulting actions into market orders
//! 4. Persists the snapshot and, on its interval, a status report

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use crate::analysis::{self, DrawdownStats, DrawdownTracker};
use crate::config::DriverConfig;
use crate::exchange::{Broker, Fill, MarketOrder, OrderSide};
use crate::persistence::{PnlRecord, SnapshotStore, TradeRecord};
use crate::snapshot::{from_snapshot, to_snapshot};
use crate::strategy::{
    delta_hedge, delta_spot, CycleReport, ExitOutcome, State, StrategyAction, StrategyEngine,
    StrategyError, StrategyStatus,
};
use crate::utils::{percentage_change, round_down_to_lot};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Driver<B: Broker, C: Clock> {
    engine: StrategyEngine,
    config: DriverConfig,
    broker: B,
    clock: C,
    store: SnapshotStore,
    state: Option<State>,
    drawdown: Option<DrawdownTracker>,
    last_status: Option<DateTime<Utc>>,
}

impl<B: Broker, C: Clock> Driver<B, C> {
    pub fn new(
        engine: StrategyEngine,
        config: DriverConfig,
        broker: B,
        clock: C,
        store: SnapshotStore,
    ) -> Self {
        Self {
            engine,
            config,
            broker,
            clock,
            store,
            state: None,
            drawdown: None,
            last_status: None,
        }
    }

    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Equity drawdown since start, sampled at each status report.
    pub fn drawdown(&self) -> Option<DrawdownStats> {
        self.drawdown.as_ref().map(DrawdownTracker::statistics)
    }

    /// Resume from the stored snapshot, or initialize a new run from the
    /// broker's price and balances.
    pub async fn start(&mut self) -> Result<()> {
        let now = self.clock.now();

        if let Some((snapshot, saved_at)) = self.store.load_snapshot()? {
            let state = from_snapshot(&snapshot).context("Stored snapshot is invalid")?;
            if state.status != StrategyStatus::Stopped {
                info!(
                    status = %state.status,
                    entry_price = %state.entry_price,
                    %saved_at,
                    "Resuming from stored snapshot"
                );
                self.begin(state, now);
                return Ok(());
            }
            info!(%saved_at, "Previous run was stopped, starting fresh");
        }

        let price = self
            .broker
            .current_price()
            .await
            .context("Failed to fetch start price")?
            .context("No price available at start")?;
        let balances = self
            .broker
            .balances()
            .await
            .context("Failed to fetch balances")?;
        let deposit = balances.value_at(price);

        info!(
            %price,
            quote = %balances.quote,
            base = %balances.base,
            %deposit,
            "Starting new run"
        );

        let mut state = self.engine.initialize(price, deposit)?;
        self.engine
            .recompute_hedge_sizes(&mut state)
            .context("Hedge ladder does not fit within the leverage limit")?;

        let shortfall = round_down_to_lot(state.initial_eth - balances.base, self.config.lot_size);
        if shortfall > Decimal::ZERO {
            let order = MarketOrder::spot(OrderSide::Buy, shortfall);
            let fill = self
                .broker
                .execute(&order)
                .await
                .context("Initial base purchase failed")?;
            self.record_trade(&order, &fill, "initial_buy", now);
            info!(quantity = %fill.quantity, price = %fill.price, "Initial base purchase filled");
        }

        self.begin(state, now);
        Ok(())
    }

    fn begin(&mut self, state: State, now: DateTime<Utc>) {
        let equity = state.total_position_value() + delta_hedge(&state);
        self.drawdown = Some(DrawdownTracker::new(self.config.max_drawdown, equity, now));
        self.state = Some(state);
        self.last_status = Some(now);
        self.persist(now);
    }

    /// Run one evaluation cycle.
    ///
    /// Returns `None` when the cycle was skipped for lack of a price. A
    /// branch the engine rolled back still leaves the cycle's committed
    /// actions to realize.
    pub async fn cycle(&mut self) -> Result<Option<CycleReport>> {
        if self.state.is_none() {
            bail!("Driver has not been started");
        }

        let price = match self.broker.current_price().await {
            Ok(Some(price)) => price,
            Ok(None) => {
                warn!("Price unavailable, skipping cycle");
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "Price fetch failed, skipping cycle");
                return Ok(None);
            }
        };
        let now = self.clock.now();

        let report = {
            let state = self.state.as_mut().context("Driver has not been started")?;
            self.engine.evaluate(state, price, now)?
        };
        match &report.rolled_back {
            Some(StrategyError::LeverageExceeded { required, max }) => warn!(
                %price,
                %required,
                %max,
                committed = report.actions.len(),
                "Leverage limit hit, branch rolled back"
            ),
            Some(e) => warn!(%price, error = %e, "Branch rolled back"),
            None => {}
        }

        self.realize(&report.actions, now).await;
        self.persist(now);
        self.maybe_report_status(now).await;

        Ok(Some(report))
    }

    /// Exit every position and persist the stopped state.
    pub async fn shutdown(&mut self) -> Result<Option<ExitOutcome>> {
        let now = self.clock.now();
        let Some(state) = self.state.as_mut() else {
            return Ok(None);
        };
        if state.status == StrategyStatus::Stopped {
            return Ok(None);
        }

        let outcome = self.engine.exit_all_positions(state);
        self.realize(&outcome.actions, now).await;
        self.persist(now);
        self.report_status(now).await;

        info!(realized_pnl = %outcome.realized_pnl, "Strategy stopped");
        Ok(Some(outcome))
    }

    /// Poll until `shutdown` is set, then exit all positions.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let interval = Duration::from_secs(self.config.poll_interval_secs);

        while !shutdown.load(Ordering::SeqCst) {
            match self.cycle().await {
                Ok(Some(report)) if !report.is_idle() => {
                    debug!(actions = report.actions.len(), "Cycle applied")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Cycle failed"),
            }
            tokio::time::sleep(interval).await;
        }

        self.shutdown().await?;
        Ok(())
    }

    async fn realize(&self, actions: &[StrategyAction], now: DateTime<Utc>) {
        for action in actions {
            let Some(order) = order_for(action, self.config.lot_size) else {
                debug!(?action, "No order needed");
                continue;
            };

            match self.broker.execute(&order).await {
                Ok(fill) => self.record_trade(&order, &fill, &action_reason(action), now),
                Err(e) => error!(
                    error = %e,
                    market = %order.market,
                    side = %order.side,
                    quantity = %order.quantity,
                    "Order failed, skipping"
                ),
            }
        }
    }

    fn record_trade(&self, order: &MarketOrder, fill: &Fill, reason: &str, now: DateTime<Utc>) {
        let trade = TradeRecord {
            timestamp: now,
            market: order.market.as_str().to_string(),
            side: order.side.as_str().to_string(),
            quantity: fill.quantity,
            price: fill.price,
            fee: fill.fee,
            reason: reason.to_string(),
        };
        if let Err(e) = self.store.record_trade(&trade) {
            warn!(error = %e, "Failed to record trade");
        }
    }

    fn persist(&self, now: DateTime<Utc>) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        if let Err(e) = self.store.save_snapshot(&to_snapshot(state), now) {
            error!(error = %e, "Failed to save state snapshot");
        }
    }

    async fn maybe_report_status(&mut self, now: DateTime<Utc>) {
        let interval = ChronoDuration::seconds(self.config.status_interval_secs as i64);
        let due = self.last_status.map_or(true, |last| now - last >= interval);
        if due {
            self.report_status(now).await;
        }
    }

    async fn report_status(&mut self, now: DateTime<Utc>) {
        self.last_status = Some(now);
        let Some(state) = self.state.as_ref() else {
            return;
        };

        let cfg = self.engine.config();
        let pnl = analysis::pnl(state, state.deposit);
        let funding = analysis::funding_cost(state, cfg, now);
        let commissions = analysis::estimated_commissions(state, cfg);
        let hedge_pnl = delta_hedge(state);
        let equity = state.total_position_value() + hedge_pnl;

        info!(
            price = %state.current_price,
            change_pct = %percentage_change(state.current_price, state.entry_price).round_dp(2),
            eth = %state.current_eth,
            usd = %state.current_usd.round_dp(2),
            pnl = %pnl.total.round_dp(2),
            pnl_pct = %pnl.percentage.round_dp(2),
            spot_delta = %delta_spot(state, state.entry_price).round_dp(2),
            hedge_pnl = %hedge_pnl.round_dp(2),
            hedge_notional = %state.total_hedge_value().round_dp(2),
            funding = %funding.round_dp(4),
            commissions = %commissions.total().round_dp(4),
            status = %state.status,
            "Strategy status"
        );
        for tier in state.active_tiers() {
            let leg = state.leg(tier);
            info!(%tier, size = %leg.size, entry = %leg.entry_price(), "Active hedge");
        }

        if let Some(tracker) = self.drawdown.as_mut() {
            if tracker.update(equity, now) {
                warn!(
                    drawdown = %tracker.current_drawdown().round_dp(4),
                    limit = %self.config.max_drawdown,
                    peak = %tracker.peak_equity(),
                    "Drawdown limit reached"
                );
            }
        }

        let record = PnlRecord {
            timestamp: now,
            price: state.current_price,
            equity,
            pnl: pnl.total,
            pnl_pct: pnl.percentage,
            funding_cost: funding,
            commissions: commissions.total(),
        };
        if let Err(e) = self.store.record_pnl(&record) {
            warn!(error = %e, "Failed to record P&L snapshot");
        }

        // The state is the strategy's own book; the account only gets compared
        match self.broker.balances().await {
            Ok(balances) => {
                let drift = balances.base - state.current_eth;
                if drift.abs() >= self.config.lot_size {
                    warn!(
                        account_base = %balances.base,
                        book_base = %state.current_eth,
                        %drift,
                        "Account base balance differs from strategy book"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to fetch balances for status"),
        }
    }
}

/// Broker order that realizes an engine action, with the quantity rounded
/// down to the lot size. `None` if nothing tradable remains.
///
/// Hedge sizes are rounded before they are differenced, so the orders for
/// one tier's open, resizes and close net to zero on the broker.
pub fn order_for(action: &StrategyAction, lot_size: Decimal) -> Option<MarketOrder> {
    let lot = |size: Decimal| round_down_to_lot(size, lot_size);
    let order = match *action {
        StrategyAction::HedgeOpened { size, .. } => MarketOrder::futures(OrderSide::Sell, lot(size)),
        StrategyAction::HedgeClosed { size, .. } => MarketOrder::futures(OrderSide::Buy, lot(size)),
        StrategyAction::HedgeResized { from, to, .. } => {
            let (from, to) = (lot(from), lot(to));
            if to > from {
                MarketOrder::futures(OrderSide::Sell, to - from)
            } else {
                MarketOrder::futures(OrderSide::Buy, from - to)
            }
        }
        StrategyAction::SpotBought { quantity, .. } => MarketOrder::spot(OrderSide::Buy, lot(quantity)),
        StrategyAction::SpotSold { quantity, .. } => MarketOrder::spot(OrderSide::Sell, lot(quantity)),
    };

    (order.quantity > Decimal::ZERO).then_some(order)
}

fn action_reason(action: &StrategyAction) -> String {
    match action {
        StrategyAction::HedgeOpened { tier, .. } => format!("hedge_opened {}", tier),
        StrategyAction::HedgeClosed { tier, .. } => format!("hedge_closed {}", tier),
        StrategyAction::HedgeResized { tier, .. } => format!("hedge_resized {}", tier),
        StrategyAction::SpotBought { .. } => "spot_bought".to_string(),
        StrategyAction::SpotSold { .. } => "spot_sold".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::exchange::{Market, MockBroker, PaperBroker, ScriptedFeed};
    use crate::strategy::HedgeTier;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn paper_driver(
        strategy: StrategyConfig,
        prices: &[Decimal],
    ) -> (Driver<PaperBroker, ManualClock>, ManualClock) {
        let feed = Arc::new(ScriptedFeed::new(prices.iter().copied()));
        let broker = PaperBroker::new(
            feed,
            dec!(1000),
            Decimal::ZERO,
            strategy.spot_commission,
            strategy.futures_commission,
        );
        let clock = ManualClock::new(t0());
        let driver = Driver::new(
            StrategyEngine::new(strategy),
            DriverConfig::default(),
            broker,
            clock.clone(),
            SnapshotStore::new(":memory:").unwrap(),
        );
        (driver, clock)
    }

    /// Driver over a mock broker, resumed from a stored state at 2000 / 1000.
    async fn resumed_driver(broker: MockBroker) -> (Driver<MockBroker, ManualClock>, State) {
        let engine = StrategyEngine::new(StrategyConfig::default());
        let mut state = engine.initialize(dec!(2000), dec!(1000)).unwrap();
        engine.recompute_hedge_sizes(&mut state).unwrap();

        let store = SnapshotStore::new(":memory:").unwrap();
        store.save_snapshot(&to_snapshot(&state), t0()).unwrap();

        let mut driver = Driver::new(
            engine,
            DriverConfig::default(),
            broker,
            ManualClock::new(t0()),
            store,
        );
        driver.start().await.unwrap();
        (driver, state)
    }

    #[test]
    fn test_order_for_actions() {
        let lot = dec!(0.0001);

        let open = StrategyAction::HedgeOpened {
            tier: HedgeTier::H1,
            size: dec!(0.05),
            price: dec!(1950),
        };
        assert_eq!(
            order_for(&open, lot),
            Some(MarketOrder::futures(OrderSide::Sell, dec!(0.05)))
        );

        let shrink = StrategyAction::HedgeResized {
            tier: HedgeTier::H1,
            from: dec!(0.05),
            to: dec!(0.0171875),
            pnl: dec!(1.64),
        };
        assert_eq!(
            order_for(&shrink, lot),
            Some(MarketOrder::futures(OrderSide::Buy, dec!(0.0329)))
        );

        // Residue below one lot on both sides nets to nothing
        let creep = StrategyAction::HedgeResized {
            tier: HedgeTier::H2,
            from: dec!(0.01714),
            to: dec!(0.01718),
            pnl: Decimal::ZERO,
        };
        assert_eq!(order_for(&creep, lot), None);

        let sold = StrategyAction::SpotSold {
            quantity: dec!(0.09375),
            price: dec!(1950),
        };
        let order = order_for(&sold, lot).unwrap();
        assert_eq!(order.market, Market::Spot);
        assert_eq!(order.quantity, dec!(0.0937));

        // Below one lot
        let dust = StrategyAction::SpotBought {
            quantity: dec!(0.00005),
            price: dec!(1950),
        };
        assert_eq!(order_for(&dust, lot), None);
    }

    #[test]
    fn test_hedge_orders_net_to_zero_per_tier() {
        let lot = dec!(0.0001);
        let sizes = [dec!(0.05), dec!(0.0171875), dec!(0.02349), dec!(0.0000875)];

        let mut actions = vec![StrategyAction::HedgeOpened {
            tier: HedgeTier::H1,
            size: sizes[0],
            price: dec!(1950),
        }];
        for pair in sizes.windows(2) {
            actions.push(StrategyAction::HedgeResized {
                tier: HedgeTier::H1,
                from: pair[0],
                to: pair[1],
                pnl: Decimal::ZERO,
            });
        }
        actions.push(StrategyAction::HedgeClosed {
            tier: HedgeTier::H1,
            size: sizes[3],
            price: dec!(1990),
            pnl: Decimal::ZERO,
        });

        let net: Decimal = actions
            .iter()
            .filter_map(|a| order_for(a, lot))
            .map(|o| match o.side {
                OrderSide::Sell => -o.quantity,
                OrderSide::Buy => o.quantity,
            })
            .sum();
        assert_eq!(net, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_fresh_start_cycle_and_shutdown() {
        let (mut driver, clock) = paper_driver(StrategyConfig::default(), &[dec!(2000), dec!(1950)]);
        driver.start().await.unwrap();

        let state = driver.state().unwrap();
        assert_eq!(state.deposit, dec!(1000));
        assert_eq!(state.initial_eth, dec!(0.1875));
        // Ladder armed before the first cycle
        assert_eq!(state.leg(HedgeTier::H1).size, dec!(0.05));
        assert_eq!(state.leg(HedgeTier::H3).size, dec!(0.375));

        let account = driver.broker().account().await;
        assert_eq!(account.base, dec!(0.1875));
        assert_eq!(account.order_count, 1);

        // Below tier 1 and inside the rebalance window
        clock.advance(ChronoDuration::hours(1));
        let report = driver.cycle().await.unwrap().unwrap();
        assert_eq!(report.actions.len(), 3);

        let state = driver.state().unwrap();
        assert!(state.is_active(HedgeTier::H1));
        assert_eq!(state.status, StrategyStatus::Rebalancing);

        let account = driver.broker().account().await;
        // Opened 0.05, then shrunk to 0.0171
        assert_eq!(account.futures_position, dec!(-0.0171));
        assert_eq!(account.base, dec!(0.0938));
        assert_eq!(driver.store().recent_trades(10).unwrap().len(), 4);
        // Status interval elapsed
        assert_eq!(driver.store().recent_pnl(5).unwrap().len(), 1);
        let drawdown = driver.drawdown().unwrap();
        assert_eq!(drawdown.observations, 2);
        assert!(drawdown.min_equity <= drawdown.peak_equity);

        let outcome = driver.shutdown().await.unwrap().unwrap();
        assert!(outcome
            .actions
            .iter()
            .any(|a| matches!(a, StrategyAction::HedgeClosed { tier: HedgeTier::H1, .. })));

        let account = driver.broker().account().await;
        assert_eq!(account.futures_position, Decimal::ZERO);

        let (snapshot, _) = driver.store().load_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.status, "stopped");
        assert!(!snapshot.h1_active);

        // Second shutdown is a no-op
        assert!(driver.shutdown().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_fails_when_ladder_breaks_leverage() {
        let strategy = StrategyConfig {
            max_leverage: dec!(1),
            ..StrategyConfig::default()
        };
        let (mut driver, _) = paper_driver(strategy, &[dec!(2000)]);

        assert!(driver.start().await.is_err());
        assert!(driver.state().is_none());
        assert_eq!(driver.broker().account().await.order_count, 0);
    }

    #[tokio::test]
    async fn test_cycle_before_start_is_an_error() {
        let (mut driver, _) = paper_driver(StrategyConfig::default(), &[dec!(2000)]);
        assert!(driver.cycle().await.is_err());
    }

    #[tokio::test]
    async fn test_resume_skips_initialization() {
        // Any broker call here would fail the mock
        let (driver, state) = resumed_driver(MockBroker::new()).await;
        assert_eq!(driver.state(), Some(&state));
    }

    #[tokio::test]
    async fn test_price_unavailable_skips_cycle() {
        let mut broker = MockBroker::new();
        let mut seq = mockall::Sequence::new();
        broker
            .expect_current_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(None));
        broker
            .expect_current_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(anyhow::anyhow!("connection reset")));

        let (mut driver, state) = resumed_driver(broker).await;

        assert!(driver.cycle().await.unwrap().is_none());
        assert!(driver.cycle().await.unwrap().is_none());
        assert_eq!(driver.state(), Some(&state));
    }

    #[tokio::test]
    async fn test_broker_failure_is_skipped() {
        let mut broker = MockBroker::new();
        broker
            .expect_current_price()
            .times(1)
            .returning(|| Ok(Some(dec!(1950))));
        broker
            .expect_execute()
            .times(3)
            .returning(|_| Err(anyhow::anyhow!("order rejected")));

        let (mut driver, _) = resumed_driver(broker).await;

        let report = driver.cycle().await.unwrap().unwrap();
        assert_eq!(report.actions.len(), 3);

        // Book advanced, nothing traded
        assert!(driver.state().unwrap().is_active(HedgeTier::H1));
        assert!(driver.store().recent_trades(10).unwrap().is_empty());
        let (snapshot, _) = driver.store().load_snapshot().unwrap().unwrap();
        assert!(snapshot.h1_active);
    }

    #[tokio::test]
    async fn test_rolled_back_branch_still_realizes_hedge_open() {
        let mut broker = MockBroker::new();
        broker
            .expect_current_price()
            .times(1)
            .returning(|| Ok(Some(dec!(1950))));
        broker
            .expect_execute()
            .withf(|order| order.market == Market::Futures && order.side == OrderSide::Sell)
            .times(1)
            .returning(|order| {
                Ok(Fill {
                    price: dec!(1950),
                    quantity: order.quantity,
                    fee: Decimal::ZERO,
                })
            });

        let (driver, _) = resumed_driver(broker).await;
        // Same book, tighter limit: the rebalance resize no longer fits
        let mut driver = Driver {
            engine: StrategyEngine::new(StrategyConfig {
                max_leverage: Decimal::ONE,
                ..StrategyConfig::default()
            }),
            ..driver
        };

        let report = driver.cycle().await.unwrap().unwrap();
        assert!(report.was_rolled_back());
        assert_eq!(report.actions.len(), 1);

        let state = driver.state().unwrap();
        assert!(state.is_active(HedgeTier::H1));
        assert_eq!(state.status, StrategyStatus::Hedging);
        assert_eq!(driver.store().recent_trades(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_exits_when_flag_is_set() {
        let (mut driver, _) = paper_driver(StrategyConfig::default(), &[dec!(2000)]);
        driver.start().await.unwrap();

        let shutdown = Arc::new(AtomicBool::new(true));
        driver.run(shutdown).await.unwrap();

        assert_eq!(driver.state().unwrap().status, StrategyStatus::Stopped);
    }
}
