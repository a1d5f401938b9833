//! Configuration management for the hedge ladder.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Strategy parameters (bands, allocation, hedge ladder, costs)
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Polling loop and bookkeeping settings
    #[serde(default)]
    pub driver: DriverConfig,
    /// Paper account seed balances
    #[serde(default)]
    pub paper: PaperConfig,
    /// Public price feed settings
    #[serde(default)]
    pub feed: FeedConfig,
}

/// Static numeric parameters of the strategy. All values are ratios or rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Spot taker commission (0.001 = 0.1%)
    #[serde(default = "default_spot_commission")]
    pub spot_commission: Decimal,
    /// Futures taker commission
    #[serde(default = "default_futures_commission")]
    pub futures_commission: Decimal,
    /// Funding rate charged per funding period on short notional
    #[serde(default = "default_funding_rate")]
    pub funding_rate: Decimal,
    /// Length of one funding period in hours
    #[serde(default = "default_hours_per_funding")]
    pub hours_per_funding: u32,
    /// Maximum leverage the hedge sleeve may carry
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    /// Upper band as a multiple of entry price
    #[serde(default = "default_upper_band_mult")]
    pub upper_band_mult: Decimal,
    /// Lower band as a multiple of entry price
    #[serde(default = "default_lower_band_mult")]
    pub lower_band_mult: Decimal,
    /// Buffer band (buy-the-dip trigger) as a multiple of entry price
    #[serde(default = "default_buffer_mult")]
    pub buffer_mult: Decimal,
    /// Share of the deposit placed in the spot sleeve
    #[serde(default = "default_spot_allocation")]
    pub spot_allocation: Decimal,
    /// Share of the deposit reserved as hedge margin
    #[serde(default = "default_hedge_allocation")]
    pub hedge_allocation: Decimal,
    /// Share of the spot sleeve held in the base asset at start; the rest stays as cash
    #[serde(default = "default_spot_base_fraction")]
    pub spot_base_fraction: Decimal,
    /// Hedge tier trigger levels as multiples of entry price, strictly decreasing
    #[serde(default = "default_hedge_level_mults")]
    pub hedge_level_mults: [Decimal; 3],
    /// Share of the insured loss absorbed by each tier
    #[serde(default = "default_hedge_weights")]
    pub hedge_weights: [Decimal; 3],
    /// Rebalance-at-entry fires while price is at or below entry times this
    #[serde(default = "default_rebalance_ceiling_mult")]
    pub rebalance_ceiling_mult: Decimal,
    /// Share of the base holding sold on rebalance-at-entry
    #[serde(default = "default_rebalance_sell_fraction")]
    pub rebalance_sell_fraction: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Base asset of the traded pair
    #[serde(default = "default_base_asset")]
    pub base_asset: String,
    /// Quote asset of the traded pair
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Seconds between price polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds between periodic status reports
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    /// SQLite database for state snapshots and history
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Order quantity precision
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
    /// Drawdown (0.0-1.0) above which status reports warn
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Starting quote balance of the paper account
    #[serde(default = "default_initial_quote")]
    pub initial_quote: Decimal,
    /// Starting base balance of the paper account
    #[serde(default)]
    pub initial_base: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// REST endpoint of the public ticker
    #[serde(default = "default_feed_url")]
    pub base_url: String,
    /// HTTP timeout in seconds
    #[serde(default = "default_feed_timeout")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_spot_commission() -> Decimal {
    dec!(0.001)
}

fn default_futures_commission() -> Decimal {
    dec!(0.0004)
}

fn default_funding_rate() -> Decimal {
    dec!(0.0001) // 0.01% per 8h
}

fn default_hours_per_funding() -> u32 {
    8
}

fn default_max_leverage() -> Decimal {
    dec!(10)
}

fn default_upper_band_mult() -> Decimal {
    dec!(1.06)
}

fn default_lower_band_mult() -> Decimal {
    dec!(0.94)
}

fn default_buffer_mult() -> Decimal {
    dec!(0.92)
}

fn default_spot_allocation() -> Decimal {
    dec!(0.75)
}

fn default_hedge_allocation() -> Decimal {
    dec!(0.25)
}

fn default_spot_base_fraction() -> Decimal {
    dec!(0.5)
}

fn default_hedge_level_mults() -> [Decimal; 3] {
    [dec!(0.98), dec!(0.96), dec!(0.94)] // -2%, -4%, -6%
}

fn default_hedge_weights() -> [Decimal; 3] {
    [dec!(0.2), dec!(0.3), dec!(0.5)]
}

fn default_rebalance_ceiling_mult() -> Decimal {
    dec!(1.01)
}

fn default_rebalance_sell_fraction() -> Decimal {
    dec!(0.5)
}

fn default_base_asset() -> String {
    "ETH".to_string()
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_status_interval() -> u64 {
    3600
}

fn default_db_path() -> String {
    "data/hedge_ladder.db".to_string()
}

fn default_lot_size() -> Decimal {
    dec!(0.0001)
}

fn default_max_drawdown() -> Decimal {
    dec!(0.10)
}

fn default_initial_quote() -> Decimal {
    dec!(1000)
}

fn default_feed_url() -> String {
    "https://www.okx.com".to_string()
}

fn default_feed_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("LADDER"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        self.strategy.validate()?;

        anyhow::ensure!(
            self.driver.poll_interval_secs > 0,
            "poll_interval_secs must be positive"
        );
        anyhow::ensure!(
            self.driver.lot_size >= Decimal::ZERO,
            "lot_size must not be negative"
        );
        anyhow::ensure!(
            self.paper.initial_quote >= Decimal::ZERO && self.paper.initial_base >= Decimal::ZERO,
            "paper balances must not be negative"
        );

        Ok(())
    }

    /// Trading pair in `BASE/QUOTE` form.
    pub fn pair(&self) -> String {
        format!("{}/{}", self.driver.base_asset, self.driver.quote_asset)
    }
}

impl StrategyConfig {
    /// Validate band ordering, ladder shape and allocation ranges.
    pub fn validate(&self) -> Result<()> {
        let unit = |v: Decimal| v > Decimal::ZERO && v <= Decimal::ONE;

        anyhow::ensure!(
            unit(self.spot_allocation),
            "spot_allocation must be between 0 and 1"
        );
        anyhow::ensure!(
            unit(self.hedge_allocation),
            "hedge_allocation must be between 0 and 1"
        );
        anyhow::ensure!(
            unit(self.spot_base_fraction) && unit(self.rebalance_sell_fraction),
            "spot_base_fraction and rebalance_sell_fraction must be between 0 and 1"
        );

        anyhow::ensure!(
            self.buffer_mult > Decimal::ZERO
                && self.buffer_mult < self.lower_band_mult
                && self.lower_band_mult < Decimal::ONE
                && self.upper_band_mult > Decimal::ONE,
            "bands must satisfy 0 < buffer < lower < 1 < upper"
        );

        let [h1, h2, h3] = self.hedge_level_mults;
        anyhow::ensure!(
            h1 < Decimal::ONE && h1 > h2 && h2 > h3 && h3 >= self.buffer_mult,
            "hedge levels must be strictly decreasing, below 1 and not below the buffer"
        );
        anyhow::ensure!(
            self.hedge_weights.iter().all(|w| *w >= Decimal::ZERO),
            "hedge weights must not be negative"
        );

        anyhow::ensure!(self.max_leverage > Decimal::ZERO, "max_leverage must be positive");
        anyhow::ensure!(self.hours_per_funding > 0, "hours_per_funding must be positive");
        anyhow::ensure!(
            self.rebalance_ceiling_mult >= Decimal::ONE,
            "rebalance_ceiling_mult must be at least 1"
        );
        anyhow::ensure!(
            self.spot_commission >= Decimal::ZERO && self.futures_commission >= Decimal::ZERO,
            "commission rates must not be negative"
        );

        Ok(())
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            spot_commission: default_spot_commission(),
            futures_commission: default_futures_commission(),
            funding_rate: default_funding_rate(),
            hours_per_funding: default_hours_per_funding(),
            max_leverage: default_max_leverage(),
            upper_band_mult: default_upper_band_mult(),
            lower_band_mult: default_lower_band_mult(),
            buffer_mult: default_buffer_mult(),
            spot_allocation: default_spot_allocation(),
            hedge_allocation: default_hedge_allocation(),
            spot_base_fraction: default_spot_base_fraction(),
            hedge_level_mults: default_hedge_level_mults(),
            hedge_weights: default_hedge_weights(),
            rebalance_ceiling_mult: default_rebalance_ceiling_mult(),
            rebalance_sell_fraction: default_rebalance_sell_fraction(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            base_asset: default_base_asset(),
            quote_asset: default_quote_asset(),
            poll_interval_secs: default_poll_interval(),
            status_interval_secs: default_status_interval(),
            db_path: default_db_path(),
            lot_size: default_lot_size(),
            max_drawdown: default_max_drawdown(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_quote: default_initial_quote(),
            initial_base: Decimal::ZERO,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: default_feed_url(),
            timeout_secs: default_feed_timeout(),
        }
    }
}
