//! Hedge Ladder - Main Entry Point
//!
//! Paper trading against the OKX public ticker, offline replays over a
//! price file, and a status view of the persisted run.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use hedge_ladder::analysis;
use hedge_ladder::config::Config;
use hedge_ladder::driver::{Driver, ManualClock, SystemClock};
use hedge_ladder::exchange::{OkxTickerFeed, PaperBroker, ScriptedFeed};
use hedge_ladder::persistence::SnapshotStore;
use hedge_ladder::replay::PriceSeries;
use hedge_ladder::snapshot::from_snapshot;
use hedge_ladder::strategy::{delta_hedge, HedgeTier, StrategyEngine};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Hedge Ladder CLI
#[derive(Parser)]
#[command(name = "hedge-ladder")]
#[command(version, about = "Spot holding with a laddered short perpetual hedge")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Paper trade against the live public ticker (default)
    Run,

    /// Run the strategy offline over a price file
    Replay {
        /// One price, or `timestamp,price`, per line
        #[arg(short, long)]
        prices: String,

        /// Starting quote balance (defaults to the paper config)
        #[arg(short, long)]
        deposit: Option<Decimal>,
    },

    /// Show the persisted strategy state
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/hedge_ladder.db")]
        db: String,

        /// Show hedge tiers and recent history
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::Replay { prices, deposit }) => run_replay(&prices, deposit).await,
        Some(Commands::Status { db, verbose }) => show_status(&db, verbose),
        Some(Commands::Run) | None => run_paper().await,
    }
}

async fn run_paper() -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          Hedge Ladder v{} - Paper Trading               ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = Config::load()?;
    config.validate()?;
    log_config(&config);

    let feed = OkxTickerFeed::new(
        &config.feed.base_url,
        &config.driver.base_asset,
        &config.driver.quote_asset,
        Duration::from_secs(config.feed.timeout_secs),
    )?;
    info!(inst_id = %feed.inst_id(), "Using OKX public ticker");

    let broker = PaperBroker::new(
        Arc::new(feed),
        config.paper.initial_quote,
        config.paper.initial_base,
        config.strategy.spot_commission,
        config.strategy.futures_commission,
    );

    if let Some(parent) = Path::new(&config.driver.db_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SnapshotStore::new(&config.driver.db_path)?;

    let mut driver = Driver::new(
        StrategyEngine::new(config.strategy.clone()),
        config.driver.clone(),
        broker,
        SystemClock,
        store,
    );

    if let Err(e) = driver.start().await {
        error!(error = %e, "Failed to start strategy");
        return Err(e);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    info!(pair = %config.pair(), "🚀 Starting main loop");
    driver.run(shutdown).await?;

    let account = driver.broker().account().await;
    info!(
        quote = %account.quote.round_dp(2),
        base = %account.base,
        futures = %account.futures_position,
        fees = %account.total_fees.round_dp(4),
        orders = account.order_count,
        "Final paper account"
    );
    info!("👋 Hedge Ladder shutdown complete");
    Ok(())
}

async fn run_replay(prices_path: &str, deposit: Option<Decimal>) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              REPLAY MODE                                   ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = Config::load()?;
    config.validate()?;

    let series = PriceSeries::load(prices_path)?;
    info!(samples = series.len(), file = %prices_path, "Loaded price series");

    let points = series.points().to_vec();
    let step = ChronoDuration::seconds(config.driver.poll_interval_secs as i64);
    let clock = ManualClock::new(points[0].timestamp.unwrap_or_else(Utc::now));

    let feed = Arc::new(ScriptedFeed::new(series.prices()));
    let initial_quote = deposit.unwrap_or(config.paper.initial_quote);
    let broker = PaperBroker::new(
        feed.clone(),
        initial_quote,
        config.paper.initial_base,
        config.strategy.spot_commission,
        config.strategy.futures_commission,
    );

    let mut driver = Driver::new(
        StrategyEngine::new(config.strategy.clone()),
        config.driver.clone(),
        broker,
        clock.clone(),
        SnapshotStore::new(":memory:")?,
    );
    driver.start().await?;

    let mut cycles = 0usize;
    let mut trades = 0usize;
    let mut rollbacks = 0usize;
    let mut cycle_hedge_pnl = Decimal::ZERO;
    for point in &points[1..] {
        match point.timestamp {
            Some(at) => clock.set(at),
            None => clock.advance(step),
        }

        match driver.cycle().await {
            Ok(Some(report)) => {
                cycles += 1;
                trades += report.actions.len();
                rollbacks += usize::from(report.was_rolled_back());
                cycle_hedge_pnl += report.realized_hedge_pnl();
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Replay cycle failed"),
        }
    }
    if !feed.is_exhausted() {
        warn!(unread = feed.remaining(), "Replay ended before the series did");
    }

    let outcome = driver.shutdown().await?;
    let account = driver.broker().account().await;
    let final_value = account.quote;

    println!("\n📊 Replay Summary");
    println!("   ├─ Samples:          {}", points.len());
    println!("   ├─ Cycles:           {}", cycles);
    println!("   ├─ Strategy Actions: {}", trades);
    println!("   ├─ Rolled Back:      {}", rollbacks);
    println!("   ├─ Hedge P&L (book): ${:.2} before exit", cycle_hedge_pnl);
    if let Some(outcome) = outcome {
        println!("   ├─ Exit P&L (book):  ${:.2}", outcome.realized_pnl);
    }
    println!("   ├─ Futures P&L:      ${:.2} (paper fills)", account.futures_realized_pnl);
    if let Some(drawdown) = driver.drawdown() {
        println!(
            "   ├─ Max Drawdown:     {:.2}% (low ${:.2})",
            drawdown.session_mdd * dec!(100),
            drawdown.min_equity
        );
    }
    println!("   ├─ Paper Fees:       ${:.4}", account.total_fees);
    println!("   ├─ Orders:           {}", account.order_count);
    println!(
        "   └─ Final Quote:      ${:.2} (from ${:.2})",
        final_value, initial_quote
    );

    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "hedge-ladder.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the whole program
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hedge_ladder=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let s = &config.strategy;
    info!("📋 Configuration:");
    info!("   Pair: {}", config.pair());
    info!(
        "   Bands: upper {}x, lower {}x, buffer {}x",
        s.upper_band_mult, s.lower_band_mult, s.buffer_mult
    );
    info!(
        "   Allocation: spot {:.0}%, hedge {:.0}%",
        s.spot_allocation * dec!(100),
        s.hedge_allocation * dec!(100)
    );
    info!(
        "   Hedge levels: {:?}, weights: {:?}",
        s.hedge_level_mults, s.hedge_weights
    );
    info!("   Max Leverage: {}x", s.max_leverage);
    info!(
        "   Commissions: spot {:.2}%, futures {:.3}%",
        s.spot_commission * dec!(100),
        s.futures_commission * dec!(100)
    );
    info!(
        "   Funding: {:.4}% per {}h",
        s.funding_rate * dec!(100),
        s.hours_per_funding
    );
    info!(
        "   Poll: {}s, Status: {}s",
        config.driver.poll_interval_secs, config.driver.status_interval_secs
    );
}

/// Print the persisted state with derived figures.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              HEDGE LADDER STATUS                           ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The strategy has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = SnapshotStore::new(db_path)?;
    let Some((snapshot, saved_at)) = store.load_snapshot()? else {
        println!("\n❌ No saved state found in database.");
        return Ok(());
    };
    let state = from_snapshot(&snapshot).context("Stored snapshot is invalid")?;

    let config = Config::load().unwrap_or_default();
    let now = Utc::now();
    let pnl = analysis::pnl(&state, state.deposit);
    let funding = analysis::funding_cost(&state, &config.strategy, now);
    let commissions = analysis::estimated_commissions(&state, &config.strategy);

    println!("\n📊 Strategy");
    println!("   ├─ Status:           {}", state.status);
    println!("   ├─ Entry Price:      ${:.2}", state.entry_price);
    println!("   ├─ Current Price:    ${:.2}", state.current_price);
    println!(
        "   ├─ Bands:            ${:.2} / ${:.2} (buffer ${:.2})",
        state.lower, state.upper, state.buffer
    );
    println!("   └─ Last Updated:     {}", saved_at.format("%Y-%m-%d %H:%M:%S UTC"));

    println!("\n💰 Holdings");
    println!("   ├─ Deposit:          ${:.2}", state.deposit);
    println!(
        "   ├─ Base:             {:.6} (${:.2})",
        state.current_eth,
        state.current_eth * state.current_price
    );
    println!("   ├─ Cash:             ${:.2}", state.current_usd);
    println!("   ├─ P&L:              ${:.2} ({:+.2}%)", pnl.total, pnl.percentage);
    println!("   ├─ Hedge Notional:   ${:.2}", state.total_hedge_value());
    println!("   └─ Hedge P&L:        ${:.2}", delta_hedge(&state));

    println!("\n🧾 Costs");
    println!("   ├─ Funding Accrued:  ${:.4}", funding);
    println!("   ├─ Spot Commission:  ${:.4}", commissions.spot);
    println!("   ├─ Futures Commission: ${:.4}", commissions.futures);
    println!("   └─ Total:            ${:.4}", commissions.total() + funding);

    if verbose {
        println!("\n🪜 Hedge Ladder");
        for tier in HedgeTier::ALL {
            let leg = state.leg(tier);
            match leg.entry_time() {
                Some(opened) => println!(
                    "   ├─ {}: {:.4} @ ${:.2} (trigger ${:.2}, open since {})",
                    tier,
                    leg.size,
                    leg.entry_price(),
                    leg.level,
                    opened.format("%Y-%m-%d %H:%M UTC")
                ),
                None => println!(
                    "   ├─ {}: {:.4} planned (trigger ${:.2})",
                    tier, leg.size, leg.level
                ),
            }
        }

        let trades = store.recent_trades(10)?;
        if !trades.is_empty() {
            println!("\n📈 Recent Trades");
            for t in &trades {
                println!(
                    "   ├─ {} {} {} {} @ ${:.2} (fee ${:.4}) {}",
                    t.timestamp.format("%m-%d %H:%M"),
                    t.market,
                    t.side,
                    t.quantity,
                    t.price,
                    t.fee,
                    t.reason
                );
            }
        }

        let history = store.recent_pnl(5)?;
        if !history.is_empty() {
            println!("\n📉 Recent P&L");
            for p in &history {
                println!(
                    "   ├─ {} price ${:.2} equity ${:.2} P&L ${:.2} ({:+.2}%)",
                    p.timestamp.format("%m-%d %H:%M"),
                    p.price,
                    p.equity,
                    p.pnl,
                    p.pnl_pct
                );
            }
        }
    }

    Ok(())
}
