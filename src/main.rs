use clap::{Parser, Subcommand};
use qtrade::config::AppConfig;
use qtrade::engine::DecisionEngine;
use qtrade::error::Result;
use qtrade::ledger::Ledger;
use qtrade::store::{PersistenceStore, PostgresStore, TradeFilter};
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "qtrade")]
#[command(author, version, about = "Q-learning intraday paper-trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run decision cycles over the configured instruments
    Trade {
        /// Comma-separated instrument override
        #[arg(short, long)]
        symbols: Option<String>,
        /// Seconds between cycles
        #[arg(long, default_value = "60")]
        interval: u64,
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        /// Always exploit, never explore (deployment mode)
        #[arg(long)]
        exploit: bool,
    },
    /// Force-close all open positions at the prior session close
    Settle,
    /// Print bankroll, open positions, and recent decisions
    Report {
        /// How many recent decisions to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Trade {
            symbols,
            interval,
            once,
            exploit,
        } => {
            let config = AppConfig::load()?;
            init_logging(&config);
            run_trade(config, symbols, interval, once, exploit).await?;
        }
        Commands::Settle => {
            let config = AppConfig::load()?;
            init_logging(&config);
            run_settle(config).await?;
        }
        Commands::Report { limit } => {
            init_logging_simple();
            run_report(limit).await?;
        }
    }

    Ok(())
}

async fn run_trade(
    config: AppConfig,
    symbols: Option<String>,
    interval_secs: u64,
    once: bool,
    exploit: bool,
) -> Result<()> {
    let store = Arc::new(connect(&config).await?);

    let instruments: Vec<String> = match symbols {
        Some(raw) => raw.split(',').map(|s| s.trim().to_uppercase()).collect(),
        None => config.trading.symbols.clone(),
    };
    info!(instruments = ?instruments, exploit, "starting decision engine");

    let engine = DecisionEngine::new(store.clone(), store, config, exploit);

    if once {
        let summary = engine.run_cycle(&instruments).await?;
        info!(
            decisions = summary.outcomes.len(),
            skipped = summary.skipped.len(),
            "single cycle complete"
        );
        return Ok(());
    }

    let mut ticker = interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.run_cycle(&instruments).await {
                    Ok(summary) => {
                        if !summary.skipped.is_empty() {
                            warn!(skipped = ?summary.skipped, "instruments skipped this cycle");
                        }
                    }
                    Err(err) => error!(%err, "decision cycle failed"),
                }
            }
            _ = shutdown_signal() => {
                info!("shutdown requested, stopping");
                break;
            }
        }
    }
    Ok(())
}

async fn run_settle(config: AppConfig) -> Result<()> {
    let store = Arc::new(connect(&config).await?);
    let engine = DecisionEngine::new(store.clone(), store, config, false);

    let summary = engine.settle_all().await?;
    println!(
        "Settled {} position(s), realized P&L {:+.2}, final balance {:.2}",
        summary.positions_closed, summary.realized_pnl, summary.final_balance
    );
    Ok(())
}

async fn run_report(limit: usize) -> Result<()> {
    let config = AppConfig::load()?;
    let store = connect(&config).await?;

    let trades = store.query_trades(&TradeFilter::default()).await?;
    let ledger = Ledger::from_trades(config.trading.starting_cash, trades);
    let bankroll = ledger.bankroll();

    println!("=== Bankroll ===");
    println!("Balance:        {:.2}", bankroll.balance);
    println!(
        "Closed trades:  {} ({} winning, {:.1}% win rate)",
        bankroll.closed_trades,
        bankroll.winning_trades,
        bankroll.win_rate * 100.0
    );
    println!("Total P&L:      {:+.2}", bankroll.total_pnl);
    println!("ROI:            {:+.2}%", bankroll.roi * 100.0);

    let positions = ledger.active_positions();
    println!("\n=== Open positions ({}) ===", positions.len());
    for position in &positions {
        println!(
            "{:<8} {:>5} @ {:.2}",
            position.instrument, position.quantity, position.avg_entry_price
        );
    }

    println!("\n=== Agents ===");
    for symbol in &config.trading.symbols {
        if let Some(snapshot) = store.load_agent(symbol).await? {
            println!(
                "{:<8} episodes={:<6} epsilon={:.3} states={} total_reward={:+.2}",
                symbol,
                snapshot.total_episodes,
                snapshot.exploration_rate,
                snapshot.q_table.len(),
                snapshot.total_rewards
            );
        }
    }

    println!("\n=== Exploration health ===");
    for symbol in &config.trading.symbols {
        let decisions = store.recent_decisions(Some(symbol), limit).await?;
        if decisions.is_empty() {
            continue;
        }
        let total = decisions.len();
        let explored = decisions.iter().filter(|d| d.was_random).count();
        let executed = decisions.iter().filter(|d| d.was_executed).count();
        println!(
            "{:<8} decisions={:<4} explored={:.0}% executed={:.0}%",
            symbol,
            total,
            explored as f64 / total as f64 * 100.0,
            executed as f64 / total as f64 * 100.0
        );
    }

    println!("\n=== Recent decisions ===");
    for decision in store.recent_decisions(None, limit).await? {
        println!(
            "{} {:<8} {:<4} executed={} random={} {}",
            decision.timestamp.format("%Y-%m-%d %H:%M:%S"),
            decision.instrument,
            decision.action,
            decision.was_executed,
            decision.was_random,
            decision.reasoning
        );
    }
    Ok(())
}

async fn connect(config: &AppConfig) -> Result<PostgresStore> {
    let store = PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;
    Ok(store)
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},qtrade=debug,sqlx=warn", config.logging.level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_logging_simple() {
    // Minimal logging for read-only CLI commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
