// =============================================================================
// Helios Portfolio Engine — Main Entry Point
// =============================================================================
//
// The engine starts in dry-run mode unless --live is given explicitly, and
// DRY_RUN=1 in the environment forces dry-run regardless of flags.
//
// Exit codes: 0 clean shutdown, 1 fatal error or consecutive-timeout restart
// request, 2 configuration error. (137 = killed by the supervisor watchdog.)
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod commands;
mod config;
mod errors;
mod exchange;
mod executor;
mod factors;
mod indicators;
mod market_data;
mod notifier;
mod portfolio;
mod position;
mod regime;
mod risk;
mod scheduler;
mod state_store;
mod strategy;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::exchange::bithumb::BithumbClient;
use crate::executor::LiveExecutor;
use crate::notifier::{ChatNotifier, LogNotifier, Notifier, NotifierHandle};
use crate::portfolio::PortfolioManager;
use crate::position::PositionBook;
use crate::regime::RegimeTracker;
use crate::risk::RiskLedger;
use crate::scheduler::{ExitReason, Scheduler};
use crate::state_store::StateStore;
use crate::strategy::ScoreStrategy;
use crate::types::{Clock, RunMode, SystemClock};

const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "helios-bot", about = "Regime-driven spot portfolio engine")]
struct Args {
    /// Simulate fills locally (default).
    #[arg(long, conflicts_with = "live")]
    dry_run: bool,

    /// Send real orders to the exchange.
    #[arg(long)]
    live: bool,

    /// Path to the engine configuration file.
    #[arg(long, default_value = "engine_config.json")]
    config: PathBuf,

    /// Log filter (overridden by RUST_LOG when set).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Comma-separated subset of configured coins to trade, e.g. "BTC,ETH".
    #[arg(long)]
    coins: Option<String>,
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Helios Portfolio Engine — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = match build_config(&args) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    info!(
        run_mode = %config.run_mode,
        coins = ?config.coins.iter().map(|c| c.symbol.as_str()).collect::<Vec<_>>(),
        interval_secs = config.cycle_interval_secs,
        "engine configured"
    );

    match run_engine(config).await {
        Ok(ExitReason::Shutdown) => {
            info!("engine shut down cleanly");
        }
        Ok(ExitReason::ConsecutiveTimeouts) => {
            error!("engine exiting for supervisor restart");
            std::process::exit(EXIT_FATAL);
        }
        Err(e) => {
            error!(error = %e, "fatal engine error");
            std::process::exit(EXIT_FATAL);
        }
    }
}

/// Load the config file and fold in CLI/env overrides.
fn build_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = if args.config.exists() {
        EngineConfig::load(&args.config)?
    } else {
        warn!(path = %args.config.display(), "config file missing — using defaults");
        EngineConfig::default()
    };

    if args.live {
        config.run_mode = RunMode::Live;
    }
    if args.dry_run {
        config.run_mode = RunMode::DryRun;
    }
    // SAFETY: the env kill-switch wins over everything.
    if std::env::var("DRY_RUN").map(|v| v == "1").unwrap_or(false) {
        if config.run_mode == RunMode::Live {
            warn!("DRY_RUN=1 set — forcing dry-run despite --live");
        }
        config.run_mode = RunMode::DryRun;
    }

    if let Some(filter) = &args.coins {
        let wanted: Vec<String> = filter
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        for symbol in &wanted {
            if config.coin(symbol).is_none() {
                anyhow::bail!("--coins names unknown symbol {symbol}");
            }
        }
        config.coins.retain(|c| wanted.contains(&c.symbol));
    }

    config.validate()?;
    Ok(config)
}

async fn run_engine(config: Arc<EngineConfig>) -> anyhow::Result<ExitReason> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ── State store + recovery ───────────────────────────────────────────
    let store = Arc::new(StateStore::open(&config.state_dir)?);
    let positions = store
        .load_positions()
        .map_err(|e| anyhow::anyhow!("{e} — operator intervention required"))?;
    let persisted = store.load_engine_state();

    let book = Arc::new(PositionBook::new());
    book.restore(positions);
    if book.count() > 0 {
        info!(count = book.count(), "open positions restored");
    }

    let ledger = Arc::new(RiskLedger::new(
        config.initial_capital,
        config.max_daily_loss_pct,
        config.max_consecutive_losses,
        clock.clone(),
    ));
    ledger.restore(
        persisted.daily_loss_pct,
        persisted.consecutive_losses,
        persisted.observation_mode,
    );

    let regimes = Arc::new(RegimeTracker::new());
    regimes.seed(&persisted.last_regime_per_coin);

    // ── Notifier ─────────────────────────────────────────────────────────
    let backend: Arc<dyn Notifier> = match (
        std::env::var("TELEGRAM_BOT_TOKEN"),
        std::env::var("TELEGRAM_CHAT_ID"),
    ) {
        (Ok(token), Ok(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            info!("chat notifier configured");
            Arc::new(ChatNotifier::new(token, chat_id))
        }
        _ => {
            info!("no chat credentials — notifications go to the log");
            Arc::new(LogNotifier)
        }
    };
    let notifier = NotifierHandle::spawn(backend);

    // ── Exchange adapter ─────────────────────────────────────────────────
    let api_key = std::env::var("BITHUMB_CONNECT_KEY").unwrap_or_default();
    let api_secret = std::env::var("BITHUMB_SECRET_KEY").unwrap_or_default();
    let exchange = Arc::new(BithumbClient::new(api_key, api_secret, config.fee_rate));

    if config.run_mode == RunMode::Live && !exchange.has_credentials() {
        warn!("live mode without exchange credentials — running read-only");
        notifier.push("Live mode without credentials: entries suppressed (read-only)");
        ledger.set_read_only(true);
    }

    // ── Engine assembly ──────────────────────────────────────────────────
    let executor = Arc::new(LiveExecutor::new(
        exchange.clone(),
        book,
        ledger.clone(),
        store.clone(),
        notifier.clone(),
        clock.clone(),
        config.initial_capital,
        config.fee_rate,
        config.run_mode,
        config.pyramiding_enabled,
    ));

    let portfolio = Arc::new(PortfolioManager::new(
        config.clone(),
        exchange,
        Arc::new(ScoreStrategy),
        executor.clone(),
        ledger.clone(),
        store.clone(),
        regimes,
        notifier.clone(),
        clock.clone(),
    ));
    portfolio.restore(&persisted);

    // ── Signals ──────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    notifier.push(format!(
        "Engine started ({}) — {} coins, {}s cycle",
        config.run_mode,
        config.coins.len(),
        config.cycle_interval_secs
    ));

    // ── Run ──────────────────────────────────────────────────────────────
    let commands: Option<Box<dyn commands::CommandSource>> = {
        use std::io::IsTerminal;
        if std::io::stdin().is_terminal() {
            info!("stdin console enabled (status/positions/factors/close/stop)");
            Some(Box::new(commands::StdinCommandSource::new()))
        } else {
            None
        }
    };

    let scheduler = Scheduler::new(
        config,
        portfolio,
        executor,
        ledger,
        store,
        notifier,
        clock,
        commands,
    );
    Ok(scheduler.run(shutdown_rx).await)
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
