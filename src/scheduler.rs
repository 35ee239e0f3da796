// =============================================================================
// Scheduler — fixed-period cycle driver
// =============================================================================
//
// Sleeps to the next cycle boundary (interval minus the cycle's wall-clock
// time), so cycles never overlap and never drift. Between cycles it services
// remote commands and the shutdown signal.
//
// Exit paths:
//   - Shutdown (signal or Stop command): finish in-flight work, write the
//     daily snapshot, exit 0.
//   - Consecutive all-timeout cycles at the configured limit: exit non-zero
//     so the supervisor watchdog restarts the process.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::commands::{Command, CommandSource};
use crate::config::EngineConfig;
use crate::executor::LiveExecutor;
use crate::notifier::NotifierHandle;
use crate::portfolio::PortfolioManager;
use crate::risk::RiskLedger;
use crate::state_store::{DailySnapshot, StateStore};
use crate::types::Clock;

/// Why the scheduler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Graceful shutdown (signal or Stop command). Process exit 0.
    Shutdown,
    /// Too many consecutive all-timeout cycles. Process exit 1; the
    /// supervisor restarts us.
    ConsecutiveTimeouts,
}

pub struct Scheduler {
    config: Arc<EngineConfig>,
    portfolio: Arc<PortfolioManager>,
    executor: Arc<LiveExecutor>,
    ledger: Arc<RiskLedger>,
    store: Arc<StateStore>,
    notifier: NotifierHandle,
    clock: Arc<dyn Clock>,
    commands: Option<Box<dyn CommandSource>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<EngineConfig>,
        portfolio: Arc<PortfolioManager>,
        executor: Arc<LiveExecutor>,
        ledger: Arc<RiskLedger>,
        store: Arc<StateStore>,
        notifier: NotifierHandle,
        clock: Arc<dyn Clock>,
        commands: Option<Box<dyn CommandSource>>,
    ) -> Self {
        Self {
            config,
            portfolio,
            executor,
            ledger,
            store,
            notifier,
            clock,
            commands,
        }
    }

    /// Drive cycles until shutdown or the timeout watchdog trips.
    ///
    /// `shutdown` flips to `true` exactly once, from the signal handler.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> ExitReason {
        let interval = Duration::from_secs(self.config.cycle_interval_secs);
        let mut cycle_id: u64 = 0;

        loop {
            cycle_id += 1;
            let cycle_started = Instant::now();
            info!(cycle_id, at = %self.clock.now().to_rfc3339(), "cycle boundary");

            self.portfolio.run_cycle(cycle_id).await;

            if self.portfolio.consecutive_timeout_cycles() >= self.config.consecutive_timeout_limit
            {
                warn!(
                    cycles = self.portfolio.consecutive_timeout_cycles(),
                    "consecutive-timeout limit reached — exiting for restart"
                );
                self.notifier.push(format!(
                    "ENGINE RESTART: {} consecutive all-timeout cycles",
                    self.portfolio.consecutive_timeout_cycles()
                ));
                self.write_daily_snapshot();
                return ExitReason::ConsecutiveTimeouts;
            }

            self.write_daily_snapshot();

            // Sleep to the boundary, servicing commands while we wait.
            let elapsed = cycle_started.elapsed();
            let deadline = cycle_started + interval.max(elapsed);
            if let Some(reason) = self.wait_until(deadline, &mut shutdown).await {
                self.write_daily_snapshot();
                return reason;
            }
        }
    }

    /// Wait until `deadline`, handling commands as they arrive. Returns
    /// `Some(reason)` when the wait ended in a shutdown request.
    async fn wait_until(
        &mut self,
        deadline: Instant,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Option<ExitReason> {
        enum Waited {
            Shutdown,
            Deadline,
            Command(Option<Command>),
        }

        loop {
            // A closed command source degrades to plain sleeping.
            let commands = self.commands.as_mut();
            let waited = tokio::select! {
                _ = shutdown.changed() => Waited::Shutdown,
                _ = tokio::time::sleep_until(deadline) => Waited::Deadline,
                cmd = async {
                    match commands {
                        Some(source) => source.next().await,
                        None => std::future::pending().await,
                    }
                } => Waited::Command(cmd),
            };

            match waited {
                Waited::Shutdown => {
                    info!("shutdown signal received — stopping after in-flight work");
                    return Some(ExitReason::Shutdown);
                }
                Waited::Deadline => return None,
                Waited::Command(Some(Command::Stop)) => {
                    info!("stop command received");
                    return Some(ExitReason::Shutdown);
                }
                Waited::Command(Some(cmd)) => self.handle_command(cmd).await,
                Waited::Command(None) => {
                    // Source closed for good; stop polling it.
                    self.commands = None;
                }
            }
        }
    }

    async fn handle_command(&self, cmd: Command) {
        match cmd {
            Command::Status => {
                let risk = self.ledger.snapshot();
                self.notifier.push(format!(
                    "Status: mode={} open={}/{} daily={:+.2}% streak={} observation={}",
                    self.config.run_mode,
                    self.executor.book().count(),
                    self.config.max_positions,
                    risk.daily_loss_pct,
                    risk.consecutive_losses,
                    risk.observation_mode,
                ));
            }
            Command::Positions => {
                let positions = self.executor.book().snapshot();
                if positions.is_empty() {
                    self.notifier.push("No open positions");
                } else {
                    let body = positions
                        .iter()
                        .map(|p| {
                            format!(
                                "{}: {} @ {} (stop {}, tp1 {}{})",
                                p.coin,
                                p.size,
                                p.entry_price,
                                p.stop_loss_price,
                                p.first_target_price,
                                if p.first_target_hit { ", trailing" } else { "" },
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.notifier.push(body);
                }
            }
            Command::Factors => match self.portfolio.last_factors() {
                Some(record) => self.notifier.notify_factors_summary(&record),
                None => self.notifier.push("Factors not derived yet"),
            },
            Command::Close(symbol) => {
                let coin = self
                    .portfolio
                    .active_coins()
                    .into_iter()
                    .find(|c| c.symbol.eq_ignore_ascii_case(&symbol));
                match coin {
                    Some(coin) => {
                        match self.executor.close_full(&coin, "manual_close", None).await {
                            Ok(result) => self
                                .notifier
                                .push(format!("Close {}: {result}", coin.symbol)),
                            Err(e) => self
                                .notifier
                                .push(format!("Close {} failed: {e}", coin.symbol)),
                        }
                    }
                    None => self.notifier.push(format!("Unknown coin: {symbol}")),
                }
            }
            Command::Stop => unreachable!("Stop is handled by the wait loop"),
        }
    }

    /// Write (or refresh) today's row in the daily history. Called at the end
    /// of every cycle; the final write of a date is the day's snapshot.
    fn write_daily_snapshot(&self) {
        let today = self.clock.now().format("%Y-%m-%d").to_string();

        let performance = self.store.load_performance();
        let cumulative: Decimal = performance.trades.iter().map(|t| t.realized_pnl).sum();
        let daily_pnl = self.ledger.daily_pnl();

        let journal = self.store.load_journal();
        let trades_today = journal
            .transactions
            .iter()
            .filter(|t| t.timestamp.format("%Y-%m-%d").to_string() == today)
            .count() as u32;

        let capital = self.config.initial_capital;
        let total_assets = capital + cumulative;
        let pct = |v: Decimal| {
            if capital > Decimal::ZERO {
                (v / capital).to_f64().unwrap_or(0.0) * 100.0
            } else {
                0.0
            }
        };

        let snapshot = DailySnapshot {
            date: today,
            total_assets,
            daily_pnl,
            daily_pnl_pct: pct(daily_pnl),
            cumulative_pnl_pct: pct(cumulative),
            position_count: self.executor.book().count() as u32,
            trades_today,
        };

        if let Err(e) = self.store.append_daily_snapshot(capital, snapshot) {
            warn!(error = %e, "daily snapshot write failed");
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ChannelCommandSource;
    use crate::exchange::mock::MockExchange;
    use crate::notifier::LogNotifier;
    use crate::position::PositionBook;
    use crate::regime::RegimeTracker;
    use crate::strategy::ScoreStrategy;
    use crate::types::{Coin, RunMode, SystemClock};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn coin(symbol: &str, rank: u32) -> Coin {
        Coin {
            symbol: symbol.to_string(),
            pair: format!("{symbol}/KRW"),
            min_order_qty: dec!(0.0001),
            min_order_value: dec!(5000),
            price_precision: 0,
            qty_precision: 4,
            rank,
        }
    }

    struct Rig {
        scheduler: Scheduler,
        store: Arc<StateStore>,
        exchange: Arc<MockExchange>,
        _dir: TempDir,
    }

    fn rig(
        mut config: EngineConfig,
        commands: Option<Box<dyn CommandSource>>,
    ) -> Rig {
        config.coins = vec![coin("BTC", 1)];
        let config = Arc::new(config);
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let exchange = Arc::new(MockExchange::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ledger = Arc::new(RiskLedger::new(
            config.initial_capital,
            config.max_daily_loss_pct,
            config.max_consecutive_losses,
            clock.clone(),
        ));
        let notifier = NotifierHandle::spawn(Arc::new(LogNotifier));
        let executor = Arc::new(LiveExecutor::new(
            exchange.clone(),
            Arc::new(PositionBook::new()),
            ledger.clone(),
            store.clone(),
            notifier.clone(),
            clock.clone(),
            config.initial_capital,
            config.fee_rate,
            RunMode::DryRun,
            false,
        ));
        let portfolio = Arc::new(PortfolioManager::new(
            config.clone(),
            exchange.clone(),
            Arc::new(ScoreStrategy),
            executor.clone(),
            ledger.clone(),
            store.clone(),
            Arc::new(RegimeTracker::new()),
            notifier.clone(),
            clock.clone(),
        ));

        let scheduler = Scheduler::new(
            config,
            portfolio,
            executor,
            ledger,
            store.clone(),
            notifier,
            clock,
            commands,
        );
        Rig {
            scheduler,
            store,
            exchange,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_signal_exits_cleanly() {
        let rig = rig(EngineConfig::default(), None);
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(rig.scheduler.run(rx));
        // Let the first cycle run, then signal during the sleep window.
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();

        let reason = handle.await.unwrap();
        assert_eq!(reason, ExitReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_command_exits_cleanly() {
        let (tx, source) = ChannelCommandSource::new(4);
        let rig = rig(EngineConfig::default(), Some(Box::new(source)));
        let (_shutdown_tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(rig.scheduler.run(rx));
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(Command::Stop).await.unwrap();

        let reason = handle.await.unwrap();
        assert_eq!(reason, ExitReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_all_timeouts_exit_for_restart() {
        // The single coin hangs past the per-coin timeout, so every cycle is
        // an all-timeout cycle; the third one must end the loop.
        let mut config = EngineConfig::default();
        config.consecutive_timeout_limit = 3;
        config.cycle_interval_secs = 10;

        let rig = rig(config, None);
        rig.exchange
            .set_pair_latency("BTC/KRW", Duration::from_secs(600));
        let (_tx, rx) = tokio::sync::watch::channel(false);

        let reason = rig.scheduler.run(rx).await;
        assert_eq!(reason, ExitReason::ConsecutiveTimeouts);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_trip_the_timeout_watchdog() {
        // Unscripted candles fail immediately — failures, not timeouts — so
        // the counter stays at zero and the loop keeps cycling until told to
        // stop.
        let mut config = EngineConfig::default();
        config.consecutive_timeout_limit = 2;
        config.cycle_interval_secs = 10;

        let rig = rig(config, None);
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(rig.scheduler.run(rx));
        tokio::time::sleep(Duration::from_secs(45)).await;
        tx.send(true).unwrap();
        let reason = handle.await.unwrap();
        assert_eq!(reason, ExitReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn daily_snapshot_written_each_cycle() {
        let mut config = EngineConfig::default();
        config.cycle_interval_secs = 10;
        let rig = rig(config, None);
        let store = rig.store.clone();
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(rig.scheduler.run(rx));
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let history = store.load_daily_history();
        assert_eq!(history.snapshots.len(), 1);
        assert_eq!(history.initial_capital, dec!(1000000));
    }
}
