// =============================================================================
// Portfolio Manager — per-cycle orchestration and arbitration
// =============================================================================
//
// One cycle:
//   1. Optional monthly/emergency rebalance (pre-arbitration, gates intact).
//   2. Immutable snapshot of the active coin set and open positions.
//   3. One analysis task per coin under PerCoinTimeout, all awaited under
//      TotalTimeout. A task fetches its own daily + 4h candles, classifies
//      the regime, derives factors, and runs the strategy.
//   4. Timed-out or failed coins are substituted with HOLD + the coin's last
//      valid regime. An all-timeout cycle bumps the watchdog counter.
//   5. Arbitration: exits first (per-position, cannot conflict), then BUY
//      candidates ordered by (score desc, rank asc) are accepted into the
//      remaining position slots, each subject to the risk-ledger gates.
//   6. State is persisted atomically, and a one-message cycle summary goes to
//      the notifier.
//
// Entry ordering is deterministic: ties never resolve by arrival time.
// =============================================================================

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::exchange::ExchangeAdapter;
use crate::executor::{ApplyResult, LiveExecutor};
use crate::factors::{derive_factors, Factors, FactorsRecord, VolatilityBucket};
use crate::indicators::atr::atr_pct;
use crate::market_data::validate_series;
use crate::notifier::NotifierHandle;
use crate::regime::{classify, Regime, RegimeTracker};
use crate::risk::RiskLedger;
use crate::state_store::{EngineState, StateStore};
use crate::strategy::{Action, Decision, Strategy};
use crate::types::{Clock, Coin, Interval};

/// Everything one per-coin task produced.
#[derive(Debug, Clone)]
pub struct CoinAnalysis {
    pub coin: Coin,
    pub decision: Decision,
    pub factors: Factors,
    pub atr_pct: f64,
    pub volatility: VolatilityBucket,
    pub timed_out: bool,
    pub failed: bool,
    /// Set when this cycle's classification changed the coin's regime.
    pub regime_change: Option<(Regime, Regime)>,
}

/// What a cycle did, for logging and the notifier.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub cycle_id: u64,
    pub lines: Vec<String>,
    pub timed_out_coins: Vec<String>,
    pub all_timed_out: bool,
    pub open_positions: usize,
    pub entries_taken: u32,
    pub exits_taken: u32,
}

impl CycleSummary {
    fn render(&self, daily_loss_pct: f64, max_positions: u32) -> String {
        let mut text = format!(
            "Cycle #{} | open {}/{} | daily {:+.2}%\n",
            self.cycle_id, self.open_positions, max_positions, daily_loss_pct
        );
        text.push_str(&self.lines.join("\n"));
        if !self.timed_out_coins.is_empty() {
            text.push_str(&format!(
                "\ntimeouts: [{}]",
                self.timed_out_coins.join(", ")
            ));
        }
        text
    }
}

/// Result of one per-coin analysis task before substitution.
struct TaskSuccess {
    decision: Decision,
    factors: Factors,
    atr_pct: f64,
    volatility: VolatilityBucket,
    regime_change: Option<(Regime, Regime)>,
}

pub struct PortfolioManager {
    config: Arc<EngineConfig>,
    exchange: Arc<dyn ExchangeAdapter>,
    strategy: Arc<dyn Strategy>,
    executor: Arc<LiveExecutor>,
    ledger: Arc<RiskLedger>,
    store: Arc<StateStore>,
    regimes: Arc<RegimeTracker>,
    notifier: NotifierHandle,
    clock: Arc<dyn Clock>,

    /// Coin set the cycle iterates; replaced only by rebalance.
    active_coins: RwLock<Vec<Coin>>,
    last_factors: RwLock<Option<FactorsRecord>>,
    consecutive_timeout_cycles: AtomicU32,
    last_rebalance_month: RwLock<Option<String>>,
    last_emergency_rebalance_month: RwLock<Option<String>>,
}

impl PortfolioManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<EngineConfig>,
        exchange: Arc<dyn ExchangeAdapter>,
        strategy: Arc<dyn Strategy>,
        executor: Arc<LiveExecutor>,
        ledger: Arc<RiskLedger>,
        store: Arc<StateStore>,
        regimes: Arc<RegimeTracker>,
        notifier: NotifierHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let active_coins = config.coins.clone();
        Self {
            config,
            exchange,
            strategy,
            executor,
            ledger,
            store,
            regimes,
            notifier,
            clock,
            active_coins: RwLock::new(active_coins),
            last_factors: RwLock::new(None),
            consecutive_timeout_cycles: AtomicU32::new(0),
            last_rebalance_month: RwLock::new(None),
            last_emergency_rebalance_month: RwLock::new(None),
        }
    }

    /// Restore rebalance markers and timeout counter from persisted state.
    pub fn restore(&self, state: &EngineState) {
        *self.last_rebalance_month.write() = state.last_rebalance_month.clone();
        *self.last_emergency_rebalance_month.write() =
            state.last_emergency_rebalance_month.clone();
        self.consecutive_timeout_cycles
            .store(state.consecutive_timeout_cycles, AtomicOrdering::SeqCst);
        *self.last_factors.write() = state.last_factors.clone();
    }

    pub fn consecutive_timeout_cycles(&self) -> u32 {
        self.consecutive_timeout_cycles.load(AtomicOrdering::SeqCst)
    }

    pub fn last_factors(&self) -> Option<FactorsRecord> {
        self.last_factors.read().clone()
    }

    pub fn active_coins(&self) -> Vec<Coin> {
        self.active_coins.read().clone()
    }

    // =========================================================================
    // Cycle driver
    // =========================================================================

    /// Run one full cycle. Never panics the loop: every failure inside is
    /// contained to its coin or logged and skipped.
    pub async fn run_cycle(&self, cycle_id: u64) -> CycleSummary {
        let started = Instant::now();
        info!(cycle_id, "cycle start");

        self.maybe_rebalance().await;

        let analyses = self.analyze_all(cycle_id).await;
        let mut summary = self.apply_analyses(cycle_id, &analyses).await;

        self.persist(&analyses);

        summary.open_positions = self.executor.book().count();
        let risk = self.ledger.snapshot();
        self.notifier
            .notify_cycle_summary(&summary.render(risk.daily_loss_pct, self.config.max_positions));

        info!(
            cycle_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            entries = summary.entries_taken,
            exits = summary.exits_taken,
            timeouts = summary.timed_out_coins.len(),
            all_timed_out = summary.all_timed_out,
            "cycle complete"
        );
        summary
    }

    // =========================================================================
    // Fan-out analysis
    // =========================================================================

    /// Launch one task per active coin and gather results under the cycle
    /// deadline. Missing results become HOLD + last-valid-regime substitutes.
    pub async fn analyze_all(&self, cycle_id: u64) -> Vec<CoinAnalysis> {
        let coins = self.active_coins.read().clone();
        let per_coin = Duration::from_secs(self.config.per_coin_timeout_secs);
        let total = Duration::from_secs(self.config.total_timeout_secs);

        let mut set: JoinSet<(String, Result<TaskSuccess, EngineError>)> = JoinSet::new();
        for coin in coins.clone() {
            let exchange = self.exchange.clone();
            let strategy = self.strategy.clone();
            let book = self.executor.book().clone();
            let regimes = self.regimes.clone();
            let daily_bars = self.config.daily_bars;
            let strategy_bars = self.config.strategy_bars;

            set.spawn(async move {
                let symbol = coin.symbol.clone();
                let work = analyze_one(
                    exchange,
                    strategy,
                    book,
                    regimes,
                    coin,
                    daily_bars,
                    strategy_bars,
                );
                let outcome = match tokio::time::timeout(per_coin, work).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::PerCoinTimeout(symbol.clone())),
                };
                (symbol, outcome)
            });
        }

        // Gather under the total deadline; stragglers are abandoned, not
        // awaited.
        let deadline = Instant::now() + total;
        let mut results: HashMap<String, Result<TaskSuccess, EngineError>> = HashMap::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, set.join_next()).await {
                Ok(Some(Ok((symbol, outcome)))) => {
                    results.insert(symbol, outcome);
                }
                Ok(Some(Err(join_err))) => {
                    error!(cycle_id, error = %join_err, "analysis task aborted");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(cycle_id, error = %EngineError::CycleTimeout, "abandoning straggler tasks");
                    set.abort_all();
                    break;
                }
            }
        }

        // Substitute and assemble in coin order.
        let mut analyses = Vec::with_capacity(coins.len());
        let mut timeout_coins = Vec::new();
        for coin in coins {
            let symbol = coin.symbol.clone();
            let analysis = match results.remove(&symbol) {
                Some(Ok(success)) => CoinAnalysis {
                    coin,
                    decision: success.decision,
                    factors: success.factors,
                    atr_pct: success.atr_pct,
                    volatility: success.volatility,
                    timed_out: false,
                    failed: false,
                    regime_change: success.regime_change,
                },
                Some(Err(EngineError::PerCoinTimeout(_))) | None => {
                    let regime = self.regimes.last_valid(&symbol);
                    timeout_coins.push(symbol.clone());
                    CoinAnalysis {
                        coin,
                        decision: Decision::hold("timeout", regime),
                        factors: derive_factors(regime, VolatilityBucket::Normal),
                        atr_pct: 0.0,
                        volatility: VolatilityBucket::Normal,
                        timed_out: true,
                        failed: false,
                        regime_change: None,
                    }
                }
                Some(Err(e)) => {
                    let regime = self.regimes.last_valid(&symbol);
                    if e.is_recoverable_per_coin() {
                        warn!(cycle_id, coin = %symbol, error = %e, "analysis failed — substituting HOLD");
                    } else {
                        error!(cycle_id, coin = %symbol, error = %e, "unexpected analysis failure — substituting HOLD");
                    }
                    CoinAnalysis {
                        coin,
                        decision: Decision::hold(format!("error: {e}"), regime),
                        factors: derive_factors(regime, VolatilityBucket::Normal),
                        atr_pct: 0.0,
                        volatility: VolatilityBucket::Normal,
                        timed_out: false,
                        failed: true,
                        regime_change: None,
                    }
                }
            };
            analyses.push(analysis);
        }

        // Watchdog accounting: only an all-timeout cycle counts.
        if !analyses.is_empty() && timeout_coins.len() == analyses.len() {
            let count = self
                .consecutive_timeout_cycles
                .fetch_add(1, AtomicOrdering::SeqCst)
                + 1;
            warn!(cycle_id, consecutive = count, "all coins timed out this cycle");
        } else {
            self.consecutive_timeout_cycles
                .store(0, AtomicOrdering::SeqCst);
        }
        if !timeout_coins.is_empty() {
            self.notifier.notify_timeout_alert(cycle_id, &timeout_coins);
        }

        analyses
    }

    // =========================================================================
    // Arbitration + execution
    // =========================================================================

    /// Apply a cycle's analyses: exits first, then prioritized entries.
    pub async fn apply_analyses(&self, cycle_id: u64, analyses: &[CoinAnalysis]) -> CycleSummary {
        let mut lines = Vec::with_capacity(analyses.len());
        let mut entries_taken = 0u32;
        let mut exits_taken = 0u32;

        for analysis in analyses {
            if let Some((old, new)) = analysis.regime_change {
                self.notifier
                    .notify_regime_change(&analysis.coin.symbol, old, new);
            }
        }

        // --- Exits (and position upkeep) first ------------------------------
        for analysis in analyses {
            let symbol = &analysis.coin.symbol;
            if !self.executor.book().contains(symbol) {
                continue;
            }
            match analysis.decision.action {
                Action::SellPartial | Action::Close => {
                    match self
                        .executor
                        .apply_exit(&analysis.coin, &analysis.decision, &analysis.factors)
                        .await
                    {
                        Ok(ApplyResult::Filled(_) | ApplyResult::Simulated(_)) => {
                            exits_taken += 1;
                            lines.push(format!(
                                "{symbol}: {} ({})",
                                analysis.decision.action, analysis.decision.reason
                            ));
                        }
                        Ok(other) => {
                            lines.push(format!("{symbol}: exit {other}"));
                        }
                        Err(e) => {
                            error!(cycle_id, coin = %symbol, error = %e, "exit failed");
                            lines.push(format!("{symbol}: exit failed ({e})"));
                        }
                    }
                }
                Action::Hold | Action::Buy => {
                    // Tick upkeep: trailing stop, intra-cycle stop breach,
                    // optional pyramid add. Timed-out coins are left alone.
                    if !analysis.timed_out && !analysis.failed {
                        if let Err(e) = self
                            .executor
                            .observe_tick(&analysis.coin, &analysis.factors)
                            .await
                        {
                            debug!(cycle_id, coin = %symbol, error = %e, "tick upkeep failed");
                        }
                        if let Some(snap) = analysis.decision.indicators.as_ref() {
                            if let Err(e) = self
                                .executor
                                .maybe_pyramid(&analysis.coin, snap, &analysis.factors)
                                .await
                            {
                                debug!(cycle_id, coin = %symbol, error = %e, "pyramid check failed");
                            }
                        }
                    }
                    lines.push(hold_line(analysis));
                }
            }
        }

        // --- Entries, by (score desc, rank asc) -----------------------------
        let mut candidates: Vec<&CoinAnalysis> = analyses
            .iter()
            .filter(|a| {
                a.decision.action == Action::Buy && !self.executor.book().contains(&a.coin.symbol)
            })
            .collect();
        candidates.sort_by(|a, b| entry_priority(a, b));

        for candidate in candidates {
            let symbol = &candidate.coin.symbol;

            if self.executor.book().count() >= self.config.max_positions as usize {
                lines.push(format!("{symbol}: BUY rejected (portfolio_slot)"));
                continue;
            }
            if let Err(block) = self.ledger.can_open() {
                lines.push(format!("{symbol}: BUY rejected ({block})"));
                continue;
            }

            match self
                .executor
                .open_entry(&candidate.coin, &candidate.decision, &candidate.factors)
                .await
            {
                Ok(ApplyResult::Filled(_) | ApplyResult::Simulated(_)) => {
                    entries_taken += 1;
                    lines.push(format!(
                        "{symbol}: BUY (score {:.1}, {})",
                        candidate.decision.score, candidate.decision.regime
                    ));
                }
                Ok(ApplyResult::Rejected(reason)) => {
                    lines.push(format!("{symbol}: BUY rejected ({reason})"));
                }
                Ok(ApplyResult::Noop) => {}
                Err(e) => {
                    error!(cycle_id, coin = %symbol, error = %e, "entry failed");
                    lines.push(format!("{symbol}: BUY failed ({e})"));
                }
            }
        }

        // Coins with no position and no BUY still deserve a summary line.
        for analysis in analyses {
            let symbol = &analysis.coin.symbol;
            let mentioned = lines.iter().any(|l| l.starts_with(symbol.as_str()));
            if !mentioned {
                lines.push(hold_line(analysis));
            }
        }

        let timed_out_coins: Vec<String> = analyses
            .iter()
            .filter(|a| a.timed_out)
            .map(|a| a.coin.symbol.clone())
            .collect();
        let all_timed_out = !analyses.is_empty() && timed_out_coins.len() == analyses.len();

        CycleSummary {
            cycle_id,
            lines,
            timed_out_coins,
            all_timed_out,
            open_positions: self.executor.book().count(),
            entries_taken,
            exits_taken,
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn persist(&self, analyses: &[CoinAnalysis]) {
        // Factors record from the best fresh analysis (coin order = rank
        // order as configured).
        if let Some(best) = analyses.iter().find(|a| !a.timed_out && !a.failed) {
            let record = FactorsRecord {
                factors: best.factors.clone(),
                regime: best.decision.regime,
                volatility_bucket: best.volatility,
                atr_pct: best.atr_pct,
                generated_at: self.clock.now(),
            };
            if let Err(e) = self.store.save_factors(&record) {
                warn!(error = %e, "factors persist failed");
            }
            *self.last_factors.write() = Some(record);
        }

        let state = EngineState::from_parts(
            self.executor.book().snapshot(),
            self.last_factors.read().clone(),
            self.regimes.snapshot(),
            &self.ledger.snapshot(),
            self.consecutive_timeout_cycles(),
            self.last_rebalance_month.read().clone(),
            self.last_emergency_rebalance_month.read().clone(),
            self.clock.now(),
        );
        if let Err(e) = self.store.save_engine_state(&state) {
            error!(error = %e, "engine state persist failed");
        }
    }

    // =========================================================================
    // Rebalance
    // =========================================================================

    /// Monthly re-selection on the first day of the month, plus an emergency
    /// path when the position count collapses. Each fires at most once per
    /// calendar month, tracked separately.
    async fn maybe_rebalance(&self) {
        let cfg = &self.config.rebalance;
        if !cfg.enabled || cfg.universe.is_empty() {
            return;
        }

        let now = self.clock.now();
        let month = now.format("%Y-%m").to_string();
        let day_of_month = {
            use chrono::Datelike;
            now.day()
        };

        let monthly_due =
            day_of_month == 1 && self.last_rebalance_month.read().as_deref() != Some(&month);
        if monthly_due {
            self.reselect("monthly").await;
            *self.last_rebalance_month.write() = Some(month);
            return;
        }

        let floor = (cfg.target_count as f64 * cfg.emergency_ratio).ceil() as usize;
        let emergency_due = self.executor.book().count() < floor
            && self.last_emergency_rebalance_month.read().as_deref() != Some(&month);
        if emergency_due {
            self.reselect("emergency").await;
            *self.last_emergency_rebalance_month.write() = Some(month);
        }
    }

    /// Swap the active coin set for the top-ranked slice of the universe and
    /// close positions that fell out of it. Entry gates are untouched — new
    /// coins earn positions through the normal scoring path.
    async fn reselect(&self, kind: &str) {
        let cfg = &self.config.rebalance;
        let mut universe = cfg.universe.clone();
        universe.sort_by_key(|c| c.rank);
        universe.truncate(cfg.target_count as usize);

        let selected: Vec<String> = universe.iter().map(|c| c.symbol.clone()).collect();
        info!(kind, selected = ?selected, "rebalance re-selection");
        self.notifier
            .push(format!("Rebalance ({kind}): active set -> [{}]", selected.join(", ")));

        let dropped: Vec<Coin> = self
            .active_coins
            .read()
            .iter()
            .filter(|c| !selected.contains(&c.symbol))
            .cloned()
            .collect();
        for coin in dropped {
            if self.executor.book().contains(&coin.symbol) {
                if let Err(e) = self.executor.close_full(&coin, "rebalance", None).await {
                    error!(coin = %coin.symbol, error = %e, "rebalance close failed");
                }
            }
        }

        *self.active_coins.write() = universe;
    }
}

/// Summary line for a coin that ends the cycle without an order.
fn hold_line(analysis: &CoinAnalysis) -> String {
    let symbol = &analysis.coin.symbol;
    if analysis.timed_out {
        format!(
            "{symbol}: HOLD (timeout, prev_regime={})",
            analysis.decision.regime
        )
    } else if analysis.failed {
        format!("{symbol}: HOLD ({})", analysis.decision.reason)
    } else {
        format!(
            "{symbol}: {} (score {:.1}, {})",
            analysis.decision.action, analysis.decision.score, analysis.decision.regime
        )
    }
}

/// Deterministic entry ordering: higher score first, rank breaks ties.
fn entry_priority(a: &CoinAnalysis, b: &CoinAnalysis) -> Ordering {
    b.decision
        .score
        .partial_cmp(&a.decision.score)
        .unwrap_or(Ordering::Equal)
        .then(a.coin.rank.cmp(&b.coin.rank))
}

/// One coin's full analysis pipeline, run inside its own task.
async fn analyze_one(
    exchange: Arc<dyn ExchangeAdapter>,
    strategy: Arc<dyn Strategy>,
    book: Arc<crate::position::PositionBook>,
    regimes: Arc<RegimeTracker>,
    coin: Coin,
    daily_bars: u32,
    strategy_bars: u32,
) -> Result<TaskSuccess, EngineError> {
    // Daily series -> regime (falling back to the last valid one when the
    // warmup is unmet).
    let daily = exchange
        .get_ohlcv(&coin.pair, Interval::D1, daily_bars)
        .await?;
    if let Err(defect) = validate_series(&daily) {
        return Err(EngineError::InsufficientData(format!(
            "daily series for {}: {defect}",
            coin.symbol
        )));
    }

    let (regime, regime_change) = match classify(&daily) {
        Ok(reading) => {
            let prev = regimes.record(&coin.symbol, reading.regime);
            let change = match prev {
                Some(old) if old != reading.regime => Some((old, reading.regime)),
                _ => None,
            };
            (reading.regime, change)
        }
        Err(EngineError::InsufficientData(cause)) => {
            debug!(coin = %coin.symbol, cause, "regime warmup unmet — using last valid");
            (regimes.last_valid(&coin.symbol), None)
        }
        Err(e) => return Err(e),
    };

    // 4h series -> volatility bucket + factors + decision.
    let series_4h = exchange
        .get_ohlcv(&coin.pair, Interval::H4, strategy_bars)
        .await?;
    if let Err(defect) = validate_series(&series_4h) {
        return Err(EngineError::InsufficientData(format!(
            "4h series for {}: {defect}",
            coin.symbol
        )));
    }

    let atr_pct_value = atr_pct(&series_4h, 14).ok_or_else(|| {
        EngineError::InsufficientData(format!("ATR warmup unmet for {}", coin.symbol))
    })?;
    let volatility = VolatilityBucket::from_atr_pct(atr_pct_value);
    let factors = derive_factors(regime, volatility);

    let position = book.get(&coin.symbol);
    let decision = strategy.analyze(
        &coin.symbol,
        &series_4h,
        &factors,
        regime,
        position.as_ref(),
    )?;

    Ok(TaskSuccess {
        decision,
        factors,
        atr_pct: atr_pct_value,
        volatility,
        regime_change,
    })
}
