// =============================================================================
// Live Executor — the only component that sends orders
// =============================================================================
//
// Owns the position book. Translates strategy decisions into market orders,
// applies the stop/target state machines on every price it observes, and
// journals every fill.
//
// Order path:
//   - Dry-run simulates a fill at the reference price with the configured fee
//     rate; no network I/O.
//   - Live orders retry transient failures with exponential backoff (3
//     attempts, 1 s base, jitter). Rate-limit responses trigger a bounded
//     wait that does not consume the retry budget. An auth failure latches
//     the risk ledger read-only.
//
// Entry risk math:
//   riskPerTrade = capital * 1% * positionSizeMultiplier
//   atrStopDist  = ATR14(4h) * chandelierMultiplier
//   size         = riskPerTrade / atrStopDist, floored to the coin's qty step
//   stop         = entry - atrStopDist
//   targets      = entry + atrStopDist * {1.5, 2.5}
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::exchange::{ExchangeAdapter, ExchangeError, Fill};
use crate::factors::Factors;
use crate::position::{Position, PositionBook};
use crate::risk::RiskLedger;
use crate::state_store::{StateStore, TradeOutcome, Transaction};
use crate::strategy::{Action, Decision, IndicatorSnapshot};
use crate::notifier::NotifierHandle;
use crate::types::{Clock, Coin, RunMode, Side};

/// Transient-failure retry budget per order.
const MAX_ORDER_ATTEMPTS: u32 = 3;
/// Base backoff before the first retry.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Ceiling on any single rate-limit wait.
const RATE_LIMIT_WAIT_CAP: Duration = Duration::from_secs(30);
/// Fallback rate-limit wait when the exchange gives no Retry-After.
const RATE_LIMIT_WAIT_DEFAULT: Duration = Duration::from_secs(2);

/// First/second target distances in ATR-stop units.
const FIRST_TARGET_MULT: Decimal = Decimal::from_parts(15, 0, 0, false, 1); // 1.5
const SECOND_TARGET_MULT: Decimal = Decimal::from_parts(25, 0, 0, false, 1); // 2.5

/// Fraction of capital risked per trade before the size multiplier.
const RISK_FRACTION: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01

/// Pyramid add sizes relative to the base entry, indexed by entries already
/// taken.
const PYRAMID_FRACTIONS: [f64; 3] = [1.0, 0.5, 0.25];

/// Outcome of routing one decision through the executor.
#[derive(Debug, Clone)]
pub enum ApplyResult {
    /// A live order filled on the exchange.
    Filled(Fill),
    /// A dry-run fill was synthesized locally.
    Simulated(Fill),
    /// The order was refused before reaching the exchange.
    Rejected(String),
    /// Nothing to do (HOLD, or no position for an exit).
    Noop,
}

impl std::fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled(fill) => write!(f, "Filled({} @ {})", fill.qty, fill.avg_price),
            Self::Simulated(fill) => write!(f, "Simulated({} @ {})", fill.qty, fill.avg_price),
            Self::Rejected(reason) => write!(f, "Rejected({reason})"),
            Self::Noop => write!(f, "Noop"),
        }
    }
}

/// The executor. Constructed once and shared.
pub struct LiveExecutor {
    exchange: Arc<dyn ExchangeAdapter>,
    book: Arc<PositionBook>,
    ledger: Arc<RiskLedger>,
    store: Arc<StateStore>,
    notifier: NotifierHandle,
    clock: Arc<dyn Clock>,
    capital: Decimal,
    fee_rate: Decimal,
    mode: RunMode,
    pyramiding_enabled: bool,
}

impl LiveExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        book: Arc<PositionBook>,
        ledger: Arc<RiskLedger>,
        store: Arc<StateStore>,
        notifier: NotifierHandle,
        clock: Arc<dyn Clock>,
        capital: Decimal,
        fee_rate: Decimal,
        mode: RunMode,
        pyramiding_enabled: bool,
    ) -> Self {
        Self {
            exchange,
            book,
            ledger,
            store,
            notifier,
            clock,
            capital,
            fee_rate,
            mode,
            pyramiding_enabled,
        }
    }

    pub fn book(&self) -> &Arc<PositionBook> {
        &self.book
    }

    fn is_dry_run(&self) -> bool {
        self.mode == RunMode::DryRun
    }

    // =========================================================================
    // Entry
    // =========================================================================

    /// Open a position from an accepted BUY decision. Portfolio-level gates
    /// have already been checked; this enforces only order-level constraints.
    pub async fn open_entry(
        &self,
        coin: &Coin,
        decision: &Decision,
        factors: &Factors,
    ) -> Result<ApplyResult, EngineError> {
        if self.book.contains(&coin.symbol) {
            return Ok(ApplyResult::Rejected("already_in_position".to_string()));
        }
        let snap = decision.indicators.as_ref().ok_or_else(|| {
            EngineError::InvalidParam("BUY decision without indicator snapshot".to_string())
        })?;

        let entry_price = dec_from_f64(snap.close, "entry close")?;
        let sizing = self.entry_sizing(coin, snap, factors)?;
        if sizing.size <= Decimal::ZERO || sizing.size < coin.min_order_qty {
            return Ok(ApplyResult::Rejected("below_min_order_qty".to_string()));
        }
        if sizing.size * entry_price < coin.min_order_value {
            return Ok(ApplyResult::Rejected("below_min_order_value".to_string()));
        }

        let fill = match self
            .execute_order(coin, Side::Buy, sizing.size, entry_price)
            .await
        {
            Ok(fill) => fill,
            Err(e) => return Err(self.order_error(coin, e)),
        };

        let pos = Position::open(
            &coin.symbol,
            fill.avg_price,
            fill.qty,
            fill.avg_price - sizing.atr_stop_dist,
            fill.avg_price + sizing.atr_stop_dist * FIRST_TARGET_MULT,
            fill.avg_price + sizing.atr_stop_dist * SECOND_TARGET_MULT,
            factors.profit_target_mode,
            decision.regime,
            decision.score,
            self.clock.now(),
        );

        if self.book.insert(pos).is_err() {
            // A duplicate slipped past the pre-check; the position table wins
            // and the duplicate order is journaled for the operator.
            warn!(coin = %coin.symbol, "duplicate entry fill — position table unchanged");
            return Ok(ApplyResult::Rejected("already_in_position".to_string()));
        }

        let tx = Transaction {
            timestamp: self.clock.now(),
            coin: coin.symbol.clone(),
            side: Side::Buy,
            qty: fill.qty,
            price: fill.avg_price,
            fee: fill.fee,
            reason: decision.reason.clone(),
            regime: decision.regime,
            entry_score: Some(decision.score),
            realized_pnl: None,
            pnl_pct: None,
            dry_run: self.is_dry_run(),
        };
        self.journal(tx);

        info!(
            coin = %coin.symbol,
            qty = %fill.qty,
            price = %fill.avg_price,
            score = decision.score,
            "entry executed"
        );

        Ok(self.wrap_fill(fill))
    }

    /// Entry sizing per the risk math above.
    fn entry_sizing(
        &self,
        coin: &Coin,
        snap: &IndicatorSnapshot,
        factors: &Factors,
    ) -> Result<EntrySizing, EngineError> {
        let atr = dec_from_f64(snap.atr, "ATR")?;
        if atr <= Decimal::ZERO {
            return Err(EngineError::InvalidParam(format!(
                "non-positive ATR for {}: {atr}",
                coin.symbol
            )));
        }
        let chandelier = dec_from_f64(factors.chandelier_multiplier, "chandelier multiplier")?;
        let size_mult = dec_from_f64(factors.position_size_multiplier, "size multiplier")?;

        let risk_per_trade = self.capital * RISK_FRACTION * size_mult;
        let atr_stop_dist = atr * chandelier;
        let size = (risk_per_trade / atr_stop_dist)
            .round_dp_with_strategy(coin.qty_precision, RoundingStrategy::ToZero);

        Ok(EntrySizing {
            size,
            atr_stop_dist,
        })
    }

    // =========================================================================
    // Pyramiding (config-gated, off by default)
    // =========================================================================

    /// Add to an existing position when price has dropped far enough below
    /// the blended entry. Stops and targets are refreshed from the combined
    /// position.
    pub async fn maybe_pyramid(
        &self,
        coin: &Coin,
        snap: &IndicatorSnapshot,
        factors: &Factors,
    ) -> Result<ApplyResult, EngineError> {
        if !self.pyramiding_enabled {
            return Ok(ApplyResult::Noop);
        }
        let Some(pos) = self.book.get(&coin.symbol) else {
            return Ok(ApplyResult::Noop);
        };
        if pos.entries_taken >= 3 || pos.first_target_hit {
            return Ok(ApplyResult::Noop);
        }
        if self.ledger.can_open().is_err() {
            return Ok(ApplyResult::Noop);
        }

        let price = dec_from_f64(snap.close, "pyramid close")?;
        let threshold = dec_from_f64(factors.pyramid_threshold_pct, "pyramid threshold")?
            / Decimal::ONE_HUNDRED;
        let trigger = pos.entry_price * (Decimal::ONE - threshold);
        if price > trigger {
            return Ok(ApplyResult::Noop);
        }

        let sizing = self.entry_sizing(coin, snap, factors)?;
        let fraction =
            dec_from_f64(PYRAMID_FRACTIONS[pos.entries_taken as usize], "pyramid fraction")?;
        let add_qty = (sizing.size * fraction)
            .round_dp_with_strategy(coin.qty_precision, RoundingStrategy::ToZero);
        if add_qty < coin.min_order_qty || add_qty * price < coin.min_order_value {
            return Ok(ApplyResult::Rejected("below_min_order_value".to_string()));
        }

        let fill = match self.execute_order(coin, Side::Buy, add_qty, price).await {
            Ok(fill) => fill,
            Err(e) => return Err(self.order_error(coin, e)),
        };

        self.book.with_mut(&coin.symbol, |p| {
            p.apply_add(fill.avg_price, fill.qty);
            // Stop/target math restated from the new combined basis.
            p.stop_loss_price = p.entry_price - sizing.atr_stop_dist;
            p.first_target_price = p.entry_price + sizing.atr_stop_dist * FIRST_TARGET_MULT;
            p.second_target_price = p.entry_price + sizing.atr_stop_dist * SECOND_TARGET_MULT;
        });

        let tx = Transaction {
            timestamp: self.clock.now(),
            coin: coin.symbol.clone(),
            side: Side::Buy,
            qty: fill.qty,
            price: fill.avg_price,
            fee: fill.fee,
            reason: "pyramid_add".to_string(),
            regime: self
                .book
                .get(&coin.symbol)
                .map(|p| p.regime_at_entry)
                .unwrap_or(crate::regime::Regime::Neutral),
            entry_score: None,
            realized_pnl: None,
            pnl_pct: None,
            dry_run: self.is_dry_run(),
        };
        self.journal(tx);

        Ok(self.wrap_fill(fill))
    }

    // =========================================================================
    // Exits
    // =========================================================================

    /// Route a SELL_PARTIAL or CLOSE decision. HOLD/BUY are no-ops here.
    pub async fn apply_exit(
        &self,
        coin: &Coin,
        decision: &Decision,
        factors: &Factors,
    ) -> Result<ApplyResult, EngineError> {
        match decision.action {
            Action::SellPartial => self.sell_partial(coin, decision, factors).await,
            Action::Close => {
                let price = decision
                    .indicators
                    .as_ref()
                    .map(|s| dec_from_f64(s.close, "exit close"))
                    .transpose()?;
                self.close_full(coin, &decision.reason, price).await
            }
            Action::Hold | Action::Buy => Ok(ApplyResult::Noop),
        }
    }

    async fn sell_partial(
        &self,
        coin: &Coin,
        decision: &Decision,
        factors: &Factors,
    ) -> Result<ApplyResult, EngineError> {
        let Some(pos) = self.book.get(&coin.symbol) else {
            return Ok(ApplyResult::Noop);
        };
        let snap = decision.indicators.as_ref().ok_or_else(|| {
            EngineError::InvalidParam("partial exit without indicator snapshot".to_string())
        })?;
        let ref_price = dec_from_f64(snap.close, "partial exit close")?;

        let half = (pos.size / Decimal::TWO)
            .round_dp_with_strategy(coin.qty_precision, RoundingStrategy::ToZero);
        if half <= Decimal::ZERO {
            // Remaining size too small to split — close the whole thing.
            return self.close_full(coin, "first_target", Some(ref_price)).await;
        }

        let fill = match self.execute_order(coin, Side::Sell, half, ref_price).await {
            Ok(fill) => fill,
            Err(e) => return Err(self.order_error(coin, e)),
        };

        let trailing = dec_from_f64(factors.trailing_stop_pct, "trailing pct")?;
        self.book.with_mut(&coin.symbol, |p| {
            p.record_partial_exit(fill.qty, fill.avg_price, trailing);
        });

        let realized = (fill.avg_price - pos.entry_price) * fill.qty;
        let pnl_pct = pct_change(pos.entry_price, fill.avg_price);
        self.ledger.record_realized(realized, false);

        let tx = Transaction {
            timestamp: self.clock.now(),
            coin: coin.symbol.clone(),
            side: Side::Sell,
            qty: fill.qty,
            price: fill.avg_price,
            fee: fill.fee,
            reason: decision.reason.clone(),
            regime: decision.regime,
            entry_score: None,
            realized_pnl: Some(realized),
            pnl_pct: Some(pnl_pct),
            dry_run: self.is_dry_run(),
        };
        self.journal(tx);

        info!(
            coin = %coin.symbol,
            qty = %fill.qty,
            price = %fill.avg_price,
            realized = %realized,
            "first target partial exit"
        );

        Ok(self.wrap_fill(fill))
    }

    /// Close the remaining position at market. `ref_price` anchors dry-run
    /// fills; when absent the latest ticker is used.
    pub async fn close_full(
        &self,
        coin: &Coin,
        reason: &str,
        ref_price: Option<Decimal>,
    ) -> Result<ApplyResult, EngineError> {
        let Some(pos) = self.book.get(&coin.symbol) else {
            return Ok(ApplyResult::Noop);
        };

        let price = match ref_price {
            Some(p) => p,
            None => self.exchange.get_ticker(&coin.pair).await?.last_price,
        };

        let fill = match self
            .execute_order(coin, Side::Sell, pos.size, price)
            .await
        {
            Ok(fill) => fill,
            Err(e) => return Err(self.order_error(coin, e)),
        };

        let mut closed = match self.book.remove(&coin.symbol) {
            Some(p) => p,
            None => return Ok(ApplyResult::Noop),
        };
        closed.last_exit_reason = Some(reason.to_string());

        let realized = (fill.avg_price - closed.entry_price) * fill.qty;
        let pnl_pct = pct_change(closed.entry_price, fill.avg_price);
        self.ledger.record_realized(realized, true);

        let now = self.clock.now();
        let tx = Transaction {
            timestamp: now,
            coin: coin.symbol.clone(),
            side: Side::Sell,
            qty: fill.qty,
            price: fill.avg_price,
            fee: fill.fee,
            reason: reason.to_string(),
            regime: closed.regime_at_entry,
            entry_score: None,
            realized_pnl: Some(realized),
            pnl_pct: Some(pnl_pct),
            dry_run: self.is_dry_run(),
        };
        self.notifier.notify_trade(&tx);
        if let Err(e) = self.store.append_transaction(tx) {
            warn!(error = %e, "journal append failed");
        }

        let outcome = TradeOutcome {
            coin: coin.symbol.clone(),
            entry_price: closed.entry_price,
            exit_price: fill.avg_price,
            qty: fill.qty,
            realized_pnl: realized,
            pnl_pct,
            holding_secs: (now - closed.entry_time).num_seconds(),
            regime_at_entry: closed.regime_at_entry,
            exit_reason: reason.to_string(),
            closed_at: now,
        };
        if let Err(e) = self.store.append_trade_outcome(outcome) {
            warn!(error = %e, "performance append failed");
        }

        info!(
            coin = %coin.symbol,
            reason,
            price = %fill.avg_price,
            realized = %realized,
            pnl_pct = format!("{pnl_pct:+.2}%"),
            "position closed"
        );

        Ok(self.wrap_fill(fill))
    }

    // =========================================================================
    // Tick observation
    // =========================================================================

    /// Pull the latest ticker for an open position, ratchet the trailing
    /// stop, and close at market if the stop is breached. Called once per
    /// cycle for every coin whose decision was HOLD.
    pub async fn observe_tick(
        &self,
        coin: &Coin,
        factors: &Factors,
    ) -> Result<ApplyResult, EngineError> {
        if !self.book.contains(&coin.symbol) {
            return Ok(ApplyResult::Noop);
        }

        let price = self.exchange.get_ticker(&coin.pair).await?.last_price;
        let trailing = dec_from_f64(factors.trailing_stop_pct, "trailing pct")?;
        self.book.with_mut(&coin.symbol, |p| {
            p.observe_price(price, trailing);
        });

        let stop_hit = self
            .book
            .get(&coin.symbol)
            .map(|p| price <= p.stop_loss_price)
            .unwrap_or(false);

        if stop_hit {
            debug!(coin = %coin.symbol, price = %price, "tick breached stop");
            return self.close_full(coin, "stop_loss", Some(price)).await;
        }

        Ok(ApplyResult::Noop)
    }

    // =========================================================================
    // Order plumbing
    // =========================================================================

    /// The order contract: a market order for `qty` at (around) `ref_price`.
    /// Dry-run fills locally; live retries per the policy in the header.
    async fn execute_order(
        &self,
        coin: &Coin,
        side: Side,
        qty: Decimal,
        ref_price: Decimal,
    ) -> Result<Fill, ExchangeError> {
        if qty <= Decimal::ZERO {
            return Err(ExchangeError::InvalidParam(format!(
                "non-positive qty {qty} for {}",
                coin.symbol
            )));
        }

        if self.is_dry_run() {
            let fee = (qty * ref_price * self.fee_rate).round_dp(2);
            return Ok(Fill {
                order_id: format!("sim-{}", Uuid::new_v4()),
                qty,
                avg_price: ref_price,
                fee,
            });
        }

        let mut attempts = 0u32;
        loop {
            match self
                .exchange
                .place_market_order(&coin.pair, side, qty)
                .await
            {
                Ok(fill) => return Ok(fill),
                Err(ExchangeError::RateLimited { retry_after }) => {
                    let wait = retry_after
                        .unwrap_or(RATE_LIMIT_WAIT_DEFAULT)
                        .min(RATE_LIMIT_WAIT_CAP);
                    warn!(coin = %coin.symbol, wait_ms = wait.as_millis() as u64, "rate limited — waiting");
                    tokio::time::sleep(wait).await;
                    // Not counted against the retry budget.
                }
                Err(e) if e.is_retryable() && attempts + 1 < MAX_ORDER_ATTEMPTS => {
                    attempts += 1;
                    let backoff = BACKOFF_BASE * 2u32.pow(attempts - 1);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    warn!(
                        coin = %coin.symbol,
                        attempt = attempts,
                        error = %e,
                        "transient order failure — backing off"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Convert an exhausted order error, latching read-only on auth failure.
    fn order_error(&self, coin: &Coin, err: ExchangeError) -> EngineError {
        if matches!(err, ExchangeError::Auth(_)) {
            self.ledger.set_read_only(true);
            self.notifier
                .push(format!("AUTH FAILURE on {} — engine is read-only", coin.symbol));
        }
        EngineError::Exchange(err)
    }

    fn wrap_fill(&self, fill: Fill) -> ApplyResult {
        if self.is_dry_run() {
            ApplyResult::Simulated(fill)
        } else {
            ApplyResult::Filled(fill)
        }
    }

    fn journal(&self, tx: Transaction) {
        self.notifier.notify_trade(&tx);
        if let Err(e) = self.store.append_transaction(tx) {
            warn!(error = %e, "journal append failed");
        }
    }
}

struct EntrySizing {
    size: Decimal,
    atr_stop_dist: Decimal,
}

/// f64 -> Decimal with the taxonomy-correct error.
fn dec_from_f64(value: f64, what: &str) -> Result<Decimal, EngineError> {
    Decimal::try_from(value)
        .map_err(|_| EngineError::InvalidParam(format!("unrepresentable {what}: {value}")))
}

/// Percent change from `from` to `to`.
fn pct_change(from: Decimal, to: Decimal) -> f64 {
    if from <= Decimal::ZERO {
        return 0.0;
    }
    ((to - from) / from).to_f64().unwrap_or(0.0) * 100.0
}

impl std::fmt::Debug for LiveExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveExecutor")
            .field("mode", &self.mode)
            .field("capital", &self.capital)
            .field("book", &self.book)
            .finish()
    }
}
