// =============================================================================
// Strategy Engine — score-based entry, target-driven exit
// =============================================================================
//
// Entry (no position): weighted oversold score on the 4h timeframe.
//
//   close <= bbLower                                     +1 * w_bbTouch
//   RSI < rsiOversoldThreshold                           +1 * w_rsiOversold
//   %K crossed above %D while %K < stochOversoldThr      +2 * w_stochCross
//
// BUY iff score >= minEntryScore, and in Bearish/StrongBearish regimes the
// extreme-oversold gate additionally requires 2 of { RSI < 20, %K < 10,
// close <= bbLower }. Portfolio-level gates live in the portfolio manager.
//
// Exit (position exists), strict priority:
//   1. close <= stopLossPrice                  -> CLOSE  "stop_loss"
//   2. close >= firstTarget, not yet hit       -> SELL_PARTIAL "first_target"
//   3. profit-target band reached              -> CLOSE  "profit_target" /
//                                                        "mean_reversion"
//   4. otherwise                               -> HOLD
//
// The executor owns the partial-exit and trailing-stop state machines; this
// module only signals intent.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::EngineError;
use crate::factors::{Factors, ProfitTargetMode};
use crate::indicators::{
    atr::{atr, atr_pct},
    bollinger::bollinger,
    rsi::rsi,
    stochastic::{crossed_above, stoch_series, StochPoint},
};
use crate::market_data::{closes, Candle};
use crate::position::Position;
use crate::regime::Regime;

/// Minimum 4h bars before the strategy will evaluate a coin.
pub const MIN_STRATEGY_BARS: usize = 30;

/// RSI level for the extreme-oversold gate.
const GATE_RSI: f64 = 20.0;
/// %K level for the extreme-oversold gate.
const GATE_STOCH_K: f64 = 10.0;
/// Gate passes when at least this many of its three conditions hold.
const GATE_REQUIRED: usize = 2;

/// What the engine should do with a coin this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Hold,
    SellPartial,
    Close,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Hold => write!(f, "HOLD"),
            Self::SellPartial => write!(f, "SELL_PARTIAL"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

/// The indicator values a decision was made from, kept so the executor can
/// seed stop/target math and the journal can explain the trade.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub bb_lower: f64,
    pub bb_middle: f64,
    pub bb_upper: f64,
    pub rsi: f64,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub prev_stoch_k: f64,
    pub prev_stoch_d: f64,
    pub atr: f64,
    pub atr_pct: f64,
}

/// Strategy output for one coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    pub score: f64,
    pub regime: Regime,
    pub indicators: Option<IndicatorSnapshot>,
}

impl Decision {
    /// The fallback decision substituted for timed-out or failed analyses.
    pub fn hold(reason: impl Into<String>, regime: Regime) -> Self {
        Self {
            action: Action::Hold,
            reason: reason.into(),
            score: 0.0,
            regime,
            indicators: None,
        }
    }
}

/// Analysis seam the portfolio manager programs against.
pub trait Strategy: Send + Sync {
    fn analyze(
        &self,
        coin: &str,
        series_4h: &[Candle],
        factors: &Factors,
        regime: Regime,
        position: Option<&Position>,
    ) -> Result<Decision, EngineError>;
}

/// The production strategy described above.
#[derive(Debug, Default)]
pub struct ScoreStrategy;

impl Strategy for ScoreStrategy {
    fn analyze(
        &self,
        coin: &str,
        series_4h: &[Candle],
        factors: &Factors,
        regime: Regime,
        position: Option<&Position>,
    ) -> Result<Decision, EngineError> {
        let snapshot = compute_snapshot(series_4h)?;

        let decision = match position {
            Some(pos) => evaluate_exit(&snapshot, factors, regime, pos),
            None => evaluate_entry(&snapshot, factors, regime),
        };

        debug!(
            coin,
            action = %decision.action,
            score = decision.score,
            regime = %regime,
            reason = %decision.reason,
            "analysis complete"
        );

        Ok(decision)
    }
}

/// Compute every indicator the decision needs, or fail with
/// `InsufficientData` when the 4h warmup is unmet.
fn compute_snapshot(series_4h: &[Candle]) -> Result<IndicatorSnapshot, EngineError> {
    if series_4h.len() < MIN_STRATEGY_BARS {
        return Err(EngineError::InsufficientData(format!(
            "strategy needs {} 4h bars, got {}",
            MIN_STRATEGY_BARS,
            series_4h.len()
        )));
    }

    let close_prices = closes(series_4h);
    let close = *close_prices
        .last()
        .ok_or_else(|| EngineError::InsufficientData("empty series".to_string()))?;
    if close <= 0.0 {
        return Err(EngineError::InvalidParam(format!(
            "non-positive close: {close}"
        )));
    }

    let bands = bollinger(&close_prices, 20, 2.0)
        .ok_or_else(|| EngineError::InsufficientData("Bollinger warmup unmet".to_string()))?;
    let rsi_value = rsi(&close_prices, 14)
        .ok_or_else(|| EngineError::InsufficientData("RSI warmup unmet".to_string()))?;

    let stoch = stoch_series(series_4h, 14, 3);
    if stoch.len() < 2 {
        return Err(EngineError::InsufficientData(
            "stochastic needs two settled readings".to_string(),
        ));
    }
    let now = stoch[stoch.len() - 1];
    let prev = stoch[stoch.len() - 2];

    let atr_value = atr(series_4h, 14)
        .ok_or_else(|| EngineError::InsufficientData("ATR warmup unmet".to_string()))?;
    let atr_pct_value = atr_pct(series_4h, 14)
        .ok_or_else(|| EngineError::InsufficientData("ATR% unavailable".to_string()))?;

    Ok(IndicatorSnapshot {
        close,
        bb_lower: bands.lower,
        bb_middle: bands.middle,
        bb_upper: bands.upper,
        rsi: rsi_value,
        stoch_k: now.k,
        stoch_d: now.d,
        prev_stoch_k: prev.k,
        prev_stoch_d: prev.d,
        atr: atr_value,
        atr_pct: atr_pct_value,
    })
}

// =============================================================================
// Entry path
// =============================================================================

/// Score the entry conditions and decide BUY / HOLD for a coin with no open
/// position.
fn evaluate_entry(snap: &IndicatorSnapshot, factors: &Factors, regime: Regime) -> Decision {
    let score = entry_score(snap, factors);

    if regime.requires_oversold_gate() && !oversold_gate_passes(snap) {
        return Decision {
            action: Action::Hold,
            reason: "extreme_oversold_gate".to_string(),
            score,
            regime,
            indicators: Some(*snap),
        };
    }

    if score >= factors.min_entry_score as f64 {
        Decision {
            action: Action::Buy,
            reason: "entry_score".to_string(),
            score,
            regime,
            indicators: Some(*snap),
        }
    } else {
        Decision {
            action: Action::Hold,
            reason: "score_below_min".to_string(),
            score,
            regime,
            indicators: Some(*snap),
        }
    }
}

/// Weighted oversold score per the entry table.
fn entry_score(snap: &IndicatorSnapshot, factors: &Factors) -> f64 {
    let weights = &factors.entry_weights;
    let mut score = 0.0;

    if snap.close <= snap.bb_lower {
        score += 1.0 * weights.bb_touch;
    }
    if snap.rsi < factors.rsi_oversold_threshold {
        score += 1.0 * weights.rsi_oversold;
    }

    let crossed = prev_below_now_above(snap);
    if crossed && snap.stoch_k < factors.stoch_oversold_threshold {
        score += 2.0 * weights.stoch_cross;
    }

    score
}

/// The cross is defined on the last two readings only.
fn prev_below_now_above(snap: &IndicatorSnapshot) -> bool {
    let prev = StochPoint {
        k: snap.prev_stoch_k,
        d: snap.prev_stoch_d,
    };
    let now = StochPoint {
        k: snap.stoch_k,
        d: snap.stoch_d,
    };
    crossed_above(&[prev, now])
}

/// Bearish-regime gate: at least 2 of { RSI < 20, %K < 10, close <= bbLower }.
fn oversold_gate_passes(snap: &IndicatorSnapshot) -> bool {
    let met = [
        snap.rsi < GATE_RSI,
        snap.stoch_k < GATE_STOCH_K,
        snap.close <= snap.bb_lower,
    ]
    .iter()
    .filter(|&&c| c)
    .count();
    met >= GATE_REQUIRED
}

// =============================================================================
// Exit path
// =============================================================================

/// Evaluate the exit ladder for an open position, in strict priority order.
fn evaluate_exit(
    snap: &IndicatorSnapshot,
    factors: &Factors,
    regime: Regime,
    pos: &Position,
) -> Decision {
    let close = snap.close;
    // Conversion failure must not trip an exit: the stop defaults low and
    // the target high so neither condition fires spuriously.
    let stop = pos.stop_loss_price.to_f64().unwrap_or(f64::MIN);
    let first_target = pos.first_target_price.to_f64().unwrap_or(f64::MAX);

    // 1. Stop-loss.
    if close <= stop {
        return exit_decision(Action::Close, "stop_loss", regime, snap);
    }

    // 2. First target — partial exit, trailing begins.
    if !pos.first_target_hit && close >= first_target {
        return exit_decision(Action::SellPartial, "first_target", regime, snap);
    }

    // 3. Remaining-half profit target by mode.
    match factors.profit_target_mode {
        ProfitTargetMode::BbUpper if close >= snap.bb_upper => {
            return exit_decision(Action::Close, "profit_target", regime, snap);
        }
        ProfitTargetMode::BbMiddle if close >= snap.bb_middle => {
            return exit_decision(Action::Close, "mean_reversion", regime, snap);
        }
        _ => {}
    }

    exit_decision(Action::Hold, "hold", regime, snap)
}

fn exit_decision(
    action: Action,
    reason: &str,
    regime: Regime,
    snap: &IndicatorSnapshot,
) -> Decision {
    Decision {
        action,
        reason: reason.to_string(),
        score: 0.0,
        regime,
        indicators: Some(*snap),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{derive_factors, VolatilityBucket};
    use rust_decimal_macros::dec;

    fn snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            close: 100.0,
            bb_lower: 99.5,
            bb_middle: 102.0,
            bb_upper: 104.5,
            rsi: 45.0,
            stoch_k: 50.0,
            stoch_d: 50.0,
            prev_stoch_k: 50.0,
            prev_stoch_d: 50.0,
            atr: 1.25,
            atr_pct: 1.25,
        }
    }

    fn position(entry: f64, stop: f64, first_target: f64, hit: bool) -> Position {
        let mut pos = Position::open(
            "BTC",
            rust_decimal::Decimal::try_from(entry).unwrap(),
            dec!(1),
            rust_decimal::Decimal::try_from(stop).unwrap(),
            rust_decimal::Decimal::try_from(first_target).unwrap(),
            dec!(109.375),
            ProfitTargetMode::BbUpper,
            Regime::Bullish,
            4.0,
            chrono::Utc::now(),
        );
        pos.first_target_hit = hit;
        pos
    }

    // ---- entry scoring ----------------------------------------------------

    #[test]
    fn bullish_full_score_entry() {
        // All three components fire: 1 + 1 + 2 = 4 with unit weights.
        let mut snap = snapshot();
        snap.close = 100.0;
        snap.bb_lower = 100.0; // close <= lower
        snap.rsi = 28.0;
        snap.prev_stoch_k = 10.0;
        snap.prev_stoch_d = 15.0;
        snap.stoch_k = 12.0;
        snap.stoch_d = 11.0;

        let factors = derive_factors(Regime::Bullish, VolatilityBucket::Normal);
        let decision = evaluate_entry(&snap, &factors, Regime::Bullish);
        assert!((decision.score - 4.0).abs() < 1e-12);
        assert_eq!(decision.action, Action::Buy);
        assert_eq!(decision.reason, "entry_score");
    }

    #[test]
    fn score_below_minimum_holds() {
        // Only the RSI component fires: score 1 < Neutral minimum of 3.
        let mut snap = snapshot();
        snap.rsi = 25.0;

        let factors = derive_factors(Regime::Neutral, VolatilityBucket::Normal);
        let decision = evaluate_entry(&snap, &factors, Regime::Neutral);
        assert!((decision.score - 1.0).abs() < 1e-12);
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.reason, "score_below_min");
    }

    #[test]
    fn stoch_cross_requires_oversold_k() {
        // Cross happens but %K is above the oversold threshold: no points.
        let mut snap = snapshot();
        snap.prev_stoch_k = 40.0;
        snap.prev_stoch_d = 45.0;
        snap.stoch_k = 50.0;
        snap.stoch_d = 48.0;

        let factors = derive_factors(Regime::Bullish, VolatilityBucket::Normal);
        assert!((entry_score(&snap, &factors) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn cross_defined_on_last_two_bars_only() {
        // now k >= d but prev was also k >= d: not a cross.
        let mut snap = snapshot();
        snap.prev_stoch_k = 12.0;
        snap.prev_stoch_d = 11.0;
        snap.stoch_k = 15.0;
        snap.stoch_d = 12.0;

        assert!(!prev_below_now_above(&snap));
    }

    #[test]
    fn weights_scale_components() {
        let mut snap = snapshot();
        snap.bb_lower = 100.0;
        snap.rsi = 20.0;

        let mut factors = derive_factors(Regime::Bullish, VolatilityBucket::Normal);
        factors.entry_weights.bb_touch = 0.5;
        factors.entry_weights.rsi_oversold = 2.0;
        // 1 * 0.5 + 1 * 2.0 = 2.5
        assert!((entry_score(&snap, &factors) - 2.5).abs() < 1e-12);
    }

    // ---- extreme-oversold gate --------------------------------------------

    #[test]
    fn bearish_gate_rejects_single_condition() {
        // Score high enough, but only RSI < 20 holds: 1 of 3 conditions.
        let mut snap = snapshot();
        snap.rsi = 15.0;
        snap.prev_stoch_k = 10.0;
        snap.prev_stoch_d = 15.0;
        snap.stoch_k = 12.0;
        snap.stoch_d = 11.0;
        snap.close = 100.0;
        snap.bb_lower = 99.0; // close above band

        let factors = derive_factors(Regime::Bearish, VolatilityBucket::Normal);
        let decision = evaluate_entry(&snap, &factors, Regime::Bearish);
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.reason, "extreme_oversold_gate");
    }

    #[test]
    fn bearish_gate_passes_with_two_conditions() {
        // RSI < 20 and close <= bbLower: 2 of 3. Score: bb 1 + rsi 1 + cross 2 = 4.
        let mut snap = snapshot();
        snap.rsi = 15.0;
        snap.close = 99.0;
        snap.bb_lower = 99.0;
        snap.prev_stoch_k = 10.0;
        snap.prev_stoch_d = 15.0;
        snap.stoch_k = 12.0;
        snap.stoch_d = 11.0;

        // Bearish minimum is 3; score 4 clears it once the gate passes.
        let factors = derive_factors(Regime::Bearish, VolatilityBucket::Normal);
        let decision = evaluate_entry(&snap, &factors, Regime::Bearish);
        assert_eq!(decision.action, Action::Buy);
    }

    #[test]
    fn ranging_regime_skips_gate() {
        // Same single-condition setup as the bearish rejection, but Ranging
        // does not require the gate.
        let mut snap = snapshot();
        snap.rsi = 15.0;
        snap.close = 99.0;
        snap.bb_lower = 99.0;
        snap.prev_stoch_k = 10.0;
        snap.prev_stoch_d = 15.0;
        snap.stoch_k = 12.0;
        snap.stoch_d = 11.0;

        let factors = derive_factors(Regime::Ranging, VolatilityBucket::Normal);
        let decision = evaluate_entry(&snap, &factors, Regime::Ranging);
        assert_eq!(decision.action, Action::Buy);
    }

    // ---- exit ladder ------------------------------------------------------

    #[test]
    fn stop_loss_outranks_everything() {
        let mut snap = snapshot();
        snap.close = 96.0;
        snap.bb_upper = 95.0; // would also trigger profit target

        let factors = derive_factors(Regime::Bullish, VolatilityBucket::Normal);
        let pos = position(100.0, 96.25, 105.625, false);
        let decision = evaluate_exit(&snap, &factors, Regime::Bullish, &pos);
        assert_eq!(decision.action, Action::Close);
        assert_eq!(decision.reason, "stop_loss");
    }

    #[test]
    fn first_target_triggers_partial_once() {
        let mut snap = snapshot();
        snap.close = 106.0;
        snap.bb_upper = 120.0;

        let factors = derive_factors(Regime::Bullish, VolatilityBucket::Normal);

        let pos = position(100.0, 96.25, 105.625, false);
        let decision = evaluate_exit(&snap, &factors, Regime::Bullish, &pos);
        assert_eq!(decision.action, Action::SellPartial);
        assert_eq!(decision.reason, "first_target");

        // Already hit: same price is just a hold.
        let pos = position(100.0, 96.25, 105.625, true);
        let decision = evaluate_exit(&snap, &factors, Regime::Bullish, &pos);
        assert_eq!(decision.action, Action::Hold);
    }

    #[test]
    fn upper_band_target_in_trend_mode() {
        let mut snap = snapshot();
        snap.close = 105.0;
        snap.bb_upper = 104.5;

        let factors = derive_factors(Regime::Bullish, VolatilityBucket::Normal);
        let pos = position(100.0, 96.25, 103.0, true);
        let decision = evaluate_exit(&snap, &factors, Regime::Bullish, &pos);
        assert_eq!(decision.action, Action::Close);
        assert_eq!(decision.reason, "profit_target");
    }

    #[test]
    fn middle_band_target_in_defensive_mode() {
        let mut snap = snapshot();
        snap.close = 102.5;
        snap.bb_middle = 102.0;
        snap.bb_upper = 110.0;

        let factors = derive_factors(Regime::Neutral, VolatilityBucket::Normal);
        let pos = position(100.0, 96.25, 103.0, true);
        let decision = evaluate_exit(&snap, &factors, Regime::Neutral, &pos);
        assert_eq!(decision.action, Action::Close);
        assert_eq!(decision.reason, "mean_reversion");
    }

    #[test]
    fn quiet_market_holds() {
        let factors = derive_factors(Regime::Bullish, VolatilityBucket::Normal);
        let pos = position(100.0, 96.25, 105.625, false);
        let decision = evaluate_exit(&snapshot(), &factors, Regime::Bullish, &pos);
        assert_eq!(decision.action, Action::Hold);
    }

    // ---- full analyze path ------------------------------------------------

    #[test]
    fn analyze_rejects_short_series() {
        let series: Vec<Candle> = (0..10)
            .map(|i| Candle::new(i * 14_400_000, 100.0, 101.0, 99.0, 100.0, 5.0))
            .collect();
        let factors = derive_factors(Regime::Bullish, VolatilityBucket::Normal);
        let result = ScoreStrategy.analyze("BTC", &series, &factors, Regime::Bullish, None);
        assert!(matches!(result, Err(EngineError::InsufficientData(_))));
    }

    #[test]
    fn analyze_produces_snapshot() {
        let series: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.4).sin() * 3.0;
                Candle::new(i * 14_400_000, base, base + 1.0, base - 1.0, base + 0.2, 5.0)
            })
            .collect();
        let factors = derive_factors(Regime::Bullish, VolatilityBucket::Normal);
        let decision = ScoreStrategy
            .analyze("BTC", &series, &factors, Regime::Bullish, None)
            .unwrap();
        let snap = decision.indicators.expect("snapshot must be attached");
        assert!(snap.atr > 0.0);
        assert!((0.0..=100.0).contains(&snap.rsi));
        assert!(snap.bb_lower < snap.bb_upper);
    }
}
