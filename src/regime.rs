// =============================================================================
// Market Regime Classifier
// =============================================================================
//
// Maps a daily OHLCV series to one of six regimes from two inputs:
//
//   d     = (EMA50 - EMA200) / EMA200 * 100   (trend spread, percent)
//   ADX14 = trend strength
//
// Classification (first match wins):
//
//   1. ADX14 < 20          -> Ranging (overrides the spread)
//   2. d >  5              -> StrongBullish
//   3. d >  2              -> Bullish
//   4. d > -2              -> Neutral
//   5. d > -5              -> Bearish
//   6. otherwise           -> StrongBearish
//
// Boundaries land on the weaker side: d == 5 is Bullish, d == 2 is Neutral,
// d == -2 is Bearish, d == -5 is StrongBearish, ADX == 20 is not Ranging.
//
// 220+ daily bars give a fully warmed EMA200; the hard minimum is 50 bars,
// below which classification fails and the caller falls back to the coin's
// last valid regime.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::EngineError;
use crate::indicators::{adx::adx, ema::ema_or_mean};
use crate::market_data::{closes, Candle};

/// Minimum daily bars required for any classification.
pub const MIN_DAILY_BARS: usize = 50;

/// ADX floor below which the market is treated as trendless.
const ADX_RANGING_CEILING: f64 = 20.0;

/// High-level market regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    StrongBullish,
    Bullish,
    Neutral,
    Bearish,
    StrongBearish,
    Ranging,
}

impl Regime {
    /// Whether the extreme-oversold entry gate applies in this regime.
    pub fn requires_oversold_gate(&self) -> bool {
        matches!(self, Self::Bearish | Self::StrongBearish)
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongBullish => write!(f, "StrongBullish"),
            Self::Bullish => write!(f, "Bullish"),
            Self::Neutral => write!(f, "Neutral"),
            Self::Bearish => write!(f, "Bearish"),
            Self::StrongBearish => write!(f, "StrongBearish"),
            Self::Ranging => write!(f, "Ranging"),
        }
    }
}

/// Classification output plus the metrics that produced it, kept for audit
/// logging and the factors snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeReading {
    pub regime: Regime,
    /// (EMA50 - EMA200) / EMA200 * 100.
    pub ema_spread_pct: f64,
    pub adx: f64,
}

/// Classify a daily candle series.
///
/// Fails with `InsufficientData` below [`MIN_DAILY_BARS`] or when the ADX
/// warmup is unmet; the portfolio manager recovers by reusing the coin's last
/// valid regime.
pub fn classify(daily: &[Candle]) -> Result<RegimeReading, EngineError> {
    if daily.len() < MIN_DAILY_BARS {
        return Err(EngineError::InsufficientData(format!(
            "regime needs {} daily bars, got {}",
            MIN_DAILY_BARS,
            daily.len()
        )));
    }

    let close_prices = closes(daily);

    let fast = ema_or_mean(&close_prices, 50).ok_or_else(|| {
        EngineError::InsufficientData("EMA50 unavailable".to_string())
    })?;
    let slow = ema_or_mean(&close_prices, 200).ok_or_else(|| {
        EngineError::InsufficientData("EMA200 unavailable".to_string())
    })?;

    if slow <= 0.0 {
        return Err(EngineError::InvalidParam(format!(
            "non-positive EMA200: {slow}"
        )));
    }

    let spread = (fast - slow) / slow * 100.0;

    let adx_value = adx(daily, 14).ok_or_else(|| {
        EngineError::InsufficientData("ADX14 warmup unmet".to_string())
    })?;

    let regime = if adx_value < ADX_RANGING_CEILING {
        Regime::Ranging
    } else if spread > 5.0 {
        Regime::StrongBullish
    } else if spread > 2.0 {
        Regime::Bullish
    } else if spread > -2.0 {
        Regime::Neutral
    } else if spread > -5.0 {
        Regime::Bearish
    } else {
        Regime::StrongBearish
    };

    debug!(
        regime = %regime,
        spread = format!("{spread:.3}"),
        adx = format!("{adx_value:.2}"),
        "regime classified"
    );

    Ok(RegimeReading {
        regime,
        ema_spread_pct: spread,
        adx: adx_value,
    })
}

// =============================================================================
// Per-coin regime tracker
// =============================================================================

/// Caches the last successful classification per coin so that a failed or
/// timed-out cycle can still report a regime.
pub struct RegimeTracker {
    last_valid: RwLock<HashMap<String, Regime>>,
}

impl RegimeTracker {
    pub fn new() -> Self {
        Self {
            last_valid: RwLock::new(HashMap::new()),
        }
    }

    /// Seed the tracker from persisted engine state on startup.
    pub fn seed(&self, regimes: &HashMap<String, Regime>) {
        let mut map = self.last_valid.write();
        for (coin, regime) in regimes {
            map.insert(coin.clone(), *regime);
        }
    }

    /// Record a fresh classification for `coin`, returning the previous one
    /// so callers can announce regime changes.
    pub fn record(&self, coin: &str, regime: Regime) -> Option<Regime> {
        self.last_valid.write().insert(coin.to_string(), regime)
    }

    /// Last valid regime for `coin`, defaulting to Neutral when the coin has
    /// never classified successfully.
    pub fn last_valid(&self, coin: &str) -> Regime {
        self.last_valid
            .read()
            .get(coin)
            .copied()
            .unwrap_or(Regime::Neutral)
    }

    /// Snapshot for persistence.
    pub fn snapshot(&self) -> HashMap<String, Regime> {
        self.last_valid.read().clone()
    }
}

impl Default for RegimeTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Flat-ish candles with a gentle oscillation: weak ADX.
    fn choppy_series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 2.1).sin() * 0.4;
                Candle::new(i as i64 * 86_400_000, base, base + 0.5, base - 0.5, base, 10.0)
            })
            .collect()
    }

    /// Persistent uptrend: strong ADX, EMA50 well above EMA200.
    fn trending_up_series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 1.5;
                Candle::new(i as i64 * 86_400_000, base, base + 1.0, base - 0.3, base + 0.8, 10.0)
            })
            .collect()
    }

    /// Persistent downtrend.
    fn trending_down_series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 500.0 - i as f64 * 1.5;
                Candle::new(i as i64 * 86_400_000, base, base + 0.3, base - 1.0, base - 0.8, 10.0)
            })
            .collect()
    }

    #[test]
    fn insufficient_bars_rejected() {
        let daily = trending_up_series(49);
        assert!(matches!(
            classify(&daily),
            Err(EngineError::InsufficientData(_))
        ));
    }

    #[test]
    fn minimum_bars_accepted() {
        let daily = trending_up_series(50);
        assert!(classify(&daily).is_ok());
    }

    #[test]
    fn sustained_uptrend_is_strong_bullish() {
        let reading = classify(&trending_up_series(250)).unwrap();
        assert!(reading.adx >= 20.0);
        assert!(reading.ema_spread_pct > 5.0);
        assert_eq!(reading.regime, Regime::StrongBullish);
    }

    #[test]
    fn sustained_downtrend_is_strong_bearish() {
        let reading = classify(&trending_down_series(250)).unwrap();
        assert!(reading.ema_spread_pct < -5.0);
        assert_eq!(reading.regime, Regime::StrongBearish);
    }

    #[test]
    fn weak_adx_overrides_spread() {
        let reading = classify(&choppy_series(250)).unwrap();
        assert!(
            reading.adx < 20.0,
            "fixture must produce weak ADX, got {}",
            reading.adx
        );
        assert_eq!(reading.regime, Regime::Ranging);
    }

    #[test]
    fn spread_boundaries_choose_documented_side() {
        // Exercise the threshold arithmetic directly: a spread of exactly 5
        // is NOT > 5, so it classifies one notch weaker, and so on down.
        let pick = |d: f64| {
            if d > 5.0 {
                Regime::StrongBullish
            } else if d > 2.0 {
                Regime::Bullish
            } else if d > -2.0 {
                Regime::Neutral
            } else if d > -5.0 {
                Regime::Bearish
            } else {
                Regime::StrongBearish
            }
        };
        assert_eq!(pick(5.0), Regime::Bullish);
        assert_eq!(pick(2.0), Regime::Neutral);
        assert_eq!(pick(-2.0), Regime::Bearish);
        assert_eq!(pick(-5.0), Regime::StrongBearish);
        assert_eq!(pick(5.000001), Regime::StrongBullish);
    }

    #[test]
    fn classification_is_pure() {
        let daily = trending_up_series(250);
        let a = classify(&daily).unwrap();
        let b = classify(&daily).unwrap();
        assert_eq!(a.regime, b.regime);
        assert_eq!(a.ema_spread_pct.to_bits(), b.ema_spread_pct.to_bits());
        assert_eq!(a.adx.to_bits(), b.adx.to_bits());
    }

    #[test]
    fn tracker_fallback_and_seed() {
        let tracker = RegimeTracker::new();
        assert_eq!(tracker.last_valid("BTC"), Regime::Neutral);

        tracker.record("BTC", Regime::Bullish);
        assert_eq!(tracker.last_valid("BTC"), Regime::Bullish);

        let mut seedmap = HashMap::new();
        seedmap.insert("ETH".to_string(), Regime::Ranging);
        tracker.seed(&seedmap);
        assert_eq!(tracker.last_valid("ETH"), Regime::Ranging);
        assert_eq!(tracker.last_valid("BTC"), Regime::Bullish);
    }

    #[test]
    fn requires_gate_only_in_bearish_regimes() {
        assert!(Regime::Bearish.requires_oversold_gate());
        assert!(Regime::StrongBearish.requires_oversold_gate());
        assert!(!Regime::Ranging.requires_oversold_gate());
        assert!(!Regime::Neutral.requires_oversold_gate());
        assert!(!Regime::Bullish.requires_oversold_gate());
    }
}
