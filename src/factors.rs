// =============================================================================
// Dynamic Factor Manager
// =============================================================================
//
// Produces the active parameter set for a cycle from (regime, volatility
// bucket). Factors carry no hysteresis: the same inputs always produce the
// same output, and they are recomputed from scratch at every cycle start.
//
// Regime row: entry-score multiplier, stop-loss multiplier, profit target.
// Volatility row: position-size multiplier, chandelier multiplier, min-score
// bump. The chandelier multiplier never drops below 2.5 regardless of the
// combination.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::regime::Regime;

/// Which band closes out the remaining position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProfitTargetMode {
    /// Ride to the upper Bollinger band (trend regimes).
    BbUpper,
    /// Mean-revert to the middle band (defensive regimes).
    BbMiddle,
}

impl std::fmt::Display for ProfitTargetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BbUpper => write!(f, "bbUpper"),
            Self::BbMiddle => write!(f, "bbMiddle"),
        }
    }
}

/// Volatility classification of `ATR/close * 100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolatilityBucket {
    Low,
    Normal,
    High,
    Extreme,
}

impl VolatilityBucket {
    /// Bucket boundaries: <1.5 Low, [1.5, 3.0) Normal, [3.0, 5.0) High,
    /// >= 5.0 Extreme.
    pub fn from_atr_pct(atr_pct: f64) -> Self {
        if atr_pct < 1.5 {
            Self::Low
        } else if atr_pct < 3.0 {
            Self::Normal
        } else if atr_pct < 5.0 {
            Self::High
        } else {
            Self::Extreme
        }
    }

    /// (position-size multiplier, chandelier multiplier, min-score bump).
    fn modifiers(self) -> (f64, f64, u32) {
        match self {
            Self::Low => (1.2, 3.5, 0),
            Self::Normal => (1.0, 3.0, 0),
            Self::High => (0.7, 2.5, 1),
            Self::Extreme => (0.5, 2.5, 2),
        }
    }
}

impl std::fmt::Display for VolatilityBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "Low"),
            Self::Normal => write!(f, "Normal"),
            Self::High => write!(f, "High"),
            Self::Extreme => write!(f, "Extreme"),
        }
    }
}

/// Per-component weights of the entry score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryWeights {
    pub bb_touch: f64,
    pub rsi_oversold: f64,
    pub stoch_cross: f64,
}

impl Default for EntryWeights {
    fn default() -> Self {
        Self {
            bb_touch: 1.0,
            rsi_oversold: 1.0,
            stoch_cross: 1.0,
        }
    }
}

/// The active, cycle-scoped parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Factors {
    pub entry_weights: EntryWeights,
    pub min_entry_score: u32,
    pub rsi_oversold_threshold: f64,
    pub stoch_oversold_threshold: f64,
    pub chandelier_multiplier: f64,
    pub position_size_multiplier: f64,
    pub profit_target_mode: ProfitTargetMode,
    /// Trailing distance as a fraction (0.02 = 2 %).
    pub trailing_stop_pct: f64,
    /// Price drop (percent of previous average entry) required before a
    /// pyramid add.
    pub pyramid_threshold_pct: f64,
}

/// Lowest chandelier multiplier any combination may produce.
const CHANDELIER_FLOOR: f64 = 2.5;

/// Default trailing-stop distance after the first target (2 %).
const DEFAULT_TRAILING_STOP_PCT: f64 = 0.02;

/// Default pyramid add threshold (3 % below previous average entry).
const DEFAULT_PYRAMID_THRESHOLD_PCT: f64 = 3.0;

impl Regime {
    /// (entry-score multiplier, stop-loss multiplier, profit target mode).
    fn factor_row(self) -> (f64, f64, ProfitTargetMode) {
        match self {
            Self::StrongBullish => (1.0, 1.0, ProfitTargetMode::BbUpper),
            Self::Bullish => (1.0, 1.0, ProfitTargetMode::BbUpper),
            Self::Neutral => (1.2, 1.0, ProfitTargetMode::BbMiddle),
            Self::Bearish => (1.3, 0.85, ProfitTargetMode::BbMiddle),
            Self::StrongBearish => (1.5, 0.8, ProfitTargetMode::BbMiddle),
            Self::Ranging => (1.0, 1.0, ProfitTargetMode::BbUpper),
        }
    }

    /// Base minimum entry score before multipliers and volatility bumps.
    fn base_min_score(self) -> u32 {
        match self {
            Self::StrongBullish | Self::Bullish => 1,
            Self::Neutral | Self::Bearish | Self::Ranging => 2,
            Self::StrongBearish => 3,
        }
    }
}

/// Build the active factors for `(regime, bucket)`.
pub fn derive_factors(regime: Regime, bucket: VolatilityBucket) -> Factors {
    let (score_mult, stop_mult, target_mode) = regime.factor_row();
    let (size_mult, chandelier, score_bump) = bucket.modifiers();

    let min_entry_score =
        (regime.base_min_score() as f64 * score_mult).ceil() as u32 + score_bump;

    let chandelier_multiplier = (chandelier * stop_mult).max(CHANDELIER_FLOOR);

    Factors {
        entry_weights: EntryWeights::default(),
        min_entry_score,
        rsi_oversold_threshold: 30.0,
        stoch_oversold_threshold: 20.0,
        chandelier_multiplier,
        position_size_multiplier: size_mult,
        profit_target_mode: target_mode,
        trailing_stop_pct: DEFAULT_TRAILING_STOP_PCT,
        pyramid_threshold_pct: DEFAULT_PYRAMID_THRESHOLD_PCT,
    }
}

/// Last produced factors plus their inputs, persisted after every cycle for
/// operator inspection (`dynamic_factors.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorsRecord {
    pub factors: Factors,
    pub regime: Regime,
    pub volatility_bucket: VolatilityBucket,
    pub atr_pct: f64,
    pub generated_at: DateTime<Utc>,
}
