// =============================================================================
// Shared types used across the Helios trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side. The engine is long-only: BUY opens or adds, SELL reduces or
/// closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Candle interval requested from the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    /// 4-hour candles — the strategy timeframe.
    H4,
    /// Daily candles — the regime timeframe.
    D1,
}

impl Interval {
    /// Wire representation used by the exchange adapter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H4 => "4h",
            Self::D1 => "24h",
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the engine simulates fills locally or sends real orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    DryRun,
    Live,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::DryRun
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DryRun => write!(f, "DryRun"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Static per-coin trading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coin {
    /// Base asset symbol, e.g. "BTC".
    pub symbol: String,
    /// Exchange pair, e.g. "BTC/KRW".
    pub pair: String,
    /// Smallest order quantity the exchange accepts.
    pub min_order_qty: Decimal,
    /// Smallest order notional (qty x price) the exchange accepts.
    pub min_order_value: Decimal,
    /// Fractional digits for quote prices.
    pub price_precision: u32,
    /// Fractional digits for base-asset quantities.
    pub qty_precision: u32,
    /// Deterministic tiebreaker for entry arbitration (lower = higher priority).
    pub rank: u32,
}

// =============================================================================
// Clock
// =============================================================================

/// Source of wall-clock time. Injected so that daily rollover and snapshot
/// logic can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
