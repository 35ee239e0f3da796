// =============================================================================
// Exchange adapter seam
// =============================================================================
//
// The engine core only ever talks to this trait. The production implementation
// is the Bithumb REST client; tests use the scriptable mock. Constructors take
// the adapter as `Arc<dyn ExchangeAdapter>` — there is no global client.

pub mod bithumb;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market_data::Candle;
use crate::types::{Interval, Side};

/// Error kinds every adapter must map its failures into. The executor's retry
/// policy dispatches on these, never on adapter-specific payloads.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network blip or exchange 5xx — safe to retry with backoff.
    #[error("transient exchange failure: {0}")]
    Transient(String),

    /// HTTP 429 or an explicit throttle code. Waiting this out is not counted
    /// against the retry budget.
    #[error("rate limited by exchange")]
    RateLimited {
        /// Server-suggested wait, when one was provided.
        retry_after: Option<std::time::Duration>,
    },

    /// Credentials rejected. The engine drops to read-only posture.
    #[error("exchange authentication failed: {0}")]
    Auth(String),

    /// The request itself was malformed — a bug on our side.
    #[error("invalid order parameter: {0}")]
    InvalidParam(String),

    /// Anything the exchange says will not succeed on retry.
    #[error("permanent exchange failure: {0}")]
    Permanent(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result of a filled (or simulated) market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub order_id: String,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
}

/// Latest traded price for a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub pair: String,
    pub last_price: Decimal,
    pub at: DateTime<Utc>,
}

/// The spot-exchange surface the engine consumes.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Fetch up to `limit` candles, oldest first.
    async fn get_ohlcv(
        &self,
        pair: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError>;

    async fn place_market_order(
        &self,
        pair: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<Fill, ExchangeError>;

    /// Free balance of `currency` (quote for sizing, base for sanity checks).
    async fn get_balance(&self, currency: &str) -> Result<Decimal, ExchangeError>;
}
