// =============================================================================
// Scriptable in-memory exchange adapter
// =============================================================================
//
// Used by the test suite across the crate. Candle series, ticker prices,
// order outcomes, and artificial latency are all scripted per pair; every
// call is counted so tests can assert on traffic.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::market_data::Candle;
use crate::types::{Interval, Side};

use super::{ExchangeAdapter, ExchangeError, Fill, Ticker};

#[derive(Default)]
struct MockState {
    candles: HashMap<(String, Interval), Vec<Candle>>,
    tickers: HashMap<String, Decimal>,
    /// Pre-scripted order outcomes, consumed FIFO. Empty queue = fill at the
    /// scripted ticker price with zero fee.
    order_results: VecDeque<Result<Fill, ExchangeError>>,
    /// Artificial delay applied to every call (for timeout tests).
    latency: Option<Duration>,
    /// Per-pair delay, applied on top of the global one.
    pair_latency: HashMap<String, Duration>,
    ohlcv_calls: u32,
    ticker_calls: u32,
    order_calls: u32,
}

/// In-memory `ExchangeAdapter` with scriptable behavior.
#[derive(Default)]
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_candles(&self, pair: &str, interval: Interval, candles: Vec<Candle>) {
        self.state
            .lock()
            .candles
            .insert((pair.to_string(), interval), candles);
    }

    pub fn set_ticker(&self, pair: &str, price: Decimal) {
        self.state.lock().tickers.insert(pair.to_string(), price);
    }

    pub fn push_order_result(&self, result: Result<Fill, ExchangeError>) {
        self.state.lock().order_results.push_back(result);
    }

    /// Delay every subsequent call by `latency` (drives timeout tests).
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Delay calls touching `pair` only (per-coin timeout tests).
    pub fn set_pair_latency(&self, pair: &str, latency: Duration) {
        self.state
            .lock()
            .pair_latency
            .insert(pair.to_string(), latency);
    }

    pub fn order_calls(&self) -> u32 {
        self.state.lock().order_calls
    }

    pub fn ohlcv_calls(&self) -> u32 {
        self.state.lock().ohlcv_calls
    }

    async fn apply_latency(&self, pair: &str) {
        let (global, per_pair) = {
            let s = self.state.lock();
            (s.latency, s.pair_latency.get(pair).copied())
        };
        if let Some(d) = global {
            tokio::time::sleep(d).await;
        }
        if let Some(d) = per_pair {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn get_ohlcv(
        &self,
        pair: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.apply_latency(pair).await;
        let mut s = self.state.lock();
        s.ohlcv_calls += 1;
        let series = s
            .candles
            .get(&(pair.to_string(), interval))
            .cloned()
            .ok_or_else(|| ExchangeError::Transient(format!("no scripted candles for {pair}")))?;
        let keep = series.len().saturating_sub(limit as usize);
        Ok(series[keep..].to_vec())
    }

    async fn get_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError> {
        self.apply_latency(pair).await;
        let mut s = self.state.lock();
        s.ticker_calls += 1;
        let price = s
            .tickers
            .get(pair)
            .copied()
            .ok_or_else(|| ExchangeError::Transient(format!("no scripted ticker for {pair}")))?;
        Ok(Ticker {
            pair: pair.to_string(),
            last_price: price,
            at: Utc::now(),
        })
    }

    async fn place_market_order(
        &self,
        pair: &str,
        _side: Side,
        qty: Decimal,
    ) -> Result<Fill, ExchangeError> {
        self.apply_latency(pair).await;
        let mut s = self.state.lock();
        s.order_calls += 1;

        if let Some(scripted) = s.order_results.pop_front() {
            return scripted;
        }

        let price = s.tickers.get(pair).copied().unwrap_or(Decimal::ZERO);
        Ok(Fill {
            order_id: Uuid::new_v4().to_string(),
            qty,
            avg_price: price,
            fee: Decimal::ZERO,
        })
    }

    async fn get_balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        self.apply_latency(currency).await;
        Ok(Decimal::ZERO)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn scripted_candles_respect_limit() {
        let mock = MockExchange::new();
        let candles: Vec<Candle> = (0..10)
            .map(|i| Candle::new(i * 1000, 1.0, 2.0, 0.5, 1.5, 1.0))
            .collect();
        mock.set_candles("BTC/KRW", Interval::H4, candles);

        let fetched = mock.get_ohlcv("BTC/KRW", Interval::H4, 4).await.unwrap();
        assert_eq!(fetched.len(), 4);
        assert_eq!(fetched[0].open_time, 6000);
        assert_eq!(mock.ohlcv_calls(), 1);
    }

    #[tokio::test]
    async fn unscripted_pair_is_transient() {
        let mock = MockExchange::new();
        let err = mock.get_ohlcv("XRP/KRW", Interval::D1, 10).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Transient(_)));
    }

    #[tokio::test]
    async fn scripted_order_results_consume_fifo() {
        let mock = MockExchange::new();
        mock.set_ticker("BTC/KRW", dec!(100));
        mock.push_order_result(Err(ExchangeError::Transient("blip".into())));

        let first = mock.place_market_order("BTC/KRW", Side::Buy, dec!(1)).await;
        assert!(first.is_err());

        // Queue drained: default fill at ticker price.
        let second = mock
            .place_market_order("BTC/KRW", Side::Buy, dec!(1))
            .await
            .unwrap();
        assert_eq!(second.avg_price, dec!(100));
        assert_eq!(mock.order_calls(), 2);
    }
}
