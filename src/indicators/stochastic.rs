// =============================================================================
// Stochastic Oscillator (%K / %D)
// =============================================================================
//
//   %K_t = (close_t - lowestLow(k)) / (highestHigh(k) - lowestLow(k)) * 100
//   %D_t = SMA of the last `d` %K values
//
// A window with zero range (highest == lowest) reads as 50 — the close sits
// nowhere in particular inside a degenerate band.
// =============================================================================

use crate::market_data::Candle;

/// One aligned (%K, %D) reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StochPoint {
    pub k: f64,
    pub d: f64,
}

/// Full stochastic series for `candles` with a `k_period` look-back and
/// `d_period` %D smoothing.
///
/// One output per bar starting at index `k_period + d_period - 2` (the first
/// `k_period - 1` bars warm up %K, the next `d_period - 1` warm up %D).
/// Empty when either period is zero or the warmup is unmet.
pub fn stoch_series(candles: &[Candle], k_period: usize, d_period: usize) -> Vec<StochPoint> {
    if k_period == 0 || d_period == 0 || candles.len() < k_period + d_period - 1 {
        return Vec::new();
    }

    // Raw %K values, one per window.
    let mut k_values = Vec::with_capacity(candles.len() - k_period + 1);
    for window in candles.windows(k_period) {
        let highest = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let close = window[k_period - 1].close;

        let range = highest - lowest;
        let k = if range <= 0.0 {
            50.0
        } else {
            ((close - lowest) / range * 100.0).clamp(0.0, 100.0)
        };
        if !k.is_finite() {
            return Vec::new();
        }
        k_values.push(k);
    }

    // %D: simple moving average over the %K stream.
    let mut out = Vec::with_capacity(k_values.len() - d_period + 1);
    for (i, window) in k_values.windows(d_period).enumerate() {
        let d = window.iter().sum::<f64>() / d_period as f64;
        out.push(StochPoint {
            k: k_values[i + d_period - 1],
            d,
        });
    }

    out
}

/// Latest (%K, %D) reading, or `None` when the warmup is unmet.
pub fn stochastic(candles: &[Candle], k_period: usize, d_period: usize) -> Option<StochPoint> {
    stoch_series(candles, k_period, d_period).last().copied()
}

/// Whether %K crossed above %D on the last two readings (`prev: k < d`,
/// `now: k >= d`). This is the only cross definition the entry score uses.
pub fn crossed_above(series: &[StochPoint]) -> bool {
    if series.len() < 2 {
        return false;
    }
    let prev = series[series.len() - 2];
    let now = series[series.len() - 1];
    prev.k < prev.d && now.k >= now.d
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, (high + low) / 2.0, high, low, close, 10.0)
    }

    #[test]
    fn warmup_unmet() {
        let candles = vec![candle(10.0, 5.0, 7.0); 10];
        assert!(stoch_series(&candles, 14, 3).is_empty());
        assert!(stochastic(&candles, 14, 3).is_none());
    }

    #[test]
    fn zero_periods() {
        let candles = vec![candle(10.0, 5.0, 7.0); 30];
        assert!(stoch_series(&candles, 0, 3).is_empty());
        assert!(stoch_series(&candles, 14, 0).is_empty());
    }

    #[test]
    fn close_at_extremes() {
        // Close pinned to the highest high => %K = 100.
        let mut candles: Vec<Candle> = (0..20).map(|i| candle(10.0 + i as f64, 5.0, 8.0)).collect();
        let last_high = 10.0 + 19.0;
        candles.push(candle(last_high + 1.0, 5.0, last_high + 1.0));
        let point = stochastic(&candles, 14, 3).unwrap();
        assert!((point.k - 100.0).abs() < 1e-10);

        // Close pinned to the lowest low => %K = 0.
        let mut candles: Vec<Candle> = (0..20).map(|i| candle(10.0 + i as f64, 5.0, 8.0)).collect();
        candles.push(candle(30.0, 4.0, 4.0));
        let point = stochastic(&candles, 14, 3).unwrap();
        assert!(point.k.abs() < 1e-10);
    }

    #[test]
    fn degenerate_range_reads_fifty() {
        let candles = vec![candle(100.0, 100.0, 100.0); 20];
        let point = stochastic(&candles, 14, 3).unwrap();
        assert!((point.k - 50.0).abs() < 1e-10);
        assert!((point.d - 50.0).abs() < 1e-10);
    }

    #[test]
    fn d_is_sma_of_k() {
        let candles: Vec<Candle> = (0..25)
            .map(|i| {
                let base = 50.0 + (i as f64 * 0.9).sin() * 10.0;
                candle(base + 2.0, base - 2.0, base + (i % 3) as f64 - 1.0)
            })
            .collect();
        let series = stoch_series(&candles, 14, 3);
        assert!(series.len() >= 3);

        // Recompute %D for the last point from raw %K values.
        let n = series.len();
        let k2 = series[n - 1].k;
        let k1 = series[n - 2].k;
        let k0 = series[n - 3].k;
        let expected = (k0 + k1 + k2) / 3.0;
        assert!((series[n - 1].d - expected).abs() < 1e-9);
    }

    #[test]
    fn cross_above_detection() {
        let below = StochPoint { k: 10.0, d: 15.0 };
        let above = StochPoint { k: 16.0, d: 14.0 };
        let equal = StochPoint { k: 14.0, d: 14.0 };

        assert!(crossed_above(&[below, above]));
        // k == d counts as crossed (now: k >= d).
        assert!(crossed_above(&[below, equal]));
        // Already above before: no cross.
        assert!(!crossed_above(&[above, above]));
        // Single point: no cross.
        assert!(!crossed_above(&[above]));
    }

    #[test]
    fn deterministic() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 80.0 + (i as f64 * 0.5).cos() * 6.0;
                candle(base + 1.5, base - 1.5, base)
            })
            .collect();
        assert_eq!(stoch_series(&candles, 14, 3), stoch_series(&candles, 14, 3));
    }
}
