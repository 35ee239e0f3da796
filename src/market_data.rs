// =============================================================================
// Market data — OHLCV candle model and series validation
// =============================================================================
//
// The engine polls candles over REST on a fixed cadence; there is no streaming
// buffer. A fetched series must be oldest-first, strictly monotonic in
// open_time, and internally consistent (low <= open/close <= high) before any
// indicator touches it.
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV bar. Prices are `f64` here because candles only feed
/// indicator scratch math; money that reaches orders or disk is converted to
/// decimals at the executor boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, UTC milliseconds.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Structural validity of a single bar.
    pub fn is_valid(&self) -> bool {
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        self.low <= body_lo
            && body_hi <= self.high
            && self.volume >= 0.0
            && [self.open, self.high, self.low, self.close, self.volume]
                .iter()
                .all(|v| v.is_finite())
    }
}

/// Validate an ordered candle series fetched from the exchange.
///
/// Checks, in order:
/// 1. Every bar is structurally valid.
/// 2. `open_time` is strictly increasing.
/// 3. Spacing between consecutive bars is uniform (the first gap sets the
///    expected spacing).
///
/// Returns the offending index on failure so the caller can log which bar the
/// exchange mangled.
pub fn validate_series(candles: &[Candle]) -> Result<(), SeriesDefect> {
    for (i, c) in candles.iter().enumerate() {
        if !c.is_valid() {
            return Err(SeriesDefect::MalformedBar(i));
        }
    }

    if candles.len() < 2 {
        return Ok(());
    }

    let spacing = candles[1].open_time - candles[0].open_time;
    if spacing <= 0 {
        return Err(SeriesDefect::NonMonotonic(1));
    }

    for i in 2..candles.len() {
        let gap = candles[i].open_time - candles[i - 1].open_time;
        if gap <= 0 {
            return Err(SeriesDefect::NonMonotonic(i));
        }
        if gap != spacing {
            return Err(SeriesDefect::IrregularSpacing(i));
        }
    }

    Ok(())
}

/// Why a candle series was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesDefect {
    MalformedBar(usize),
    NonMonotonic(usize),
    IrregularSpacing(usize),
}

impl std::fmt::Display for SeriesDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedBar(i) => write!(f, "malformed bar at index {i}"),
            Self::NonMonotonic(i) => write!(f, "non-monotonic open_time at index {i}"),
            Self::IrregularSpacing(i) => write!(f, "irregular bar spacing at index {i}"),
        }
    }
}

/// Extract closing prices from a candle slice.
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(t: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(t, open, high, low, close, 10.0)
    }

    #[test]
    fn valid_series_passes() {
        let series = vec![
            bar(0, 100.0, 105.0, 99.0, 102.0),
            bar(3600, 102.0, 106.0, 101.0, 104.0),
            bar(7200, 104.0, 107.0, 103.0, 105.0),
        ];
        assert!(validate_series(&series).is_ok());
    }

    #[test]
    fn high_below_body_rejected() {
        let series = vec![bar(0, 100.0, 101.0, 99.0, 102.0)]; // close above high
        assert_eq!(
            validate_series(&series),
            Err(SeriesDefect::MalformedBar(0))
        );
    }

    #[test]
    fn negative_volume_rejected() {
        let mut c = bar(0, 100.0, 105.0, 99.0, 102.0);
        c.volume = -1.0;
        assert!(!c.is_valid());
    }

    #[test]
    fn out_of_order_timestamps_rejected() {
        let series = vec![
            bar(3600, 100.0, 105.0, 99.0, 102.0),
            bar(0, 102.0, 106.0, 101.0, 104.0),
        ];
        assert_eq!(
            validate_series(&series),
            Err(SeriesDefect::NonMonotonic(1))
        );
    }

    #[test]
    fn irregular_spacing_rejected() {
        let series = vec![
            bar(0, 100.0, 105.0, 99.0, 102.0),
            bar(3600, 102.0, 106.0, 101.0, 104.0),
            bar(9000, 104.0, 107.0, 103.0, 105.0),
        ];
        assert_eq!(
            validate_series(&series),
            Err(SeriesDefect::IrregularSpacing(2))
        );
    }

    #[test]
    fn nan_price_rejected() {
        let series = vec![bar(0, 100.0, f64::NAN, 99.0, 100.0)];
        assert_eq!(
            validate_series(&series),
            Err(SeriesDefect::MalformedBar(0))
        );
    }

    #[test]
    fn single_bar_and_empty_are_fine() {
        assert!(validate_series(&[]).is_ok());
        assert!(validate_series(&[bar(0, 1.0, 2.0, 0.5, 1.5)]).is_ok());
    }
}
