// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA weights recent prices more heavily than the Simple Moving Average:
//
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first value is seeded with the SMA of the first `period` closes so the
// series carries no transient bias from an arbitrary starting point.
// =============================================================================

/// Compute the EMA series for `closes` with the given look-back `period`.
///
/// The output is aligned so that element 0 corresponds to input index
/// `period - 1`. Returns an empty vec when `period` is zero or the input is
/// shorter than `period`. A non-finite intermediate value truncates the
/// series at that point.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);

    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(closes.len() - period + 1);
    out.push(seed);

    let mut prev = seed;
    for &close in &closes[period..] {
        let next = close * multiplier + prev * (1.0 - multiplier);
        if !next.is_finite() {
            break;
        }
        out.push(next);
        prev = next;
    }

    out
}

/// Latest EMA value, or `None` when the warmup is unmet.
pub fn ema(closes: &[f64], period: usize) -> Option<f64> {
    ema_series(closes, period).last().copied()
}

/// Latest EMA value, degrading to the whole-series SMA when fewer than
/// `period` closes are available.
///
/// The regime classifier compares a 50-period and a 200-period EMA but must
/// operate from 50 daily bars upward; the slow leg uses this degraded average
/// until its real warmup completes.
pub fn ema_or_mean(closes: &[f64], period: usize) -> Option<f64> {
    if closes.is_empty() {
        return None;
    }
    if closes.len() >= period {
        return ema(closes, period);
    }
    let mean = closes.iter().sum::<f64>() / closes.len() as f64;
    mean.is_finite().then_some(mean)
}
