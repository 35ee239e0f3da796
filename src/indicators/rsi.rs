// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
//   avg_gain/avg_loss seeded with the SMA of the first `period` up/down moves,
//   then smoothed:  avg = (prev_avg * (period - 1) + current) / period
//   RS  = avg_gain / avg_loss
//   RSI = 100 - 100 / (1 + RS), clamped into [0, 100]
//
// A totally flat window (both sums zero) reads as 50 — no directional
// information rather than an extreme.
// =============================================================================

/// Full RSI series for `closes`. One output per close starting at index
/// `period` (the first `period` closes seed the averages). Empty when the
/// warmup is unmet or `period` is zero.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut out = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_value(avg_gain, avg_loss) {
        Some(v) => out.push(v),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_value(avg_gain, avg_loss) {
            Some(v) => out.push(v),
            None => break,
        }
    }

    out
}

/// Most recent RSI value, or `None` when the warmup is unmet.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied()
}

/// Convert smoothed averages into an RSI value in [0, 100].
fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    value.is_finite().then(|| value.clamp(0.0, 100.0))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_period_zero() {
        assert!(rsi_series(&[], 14).is_empty());
        assert!(rsi_series(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn insufficient_data() {
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(rsi_series(&closes, 14).is_empty());
        assert!(rsi(&closes, 14).is_none());
    }

    #[test]
    fn all_gains_reads_hundred() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for v in rsi_series(&closes, 14) {
            assert!((v - 100.0).abs() < 1e-10);
        }
    }

    #[test]
    fn all_losses_reads_zero() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for v in rsi_series(&closes, 14) {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn flat_window_reads_fifty() {
        let closes = vec![100.0; 30];
        for v in rsi_series(&closes, 14) {
            assert!((v - 50.0).abs() < 1e-10);
        }
    }

    #[test]
    fn always_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13, 44.01, 42.50,
        ];
        for v in rsi_series(&closes, 14) {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn repeated_calls_identical() {
        let closes: Vec<f64> = (0..100).map(|i| 50.0 + (i as f64 * 0.4).cos() * 3.0).collect();
        assert_eq!(rsi_series(&closes, 14), rsi_series(&closes, 14));
    }
}
