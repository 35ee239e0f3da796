// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// ADX measures trend strength independent of direction:
//
//   1. +DM / -DM and True Range per bar transition.
//   2. Wilder-smoothed sums of +DM, -DM, TR over `period`.
//   3. +DI = smoothed(+DM) / smoothed(TR) * 100 (same for -DI).
//   4. DX  = |+DI - -DI| / (+DI + -DI) * 100.
//   5. ADX = Wilder-smoothed average of DX over `period`.
//
// The regime classifier treats ADX < 20 as "no usable trend".
// =============================================================================

use crate::market_data::Candle;

/// Most recent ADX value over `candles`.
///
/// Returns `None` when `period` is zero, fewer than `2 * period + 1` candles
/// are supplied (one `period` to smooth the directional sums, another to seed
/// the DX average, plus the bar with no predecessor), or the numbers go
/// non-finite.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let transitions = candles.len() - 1;

    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut true_range = Vec::with_capacity(transitions);

    for pair in candles.windows(2) {
        let prev = &pair[0];
        let cur = &pair[1];

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        true_range.push(tr);
    }

    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = true_range[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + true_range[i];
        dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut value: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &d in &dx_values[period..] {
        value = (value * (period_f - 1.0) + d) / period_f;
        if !value.is_finite() {
            return None;
        }
    }

    value.is_finite().then_some(value)
}

/// DX from smoothed directional sums. Zero directional movement reads as 0;
/// a zero true-range window yields `None`.
fn dx(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = smooth_plus / smooth_tr * 100.0;
    let minus_di = smooth_minus / smooth_tr * 100.0;

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return Some(0.0);
    }

    let value = (plus_di - minus_di).abs() / di_sum * 100.0;
    value.is_finite().then_some(value)
}
