// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period), upper/lower = middle +/- k * population σ over
// the same window. The strategy compares the latest close against the lower
// band for entries and against the middle/upper band for profit targets.

/// Bands computed over the most recent `period` closes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
}

/// Calculate Bollinger Bands over the trailing window of `closes`.
///
/// Returns `None` when `period` is zero, the input is shorter than `period`,
/// or the result is non-finite.
pub fn bollinger(closes: &[f64], period: usize, std_mul: f64) -> Option<Bands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + std_mul * std_dev;
    let lower = middle - std_mul * std_dev;

    (lower.is_finite() && upper.is_finite()).then_some(Bands {
        lower,
        middle,
        upper,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_ordering() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bands = bollinger(&closes, 20, 2.0).unwrap();
        assert!(bands.lower < bands.middle);
        assert!(bands.middle < bands.upper);
    }

    #[test]
    fn insufficient_data() {
        assert!(bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
        assert!(bollinger(&[], 20, 2.0).is_none());
    }

    #[test]
    fn flat_series_collapses() {
        let closes = vec![100.0; 20];
        let bands = bollinger(&closes, 20, 2.0).unwrap();
        assert!((bands.lower - 100.0).abs() < 1e-10);
        assert!((bands.middle - 100.0).abs() < 1e-10);
        assert!((bands.upper - 100.0).abs() < 1e-10);
    }

    #[test]
    fn uses_trailing_window_only() {
        // A wild prefix must not affect the bands if it falls outside the window.
        let mut closes = vec![1000.0; 30];
        closes.extend(std::iter::repeat(100.0).take(20));
        let bands = bollinger(&closes, 20, 2.0).unwrap();
        assert!((bands.middle - 100.0).abs() < 1e-10);
    }

    #[test]
    fn known_sigma() {
        // Window [98, 102] repeated: mean 100, population σ = 2.
        let closes: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 98.0 } else { 102.0 }).collect();
        let bands = bollinger(&closes, 20, 2.0).unwrap();
        assert!((bands.middle - 100.0).abs() < 1e-10);
        assert!((bands.upper - 104.0).abs() < 1e-10);
        assert!((bands.lower - 96.0).abs() < 1e-10);
    }

    #[test]
    fn nan_rejected() {
        let mut closes = vec![100.0; 20];
        closes[10] = f64::NAN;
        assert!(bollinger(&closes, 20, 2.0).is_none());
    }
}
