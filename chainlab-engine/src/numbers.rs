//! Numeric conversion helpers centralizing safe numeric casts.

use num_traits::cast::cast;

/// Scale a delay in logical milliseconds, rounding to the nearest millisecond.
///
/// Non-finite or non-positive scales leave the delay untouched; positive delays never round
/// down to zero so a scheduled entry always lies in the future.
#[must_use]
pub fn scale_ms(ms: u64, scale: f64) -> u64 {
    if !scale.is_finite() || scale <= 0.0 || (scale - 1.0).abs() < f64::EPSILON {
        return ms;
    }
    let scaled = u64_to_f64(ms) * scale;
    let max = cast::<u64, f64>(u64::MAX).unwrap_or(f64::MAX);
    let rounded = cast::<f64, u64>(scaled.clamp(0.0, max).round()).unwrap_or(ms);
    if ms > 0 { rounded.max(1) } else { 0 }
}

/// Integer percentage of `part` over `whole`, clamped to 0..=100.
#[must_use]
pub fn percent(part: usize, whole: usize) -> u8 {
    if whole == 0 {
        return 0;
    }
    let ratio = usize_to_f64(part.min(whole)) / usize_to_f64(whole);
    cast::<f64, u8>((ratio * 100.0).round()).unwrap_or(100)
}

/// Convert u64 to f64 while allowing precision loss in a single location.
#[must_use]
pub fn u64_to_f64(value: u64) -> f64 {
    cast::<u64, f64>(value).unwrap_or(0.0)
}

/// Convert usize to f64 while allowing precision loss in a single location.
#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    cast::<usize, f64>(value).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_ms_rounds_and_keeps_positive() {
        assert_eq!(scale_ms(3_000, 1.0), 3_000);
        assert_eq!(scale_ms(3_000, 0.5), 1_500);
        assert_eq!(scale_ms(1, 0.01), 1);
        assert_eq!(scale_ms(0, 10.0), 0);
        assert_eq!(scale_ms(2_000, f64::NAN), 2_000);
    }

    #[test]
    fn percent_handles_edges() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(9, 3), 100);
    }
}
