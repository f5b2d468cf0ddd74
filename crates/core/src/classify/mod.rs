use crate::ThresholdConfig;

/// Maps a loudness value onto one of `n` discrete visual states.
///
/// Anything below `min` selects state `0`. Above that the window
/// `[min, max)` is split into `n` equal buckets; values at or beyond `max`
/// saturate into the last one. `min < max` is guaranteed by
/// [`ThresholdConfig`] and is not checked again here.
pub fn classify(rms: f64, thresholds: &ThresholdConfig, n: usize) -> usize {
    if n <= 1 || rms < thresholds.min() {
        return 0;
    }

    let span = thresholds.max() - thresholds.min();
    let t = (rms - thresholds.min()) / span;
    let index = (t * n as f64).floor();
    if index.is_nan() || index < 0.0 {
        0
    } else {
        (index as usize).min(n - 1)
    }
}
