// =============================================================================
// Weighted Moving Average (WMA)
// =============================================================================
//
// Linear weights: the oldest value in the window has weight 1, the newest has
// weight `period`.
//
//   WMA_t = Σ_{k=1..n} k · x_{t-n+k}  /  (n(n+1)/2)
//
// Missing inputs are `None`; any `None` inside a window makes that output
// `None`.
// =============================================================================

/// WMA over the full series. Output has the same length as `values`; the first
/// `period - 1` entries are `None`.
///
/// # Edge cases
/// - `period == 0` => all `None`
/// - `values.len() < period` => all `None`
pub fn wma(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    for (i, slot) in out.iter_mut().enumerate().skip(period - 1) {
        *slot = wma_last(&values[i + 1 - period..=i]);
    }
    out
}

/// WMA of a single window, newest value last. `None` if the window holds a
/// gap or the result is not finite.
pub fn wma_last(window: &[Option<f64>]) -> Option<f64> {
    let n = window.len();
    if n == 0 {
        return None;
    }
    let mut weighted = 0.0;
    for (k, v) in window.iter().enumerate() {
        weighted += (k + 1) as f64 * (*v)?;
    }
    let denom = (n * (n + 1)) as f64 / 2.0;
    let value = weighted / denom;
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(xs: &[f64]) -> Vec<Option<f64>> {
        xs.iter().copied().map(Some).collect()
    }

    #[test]
    fn wma_matches_hand_computation() {
        // (1·1 + 2·2 + 3·3) / 6 = 14/6
        let out = wma(&some(&[1.0, 2.0, 3.0, 4.0]), 3);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert!((out[2].unwrap() - 14.0 / 6.0).abs() < 1e-12);
        assert!((out[3].unwrap() - 20.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn wma_period_zero_and_short_input() {
        assert_eq!(wma(&some(&[1.0, 2.0]), 0), vec![None, None]);
        assert_eq!(wma(&some(&[1.0, 2.0]), 3), vec![None, None]);
        assert!(wma(&[], 3).is_empty());
    }

    #[test]
    fn gap_poisons_every_window_containing_it() {
        let values = vec![Some(1.0), Some(2.0), None, Some(4.0), Some(5.0), Some(6.0)];
        let out = wma(&values, 2);
        assert!(out[1].is_some());
        assert_eq!(out[2], None);
        assert_eq!(out[3], None);
        assert!(out[4].is_some());
        assert!(out[5].is_some());
    }

    #[test]
    fn period_one_is_identity() {
        let out = wma(&some(&[3.0, 7.0]), 1);
        assert_eq!(out, some(&[3.0, 7.0]));
    }
}
