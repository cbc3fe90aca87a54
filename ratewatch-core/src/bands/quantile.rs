//! Inclusive linear-interpolation quantile.
//!
//! For quantile `q` over `n` ascending values the position is `q * (n - 1)`;
//! the result interpolates linearly between the two bracketing order
//! statistics. This is the "inclusive" / type-7 convention (numpy `linear`,
//! pandas default). Changing it changes every band boundary.

/// Quantile of already-sorted values. `None` for an empty slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = pos - lo as f64;
    Some(sorted[lo] * (1.0 - frac) + sorted[hi] * frac)
}

/// Sort a copy of `values` (NaNs are not expected; they sort last).
pub fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Greater));
    v
}
