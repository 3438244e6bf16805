//! Order statistics over weight values.

use nanoquant_core::{Error, Result};

/// Linear-interpolation quantile of `values` at `q ∈ [0, 1]`.
///
/// Matches the usual "linear" definition: position `q·(n-1)` in the sorted
/// sequence, interpolating between the two neighbouring order statistics.
pub fn quantile(values: &[f32], q: f32) -> Result<f32> {
    let sorted = sorted_finite(values, "quantile")?;
    Ok(quantile_sorted(&sorted, q))
}

/// Several quantiles over a single sort.
pub fn quantiles(values: &[f32], qs: &[f32]) -> Result<Vec<f32>> {
    let sorted = sorted_finite(values, "quantile")?;
    Ok(qs.iter().map(|&q| quantile_sorted(&sorted, q)).collect())
}

fn sorted_finite(values: &[f32], operator: &'static str) -> Result<Vec<f32>> {
    check_input(values, operator)?;
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    Ok(sorted)
}

fn quantile_sorted(sorted: &[f32], q: f32) -> f32 {
    let q = q.clamp(0.0, 1.0) as f64;
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    let (a, b) = (sorted[lo] as f64, sorted[hi] as f64);
    (a + (b - a) * frac) as f32
}

/// Mean of a slice, 0 when empty.
pub fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64) as f32
}

/// Euclidean norm of a slice.
pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>().sqrt() as f32
}

/// Reject empty or non-finite tensors before an operator touches them.
pub(crate) fn check_input(values: &[f32], operator: &'static str) -> Result<()> {
    if values.is_empty() {
        return Err(Error::EmptyTensor { operator });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::NonFinite { operator });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_interpolates() {
        let v = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(quantile(&v, 0.0).unwrap(), 1.0);
        assert_eq!(quantile(&v, 1.0).unwrap(), 4.0);
        assert!((quantile(&v, 0.5).unwrap() - 2.5).abs() < 1e-6);
        assert!((quantile(&v, 0.8).unwrap() - 3.4).abs() < 1e-6);
    }

    #[test]
    fn test_quantiles_batch() {
        let v = [3.0, -1.0, 5.0, -7.0];
        let q = quantiles(&v, &[0.0, 0.5, 1.0]).unwrap();
        assert_eq!(q, vec![-7.0, 1.0, 5.0]);
    }

    #[test]
    fn test_quantile_rejects_empty_and_nan() {
        assert!(matches!(quantile(&[], 0.5), Err(Error::EmptyTensor { .. })));
        assert!(matches!(quantile(&[1.0, f32::NAN], 0.5), Err(Error::NonFinite { .. })));
    }

    #[test]
    fn test_mean_and_norm() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[3.0, 5.0]), 4.0);
        assert_eq!(l2_norm(&[3.0, 4.0]), 5.0);
    }
}
