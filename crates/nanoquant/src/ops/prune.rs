//! Pruning operators.
//!
//! Pruning never resizes a matrix: pruned entries are zeroed and recorded in
//! a keep-mask so later stages can re-apply the sparsity pattern.

use nanoquant_core::{Error, Result, WeightMatrix};

use super::stats::{check_input, l2_norm, mean, quantile};

/// Stabilizer added to the row mean in the second-order score.
pub const SPARSEGPT_EPSILON: f32 = 1e-6;

/// Boolean keep-mask over a weight matrix (`true` = kept).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneMask {
    rows: usize,
    cols: usize,
    keep: Vec<bool>,
}

impl PruneMask {
    /// Mask that keeps every entry.
    pub fn keep_all(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            keep: vec![true; rows * cols],
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.keep
    }

    pub fn into_vec(self) -> Vec<bool> {
        self.keep
    }

    /// Number of pruned entries.
    pub fn pruned_count(&self) -> usize {
        self.keep.iter().filter(|&&k| !k).count()
    }

    /// Fraction of pruned entries.
    pub fn sparsity(&self) -> f32 {
        if self.keep.is_empty() {
            return 0.0;
        }
        self.pruned_count() as f32 / self.keep.len() as f32
    }

    /// Zero every pruned entry of `tensor`.
    pub fn apply(&self, tensor: &WeightMatrix) -> Result<WeightMatrix> {
        if tensor.shape() != self.shape() {
            return Err(Error::shape_mismatch(self.shape(), tensor.shape()));
        }
        let mut out = tensor.clone();
        for (v, &k) in out.as_mut_slice().iter_mut().zip(&self.keep) {
            if !k {
                *v = 0.0;
            }
        }
        Ok(out)
    }
}

/// Pruned weights together with the mask that produced them.
#[derive(Debug, Clone)]
pub struct Pruned {
    pub weight: WeightMatrix,
    pub mask: PruneMask,
}

fn check_ratio(ratio: f32, operator: &'static str) -> Result<()> {
    if !(0.0..1.0).contains(&ratio) {
        return Err(Error::operator(operator, format!("ratio {ratio} outside [0, 1)")));
    }
    Ok(())
}

fn finish(tensor: &WeightMatrix, keep: Vec<bool>) -> Result<Pruned> {
    let (rows, cols) = tensor.shape();
    let mask = PruneMask { rows, cols, keep };
    let weight = mask.apply(tensor)?;
    Ok(Pruned { weight, mask })
}

/// Zero the `round(ratio · numel)` entries with the smallest magnitude.
///
/// Ties are broken by position, so the pruned count is exact.
pub fn magnitude_prune(tensor: &WeightMatrix, ratio: f32) -> Result<Pruned> {
    check_input(tensor.as_slice(), "magnitude_prune")?;
    check_ratio(ratio, "magnitude_prune")?;

    let n = tensor.numel();
    let k = ((ratio as f64) * n as f64).round() as usize;
    let mut order: Vec<usize> = (0..n).collect();
    let values = tensor.as_slice();
    order.sort_by(|&a, &b| values[a].abs().total_cmp(&values[b].abs()));

    let mut keep = vec![true; n];
    for &idx in order.iter().take(k) {
        keep[idx] = false;
    }
    finish(tensor, keep)
}

/// Zero entries whose importance score falls below the `ratio`-quantile of all scores.
pub fn importance_prune<F>(tensor: &WeightMatrix, ratio: f32, importance_fn: F) -> Result<Pruned>
where
    F: Fn(&WeightMatrix) -> Vec<f32>,
{
    check_input(tensor.as_slice(), "importance_prune")?;
    check_ratio(ratio, "importance_prune")?;

    let scores = importance_fn(tensor);
    if scores.len() != tensor.numel() {
        return Err(Error::shape_mismatch(tensor.shape(), (scores.len(), 1)));
    }
    if ratio == 0.0 {
        return finish(tensor, vec![true; scores.len()]);
    }
    let threshold = quantile(&scores, ratio)?;
    let keep = scores.iter().map(|&s| s >= threshold).collect();
    finish(tensor, keep)
}

/// Activation-free Wanda-style score: `|w| · ‖row‖₂`.
pub fn wanda_scores(tensor: &WeightMatrix) -> Vec<f32> {
    let mut scores = Vec::with_capacity(tensor.numel());
    for r in 0..tensor.rows() {
        let row = tensor.row(r);
        let norm = l2_norm(row);
        scores.extend(row.iter().map(|w| w.abs() * norm));
    }
    scores
}

/// Diagonal second-order score: `w² / (mean(row²) + ε)`.
pub fn sparsegpt_scores(tensor: &WeightMatrix) -> Vec<f32> {
    let mut scores = Vec::with_capacity(tensor.numel());
    for r in 0..tensor.rows() {
        let row = tensor.row(r);
        let squares: Vec<f32> = row.iter().map(|w| w * w).collect();
        let denom = mean(&squares) + SPARSEGPT_EPSILON;
        scores.extend(squares.iter().map(|sq| sq / denom));
    }
    scores
}

/// Zero whole output rows with the smallest L2 norm; the shape is kept.
pub fn structured_prune(tensor: &WeightMatrix, ratio: f32) -> Result<Pruned> {
    check_input(tensor.as_slice(), "structured_prune")?;
    check_ratio(ratio, "structured_prune")?;

    let rows = tensor.rows();
    let k = ((ratio as f64) * rows as f64).round() as usize;
    let norms: Vec<f32> = (0..rows).map(|r| l2_norm(tensor.row(r))).collect();
    let mut order: Vec<usize> = (0..rows).collect();
    order.sort_by(|&a, &b| norms[a].total_cmp(&norms[b]));

    let mut keep = vec![true; tensor.numel()];
    for &r in order.iter().take(k) {
        keep[r * tensor.cols()..(r + 1) * tensor.cols()].fill(false);
    }
    finish(tensor, keep)
}
