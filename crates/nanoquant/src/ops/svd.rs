//! Truncated SVD for low-rank weight approximation.
//!
//! ## Algorithm
//!
//! The decomposition peels off one singular triplet at a time:
//!
//! 1. Power iteration on the residual `R` finds the dominant left vector `u`.
//! 2. The residual is deflated by projection, `R ← R - u (uᵀR)`.
//! 3. `uᵀR` (before deflation) gives `σ·vᵀ`.
//!
//! Projection deflation makes the left vectors orthonormal and removes the
//! captured subspace exactly, so keeping `min(rows, cols)` triplets
//! reconstructs the input up to floating point error even when power
//! iteration has not fully converged.
//!
//! Arithmetic is done in `f64`. With the `parallel` feature the matrix-vector
//! products are split over rows with rayon.

use nanoquant_core::{Error, Result, WeightMatrix};

use super::stats::check_input;

/// Default residual correction factor for corrective low-rank decomposition.
pub const DEFAULT_CORRECTION_FACTOR: f32 = 0.1;

const MAX_POWER_ITERATIONS: usize = 100;
const CONVERGENCE_TOLERANCE: f64 = 1e-12;
const RESIDUAL_TOLERANCE: f64 = 1e-9;

/// Low-rank factors `U (rows×rank) · diag(S) · Vᵀ (rank×cols)`, row-major.
#[derive(Debug, Clone)]
pub struct LowRankFactors {
    pub rows: usize,
    pub cols: usize,
    pub rank: usize,
    pub u: Vec<f32>,
    pub s: Vec<f32>,
    pub vt: Vec<f32>,
}

impl LowRankFactors {
    /// Dense `U · diag(S) · Vᵀ`.
    pub fn reconstruct(&self) -> Result<WeightMatrix> {
        let (rows, cols, rank) = (self.rows, self.cols, self.rank);
        if self.u.len() != rows * rank || self.s.len() != rank || self.vt.len() != rank * cols {
            return Err(Error::operator("low_rank_decompose", "invalid factor dimensions"));
        }
        let mut out = vec![0.0f64; rows * cols];
        for i in 0..rows {
            for k in 0..rank {
                let coeff = self.u[i * rank + k] as f64 * self.s[k] as f64;
                if coeff == 0.0 {
                    continue;
                }
                let vt_row = &self.vt[k * cols..(k + 1) * cols];
                for (dst, &v) in out[i * cols..(i + 1) * cols].iter_mut().zip(vt_row) {
                    *dst += coeff * v as f64;
                }
            }
        }
        WeightMatrix::new(rows, cols, out.into_iter().map(|v| v as f32).collect())
    }
}

/// Target rank for `rank_ratio`: `max(1, round(rank_ratio · min(rows, cols)))`.
pub fn target_rank(rows: usize, cols: usize, rank_ratio: f32) -> usize {
    let full = rows.min(cols);
    (((rank_ratio as f64) * full as f64).round() as usize).clamp(1, full.max(1))
}

fn check_rank_ratio(rank_ratio: f32, operator: &'static str) -> Result<()> {
    if !(rank_ratio > 0.0 && rank_ratio <= 1.0) {
        return Err(Error::operator(operator, format!("rank ratio {rank_ratio} outside (0, 1]")));
    }
    Ok(())
}

/// Truncated SVD keeping at most `rank` triplets.
///
/// Stops early once the residual is numerically zero, so the returned rank
/// may be lower than requested for rank-deficient inputs.
pub fn truncated_svd(matrix: &WeightMatrix, rank: usize) -> Result<LowRankFactors> {
    check_input(matrix.as_slice(), "svd")?;
    let (rows, cols) = matrix.shape();
    let rank = rank.clamp(1, rows.min(cols));

    let mut residual: Vec<f64> = matrix.as_slice().iter().map(|&v| v as f64).collect();
    let original_norm = frobenius(&residual);
    let mut u_vecs: Vec<Vec<f64>> = Vec::with_capacity(rank);
    let mut s_vals: Vec<f64> = Vec::with_capacity(rank);
    let mut v_vecs: Vec<Vec<f64>> = Vec::with_capacity(rank);

    for _ in 0..rank {
        if frobenius(&residual) <= RESIDUAL_TOLERANCE * original_norm.max(f64::MIN_POSITIVE) {
            break;
        }
        let u = dominant_left_vector(&residual, rows, cols);
        let mut w = vec![0.0f64; cols];
        mat_t_vec(&residual, rows, cols, &u, &mut w);
        let sigma = norm(&w);
        if !sigma.is_finite() {
            return Err(Error::operator("svd", "power iteration diverged"));
        }
        if sigma == 0.0 {
            break;
        }

        // R ← R - u wᵀ
        for i in 0..rows {
            let ui = u[i];
            for (r, &wj) in residual[i * cols..(i + 1) * cols].iter_mut().zip(&w) {
                *r -= ui * wj;
            }
        }

        w.iter_mut().for_each(|x| *x /= sigma);
        u_vecs.push(u);
        s_vals.push(sigma);
        v_vecs.push(w);
    }

    let rank = s_vals.len();
    let mut u = Vec::with_capacity(rows * rank);
    for i in 0..rows {
        for vec in &u_vecs {
            u.push(vec[i] as f32);
        }
    }
    let vt = v_vecs.iter().flatten().map(|&x| x as f32).collect();

    Ok(LowRankFactors {
        rows,
        cols,
        rank,
        u,
        s: s_vals.into_iter().map(|x| x as f32).collect(),
        vt,
    })
}

/// Rank-reduced reconstruction `U_r Σ_r V_rᵀ` with the same shape as the input.
pub fn low_rank_decompose(matrix: &WeightMatrix, rank_ratio: f32) -> Result<WeightMatrix> {
    check_rank_ratio(rank_ratio, "low_rank_decompose")?;
    let rank = target_rank(matrix.rows(), matrix.cols(), rank_ratio);
    let factors = truncated_svd(matrix, rank)?;
    let out = factors.reconstruct()?;
    if out.shape() != matrix.shape() {
        return Err(Error::shape_mismatch(matrix.shape(), out.shape()));
    }
    Ok(out)
}

/// Low-rank reconstruction plus `correction_factor · (M - reconstruction)`.
pub fn corrective_low_rank(matrix: &WeightMatrix, rank_ratio: f32, correction_factor: f32) -> Result<WeightMatrix> {
    if !(0.0..=1.0).contains(&correction_factor) {
        return Err(Error::operator(
            "corrective_low_rank",
            format!("correction factor {correction_factor} outside [0, 1]"),
        ));
    }
    let mut approx = low_rank_decompose(matrix, rank_ratio)?;
    for (a, &m) in approx.as_mut_slice().iter_mut().zip(matrix.as_slice()) {
        *a += correction_factor * (m - *a);
    }
    Ok(approx)
}

/// Power iteration on `A Aᵀ` seeded from the largest row of `A`.
///
/// The seed lies in the column space of `A`, so the iterate never collapses
/// to zero while the residual is non-zero.
fn dominant_left_vector(a: &[f64], rows: usize, cols: usize) -> Vec<f64> {
    let seed_row = (0..rows)
        .max_by(|&x, &y| norm(&a[x * cols..(x + 1) * cols]).total_cmp(&norm(&a[y * cols..(y + 1) * cols])))
        .unwrap_or(0);
    let mut v = a[seed_row * cols..(seed_row + 1) * cols].to_vec();
    let mut u = vec![0.0f64; rows];
    mat_vec(a, rows, cols, &v, &mut u);
    normalize(&mut u);

    let mut prev_sigma = 0.0f64;
    for _ in 0..MAX_POWER_ITERATIONS {
        mat_t_vec(a, rows, cols, &u, &mut v);
        let sigma = normalize(&mut v);
        mat_vec(a, rows, cols, &v, &mut u);
        normalize(&mut u);
        if (sigma - prev_sigma).abs() <= CONVERGENCE_TOLERANCE * sigma.max(1.0) {
            break;
        }
        prev_sigma = sigma;
    }
    u
}

/// `out = A · v`.
#[cfg(not(feature = "parallel"))]
fn mat_vec(a: &[f64], _rows: usize, cols: usize, v: &[f64], out: &mut [f64]) {
    for (o, row) in out.iter_mut().zip(a.chunks_exact(cols)) {
        *o = row.iter().zip(v).map(|(x, y)| x * y).sum();
    }
}

/// `out = A · v`, row-parallel.
#[cfg(feature = "parallel")]
fn mat_vec(a: &[f64], _rows: usize, cols: usize, v: &[f64], out: &mut [f64]) {
    use rayon::prelude::*;
    out.par_iter_mut()
        .zip(a.par_chunks_exact(cols))
        .for_each(|(o, row)| *o = row.iter().zip(v).map(|(x, y)| x * y).sum());
}

/// `out = Aᵀ · u`.
fn mat_t_vec(a: &[f64], rows: usize, cols: usize, u: &[f64], out: &mut [f64]) {
    out.iter_mut().for_each(|x| *x = 0.0);
    for i in 0..rows {
        let ui = u[i];
        if ui == 0.0 {
            continue;
        }
        for (o, &x) in out.iter_mut().zip(&a[i * cols..(i + 1) * cols]) {
            *o += ui * x;
        }
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn frobenius(a: &[f64]) -> f64 {
    norm(a)
}

/// Normalize in place and return the previous norm.
fn normalize(v: &mut [f64]) -> f64 {
    let n = norm(v);
    if n > 0.0 {
        v.iter_mut().for_each(|x| *x /= n);
    }
    n
}
