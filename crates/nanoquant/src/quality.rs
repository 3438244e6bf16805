//! Measured quality of a compressed model against its source.
//!
//! These numbers sit next to the declared compression ratio in reports; they
//! never replace it.

use nanoquant_core::{ModelHandle, WeightMatrix};
use serde::{Deserialize, Serialize};

use crate::engine::merged_weight;

/// Bucket of the relative reconstruction error `‖W − W'‖ / ‖W‖`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fidelity {
    /// At most 1% relative error.
    #[default]
    NearLossless,
    /// At most 10%.
    Close,
    /// At most 35%.
    Usable,
    Lossy,
}

impl Fidelity {
    pub fn from_relative_error(error: f32) -> Self {
        match error {
            e if e <= 0.01 => Fidelity::NearLossless,
            e if e <= 0.10 => Fidelity::Close,
            e if e <= 0.35 => Fidelity::Usable,
            _ => Fidelity::Lossy,
        }
    }
}

/// Metrics for a single layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerQuality {
    /// Layer name.
    pub layer: String,
    /// Cosine similarity (1.0 = identical direction).
    pub cosine_similarity: f32,
    /// Mean squared error.
    pub mse: f32,
    /// Maximum absolute error.
    pub max_error: f32,
    /// Frobenius norm of the difference over the norm of the original.
    pub relative_error: f32,
    /// Fraction of exactly-zero weights in the compressed layer.
    pub sparsity: f32,
    /// Number of elements.
    pub num_elements: usize,
}

impl LayerQuality {
    /// Compare `compressed` against `original`. `None` when the shapes differ.
    pub fn compute(layer: impl Into<String>, original: &WeightMatrix, compressed: &WeightMatrix) -> Option<Self> {
        if original.shape() != compressed.shape() || original.is_empty() {
            return None;
        }
        let n = original.numel();
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        let mut mse_sum = 0.0f64;
        let mut max_err = 0.0f32;
        let mut zeros = 0usize;

        for (&a, &b) in original.as_slice().iter().zip(compressed.as_slice()) {
            if b == 0.0 {
                zeros += 1;
            }
            let (a, b) = (a as f64, b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
            let diff = (a - b).abs();
            mse_sum += diff * diff;
            max_err = max_err.max(diff as f32);
        }

        let cosine = match (norm_a > 0.0, norm_b > 0.0) {
            (true, true) => (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32,
            (false, false) => 1.0,
            _ => 0.0,
        };

        // An all-zero source has no scale; any change counts as total loss.
        let relative_error = match (norm_a > 0.0, mse_sum > 0.0) {
            (true, _) => (mse_sum / norm_a).sqrt() as f32,
            (false, true) => 1.0,
            (false, false) => 0.0,
        };

        Some(Self {
            layer: layer.into(),
            cosine_similarity: cosine,
            mse: (mse_sum / n as f64) as f32,
            max_error: max_err,
            relative_error,
            sparsity: zeros as f32 / n as f32,
            num_elements: n,
        })
    }

    #[must_use]
    pub fn fidelity(&self) -> Fidelity {
        Fidelity::from_relative_error(self.relative_error)
    }
}

/// Aggregate quality across the layers of one artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    pub layer_count: usize,
    pub avg_cosine_similarity: f32,
    /// Worst layer.
    pub min_cosine_similarity: f32,
    pub avg_mse: f32,
    pub max_mse: f32,
    pub max_relative_error: f32,
    /// Zero fraction over all weights.
    pub sparsity: f32,
    /// Fraction of layers at [`Fidelity::Usable`] or better.
    pub usable_fraction: f32,
    /// Fidelity of the worst layer.
    pub fidelity: Fidelity,
}

impl QualitySummary {
    pub fn from_layers(layers: &[LayerQuality]) -> Self {
        if layers.is_empty() {
            return Self::default();
        }
        let n = layers.len() as f32;
        let total: usize = layers.iter().map(|l| l.num_elements).sum();
        let zeros: f32 = layers.iter().map(|l| l.sparsity * l.num_elements as f32).sum();
        let max_relative_error = layers.iter().map(|l| l.relative_error).fold(0.0f32, f32::max);

        Self {
            layer_count: layers.len(),
            avg_cosine_similarity: layers.iter().map(|l| l.cosine_similarity).sum::<f32>() / n,
            min_cosine_similarity: layers
                .iter()
                .map(|l| l.cosine_similarity)
                .fold(f32::INFINITY, f32::min),
            avg_mse: layers.iter().map(|l| l.mse).sum::<f32>() / n,
            max_mse: layers.iter().map(|l| l.mse).fold(0.0f32, f32::max),
            max_relative_error,
            sparsity: if total == 0 { 0.0 } else { zeros / total as f32 },
            usable_fraction: layers.iter().filter(|l| l.fidelity() <= Fidelity::Usable).count() as f32 / n,
            fidelity: Fidelity::from_relative_error(max_relative_error),
        }
    }
}

/// Per-layer quality of `compressed` (adapters merged) against `original`.
///
/// Layers missing from either side or with mismatched shapes are skipped.
pub fn evaluate(original: &ModelHandle, compressed: &ModelHandle) -> Vec<LayerQuality> {
    original
        .layers
        .iter()
        .filter_map(|layer| {
            let merged = merged_weight(compressed, &layer.name).ok()??;
            LayerQuality::compute(&layer.name, &layer.weight, &merged)
        })
        .collect()
}
