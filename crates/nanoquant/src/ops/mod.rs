//! Stateless numeric compression primitives.
//!
//! Every operator takes a borrowed [`WeightMatrix`](nanoquant_core::WeightMatrix)
//! and returns a new matrix of the same shape (or a keep-mask). Operators
//! reject empty and non-finite inputs with an operator error; they never
//! panic on data.

pub mod prune;
pub mod quantize;
pub mod stats;
pub mod svd;

pub use prune::{
    importance_prune, magnitude_prune, sparsegpt_scores, structured_prune, wanda_scores, PruneMask, Pruned,
};
pub use quantize::{
    binarize_two_level, mixed_precision_quantize, quantize_rows, quantize_to_bits, quantize_uniform,
    salience_quantize, sketch_quantize, two_level_means, SUPPORTED_BITS,
};
pub use stats::{quantile, quantiles};
pub use svd::{corrective_low_rank, low_rank_decompose, target_rank, truncated_svd, LowRankFactors, DEFAULT_CORRECTION_FACTOR};
