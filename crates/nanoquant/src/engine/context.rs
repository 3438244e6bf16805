//! Per-call dispatch state.
//!
//! Super-weight masks live here rather than on the engine, so two calls never
//! share them and nothing survives past the call that computed them.

use nanoquant_core::{LinearLayer, ModelHandle};
use tracing::warn;

use crate::ops::quantile;

/// Quantile of `|w|` at or above which a weight is a super weight.
pub const SUPER_WEIGHT_QUANTILE: f32 = 0.999;

/// Super-weight positions of one layer with their original values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuperWeightMask {
    positions: Vec<usize>,
    values: Vec<f32>,
}

impl SuperWeightMask {
    /// Top 0.1% of `layer` by magnitude.
    pub fn identify(layer: &LinearLayer) -> nanoquant_core::Result<Self> {
        let weights = layer.weight.as_slice();
        let magnitudes: Vec<f32> = weights.iter().map(|w| w.abs()).collect();
        let threshold = quantile(&magnitudes, SUPER_WEIGHT_QUANTILE)?;
        let (positions, values) = weights
            .iter()
            .enumerate()
            .filter(|(_, w)| w.abs() >= threshold)
            .map(|(i, &w)| (i, w))
            .unzip();
        Ok(Self { positions, values })
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Write the original values back and mark them as kept.
    pub fn restore(&self, layer: &mut LinearLayer) {
        let weights = layer.weight.as_mut_slice();
        for (&p, &v) in self.positions.iter().zip(&self.values) {
            if let Some(w) = weights.get_mut(p) {
                *w = v;
            }
        }
        if let Some(mask) = layer.mask.as_mut() {
            for &p in &self.positions {
                if let Some(keep) = mask.get_mut(p) {
                    *keep = true;
                }
            }
        }
    }
}

/// State threaded through one `compress` call.
#[derive(Debug, Default)]
pub struct DispatchContext {
    /// One entry per layer, index-aligned with `ModelHandle::layers`.
    super_weights: Option<Vec<Option<SuperWeightMask>>>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute super-weight masks for every layer.
    ///
    /// A layer whose mask cannot be computed is logged and left unprotected.
    pub fn with_super_weights(handle: &ModelHandle) -> Self {
        let masks = handle
            .layers
            .iter()
            .map(|layer| match SuperWeightMask::identify(layer) {
                Ok(mask) => Some(mask),
                Err(e) => {
                    warn!(stage = "super_weights", layer = %layer.name, error = %e, "super weights not identified");
                    None
                }
            })
            .collect();
        Self {
            super_weights: Some(masks),
        }
    }

    /// Total number of protected weights.
    pub fn super_weight_count(&self) -> usize {
        self.super_weights
            .iter()
            .flatten()
            .flatten()
            .map(SuperWeightMask::len)
            .sum()
    }

    pub fn mask_for(&self, layer_index: usize) -> Option<&SuperWeightMask> {
        self.super_weights.as_ref()?.get(layer_index)?.as_ref()
    }

    /// Restore super weights of `layer` after a mutating stage.
    pub fn restore(&self, layer_index: usize, layer: &mut LinearLayer) {
        if let Some(mask) = self.mask_for(layer_index) {
            mask.restore(layer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanoquant_core::WeightMatrix;

    fn layer_with(values: Vec<f32>) -> LinearLayer {
        let n = values.len();
        LinearLayer::new("fc", WeightMatrix::new(1, n, values).unwrap())
    }

    #[test]
    fn test_identify_top_magnitude() {
        let mut values: Vec<f32> = (0..2000).map(|i| (i % 10) as f32 * 0.01).collect();
        values[17] = -50.0;
        values[1234] = 40.0;
        let mask = SuperWeightMask::identify(&layer_with(values)).unwrap();
        assert_eq!(mask.len(), 2);
        assert_eq!(mask.positions, [17, 1234]);
    }

    #[test]
    fn test_restore_unmasks() {
        let mut layer = layer_with(vec![0.1, 9.0, 0.2]);
        let mask = SuperWeightMask::identify(&layer).unwrap();
        layer.weight = WeightMatrix::zeros(1, 3);
        layer.mask = Some(vec![true, false, false]);
        mask.restore(&mut layer);
        assert_eq!(layer.weight.as_slice(), &[0.0, 9.0, 0.0]);
        assert_eq!(layer.mask.as_deref(), Some(&[true, true, false][..]));
    }

    #[test]
    fn test_context_without_masks_is_noop() {
        let ctx = DispatchContext::new();
        let mut layer = layer_with(vec![1.0, 2.0]);
        ctx.restore(0, &mut layer);
        assert_eq!(layer.weight.as_slice(), &[1.0, 2.0]);
        assert_eq!(ctx.super_weight_count(), 0);
    }

    #[test]
    fn test_context_skips_bad_layers() {
        let handle = ModelHandle::new(
            "toy",
            vec![layer_with(vec![1.0, f32::NAN]), layer_with(vec![0.5, -3.0])],
        );
        let ctx = DispatchContext::with_super_weights(&handle);
        assert!(ctx.mask_for(0).is_none());
        assert_eq!(ctx.mask_for(1).map(SuperWeightMask::len), Some(1));
        assert_eq!(ctx.super_weight_count(), 1);
    }
}
