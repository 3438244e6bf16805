//! LoRA adapter attachment.
//!
//! Adapters follow the usual initialization: `A` uniform in
//! `±1/sqrt(in_features)`, `B` zero, so an untrained adapter leaves the layer
//! output unchanged.

use nanoquant_core::{Error, LoraAdapter, ModelHandle, Result, WeightMatrix};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::recipe::LoraStage;

/// Largest adapter rank the attacher will build.
pub const MAX_RANK: usize = 4096;

/// Build adapters for every targeted layer and attach them.
///
/// Either every matching layer gets an adapter or the handle is untouched.
/// Returns the number of attached adapters.
pub(crate) fn attach(handle: &mut ModelHandle, targets: &[String], stage: &LoraStage, seed: u64) -> Result<usize> {
    if stage.r == 0 || stage.alpha == 0 {
        return Err(Error::stage("lora", format!("invalid rank {} / alpha {}", stage.r, stage.alpha)));
    }
    if !(0.0..1.0).contains(&stage.dropout) {
        return Err(Error::stage("lora", format!("dropout {} outside [0, 1)", stage.dropout)));
    }
    if stage.r > MAX_RANK {
        return Err(Error::stage("lora", format!("rank {} exceeds maximum {MAX_RANK}", stage.r)));
    }
    if targets.is_empty() {
        return Err(Error::stage("lora", "no target modules for model family"));
    }

    let scaling = stage.alpha as f32 / stage.r as f32;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut adapters = Vec::new();

    for layer in &handle.layers {
        if !targets.iter().any(|t| layer.matches_target(t)) {
            continue;
        }
        let (out_features, in_features) = layer.weight.shape();
        if in_features == 0 || out_features == 0 {
            return Err(Error::stage("lora", format!("layer {} has no weights", layer.name)));
        }
        let (Some(a_len), Some(_)) = (stage.r.checked_mul(in_features), out_features.checked_mul(stage.r)) else {
            return Err(Error::stage(
                "lora",
                format!("rank {} overflows adapter size for layer {}", stage.r, layer.name),
            ));
        };
        let bound = 1.0 / (in_features as f32).sqrt();
        let a_data = (0..a_len)
            .map(|_| rng.gen_range(-bound..=bound))
            .collect();
        adapters.push(LoraAdapter {
            layer: layer.name.clone(),
            r: stage.r,
            alpha: stage.alpha,
            dropout: stage.dropout as f32,
            scaling,
            a: WeightMatrix::new(stage.r, in_features, a_data)?,
            b: WeightMatrix::zeros(out_features, stage.r),
        });
    }

    if adapters.is_empty() {
        return Err(Error::stage(
            "lora",
            format!("no layer matches target modules {targets:?}"),
        ));
    }

    let count = adapters.len();
    handle
        .adapters
        .retain(|existing| !adapters.iter().any(|a| a.layer == existing.layer));
    handle.adapters.extend(adapters);
    Ok(count)
}

/// Weight with its adapter folded in: `W + scaling · B · A`.
pub fn merged_weight(handle: &ModelHandle, layer: &str) -> Result<Option<WeightMatrix>> {
    let Some(base) = handle.layer(layer) else {
        return Ok(None);
    };
    let mut weight = base.weight.clone();
    if let Some(adapter) = handle.adapter(layer) {
        weight.add_scaled_product(&adapter.b, &adapter.a, adapter.scaling)?;
    }
    Ok(Some(weight))
}
