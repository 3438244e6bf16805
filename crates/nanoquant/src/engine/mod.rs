//! Compression dispatcher.
//!
//! [`CompressionEngine::compress`] applies a recipe's enabled stages in a
//! fixed order:
//!
//! ```text
//! super weights → quantization → pruning → decomposition → lora
//! ```
//!
//! Failures are absorbed at the narrowest scope that contains them. An
//! operator that fails on one layer leaves that layer unmodified and the
//! stage moves on; a failed LoRA stage leaves the handle as it was. A failed
//! stage never rolls back earlier stages and never stops later ones.

mod context;
mod lora;
mod report;

use std::fmt;
use std::sync::Arc;

use nanoquant_core::{Error, LinearLayer, ModelHandle, Result, WeightMatrix};
use tracing::{debug, info, warn};

use crate::ops::PruneMask;
use crate::recipe::{CompressionRecipe, DecompositionStage, LoraStage, PruningStage, QuantizationStage};
use crate::strategy::{resolve, DecompKind, PruneKind, QuantKind, Resolved, StrategyKind};

pub use context::{DispatchContext, SuperWeightMask, SUPER_WEIGHT_QUANTILE};
pub use lora::merged_weight;
pub use report::{DispatchReport, LayerFailure, LoraReport, StageReport, StrategyFallback};

/// Seed for adapter initialization.
pub const DEFAULT_LORA_SEED: u64 = 0x6e61_6e6f_7175_616e;

/// Hook for forcing operator failures in tests and drills.
pub trait FaultInjector: Send + Sync {
    /// Return an error message to make `strategy` fail on `layer` during `stage`.
    fn inject(&self, stage: &str, strategy: &str, layer: &str) -> Option<String>;
}

/// New weights for a layer, plus the keep-mask when the stage prunes.
struct LayerChange {
    weight: WeightMatrix,
    mask: Option<PruneMask>,
}

impl LayerChange {
    fn weight(weight: WeightMatrix) -> Self {
        Self { weight, mask: None }
    }
}

/// Handle and report returned by a dispatch call.
#[derive(Debug, Clone)]
pub struct Compressed {
    pub handle: ModelHandle,
    pub report: DispatchReport,
}

/// Applies recipes to model handles.
#[derive(Clone)]
pub struct CompressionEngine {
    target_modules: Vec<String>,
    lora_seed: u64,
    faults: Option<Arc<dyn FaultInjector>>,
}

impl fmt::Debug for CompressionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionEngine")
            .field("target_modules", &self.target_modules)
            .field("lora_seed", &self.lora_seed)
            .field("faults", &self.faults.is_some())
            .finish()
    }
}

impl CompressionEngine {
    /// Engine attaching LoRA adapters to `target_modules`.
    pub fn new(target_modules: Vec<String>) -> Self {
        Self {
            target_modules,
            lora_seed: DEFAULT_LORA_SEED,
            faults: None,
        }
    }

    pub fn with_lora_seed(mut self, seed: u64) -> Self {
        self.lora_seed = seed;
        self
    }

    pub fn with_fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    pub fn target_modules(&self) -> &[String] {
        &self.target_modules
    }

    /// Apply `recipe` to `handle`.
    ///
    /// Never fails: the returned handle carries every change that could be
    /// made and the report lists what could not.
    pub fn compress(&self, mut handle: ModelHandle, recipe: &CompressionRecipe) -> Compressed {
        let mut report = DispatchReport::default();
        debug!(model = %handle.model_id, stages = ?recipe.enabled_stages(), "dispatching recipe");

        let ctx = if recipe.preserve_super_weights {
            let ctx = DispatchContext::with_super_weights(&handle);
            report.super_weight_count = ctx.super_weight_count();
            info!(stage = "super_weights", count = report.super_weight_count, "super weights identified");
            ctx
        } else {
            DispatchContext::new()
        };

        if let Some(stage) = &recipe.quantization {
            let stage_report = self.quantize(&mut handle, &ctx, stage, &mut report);
            report.stages.push(stage_report);
        }
        if let Some(stage) = &recipe.pruning {
            let stage_report = self.prune(&mut handle, &ctx, stage, &mut report);
            report.stages.push(stage_report);
        }
        if let Some(stage) = &recipe.decomposition {
            let stage_report = self.decompose(&mut handle, &ctx, stage, &mut report);
            report.stages.push(stage_report);
        }
        if let Some(stage) = &recipe.lora {
            report.lora = Some(self.attach_lora(&mut handle, stage));
        }

        Compressed { handle, report }
    }

    fn quantize(
        &self,
        handle: &mut ModelHandle,
        ctx: &DispatchContext,
        stage: &QuantizationStage,
        report: &mut DispatchReport,
    ) -> StageReport {
        let resolved: Resolved<QuantKind> = resolve(&stage.kind);
        record_fallback(report, &resolved);
        let kind = resolved.kind;
        let params = stage.params();
        self.run_stage(handle, ctx, QuantKind::CATEGORY, kind.key(), |layer| {
            kind.apply(&layer.weight, &params).map(LayerChange::weight)
        })
    }

    fn prune(
        &self,
        handle: &mut ModelHandle,
        ctx: &DispatchContext,
        stage: &PruningStage,
        report: &mut DispatchReport,
    ) -> StageReport {
        let resolved: Resolved<PruneKind> = resolve(&stage.kind);
        record_fallback(report, &resolved);
        let kind = resolved.kind;
        let ratio = stage.ratio as f32;
        self.run_stage(handle, ctx, PruneKind::CATEGORY, kind.key(), |layer| {
            let pruned = kind.apply(&layer.weight, ratio)?;
            Ok(LayerChange {
                weight: pruned.weight,
                mask: Some(pruned.mask),
            })
        })
    }

    fn decompose(
        &self,
        handle: &mut ModelHandle,
        ctx: &DispatchContext,
        stage: &DecompositionStage,
        report: &mut DispatchReport,
    ) -> StageReport {
        let resolved: Resolved<DecompKind> = resolve(&stage.kind);
        record_fallback(report, &resolved);
        let kind = resolved.kind;
        let rank_ratio = stage.rank_ratio as f32;
        let correction = stage.correction();
        self.run_stage(handle, ctx, DecompKind::CATEGORY, kind.key(), |layer| {
            match kind.apply(&layer.weight, rank_ratio, correction) {
                Ok(weight) => Ok(LayerChange::weight(weight)),
                Err(e) if kind == DecompKind::Calr => {
                    warn!(
                        stage = DecompKind::CATEGORY,
                        layer = %layer.name,
                        error = %e,
                        "corrective decomposition failed, trying plain low rank"
                    );
                    DecompKind::LowRank
                        .apply(&layer.weight, rank_ratio, correction)
                        .map(LayerChange::weight)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Run `op` on every layer, absorbing per-layer failures.
    fn run_stage<F>(
        &self,
        handle: &mut ModelHandle,
        ctx: &DispatchContext,
        stage: &'static str,
        strategy: &'static str,
        op: F,
    ) -> StageReport
    where
        F: Fn(&LinearLayer) -> Result<LayerChange>,
    {
        info!(stage, strategy, layers = handle.layers.len(), "applying stage");
        let mut report = StageReport::new(stage, strategy);

        for (index, layer) in handle.layers.iter_mut().enumerate() {
            match self.apply_layer(layer, stage, strategy, &op) {
                Ok(()) => {
                    ctx.restore(index, layer);
                    debug!(stage, strategy, layer = %layer.name, "layer updated");
                    report.applied.push(layer.name.clone());
                }
                Err(e) => {
                    warn!(stage, strategy, layer = %layer.name, error = %e, "layer left unmodified");
                    report.failures.push(LayerFailure {
                        layer: layer.name.clone(),
                        category: e.category().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Typed per-layer outcome: the layer is only written on success.
    fn apply_layer<F>(&self, layer: &mut LinearLayer, stage: &'static str, strategy: &'static str, op: &F) -> Result<()>
    where
        F: Fn(&LinearLayer) -> Result<LayerChange>,
    {
        if let Some(message) = self.injected(stage, strategy, &layer.name) {
            return Err(Error::operator(strategy, message));
        }
        let change = op(layer)?;
        if change.weight.shape() != layer.weight.shape() {
            return Err(Error::shape_mismatch(layer.weight.shape(), change.weight.shape()));
        }
        if !change.weight.is_finite() {
            return Err(Error::NonFinite { operator: strategy });
        }

        layer.weight = change.weight;
        match change.mask {
            Some(mask) => layer.mask = Some(mask.into_vec()),
            // Reconstruction must not undo earlier pruning.
            None if stage == DecompKind::CATEGORY => layer.apply_mask(),
            None => {}
        }
        Ok(())
    }

    fn attach_lora(&self, handle: &mut ModelHandle, stage: &LoraStage) -> LoraReport {
        let injected = handle
            .layers
            .iter()
            .find_map(|layer| self.injected("lora", "lora", &layer.name));
        let result = match injected {
            Some(message) => Err(Error::stage("lora", message)),
            None => lora::attach(handle, &self.target_modules, stage, self.lora_seed),
        };

        match result {
            Ok(adapters) => {
                let scaling = stage.alpha as f32 / stage.r as f32;
                info!(stage = "lora", adapters, r = stage.r, alpha = stage.alpha, "adapters attached");
                LoraReport::Attached {
                    adapters,
                    r: stage.r,
                    alpha: stage.alpha,
                    scaling,
                }
            }
            Err(e) => {
                warn!(stage = "lora", error = %e, "adapter attachment failed, keeping base model");
                LoraReport::Failed { message: e.to_string() }
            }
        }
    }

    fn injected(&self, stage: &str, strategy: &str, layer: &str) -> Option<String> {
        self.faults.as_ref()?.inject(stage, strategy, layer)
    }
}

fn record_fallback<K: StrategyKind>(report: &mut DispatchReport, resolved: &Resolved<K>) {
    if resolved.fell_back {
        report.fallbacks.push(StrategyFallback {
            stage: K::CATEGORY.to_string(),
            requested: resolved.requested.clone(),
            used: resolved.kind.key().to_string(),
        });
    }
}
