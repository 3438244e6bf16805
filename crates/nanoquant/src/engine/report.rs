//! What a dispatch call did, layer by layer.

use serde::{Deserialize, Serialize};

/// A layer the stage left unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerFailure {
    pub layer: String,
    /// Error category, see `Error::category`.
    pub category: String,
    pub message: String,
}

/// One weight-mutating stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    /// Strategy that actually ran (after fallback).
    pub strategy: String,
    pub applied: Vec<String>,
    pub failures: Vec<LayerFailure>,
}

impl StageReport {
    pub fn new(stage: &str, strategy: &str) -> Self {
        Self {
            stage: stage.to_string(),
            strategy: strategy.to_string(),
            applied: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// An unknown strategy key replaced by the category default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyFallback {
    pub stage: String,
    pub requested: String,
    pub used: String,
}

/// Outcome of the LoRA stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoraReport {
    Attached {
        adapters: usize,
        r: usize,
        alpha: u32,
        scaling: f32,
    },
    Failed {
        message: String,
    },
}

/// Summary of one `compress` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub stages: Vec<StageReport>,
    pub fallbacks: Vec<StrategyFallback>,
    pub super_weight_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora: Option<LoraReport>,
}

impl DispatchReport {
    /// Layers left unmodified across all stages.
    pub fn operator_failures(&self) -> usize {
        self.stages.iter().map(|s| s.failures.len()).sum()
    }

    /// Operator failures plus a failed LoRA stage.
    pub fn failure_count(&self) -> usize {
        let lora = matches!(self.lora, Some(LoraReport::Failed { .. })) as usize;
        self.operator_failures() + lora
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn is_clean(&self) -> bool {
        self.failure_count() == 0
    }
}
