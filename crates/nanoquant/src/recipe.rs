//! Compression recipes: which stages run and with which parameters.
//!
//! A recipe deserializes from the same JSON shape used by the level table and
//! by custom requests:
//!
//! ```json
//! {
//!   "quantization": {"type": "8bit"},
//!   "pruning": {"type": "wanda", "ratio": 0.15},
//!   "decomposition": {"type": "calr", "rank_ratio": 0.4},
//!   "lora": {"r": 64, "alpha": 32, "dropout": 0.05},
//!   "preserve_super_weights": false
//! }
//! ```
//!
//! Absent stages are skipped. Strategy names are not checked here; unknown
//! names resolve to the category default at dispatch time.

use std::fs;
use std::path::Path;

use nanoquant_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::ops::{DEFAULT_CORRECTION_FACTOR, SUPPORTED_BITS};
use crate::strategy::QuantParams;

fn default_quant_type() -> String {
    "8bit".to_string()
}

fn default_prune_type() -> String {
    "unstructured".to_string()
}

fn default_prune_ratio() -> f64 {
    0.3
}

fn default_decomp_type() -> String {
    "low_rank".to_string()
}

fn default_rank_ratio() -> f64 {
    0.5
}

fn default_lora_r() -> usize {
    8
}

fn default_lora_alpha() -> u32 {
    32
}

fn default_lora_dropout() -> f64 {
    0.1
}

/// Quantization stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationStage {
    #[serde(rename = "type", default = "default_quant_type")]
    pub kind: String,
    /// Fraction of weights treated as salient by `ptq1_61`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salient_fraction: Option<f64>,
    /// Bit width for salient weights under `ptq1_61`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salient_bits: Option<u8>,
}

impl QuantizationStage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            salient_fraction: None,
            salient_bits: None,
        }
    }

    /// Operator parameters with defaults filled in.
    pub fn params(&self) -> QuantParams {
        let defaults = QuantParams::default();
        QuantParams {
            salient_fraction: self.salient_fraction.map_or(defaults.salient_fraction, |f| f as f32),
            salient_bits: self.salient_bits.unwrap_or(defaults.salient_bits),
        }
    }
}

/// Pruning stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruningStage {
    #[serde(rename = "type", default = "default_prune_type")]
    pub kind: String,
    /// Fraction of weights to zero, in `[0, 1)`.
    #[serde(default = "default_prune_ratio")]
    pub ratio: f64,
}

impl PruningStage {
    pub fn new(kind: impl Into<String>, ratio: f64) -> Self {
        Self {
            kind: kind.into(),
            ratio,
        }
    }
}

/// Decomposition stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionStage {
    #[serde(rename = "type", default = "default_decomp_type")]
    pub kind: String,
    /// Kept rank as a fraction of `min(rows, cols)`, in `(0, 1]`.
    #[serde(default = "default_rank_ratio")]
    pub rank_ratio: f64,
    /// Residual correction for `calr`, in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_factor: Option<f64>,
}

impl DecompositionStage {
    pub fn new(kind: impl Into<String>, rank_ratio: f64) -> Self {
        Self {
            kind: kind.into(),
            rank_ratio,
            correction_factor: None,
        }
    }

    pub fn correction(&self) -> f32 {
        self.correction_factor.map_or(DEFAULT_CORRECTION_FACTOR, |c| c as f32)
    }
}

/// LoRA adapter stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraStage {
    #[serde(default = "default_lora_r")]
    pub r: usize,
    #[serde(default = "default_lora_alpha")]
    pub alpha: u32,
    #[serde(default = "default_lora_dropout")]
    pub dropout: f64,
}

impl LoraStage {
    pub fn new(r: usize, alpha: u32, dropout: f64) -> Self {
        Self { r, alpha, dropout }
    }
}

/// Ordered set of optional compression stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionRecipe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<QuantizationStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pruning: Option<PruningStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<DecompositionStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora: Option<LoraStage>,
    #[serde(default)]
    pub preserve_super_weights: bool,
}

impl CompressionRecipe {
    /// Recipe with every stage disabled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quantization(mut self, stage: QuantizationStage) -> Self {
        self.quantization = Some(stage);
        self
    }

    pub fn with_pruning(mut self, stage: PruningStage) -> Self {
        self.pruning = Some(stage);
        self
    }

    pub fn with_decomposition(mut self, stage: DecompositionStage) -> Self {
        self.decomposition = Some(stage);
        self
    }

    pub fn with_lora(mut self, stage: LoraStage) -> Self {
        self.lora = Some(stage);
        self
    }

    pub fn with_super_weights(mut self, preserve: bool) -> Self {
        self.preserve_super_weights = preserve;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check every parameter against its domain.
    pub fn validate(&self) -> Result<()> {
        if let Some(q) = &self.quantization {
            if let Some(f) = q.salient_fraction {
                if !(0.0..=1.0).contains(&f) {
                    return Err(Error::invalid_recipe(format!(
                        "quantization.salient_fraction {f} outside [0, 1]"
                    )));
                }
            }
            if let Some(bits) = q.salient_bits {
                if !SUPPORTED_BITS.contains(&bits) {
                    return Err(Error::invalid_recipe(format!(
                        "quantization.salient_bits {bits} not one of {SUPPORTED_BITS:?}"
                    )));
                }
            }
        }
        if let Some(p) = &self.pruning {
            if !(0.0..1.0).contains(&p.ratio) {
                return Err(Error::invalid_recipe(format!("pruning.ratio {} outside [0, 1)", p.ratio)));
            }
        }
        if let Some(d) = &self.decomposition {
            if !(d.rank_ratio > 0.0 && d.rank_ratio <= 1.0) {
                return Err(Error::invalid_recipe(format!(
                    "decomposition.rank_ratio {} outside (0, 1]",
                    d.rank_ratio
                )));
            }
            if let Some(c) = d.correction_factor {
                if !(0.0..=1.0).contains(&c) {
                    return Err(Error::invalid_recipe(format!(
                        "decomposition.correction_factor {c} outside [0, 1]"
                    )));
                }
            }
        }
        if let Some(l) = &self.lora {
            if l.r == 0 {
                return Err(Error::invalid_recipe("lora.r must be positive"));
            }
            if l.alpha == 0 {
                return Err(Error::invalid_recipe("lora.alpha must be positive"));
            }
            if !(0.0..1.0).contains(&l.dropout) {
                return Err(Error::invalid_recipe(format!("lora.dropout {} outside [0, 1)", l.dropout)));
            }
        }
        Ok(())
    }

    /// Parse and validate a recipe from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let recipe: Self =
            serde_json::from_str(json).map_err(|e| Error::invalid_recipe(format!("malformed recipe: {e}")))?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// Load a recipe from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Names of the enabled stages in dispatch order.
    pub fn enabled_stages(&self) -> Vec<&'static str> {
        let mut stages = Vec::new();
        if self.preserve_super_weights {
            stages.push("super_weights");
        }
        if self.quantization.is_some() {
            stages.push("quantization");
        }
        if self.pruning.is_some() {
            stages.push("pruning");
        }
        if self.decomposition.is_some() {
            stages.push("decomposition");
        }
        if self.lora.is_some() {
            stages.push("lora");
        }
        stages
    }
}
