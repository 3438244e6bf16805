//! Strategy registry: string keys resolved to closed operator enums.
//!
//! Recipes name strategies by string (`"4bit"`, `"wanda"`, `"calr"`, ...).
//! Resolution happens once per stage; an unregistered key resolves to the
//! category default and emits a single warning, so dispatch itself is an
//! exhaustive `match` that cannot miss a case.
//!
//! | category | keys | default |
//! |----------|------|---------|
//! | quantization | `4bit` `8bit` `mixed` `quip` `aqlm` `onebit` `ptq1_61` `ultrasketch` | `8bit` |
//! | pruning | `unstructured` `structured` `magnitude` `sparsegpt` `wanda` | `unstructured` |
//! | decomposition | `low_rank` `calr` | `low_rank` |

use std::fmt;

use nanoquant_core::{Result, WeightMatrix};
use tracing::warn;

use crate::ops::{self, Pruned};

/// A closed set of strategies for one recipe category.
pub trait StrategyKind: Copy + Eq + fmt::Debug + 'static {
    /// Category name used in logs and reports.
    const CATEGORY: &'static str;
    /// Substitute for unregistered keys.
    const DEFAULT: Self;
    /// Every registered strategy.
    const ALL: &'static [Self];

    /// Registry key.
    fn key(self) -> &'static str;

    /// Exact lookup without fallback.
    fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.key() == key)
    }
}

/// Outcome of resolving a strategy key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<K> {
    pub kind: K,
    /// Key as written in the recipe.
    pub requested: String,
    /// True when `requested` was not registered and `kind` is the default.
    pub fell_back: bool,
}

/// Resolve `key`, substituting the category default for unknown keys.
///
/// Never fails. Emits exactly one warning per call that falls back.
pub fn resolve<K: StrategyKind>(key: &str) -> Resolved<K> {
    match K::from_key(key) {
        Some(kind) => Resolved {
            kind,
            requested: key.to_string(),
            fell_back: false,
        },
        None => {
            warn!(
                stage = K::CATEGORY,
                strategy = key,
                fallback = K::DEFAULT.key(),
                "unknown strategy, using default"
            );
            Resolved {
                kind: K::DEFAULT,
                requested: key.to_string(),
                fell_back: true,
            }
        }
    }
}

/// Quantization strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantKind {
    Bit4,
    Bit8,
    Mixed,
    Quip,
    Aqlm,
    OneBit,
    Ptq161,
    UltraSketch,
}

impl StrategyKind for QuantKind {
    const CATEGORY: &'static str = "quantization";
    const DEFAULT: Self = QuantKind::Bit8;
    const ALL: &'static [Self] = &[
        QuantKind::Bit4,
        QuantKind::Bit8,
        QuantKind::Mixed,
        QuantKind::Quip,
        QuantKind::Aqlm,
        QuantKind::OneBit,
        QuantKind::Ptq161,
        QuantKind::UltraSketch,
    ];

    fn key(self) -> &'static str {
        match self {
            QuantKind::Bit4 => "4bit",
            QuantKind::Bit8 => "8bit",
            QuantKind::Mixed => "mixed",
            QuantKind::Quip => "quip",
            QuantKind::Aqlm => "aqlm",
            QuantKind::OneBit => "onebit",
            QuantKind::Ptq161 => "ptq1_61",
            QuantKind::UltraSketch => "ultrasketch",
        }
    }
}

/// Tunables for the salience-split quantizers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub salient_fraction: f32,
    pub salient_bits: u8,
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            salient_fraction: 0.2,
            salient_bits: 4,
        }
    }
}

impl QuantKind {
    /// Quantize one weight matrix.
    pub fn apply(self, weight: &WeightMatrix, params: &QuantParams) -> Result<WeightMatrix> {
        match self {
            QuantKind::Bit4 => ops::quantize_to_bits(weight, 4),
            QuantKind::Bit8 => ops::quantize_to_bits(weight, 8),
            QuantKind::Mixed => ops::mixed_precision_quantize(weight),
            QuantKind::Quip => ops::quantize_to_bits(weight, 2),
            QuantKind::Aqlm => ops::quantize_rows(weight, 2),
            QuantKind::OneBit => ops::binarize_two_level(weight),
            QuantKind::Ptq161 => ops::salience_quantize(weight, params.salient_fraction, params.salient_bits),
            QuantKind::UltraSketch => ops::sketch_quantize(weight),
        }
    }
}

/// Pruning strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PruneKind {
    Unstructured,
    Structured,
    Magnitude,
    SparseGpt,
    Wanda,
}

impl StrategyKind for PruneKind {
    const CATEGORY: &'static str = "pruning";
    const DEFAULT: Self = PruneKind::Unstructured;
    const ALL: &'static [Self] = &[
        PruneKind::Unstructured,
        PruneKind::Structured,
        PruneKind::Magnitude,
        PruneKind::SparseGpt,
        PruneKind::Wanda,
    ];

    fn key(self) -> &'static str {
        match self {
            PruneKind::Unstructured => "unstructured",
            PruneKind::Structured => "structured",
            PruneKind::Magnitude => "magnitude",
            PruneKind::SparseGpt => "sparsegpt",
            PruneKind::Wanda => "wanda",
        }
    }
}

impl PruneKind {
    /// Prune one weight matrix.
    pub fn apply(self, weight: &WeightMatrix, ratio: f32) -> Result<Pruned> {
        match self {
            PruneKind::Unstructured | PruneKind::Magnitude => ops::magnitude_prune(weight, ratio),
            PruneKind::Structured => ops::structured_prune(weight, ratio),
            PruneKind::SparseGpt => ops::importance_prune(weight, ratio, ops::sparsegpt_scores),
            PruneKind::Wanda => ops::importance_prune(weight, ratio, ops::wanda_scores),
        }
    }
}

/// Decomposition strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecompKind {
    LowRank,
    Calr,
}

impl StrategyKind for DecompKind {
    const CATEGORY: &'static str = "decomposition";
    const DEFAULT: Self = DecompKind::LowRank;
    const ALL: &'static [Self] = &[DecompKind::LowRank, DecompKind::Calr];

    fn key(self) -> &'static str {
        match self {
            DecompKind::LowRank => "low_rank",
            DecompKind::Calr => "calr",
        }
    }
}

impl DecompKind {
    /// Decompose one weight matrix into a same-shaped approximation.
    pub fn apply(self, weight: &WeightMatrix, rank_ratio: f32, correction_factor: f32) -> Result<WeightMatrix> {
        match self {
            DecompKind::LowRank => ops::low_rank_decompose(weight, rank_ratio),
            DecompKind::Calr => ops::corrective_low_rank(weight, rank_ratio, correction_factor),
        }
    }
}

impl fmt::Display for QuantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl fmt::Display for PruneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl fmt::Display for DecompKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
