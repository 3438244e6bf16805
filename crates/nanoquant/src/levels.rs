//! The seven-level compression table.
//!
//! Levels are ordered from least to most aggressive. Along that order the
//! pruning ratio never decreases while the LoRA rank, the decomposition rank
//! ratio and the declared compression ratio never increase.
//!
//! | level | quant | prune | decomp | lora r | declared ratio |
//! |---|---|---|---|---|---|
//! | light | 8bit | wanda/0.15 | none | 64 | 0.30 |
//! | medium | 8bit | wanda/0.30 | none | 32 | 0.15 |
//! | heavy | 4bit | sparsegpt/0.50 | low_rank/0.60 | 16 | 0.08 |
//! | extreme | quip | sparsegpt/0.70 | calr/0.40 | 8 | 0.04 |
//! | ultra | aqlm | sparsegpt/0.85 | calr/0.25 | 4 | 0.02 |
//! | nano | ptq1_61 | sparsegpt/0.92 | calr/0.15 | 2 | 0.01 |
//! | atomic | ultrasketch | sparsegpt/0.95 | calr/0.10 | 1 | 0.005 |

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use nanoquant_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::recipe::{CompressionRecipe, DecompositionStage, LoraStage, PruningStage, QuantizationStage};

/// Declared ratio reported for ad hoc recipes.
pub const CUSTOM_DECLARED_RATIO: f64 = 0.1;

/// Canonical level names in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelName {
    Light,
    Medium,
    Heavy,
    Extreme,
    Ultra,
    Nano,
    Atomic,
}

impl LevelName {
    pub const ALL: [LevelName; 7] = [
        LevelName::Light,
        LevelName::Medium,
        LevelName::Heavy,
        LevelName::Extreme,
        LevelName::Ultra,
        LevelName::Nano,
        LevelName::Atomic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LevelName::Light => "light",
            LevelName::Medium => "medium",
            LevelName::Heavy => "heavy",
            LevelName::Extreme => "extreme",
            LevelName::Ultra => "ultra",
            LevelName::Nano => "nano",
            LevelName::Atomic => "atomic",
        }
    }
}

impl fmt::Display for LevelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LevelName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LevelName::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| Error::unknown_level(s))
    }
}

/// A named recipe with its description and declared ratio.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionLevel {
    pub name: LevelName,
    pub description: &'static str,
    pub recipe: CompressionRecipe,
    /// Static estimate of the surviving size fraction; never measured.
    pub compression_ratio: f64,
}

/// Immutable registry of the seven levels.
#[derive(Debug)]
pub struct LevelTable {
    levels: Vec<CompressionLevel>,
}

struct Row {
    name: LevelName,
    description: &'static str,
    quant: &'static str,
    prune: (&'static str, f64),
    decomp: Option<(&'static str, f64)>,
    lora: (usize, u32, f64),
    preserve_super_weights: bool,
    ratio: f64,
}

const ROWS: [Row; 7] = [
    Row {
        name: LevelName::Light,
        description: "50-70% size reduction with maximum quality preservation",
        quant: "8bit",
        prune: ("wanda", 0.15),
        decomp: None,
        lora: (64, 32, 0.05),
        preserve_super_weights: false,
        ratio: 0.30,
    },
    Row {
        name: LevelName::Medium,
        description: "70-85% size reduction with balanced compression/quality",
        quant: "8bit",
        prune: ("wanda", 0.30),
        decomp: None,
        lora: (32, 32, 0.10),
        preserve_super_weights: false,
        ratio: 0.15,
    },
    Row {
        name: LevelName::Heavy,
        description: "85-92% size reduction with significant compression",
        quant: "4bit",
        prune: ("sparsegpt", 0.50),
        decomp: Some(("low_rank", 0.60)),
        lora: (16, 16, 0.15),
        preserve_super_weights: false,
        ratio: 0.08,
    },
    Row {
        name: LevelName::Extreme,
        description: "92-96% size reduction with maximum compression",
        quant: "quip",
        prune: ("sparsegpt", 0.70),
        decomp: Some(("calr", 0.40)),
        lora: (8, 8, 0.20),
        preserve_super_weights: true,
        ratio: 0.04,
    },
    Row {
        name: LevelName::Ultra,
        description: "96-98% size reduction using advanced techniques",
        quant: "aqlm",
        prune: ("sparsegpt", 0.85),
        decomp: Some(("calr", 0.25)),
        lora: (4, 4, 0.25),
        preserve_super_weights: true,
        ratio: 0.02,
    },
    Row {
        name: LevelName::Nano,
        description: "98-99% size reduction using ultra-advanced techniques",
        quant: "ptq1_61",
        prune: ("sparsegpt", 0.92),
        decomp: Some(("calr", 0.15)),
        lora: (2, 2, 0.30),
        preserve_super_weights: true,
        ratio: 0.01,
    },
    Row {
        name: LevelName::Atomic,
        description: "Maximum compression using all ultra-advanced techniques",
        quant: "ultrasketch",
        prune: ("sparsegpt", 0.95),
        decomp: Some(("calr", 0.10)),
        lora: (1, 1, 0.35),
        preserve_super_weights: true,
        ratio: 0.005,
    },
];

impl Row {
    fn build(&self) -> CompressionLevel {
        let mut recipe = CompressionRecipe::new()
            .with_description(self.description)
            .with_quantization(QuantizationStage::new(self.quant))
            .with_pruning(PruningStage::new(self.prune.0, self.prune.1))
            .with_lora(LoraStage::new(self.lora.0, self.lora.1, self.lora.2))
            .with_super_weights(self.preserve_super_weights);
        if let Some((kind, rank_ratio)) = self.decomp {
            recipe = recipe.with_decomposition(DecompositionStage::new(kind, rank_ratio));
        }
        CompressionLevel {
            name: self.name,
            description: self.description,
            recipe,
            compression_ratio: self.ratio,
        }
    }
}

impl LevelTable {
    /// The standard table, built once.
    pub fn standard() -> &'static LevelTable {
        static TABLE: OnceLock<LevelTable> = OnceLock::new();
        TABLE.get_or_init(|| LevelTable {
            levels: ROWS.iter().map(Row::build).collect(),
        })
    }

    /// Levels in table order.
    pub fn levels(&self) -> &[CompressionLevel] {
        &self.levels
    }

    pub fn get(&self, name: LevelName) -> &CompressionLevel {
        // ROWS is indexed in LevelName order.
        &self.levels[name as usize]
    }

    /// Look a level up by name.
    pub fn level(&self, name: &str) -> Result<&CompressionLevel> {
        Ok(self.get(name.parse()?))
    }

    pub fn names(&self) -> Vec<LevelName> {
        self.levels.iter().map(|l| l.name).collect()
    }
}

/// Level names in table order.
pub fn list_levels() -> Vec<LevelName> {
    LevelTable::standard().names()
}

/// Look a level up by name; unknown names are a configuration error.
pub fn level(name: &str) -> Result<&'static CompressionLevel> {
    LevelTable::standard().level(name)
}

/// Declared ratio for a level name, or [`CUSTOM_DECLARED_RATIO`] for anything else.
pub fn declared_ratio(name: &str) -> f64 {
    name.parse::<LevelName>()
        .map_or(CUSTOM_DECLARED_RATIO, |n| LevelTable::standard().get(n).compression_ratio)
}
