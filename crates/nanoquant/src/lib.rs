// Explicit indexing reads better in the matrix kernels
#![allow(clippy::needless_range_loop)]

//! # NanoQuant
//!
//! Multi-level compression for large language model weights.
//!
//! NanoQuant chains quantization, pruning, low-rank decomposition and LoRA
//! adapter attachment into recipes, and ships seven graduated recipes
//! ("levels") from `light` to `atomic`.
//!
//! ## Quick Start
//!
//! ```ignore
//! use nanoquant::{CompressionEngine, GeneratorConfig, NanoQuantGenerator, SafetensorsStore};
//!
//! let engine = CompressionEngine::new(vec!["q_proj".into(), "v_proj".into()]);
//! let generator = NanoQuantGenerator::new(engine, SafetensorsStore::new());
//! let artifacts = generator.generate_all(&handle, "out".as_ref())?;
//! ```
//!
//! ## Levels
//!
//! | level | quantization | pruning | decomposition | lora r | declared ratio |
//! |-------|--------------|---------|---------------|--------|----------------|
//! | light | 8bit | wanda 0.15 | - | 64 | 0.30 |
//! | medium | 8bit | wanda 0.30 | - | 32 | 0.15 |
//! | heavy | 4bit | sparsegpt 0.50 | low_rank 0.60 | 16 | 0.08 |
//! | extreme | quip | sparsegpt 0.70 | calr 0.40 | 8 | 0.04 |
//! | ultra | aqlm | sparsegpt 0.85 | calr 0.25 | 4 | 0.02 |
//! | nano | ptq1_61 | sparsegpt 0.92 | calr 0.15 | 2 | 0.01 |
//! | atomic | ultrasketch | sparsegpt 0.95 | calr 0.10 | 1 | 0.005 |
//!
//! ## Feature Flags
//!
//! - `parallel` - row-parallel matrix products in the SVD operator (rayon)

pub mod engine;
pub mod generator;
pub mod ingest;
pub mod levels;
pub mod ollama;
pub mod ops;
pub mod pipeline;
pub mod quality;
pub mod recipe;
pub mod store;
pub mod strategy;

pub use nanoquant_core::{
    ArtifactStore, Error, IngestedModel, LinearLayer, LoraAdapter, ModelHandle, ModelIngestor, Result,
    ServingRegistry, StoredArtifact, WeightMatrix,
};

pub use engine::{
    merged_weight, Compressed, CompressionEngine, DispatchReport, FaultInjector, LayerFailure, LoraReport,
    StageReport, StrategyFallback,
};
pub use generator::{
    CancellationToken, GeneratedArtifact, GenerationManifest, GeneratorConfig, LevelStatus, NanoQuantGenerator,
};
pub use ingest::{LocalIngestor, ModelFamily};
pub use levels::{declared_ratio, level, list_levels, CompressionLevel, LevelName, LevelTable};
pub use ollama::{Modelfile, OllamaRegistry};
pub use pipeline::{CompressionPipeline, PipelineConfig, PipelineReport};
pub use quality::{Fidelity, LayerQuality, QualitySummary};
pub use recipe::{CompressionRecipe, DecompositionStage, LoraStage, PruningStage, QuantizationStage};
pub use store::SafetensorsStore;
pub use strategy::{DecompKind, PruneKind, QuantKind, StrategyKind};
