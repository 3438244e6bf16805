//! End-to-end orchestration: ingest, generate every level, register.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use nanoquant_core::{Error, IngestedModel, ModelIngestor, Result, ServingRegistry};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{CompressionEngine, DEFAULT_LORA_SEED};
use crate::generator::{artifact_name, CancellationToken, GeneratedArtifact, GeneratorConfig, NanoQuantGenerator};
use crate::ollama;
use crate::recipe::CompressionRecipe;
use crate::store::SafetensorsStore;

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Each model gets a subdirectory named after its id.
    pub output_base_dir: PathBuf,
    /// Register every artifact with the serving backend.
    pub push_to_serving: bool,
    /// Seed for LoRA adapter initialization.
    pub lora_seed: u64,
    pub generator: GeneratorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_base_dir: PathBuf::from("./nanoquant_models"),
            push_to_serving: false,
            lora_seed: DEFAULT_LORA_SEED,
            generator: GeneratorConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::persistence(path, e.to_string()))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// What a pipeline run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub model_id: String,
    pub family: String,
    pub output_directory: PathBuf,
    pub artifacts: Vec<GeneratedArtifact>,
    /// Tags that registered successfully.
    pub serving_tags: Vec<String>,
    /// Level → `ollama pull` command.
    pub pull_commands: BTreeMap<String, String>,
}

/// Ingest → generate → register.
#[derive(Debug, Clone)]
pub struct CompressionPipeline<I, R, S = SafetensorsStore> {
    ingestor: I,
    registry: R,
    store: S,
    config: PipelineConfig,
}

impl<I: ModelIngestor, R: ServingRegistry> CompressionPipeline<I, R> {
    pub fn new(ingestor: I, registry: R, config: PipelineConfig) -> Self {
        Self::with_store(ingestor, registry, SafetensorsStore::default(), config)
    }
}

impl<I, R, S> CompressionPipeline<I, R, S>
where
    I: ModelIngestor,
    R: ServingRegistry,
    S: nanoquant_core::ArtifactStore,
{
    pub fn with_store(ingestor: I, registry: R, store: S, config: PipelineConfig) -> Self {
        Self {
            ingestor,
            registry,
            store,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Generate every configured level for `model_id`.
    pub fn process_model(&self, model_id: &str) -> Result<PipelineReport> {
        self.process_model_with_cancel(model_id, &CancellationToken::new())
    }

    pub fn process_model_with_cancel(&self, model_id: &str, cancel: &CancellationToken) -> Result<PipelineReport> {
        let ingested = self.ingest(model_id)?;
        let output_directory = self.output_directory(model_id);

        let generator = self.generator(&ingested);
        let manifest = generator.generate(&ingested.handle, &output_directory, cancel)?;
        let artifacts = generator.selected_artifacts(&manifest)?;

        let jobs: Vec<(String, &GeneratedArtifact)> =
            artifacts.iter().map(|a| (a.level.clone(), a)).collect();
        Ok(self.finish(model_id, ingested.family, output_directory, &jobs, artifacts.clone()))
    }

    /// Generate a single artifact from a custom recipe.
    pub fn process_custom_model(&self, model_id: &str, recipe: &CompressionRecipe, name: &str) -> Result<PipelineReport> {
        recipe.validate()?;
        let ingested = self.ingest(model_id)?;
        let output_directory = self.output_directory(model_id);

        let artifact = self
            .generator(&ingested)
            .generate_custom(&ingested.handle, recipe, &output_directory, name)?;

        let jobs = vec![(name.to_string(), &artifact)];
        Ok(self.finish(model_id, ingested.family, output_directory, &jobs, vec![artifact.clone()]))
    }

    fn ingest(&self, model_id: &str) -> Result<IngestedModel> {
        let ingested = self.ingestor.ingest(model_id)?;
        info!(
            model = model_id,
            family = %ingested.family,
            layers = ingested.handle.layers.len(),
            parameters = ingested.handle.parameter_count(),
            "ingested"
        );
        Ok(ingested)
    }

    fn generator(&self, ingested: &IngestedModel) -> NanoQuantGenerator<&S> {
        let engine = CompressionEngine::new(ingested.target_modules.clone()).with_lora_seed(self.config.lora_seed);
        NanoQuantGenerator::new(engine, &self.store).with_config(self.config.generator.clone())
    }

    fn output_directory(&self, model_id: &str) -> PathBuf {
        self.config.output_base_dir.join(model_id.replace('/', "_"))
    }

    /// Register artifacts (advisory) and build the report. `jobs` pairs each
    /// artifact with its tag suffix.
    fn finish(
        &self,
        model_id: &str,
        family: String,
        output_directory: PathBuf,
        jobs: &[(String, &GeneratedArtifact)],
        artifacts: Vec<GeneratedArtifact>,
    ) -> PipelineReport {
        let mut serving_tags = Vec::new();
        if self.config.push_to_serving {
            if self.registry.is_available() {
                for (suffix, artifact) in jobs {
                    let tag = ollama::tag(model_id, suffix);
                    match self.registry.register(&artifact.path, &tag) {
                        Ok(()) => serving_tags.push(tag),
                        Err(e) => warn!(tag = %tag, artifact = %artifact.name, error = %e, "registration failed"),
                    }
                }
            } else {
                warn!("serving backend unavailable, skipping registration");
            }
        }

        let suffixes: Vec<&str> = jobs.iter().map(|(suffix, _)| suffix.as_str()).collect();
        info!(
            model = model_id,
            artifacts = artifacts.len(),
            registered = serving_tags.len(),
            "pipeline finished"
        );
        PipelineReport {
            model_id: model_id.to_string(),
            family,
            output_directory,
            artifacts,
            serving_tags,
            pull_commands: ollama::pull_commands(model_id, &suffixes),
        }
    }
}

/// Artifact directory a pipeline would use for `model_id` and `suffix`.
pub fn artifact_dir(config: &PipelineConfig, model_id: &str, suffix: &str) -> PathBuf {
    config
        .output_base_dir
        .join(model_id.replace('/', "_"))
        .join(artifact_name(model_id, suffix))
}
