//! Multi-level artifact generation.
//!
//! The generator walks the level table, compresses an independent clone of
//! the source handle for each level and persists the result:
//!
//! ```text
//! <output_dir>/
//! ├── manifest.json
//! ├── <model>_light/
//! │   ├── model.safetensors
//! │   └── nanoquant_config.json
//! ├── <model>_medium/
//! └── ...
//! ```
//!
//! A level whose artifact cannot be written is recorded as failed and the
//! run moves on. Only configuration errors (unknown level names, invalid
//! custom recipes) are returned to the caller.

mod manifest;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use nanoquant_core::{ArtifactStore, Error, ModelHandle, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};

use crate::engine::{CompressionEngine, DispatchReport};
use crate::levels::{CompressionLevel, LevelName, LevelTable, CUSTOM_DECLARED_RATIO};
use crate::quality::{evaluate, QualitySummary};
use crate::recipe::CompressionRecipe;

pub use manifest::{GeneratedArtifact, GenerationManifest, LevelStatus, MANIFEST_FILE};

pub const ARTIFACT_CONFIG_FILE: &str = "nanoquant_config.json";

/// Level name recorded for ad hoc recipes.
pub const CUSTOM_LEVEL: &str = "custom";

/// Generator options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Restrict generation to these levels; `None` means all seven.
    pub levels: Option<Vec<String>>,
    /// Reuse completed levels recorded in an existing manifest.
    pub resume: bool,
    /// Draw a progress bar on stderr.
    pub show_progress: bool,
    /// Measure per-layer quality against the source weights.
    pub evaluate_quality: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            levels: None,
            resume: false,
            show_progress: false,
            evaluate_quality: true,
        }
    }
}

/// Cooperative cancellation, checked once per level.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Contents of `nanoquant_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub model_id: String,
    pub level: String,
    pub description: String,
    pub compression_ratio: f64,
    pub config: CompressionRecipe,
    pub dispatch: DispatchReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualitySummary>,
}

/// `<model>_<suffix>` with path separators in the model id flattened.
pub fn artifact_name(model_id: &str, suffix: &str) -> String {
    format!("{}_{suffix}", model_id.replace('/', "_"))
}

/// One unit of work: a named recipe with its declared ratio.
struct Job<'a> {
    level: &'a str,
    name: String,
    description: &'a str,
    recipe: &'a CompressionRecipe,
    compression_ratio: f64,
}

/// Runs the dispatcher once per level and persists each result.
#[derive(Debug, Clone)]
pub struct NanoQuantGenerator<S> {
    engine: CompressionEngine,
    store: S,
    config: GeneratorConfig,
}

impl<S: ArtifactStore> NanoQuantGenerator<S> {
    pub fn new(engine: CompressionEngine, store: S) -> Self {
        Self {
            engine,
            store,
            config: GeneratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GeneratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn engine(&self) -> &CompressionEngine {
        &self.engine
    }

    /// Levels selected by the configuration, in table order.
    pub fn selected_levels(&self) -> Result<Vec<&'static CompressionLevel>> {
        let table = LevelTable::standard();
        let Some(requested) = &self.config.levels else {
            return Ok(table.levels().iter().collect());
        };
        let names = requested
            .iter()
            .map(|name| name.parse::<LevelName>())
            .collect::<Result<Vec<_>>>()?;
        Ok(table.levels().iter().filter(|l| names.contains(&l.name)).collect())
    }

    /// Generate an artifact for every selected level.
    ///
    /// Returns the artifacts that were written; levels that failed to persist
    /// are logged and recorded in the manifest.
    pub fn generate_all(&self, handle: &ModelHandle, output_dir: &Path) -> Result<Vec<GeneratedArtifact>> {
        let manifest = self.generate(handle, output_dir, &CancellationToken::new())?;
        self.selected_artifacts(&manifest)
    }

    /// Artifacts of the selected levels recorded in `manifest`, in table order.
    ///
    /// A resumed manifest may hold levels from earlier runs; those are left out.
    pub fn selected_artifacts(&self, manifest: &GenerationManifest) -> Result<Vec<GeneratedArtifact>> {
        let levels: Vec<&str> = self.selected_levels()?.iter().map(|l| l.name.as_str()).collect();
        Ok(manifest.artifacts_for(&levels))
    }

    /// Generate the selected levels, stopping early once `cancel` fires.
    ///
    /// Remaining levels are recorded as skipped.
    pub fn generate(
        &self,
        handle: &ModelHandle,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<GenerationManifest> {
        let levels = self.selected_levels()?;
        let manifest_path = output_dir.join(MANIFEST_FILE);
        let mut manifest = self.initial_manifest(&handle.model_id, &manifest_path);

        if let Err(e) = std::fs::create_dir_all(output_dir) {
            error!(path = %output_dir.display(), error = %e, "cannot create output directory");
        }

        let progress = self.progress_bar(levels.len());
        info!(model = %handle.model_id, levels = levels.len(), "generating artifacts");

        for level in levels {
            let name = level.name.as_str();
            progress.set_message(name);

            if cancel.is_cancelled() {
                info!(level = name, "generation cancelled, skipping");
                manifest.record(LevelStatus::Skipped {
                    level: name.to_string(),
                    reason: "cancelled".to_string(),
                });
                progress.inc(1);
                continue;
            }

            if self.config.resume {
                if let Some(existing) = manifest.reusable(name) {
                    info!(level = name, path = %existing.path.display(), "reusing completed artifact");
                    progress.inc(1);
                    continue;
                }
            }

            let job = Job {
                level: name,
                name: artifact_name(&handle.model_id, name),
                description: level.description,
                recipe: &level.recipe,
                compression_ratio: level.compression_ratio,
            };
            let status = match self.run_job(handle, &job, output_dir) {
                Ok(artifact) => LevelStatus::Completed {
                    level: name.to_string(),
                    artifact,
                },
                Err(e) => {
                    error!(level = name, error = %e, "artifact not written, continuing with next level");
                    LevelStatus::Failed {
                        level: name.to_string(),
                        error: e.to_string(),
                    }
                }
            };
            manifest.record(status);
            if let Err(e) = manifest.save(&manifest_path) {
                warn!(path = %manifest_path.display(), error = %e, "manifest not saved");
            }
            progress.inc(1);
        }

        progress.finish_and_clear();
        if let Err(e) = manifest.save(&manifest_path) {
            warn!(path = %manifest_path.display(), error = %e, "manifest not saved");
        }
        info!(
            completed = manifest.completed(),
            failed = manifest.failed(),
            skipped = manifest.skipped(),
            "generation finished"
        );
        Ok(manifest)
    }

    /// Compress and persist a single ad hoc recipe under `<model>_<name>`.
    pub fn generate_custom(
        &self,
        handle: &ModelHandle,
        recipe: &CompressionRecipe,
        output_dir: &Path,
        name: &str,
    ) -> Result<GeneratedArtifact> {
        recipe.validate()?;
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(Error::invalid_recipe(format!("invalid artifact name {name:?}")));
        }
        let job = Job {
            level: CUSTOM_LEVEL,
            name: artifact_name(&handle.model_id, name),
            description: recipe.description.as_deref().unwrap_or("Custom compression recipe"),
            recipe,
            compression_ratio: CUSTOM_DECLARED_RATIO,
        };
        self.run_job(handle, &job, output_dir)
    }

    fn run_job(&self, handle: &ModelHandle, job: &Job<'_>, output_dir: &Path) -> Result<GeneratedArtifact> {
        let _span = info_span!("level", level = job.level, artifact = %job.name).entered();
        let path = output_dir.join(&job.name);

        let compressed = self.engine.compress(handle.clone(), job.recipe);
        let failures = compressed.report.failure_count();
        if failures > 0 {
            warn!(failures, "recipe partially applied");
        }

        let stored = self.store.save(&compressed.handle, &path)?;

        let quality = self
            .config
            .evaluate_quality
            .then(|| QualitySummary::from_layers(&evaluate(handle, &compressed.handle)));

        let artifact_config = ArtifactConfig {
            model_id: handle.model_id.clone(),
            level: job.level.to_string(),
            description: job.description.to_string(),
            compression_ratio: job.compression_ratio,
            config: job.recipe.clone(),
            dispatch: compressed.report,
            quality: quality.clone(),
        };
        write_json(&path.join(ARTIFACT_CONFIG_FILE), &artifact_config)?;

        info!(
            path = %path.display(),
            ratio = job.compression_ratio,
            fidelity = ?quality.as_ref().map(|q| q.fidelity),
            "artifact written"
        );
        Ok(GeneratedArtifact {
            name: job.name.clone(),
            level: job.level.to_string(),
            path,
            description: job.description.to_string(),
            compression_ratio: job.compression_ratio,
            config: job.recipe.clone(),
            quality,
            failures,
            checksum: stored.checksum,
        })
    }

    fn initial_manifest(&self, model_id: &str, path: &Path) -> GenerationManifest {
        if self.config.resume && path.exists() {
            match GenerationManifest::load(path) {
                Ok(manifest) if manifest.model_id == model_id => return manifest,
                Ok(manifest) => {
                    warn!(found = %manifest.model_id, "manifest belongs to another model, starting fresh");
                }
                Err(e) => warn!(error = %e, "manifest unreadable, starting fresh"),
            }
        }
        GenerationManifest::new(model_id)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::persistence(path, e.to_string()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|e| Error::persistence(path, e.to_string()))
}

/// Read an artifact's `nanoquant_config.json`.
pub fn read_artifact_config(artifact_dir: &Path) -> Result<ArtifactConfig> {
    let path: PathBuf = artifact_dir.join(ARTIFACT_CONFIG_FILE);
    let file = File::open(&path).map_err(|e| Error::persistence(&path, e.to_string()))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}
