//! Generation manifest for resumable multi-level runs.
//!
//! Saved atomically after every level so an interrupted run can pick up
//! where it stopped.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nanoquant_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::quality::QualitySummary;
use crate::recipe::CompressionRecipe;

pub const MANIFEST_FILE: &str = "manifest.json";

/// One persisted compression result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    /// `<model>_<level>` or `<model>_<custom name>`.
    pub name: String,
    /// Level name, or `custom`.
    pub level: String,
    /// Artifact directory.
    pub path: PathBuf,
    pub description: String,
    /// Declared, not measured.
    pub compression_ratio: f64,
    /// Recipe that produced the artifact.
    pub config: CompressionRecipe,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualitySummary>,
    /// Layers or stages the dispatcher could not apply.
    pub failures: usize,
    /// XXH3-64 of the weights file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u64>,
}

/// Outcome of one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum LevelStatus {
    #[serde(rename = "completed")]
    Completed { level: String, artifact: GeneratedArtifact },
    /// Persistence failed; no artifact.
    #[serde(rename = "failed")]
    Failed { level: String, error: String },
    #[serde(rename = "skipped")]
    Skipped { level: String, reason: String },
}

impl LevelStatus {
    pub fn level(&self) -> &str {
        match self {
            LevelStatus::Completed { level, .. } | LevelStatus::Failed { level, .. } | LevelStatus::Skipped { level, .. } => {
                level
            }
        }
    }

    #[must_use]
    pub fn artifact(&self) -> Option<&GeneratedArtifact> {
        match self {
            LevelStatus::Completed { artifact, .. } => Some(artifact),
            _ => None,
        }
    }
}

/// Per-level statuses of one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationManifest {
    pub version: u32,
    pub model_id: String,
    /// In processing order.
    pub levels: Vec<LevelStatus>,
    /// Seconds since the Unix epoch.
    pub last_updated: u64,
}

impl GenerationManifest {
    /// Current manifest format version.
    pub const VERSION: u32 = 1;

    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            version: Self::VERSION,
            model_id: model_id.into(),
            levels: Vec::new(),
            last_updated: now(),
        }
    }

    /// Record a level outcome, replacing any earlier one for the same level.
    pub fn record(&mut self, status: LevelStatus) {
        match self.levels.iter_mut().find(|s| s.level() == status.level()) {
            Some(existing) => *existing = status,
            None => self.levels.push(status),
        }
        self.last_updated = now();
    }

    pub fn get(&self, level: &str) -> Option<&LevelStatus> {
        self.levels.iter().find(|s| s.level() == level)
    }

    /// Completed artifact for `level` whose directory still exists.
    pub fn reusable(&self, level: &str) -> Option<&GeneratedArtifact> {
        self.get(level)?.artifact().filter(|a| a.path.is_dir())
    }

    pub fn artifacts(&self) -> Vec<GeneratedArtifact> {
        self.levels.iter().filter_map(|s| s.artifact().cloned()).collect()
    }

    /// Completed artifacts for `levels`, in the order given.
    pub fn artifacts_for<S: AsRef<str>>(&self, levels: &[S]) -> Vec<GeneratedArtifact> {
        levels
            .iter()
            .filter_map(|level| self.get(level.as_ref())?.artifact().cloned())
            .collect()
    }

    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, LevelStatus::Completed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, LevelStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, LevelStatus::Skipped { .. }))
    }

    fn count(&self, pred: impl Fn(&LevelStatus) -> bool) -> usize {
        self.levels.iter().filter(|s| pred(s)).count()
    }

    /// Saves the manifest atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let file = File::create(&temp_path).map_err(|e| Error::persistence(&temp_path, e.to_string()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush().map_err(|e| Error::persistence(&temp_path, e.to_string()))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::persistence(&temp_path, e.to_string()))?;

        fs::rename(&temp_path, path).map_err(|e| Error::persistence(path, e.to_string()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::persistence(path, e.to_string()))?;
        let manifest: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::persistence(path, format!("failed to parse manifest: {e}")))?;

        if manifest.version != Self::VERSION {
            return Err(Error::persistence(
                path,
                format!(
                    "manifest version mismatch: expected {}, got {}",
                    Self::VERSION,
                    manifest.version
                ),
            ));
        }
        Ok(manifest)
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
