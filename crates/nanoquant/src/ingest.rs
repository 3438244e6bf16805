//! Model ingestion from a local directory of safetensors files.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use nanoquant_core::{Error, IngestedModel, LinearLayer, ModelHandle, ModelIngestor, Result, WeightMatrix};
use serde::Deserialize;
use tracing::{debug, info};

use crate::store::{read_tensors, safetensor_files, NamedTensor};

/// Architecture families with known LoRA targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Gpt2,
    Llama,
    Mistral,
    Falcon,
    Opt,
    Phi,
    Gemma,
    Generic,
}

impl ModelFamily {
    const KNOWN: [ModelFamily; 7] = [
        ModelFamily::Gpt2,
        ModelFamily::Llama,
        ModelFamily::Mistral,
        ModelFamily::Falcon,
        ModelFamily::Opt,
        ModelFamily::Phi,
        ModelFamily::Gemma,
    ];

    /// Family for a `config.json` `model_type`, matched exactly.
    pub fn from_model_type(model_type: &str) -> Self {
        match model_type.to_ascii_lowercase().as_str() {
            "gpt2" => ModelFamily::Gpt2,
            "llama" => ModelFamily::Llama,
            "mistral" | "mixtral" => ModelFamily::Mistral,
            "falcon" | "refinedweb" | "refinedwebmodel" => ModelFamily::Falcon,
            "opt" => ModelFamily::Opt,
            "phi" | "phi3" | "phi-msft" => ModelFamily::Phi,
            "gemma" | "gemma2" => ModelFamily::Gemma,
            _ => ModelFamily::Generic,
        }
    }

    /// Guess the family from a model identifier such as `meta-llama/Llama-2-7b`.
    ///
    /// The name after the last `/` is split on `-`, `_` and `.`. Short family
    /// names (`opt`, `phi`) must be a whole token, optionally followed by a
    /// version number; longer ones may appear inside a token (`tinyllama`).
    pub fn classify(model_id: &str) -> Self {
        let name = model_id.rsplit('/').next().unwrap_or(model_id).to_ascii_lowercase();
        let tokens: Vec<&str> = name.split(['-', '_', '.']).filter(|t| !t.is_empty()).collect();
        Self::KNOWN
            .into_iter()
            .find(|family| tokens.iter().any(|token| family.matches_token(token)))
            .unwrap_or(ModelFamily::Generic)
    }

    fn matches_token(self, token: &str) -> bool {
        let name = self.as_str();
        if name.len() >= 4 {
            return token.contains(name);
        }
        token
            .strip_prefix(name)
            .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Gpt2 => "gpt2",
            ModelFamily::Llama => "llama",
            ModelFamily::Mistral => "mistral",
            ModelFamily::Falcon => "falcon",
            ModelFamily::Opt => "opt",
            ModelFamily::Phi => "phi",
            ModelFamily::Gemma => "gemma",
            ModelFamily::Generic => "generic",
        }
    }

    /// Default LoRA target modules.
    pub fn target_modules(self) -> &'static [&'static str] {
        match self {
            ModelFamily::Gpt2 => &["c_attn"],
            ModelFamily::Llama | ModelFamily::Mistral | ModelFamily::Gemma => &["q_proj", "v_proj"],
            ModelFamily::Falcon => &["query_key_value"],
            ModelFamily::Opt | ModelFamily::Phi => &["q_proj", "k_proj", "v_proj"],
            ModelFamily::Generic => &["q_proj", "v_proj"],
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ModelConfig {
    #[serde(default)]
    model_type: Option<String>,
}

/// Reads `config.json` and `*.safetensors` from `<root>/<model_id>` (or from
/// `model_id` itself when it is a path).
#[derive(Debug, Clone, Default)]
pub struct LocalIngestor {
    root: Option<PathBuf>,
}

impl LocalIngestor {
    /// Resolve model ids as paths.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve model ids relative to `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: Some(root.into()) }
    }

    fn model_dir(&self, model_id: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(model_id),
            None => PathBuf::from(model_id),
        }
    }
}

impl ModelIngestor for LocalIngestor {
    fn ingest(&self, model_id: &str) -> Result<IngestedModel> {
        let dir = self.model_dir(model_id);
        if !dir.is_dir() {
            return Err(Error::Ingestion(format!("model directory {} not found", dir.display())));
        }

        let config = read_config(&dir)?;
        let family = match config.model_type.as_deref() {
            Some(model_type) => ModelFamily::from_model_type(model_type),
            None => ModelFamily::classify(model_id),
        };

        let files = safetensor_files(&dir).map_err(|e| Error::Ingestion(e.to_string()))?;
        if files.is_empty() {
            return Err(Error::Ingestion(format!("no safetensors files in {}", dir.display())));
        }

        let mut tensors = Vec::new();
        for file in &files {
            debug!(file = %file.display(), "reading tensors");
            tensors.extend(read_tensors(file).map_err(|e| Error::Ingestion(e.to_string()))?);
        }

        let layers = linear_layers(tensors)?;
        if layers.is_empty() {
            return Err(Error::Ingestion(format!("no 2-D weight tensors in {}", dir.display())));
        }
        info!(model = model_id, %family, layers = layers.len(), "model ingested");

        Ok(IngestedModel {
            handle: ModelHandle::new(model_id, layers),
            family: family.as_str().to_string(),
            target_modules: family.target_modules().iter().map(|s| s.to_string()).collect(),
        })
    }
}

fn read_config(dir: &Path) -> Result<ModelConfig> {
    let path = dir.join("config.json");
    if !path.exists() {
        return Ok(ModelConfig::default());
    }
    let text = fs::read_to_string(&path)?;
    serde_json::from_str(&text).map_err(|e| Error::Ingestion(format!("{}: {e}", path.display())))
}

/// Every 2-D tensor becomes a layer named without its `.weight` suffix; a
/// 1-D `<prefix>.bias` of matching length becomes its bias.
fn linear_layers(tensors: Vec<NamedTensor>) -> Result<Vec<LinearLayer>> {
    let mut biases: HashMap<String, Vec<f32>> = HashMap::new();
    let mut weights = Vec::new();
    for tensor in tensors {
        match tensor.shape.as_slice() {
            [_, _] => weights.push(tensor),
            [_] => {
                if let Some(prefix) = tensor.name.strip_suffix(".bias") {
                    biases.insert(prefix.to_string(), tensor.data);
                }
            }
            _ => {}
        }
    }

    let mut layers = Vec::with_capacity(weights.len());
    for tensor in weights {
        let name = tensor.name.strip_suffix(".weight").unwrap_or(&tensor.name).to_string();
        let weight = WeightMatrix::new(tensor.shape[0], tensor.shape[1], tensor.data)?;
        let mut layer = LinearLayer::new(name, weight);
        if let Some(bias) = biases.remove(&layer.name) {
            if bias.len() == layer.weight.rows() {
                layer = layer.with_bias(bias);
            }
        }
        layers.push(layer);
    }
    Ok(layers)
}
