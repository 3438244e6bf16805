//! Safetensors persistence for compressed models.
//!
//! An artifact directory holds:
//!
//! ```text
//! <artifact>/
//! ├── model.safetensors          F32 weights (adapters merged) and biases
//! ├── adapter_model.safetensors  LoRA A/B matrices, when adapters are attached
//! └── adapter_config.json        LoRA hyperparameters and target layers
//! ```
//!
//! The generator writes `nanoquant_config.json` next to these files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use half::{bf16, f16};
use nanoquant_core::{ArtifactStore, Error, ModelHandle, Result, StoredArtifact};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::merged_weight;

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// A named dense tensor, decoded to `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }
}

/// Adapter hyperparameters written next to the adapter weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub peft_type: String,
    pub r: usize,
    pub lora_alpha: u32,
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    /// True when the adapters are also folded into `model.safetensors`.
    pub merged: bool,
}

/// Writes artifacts as safetensors files.
#[derive(Debug, Clone)]
pub struct SafetensorsStore {
    merge_adapters: bool,
}

impl Default for SafetensorsStore {
    fn default() -> Self {
        Self { merge_adapters: true }
    }
}

impl SafetensorsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep base weights unmerged; adapters are still written separately.
    pub fn without_merge(mut self) -> Self {
        self.merge_adapters = false;
        self
    }
}

impl ArtifactStore for SafetensorsStore {
    fn save(&self, handle: &ModelHandle, path: &Path) -> Result<StoredArtifact> {
        fs::create_dir_all(path).map_err(|e| Error::persistence(path, e.to_string()))?;

        let mut tensors = Vec::with_capacity(handle.layers.len() * 2);
        for layer in &handle.layers {
            let weight = if self.merge_adapters {
                merged_weight(handle, &layer.name)?.unwrap_or_else(|| layer.weight.clone())
            } else {
                layer.weight.clone()
            };
            let (rows, cols) = weight.shape();
            tensors.push(NamedTensor::new(format!("{}.weight", layer.name), vec![rows, cols], weight.into_vec()));
            if let Some(bias) = &layer.bias {
                tensors.push(NamedTensor::new(format!("{}.bias", layer.name), vec![bias.len()], bias.clone()));
            }
        }

        let weights_file = path.join(WEIGHTS_FILE);
        write_tensors(&weights_file, &tensors)?;
        debug!(path = %weights_file.display(), tensors = tensors.len(), "weights written");

        if !handle.adapters.is_empty() {
            self.save_adapters(handle, path)?;
        }

        Ok(StoredArtifact {
            checksum: Some(checksum_file(&weights_file)?),
            weights_file: Some(weights_file),
        })
    }
}

impl SafetensorsStore {
    fn save_adapters(&self, handle: &ModelHandle, path: &Path) -> Result<()> {
        let mut tensors = Vec::with_capacity(handle.adapters.len() * 2);
        for adapter in &handle.adapters {
            let prefix = format!("base_model.model.{}", adapter.layer);
            tensors.push(NamedTensor::new(
                format!("{prefix}.lora_A.weight"),
                vec![adapter.a.rows(), adapter.a.cols()],
                adapter.a.as_slice().to_vec(),
            ));
            tensors.push(NamedTensor::new(
                format!("{prefix}.lora_B.weight"),
                vec![adapter.b.rows(), adapter.b.cols()],
                adapter.b.as_slice().to_vec(),
            ));
        }
        write_tensors(&path.join(ADAPTER_WEIGHTS_FILE), &tensors)?;

        let first = &handle.adapters[0];
        let config = AdapterConfig {
            peft_type: "LORA".to_string(),
            r: first.r,
            lora_alpha: first.alpha,
            lora_dropout: first.dropout,
            target_modules: handle.adapters.iter().map(|a| a.layer.clone()).collect(),
            merged: self.merge_adapters,
        };
        let config_path = path.join(ADAPTER_CONFIG_FILE);
        let json = serde_json::to_string_pretty(&config)?;
        fs::write(&config_path, json).map_err(|e| Error::persistence(&config_path, e.to_string()))?;
        Ok(())
    }
}

/// Write `tensors` as little-endian F32 into a safetensors file.
pub fn write_tensors(path: &Path, tensors: &[NamedTensor]) -> Result<()> {
    let buffers: Vec<Vec<u8>> = tensors
        .iter()
        .map(|t| t.data.iter().flat_map(|f| f.to_le_bytes()).collect())
        .collect();

    let mut views = Vec::with_capacity(tensors.len());
    for (tensor, bytes) in tensors.iter().zip(&buffers) {
        let view = TensorView::new(Dtype::F32, tensor.shape.clone(), bytes)
            .map_err(|e| Error::persistence(path, format!("tensor {}: {e}", tensor.name)))?;
        views.push((tensor.name.as_str(), view));
    }

    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
    safetensors::serialize_to_file(views, &metadata, path).map_err(|e| Error::persistence(path, e.to_string()))
}

/// Read every tensor of a safetensors file, converting F16/BF16 to `f32`.
pub fn read_tensors(path: &Path) -> Result<Vec<NamedTensor>> {
    let bytes = fs::read(path).map_err(|e| Error::persistence(path, e.to_string()))?;
    let file = SafeTensors::deserialize(&bytes).map_err(|e| Error::persistence(path, e.to_string()))?;

    let mut tensors = Vec::new();
    for (name, view) in file.tensors() {
        let data = decode(view.dtype(), view.data())
            .ok_or_else(|| Error::persistence(path, format!("unsupported dtype {:?} for {name}", view.dtype())))?;
        tensors.push(NamedTensor {
            name,
            shape: view.shape().to_vec(),
            data,
        });
    }
    tensors.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tensors)
}

/// Safetensors files directly inside `dir`, sorted by name.
pub fn safetensor_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    files.sort();
    Ok(files)
}

/// XXH3-64 of a file's contents.
pub fn checksum_file(path: &Path) -> Result<u64> {
    let bytes = fs::read(path).map_err(|e| Error::persistence(path, e.to_string()))?;
    Ok(xxhash_rust::xxh3::xxh3_64(&bytes))
}

fn decode(dtype: Dtype, data: &[u8]) -> Option<Vec<f32>> {
    match dtype {
        Dtype::F32 => Some(
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        Dtype::F16 => Some(
            data.chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
        ),
        Dtype::BF16 => Some(
            data.chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
        ),
        _ => None,
    }
}
