//! Shared fixtures: synthetic models, fault injectors and fake collaborators.
#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nanoquant::{
    ArtifactStore, CancellationToken, Error, FaultInjector, IngestedModel, LinearLayer, ModelHandle, ModelIngestor,
    Result, SafetensorsStore, ServingRegistry, StoredArtifact, WeightMatrix,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::fmt::MakeWriter;

/// Two linear layers: `[[1, -2], [3, -4]]` and `[[0.5, 0.5]]`.
pub fn toy_model() -> ModelHandle {
    ModelHandle::new(
        "toy",
        vec![
            LinearLayer::new("fc1", WeightMatrix::from_rows(&[vec![1.0, -2.0], vec![3.0, -4.0]]).unwrap()),
            LinearLayer::new("fc2", WeightMatrix::from_rows(&[vec![0.5, 0.5]]).unwrap()),
        ],
    )
}

/// A one-block llama-shaped model with seeded weights.
pub fn synthetic_llama(seed: u64) -> ModelHandle {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut matrix = |rows: usize, cols: usize| {
        let data = (0..rows * cols).map(|_| rng.gen_range(-0.5f32..0.5)).collect();
        WeightMatrix::new(rows, cols, data).unwrap()
    };
    let layers = vec![
        LinearLayer::new("model.layers.0.self_attn.q_proj", matrix(8, 8)),
        LinearLayer::new("model.layers.0.self_attn.k_proj", matrix(8, 8)),
        LinearLayer::new("model.layers.0.self_attn.v_proj", matrix(8, 8)),
        LinearLayer::new("model.layers.0.mlp.up_proj", matrix(16, 8)).with_bias(vec![0.01; 16]),
        LinearLayer::new("model.layers.0.mlp.down_proj", matrix(8, 16)),
    ];
    ModelHandle::new("test-org/tiny-llama", layers)
}

pub fn llama_targets() -> Vec<String> {
    vec!["q_proj".to_string(), "v_proj".to_string()]
}

/// Fails every layer for one strategy key.
pub struct FailStrategy(pub &'static str);

impl FaultInjector for FailStrategy {
    fn inject(&self, _stage: &str, strategy: &str, layer: &str) -> Option<String> {
        (strategy == self.0).then(|| format!("injected failure on {layer}"))
    }
}

/// Safetensors store that refuses artifact paths ending in `suffix`.
pub struct FailingStore {
    pub suffix: &'static str,
    inner: SafetensorsStore,
}

impl FailingStore {
    pub fn new(suffix: &'static str) -> Self {
        Self {
            suffix,
            inner: SafetensorsStore::new(),
        }
    }
}

impl ArtifactStore for FailingStore {
    fn save(&self, handle: &ModelHandle, path: &Path) -> Result<StoredArtifact> {
        if path.to_string_lossy().ends_with(self.suffix) {
            return Err(Error::persistence(path, "disk quota exceeded"));
        }
        self.inner.save(handle, path)
    }
}

/// Counts saves; optionally cancels a token after the first one.
#[derive(Default)]
pub struct CountingStore {
    pub saves: AtomicUsize,
    pub cancel_after_first: Option<CancellationToken>,
    inner: SafetensorsStore,
}

impl CountingStore {
    pub fn cancelling(token: CancellationToken) -> Self {
        Self {
            cancel_after_first: Some(token),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ArtifactStore for CountingStore {
    fn save(&self, handle: &ModelHandle, path: &Path) -> Result<StoredArtifact> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_after_first {
            token.cancel();
        }
        self.inner.save(handle, path)
    }
}

/// Returns a fixed model for any id.
pub struct FakeIngestor {
    pub handle: ModelHandle,
}

impl ModelIngestor for FakeIngestor {
    fn ingest(&self, model_id: &str) -> Result<IngestedModel> {
        if model_id.is_empty() {
            return Err(Error::Ingestion("empty model id".into()));
        }
        let mut handle = self.handle.clone();
        handle.model_id = model_id.to_string();
        Ok(IngestedModel {
            handle,
            family: "llama".into(),
            target_modules: llama_targets(),
        })
    }
}

/// Records registrations; rejects tags containing `fail_on`.
#[derive(Default)]
pub struct RecordingRegistry {
    pub available: bool,
    pub fail_on: Option<&'static str>,
    pub calls: Mutex<Vec<(PathBuf, String)>>,
}

impl RecordingRegistry {
    pub fn available() -> Self {
        Self {
            available: true,
            ..Self::default()
        }
    }

    pub fn tags(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(_, tag)| tag.clone()).collect()
    }
}

impl ServingRegistry for RecordingRegistry {
    fn register(&self, artifact_path: &Path, tag: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((artifact_path.to_path_buf(), tag.to_string()));
        match self.fail_on {
            Some(pattern) if tag.contains(pattern) => Err(Error::Registration(format!("{tag} rejected"))),
            _ => Ok(()),
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

/// In-memory sink for formatted log lines.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with a fmt subscriber writing into a buffer; returns the output.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    (out, buffer.contents())
}

pub fn count_lines(logs: &str, needle: &str) -> usize {
    logs.lines().filter(|line| line.contains(needle)).count()
}
