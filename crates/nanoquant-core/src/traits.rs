//! Seams for the collaborators that live outside the compression core.
//!
//! ```text
//! ModelIngestor  (model id -> ModelHandle + family metadata)
//!       ↓
//! [dispatch per level]
//!       ↓
//! ArtifactStore  (ModelHandle -> files on disk)
//!       ↓
//! ServingRegistry  (artifact directory -> local serving tag)
//! ```

use std::path::Path;

use crate::error::Result;
use crate::types::{IngestedModel, ModelHandle, StoredArtifact};

/// Loads a model's linear layers and reports its family.
pub trait ModelIngestor {
    /// Ingest a model by identifier (hub id or local path).
    fn ingest(&self, model_id: &str) -> Result<IngestedModel>;
}

/// Persists a compressed model.
pub trait ArtifactStore {
    /// Write `handle` into the directory `path`, creating it if needed.
    ///
    /// A returned error is a persistence failure for that artifact only.
    fn save(&self, handle: &ModelHandle, path: &Path) -> Result<StoredArtifact>;
}

/// Packages an artifact for a local model runner.
pub trait ServingRegistry {
    /// Register the artifact directory under `tag`.
    ///
    /// Registration is advisory: a failure never invalidates the artifact.
    fn register(&self, artifact_path: &Path, tag: &str) -> Result<()>;

    /// True if the serving backend can be reached.
    fn is_available(&self) -> bool {
        true
    }
}

impl<T: ArtifactStore + ?Sized> ArtifactStore for &T {
    fn save(&self, handle: &ModelHandle, path: &Path) -> Result<StoredArtifact> {
        (**self).save(handle, path)
    }
}

impl<T: ModelIngestor + ?Sized> ModelIngestor for &T {
    fn ingest(&self, model_id: &str) -> Result<IngestedModel> {
        (**self).ingest(model_id)
    }
}

impl<T: ServingRegistry + ?Sized> ServingRegistry for &T {
    fn register(&self, artifact_path: &Path, tag: &str) -> Result<()> {
        (**self).register(artifact_path, tag)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}
