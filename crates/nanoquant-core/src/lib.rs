//! # NanoQuant Core
//!
//! Shared vocabulary for the NanoQuant compression workspace: the error
//! taxonomy, the in-memory model representation and the traits behind which
//! ingestion, persistence and serving registration are plugged in.
//!
//! ## Error classes
//!
//! | class | variants | surfaced to caller |
//! |---|---|---|
//! | configuration | `UnknownLevel`, `InvalidRecipe` | yes |
//! | operator | `Operator`, `ShapeMismatch`, `NonFinite`, `EmptyTensor` | no, per layer |
//! | stage | `Stage` | no, per stage |
//! | persistence | `Persistence`, `Io`, `Json` | no, per artifact |

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{ArtifactStore, ModelIngestor, ServingRegistry};
pub use types::{IngestedModel, LinearLayer, LoraAdapter, ModelHandle, StoredArtifact, WeightMatrix};
