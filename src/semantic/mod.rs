//! Visual similarity engine for the product catalog.
//!
//! Images are embedded locally with fastembed-rs and matched with a full
//! linear cosine-similarity scan.
//!
//! # Architecture
//!
//! - `vector`: normalization and cosine similarity
//! - `embeddings`: the `ImageEmbedder` seam and the fastembed backend
//! - `provider`: lazily loaded, process-wide model handle
//! - `storage`: binary file I/O for catalog.bin persistence
//! - `reconcile`: keeps stored embeddings in line with the image directory
//! - `search`: ranks catalog entries against a query image

pub mod embeddings;
pub mod provider;
pub mod reconcile;
pub mod search;
pub mod storage;
pub mod vector;

#[cfg(test)]
pub(crate) mod testing;

pub use provider::EmbeddingProvider;
pub use reconcile::{CancelFlag, ReconcileError, ReconcileReport, Reconciler};
pub use search::{SearchError, SearchMatch, SearchOutcome, SimilaritySearch};

/// Default image embedding model name
pub const DEFAULT_MODEL: &str = "clip-vit-b-32";
