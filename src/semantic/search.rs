//! Similarity search over the product catalog.
//!
//! A full linear scan: every entry with an embedding is scored against the
//! query with cosine similarity and the whole ranked list is returned.

use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use url::Url;

use crate::catalog::{CatalogEntry, CatalogStore, StoreError};
use crate::images::{self, ImageError};
use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::vector::{self, SCORE_PRECISION};
use crate::semantic::EmbeddingProvider;

/// Errors that can occur during search operations.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("catalog error: {0}")]
    Store(#[from] StoreError),

    #[error("query image: {0}")]
    Image(#[from] ImageError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("query embedding is degenerate (empty or zero magnitude)")]
    DegenerateQuery,
}

/// A query vector, normalized once when created.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEmbedding(Vec<f32>);

impl QueryEmbedding {
    pub fn new(raw: &[f32]) -> Self {
        Self(vector::normalize(raw))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    fn is_degenerate(&self) -> bool {
        vector::l2_norm(&self.0) == 0.0
    }
}

/// One ranked catalog item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchMatch {
    pub id: u64,
    pub name: String,
    pub category: String,
    pub image_url: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "results", rename_all = "snake_case")]
pub enum SearchOutcome {
    /// No catalog entry has an embedding yet.
    EmptyCatalog,
    /// Every entry with an embedding, best match first.
    Ranked(Vec<SearchMatch>),
}

impl SearchOutcome {
    pub fn matches(&self) -> &[SearchMatch] {
        match self {
            SearchOutcome::EmptyCatalog => &[],
            SearchOutcome::Ranked(matches) => matches,
        }
    }
}

/// Read-only ranking service.
pub struct SimilaritySearch {
    store: Arc<dyn CatalogStore>,
    provider: Arc<EmbeddingProvider>,
    image_base: Url,
}

impl SimilaritySearch {
    /// `image_base` is the public URL image refs are resolved against.
    pub fn new(
        store: Arc<dyn CatalogStore>,
        provider: Arc<EmbeddingProvider>,
        image_base: Url,
    ) -> Self {
        Self {
            store,
            provider,
            image_base,
        }
    }

    /// Rank every catalog entry with an embedding against `query`.
    pub fn search(&self, query: &QueryEmbedding) -> Result<SearchOutcome, SearchError> {
        let entries = self.store.find_all_with_embedding()?;
        if entries.is_empty() {
            log::info!("search: catalog has no embeddings");
            return Ok(SearchOutcome::EmptyCatalog);
        }

        // indexed collect keeps catalog order, so the stable sort below is reproducible
        let mut results: Vec<SearchMatch> = entries
            .par_iter()
            .map(|entry| SearchMatch {
                id: entry.id,
                name: entry.name.clone(),
                category: entry.category.clone(),
                image_url: self.display_ref(&entry.image_ref),
                similarity: vector::round_to(score(query, entry), SCORE_PRECISION),
            })
            .collect();

        results.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        log::info!("search: ranked {} catalog entries", results.len());
        Ok(SearchOutcome::Ranked(results))
    }

    /// Decode a query image, embed it with the shared model and search.
    pub fn search_image(&self, data: &[u8]) -> Result<SearchOutcome, SearchError> {
        let image = images::decode_image(data)?;
        let raw = self.provider.embed_image(&image)?;
        let query = QueryEmbedding::new(&raw);
        if query.is_degenerate() {
            return Err(SearchError::DegenerateQuery);
        }
        self.search(&query)
    }

    /// Public URL for an image ref; every `/`-separated part is percent-encoded
    /// as one path segment under the base.
    fn display_ref(&self, image_ref: &str) -> String {
        display_url(&self.image_base, image_ref)
    }
}

fn display_url(base: &Url, image_ref: &str) -> String {
    let mut url = base.clone();
    match url.path_segments_mut() {
        Ok(mut segments) => {
            segments.pop_if_empty().extend(image_ref.split('/'));
        }
        Err(()) => return image_ref.to_string(),
    }
    url.to_string()
}

fn score(query: &QueryEmbedding, entry: &CatalogEntry) -> f32 {
    let Some(stored) = entry.embedding.as_slice() else {
        return 0.0;
    };

    // entries written before normalization was enforced are tolerated
    let normalized = vector::normalize(stored);
    if normalized.len() != query.as_slice().len() || vector::l2_norm(&normalized) == 0.0 {
        log::debug!(
            "search: entry {} has a malformed embedding ({} components), scoring 0",
            entry.id,
            stored.len()
        );
        return 0.0;
    }

    vector::cosine_similarity(query.as_slice(), &normalized)
}
