//! Deterministic stand-ins for the embedding model.

use image::DynamicImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::semantic::embeddings::{EmbeddingError, ImageEmbedder};
use crate::semantic::EmbeddingProvider;

/// Embeds an image from its mean color, so equal colors give equal vectors.
/// A pure black image yields an all-zero vector.
pub struct FakeEmbedder {
    dimensions: usize,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of images embedded so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageEmbedder for FakeEmbedder {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let rgb = image.to_rgb8();
        let pixels = (rgb.width() * rgb.height()).max(1) as f32;
        let mut mean = [0f32; 3];
        for pixel in rgb.pixels() {
            for (channel, value) in pixel.0.iter().enumerate() {
                mean[channel] += *value as f32 / 255.0;
            }
        }
        for channel in mean.iter_mut() {
            *channel /= pixels;
        }

        if mean.iter().all(|c| *c == 0.0) {
            return Ok(vec![0.0; self.dimensions]);
        }

        Ok((0..self.dimensions)
            .map(|i| mean[i % 3] * 10.0 + 1.0)
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Provider whose model is the given fake; the returned handle observes calls.
pub fn fake_provider(dimensions: usize) -> (Arc<EmbeddingProvider>, Arc<FakeEmbedder>) {
    let embedder = Arc::new(FakeEmbedder::new(dimensions));
    let shared = embedder.clone();
    let provider =
        EmbeddingProvider::with_loader("fake", move || Ok(shared.clone() as Arc<dyn ImageEmbedder>));
    (Arc::new(provider), embedder)
}

/// Provider whose model never loads.
pub fn broken_provider() -> Arc<EmbeddingProvider> {
    Arc::new(EmbeddingProvider::with_loader("broken", || {
        Err(EmbeddingError::ModelUnavailable(
            "model artifact missing".to_string(),
        ))
    }))
}
