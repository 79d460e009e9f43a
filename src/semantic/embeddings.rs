//! Image embedding backends.
//!
//! - `ImageEmbedder`: the seam the rest of the crate embeds through
//! - `FastembedImageModel`: local vision model via fastembed, cached on disk
//! - Model names map to fastembed enums; the SHA256 of the name identifies
//!   the model in the catalog file

use fastembed::{ImageEmbedding, ImageInitOptions};
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Mutex;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("invalid model name: {0}")]
    InvalidModel(String),
}

/// Turns a decoded image into a raw (not necessarily normalized) embedding.
pub trait ImageEmbedder: Send + Sync {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, EmbeddingError>;

    /// Number of components every embedding from this model has.
    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// Compute SHA256 hash of a model name for storage identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.to_lowercase().as_bytes());
    hasher.finalize().into()
}

/// Parse model name string to fastembed enum.
pub fn parse_model_name(name: &str) -> Result<fastembed::ImageEmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => Ok(fastembed::ImageEmbeddingModel::ClipVitB32),
        "resnet50" | "resnet-50" => Ok(fastembed::ImageEmbeddingModel::Resnet50),
        "unicom-vit-b-16" | "unicomvitb16" => Ok(fastembed::ImageEmbeddingModel::UnicomVitB16),
        "unicom-vit-b-32" | "unicomvitb32" => Ok(fastembed::ImageEmbeddingModel::UnicomVitB32),
        "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
            Ok(fastembed::ImageEmbeddingModel::NomicEmbedVisionV15)
        }
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: clip-vit-b-32, resnet50, unicom-vit-b-16, unicom-vit-b-32, nomic-embed-vision-v1.5",
            name
        ))),
    }
}

/// Wrapper around fastembed's ImageEmbedding model.
/// Uses a Mutex because fastembed's embed calls require &mut self.
pub struct FastembedImageModel {
    model: Mutex<ImageEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastembedImageModel {
    /// Load the named model, downloading it into `cache_dir/models` on first use.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        show_download_progress: bool,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::ModelUnavailable(format!("Failed to create models directory: {}", e))
        })?;

        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(show_download_progress);

        let mut model = ImageEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::ModelUnavailable(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut model)?;
        log::info!("loaded image model '{}' ({} dimensions)", model_name, dimensions);

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Probe the model with a blank image to learn its output size.
    fn probe_dimensions(model: &mut ImageEmbedding) -> Result<usize, EmbeddingError> {
        let probe = DynamicImage::ImageRgb8(image::RgbImage::new(32, 32));
        let embeddings = model.embed_images(vec![probe]).map_err(|e| {
            EmbeddingError::ModelUnavailable(format!("Failed to probe dimensions: {}", e))
        })?;

        embeddings
            .first()
            .map(|v| v.len())
            .filter(|len| *len > 0)
            .ok_or_else(|| EmbeddingError::ModelUnavailable("Model returned no embedding".to_string()))
    }
}

impl ImageEmbedder for FastembedImageModel {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed_images(vec![image.clone()])
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        let embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))?;

        if embedding.len() != self.dimensions {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "model returned {} components, expected {}",
                embedding.len(),
                self.dimensions
            )));
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        &self.model_name
    }
}
