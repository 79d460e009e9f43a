//! Image decoding and validation for catalog and query images.
//!
//! Decoding is the only preprocessing done here; resizing and channel
//! layout for the model are left to the embedding backend.

use image::{DynamicImage, GenericImageView};
use std::path::Path;

/// File extensions treated as catalog images.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Largest accepted upload (5 MiB).
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("failed to read image {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to decode image: {0}")]
    DecodeFailed(#[from] image::ImageError),

    #[error("unsupported image type: {0}")]
    Unsupported(String),

    #[error("image is {0} bytes, limit is 5 MiB")]
    TooLarge(usize),
}

/// Whether `path` has one of the recognized image extensions (case-insensitive).
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Decode image bytes into an RGB pixel buffer.
pub fn decode_image(data: &[u8]) -> Result<DynamicImage, ImageError> {
    let img = image::load_from_memory(data)?;
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(ImageError::Unsupported("empty image".to_string()));
    }
    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}

/// Read and decode an image file.
pub fn decode_file(path: &Path) -> Result<DynamicImage, ImageError> {
    let data = std::fs::read(path).map_err(|source| ImageError::Read {
        path: path.display().to_string(),
        source,
    })?;
    decode_image(&data)
}

/// Check that uploaded bytes are a JPEG or PNG within the size limit.
///
/// Returns the canonical extension of the sniffed type.
pub fn validate_upload(data: &[u8]) -> Result<&'static str, ImageError> {
    if data.len() > MAX_UPLOAD_BYTES {
        return Err(ImageError::TooLarge(data.len()));
    }

    let kind = infer::get(data)
        .ok_or_else(|| ImageError::Unsupported("unknown file type".to_string()))?;
    match kind.mime_type() {
        "image/jpeg" => Ok("jpg"),
        "image/png" => Ok("png"),
        other => Err(ImageError::Unsupported(other.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image::ImageFormat;

    /// Encode a small solid-color image; distinct colors give distinct fake embeddings.
    pub fn png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        encode(width, height, rgb, ImageFormat::Png)
    }

    pub fn jpeg(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        encode(width, height, rgb, ImageFormat::Jpeg)
    }

    fn encode(width: u32, height: u32, rgb: [u8; 3], format: ImageFormat) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
        let mut buf = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut buf);
        img.write_to(&mut cursor, format).unwrap();
        buf
    }
}
