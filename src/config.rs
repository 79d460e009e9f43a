use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    semantic::{embeddings::parse_model_name, DEFAULT_MODEL},
    storage::{self, StorageManager},
};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_CATALOG_DIR: &str = "db";
const DEFAULT_PRODUCTS_SUBDIR: &str = "products";
const DEFAULT_UPLOADS_DIR: &str = "uploads";
const DEFAULT_UPLOADS_MAX_AGE_HOURS: u64 = 24;
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:5000";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config.yaml: {0}")]
    Io(#[from] std::io::Error),

    #[error("config.yaml is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("config.yaml is not valid utf8")]
    NotUtf8(#[from] std::string::FromUtf8Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Configuration for the image embedding model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name (e.g., "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub model: String,

    /// Timeout for model download and initialization in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub show_download_progress: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            show_download_progress: true,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

fn default_catalog_dir() -> String {
    DEFAULT_CATALOG_DIR.to_string()
}

fn default_products_subdir() -> String {
    DEFAULT_PRODUCTS_SUBDIR.to_string()
}

fn default_uploads_dir() -> String {
    DEFAULT_UPLOADS_DIR.to_string()
}

fn default_uploads_max_age_hours() -> u64 {
    DEFAULT_UPLOADS_MAX_AGE_HOURS
}

fn default_public_base_url() -> String {
    DEFAULT_PUBLIC_BASE_URL.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Catalog root: holds catalog.bin and the product images. Relative paths
    /// are resolved against the base directory.
    #[serde(default = "default_catalog_dir")]
    pub catalog_dir: String,

    /// Subdirectory of the catalog root scanned for product images.
    /// Empty means the catalog root itself.
    #[serde(default = "default_products_subdir")]
    pub products_subdir: String,

    /// Where query images are kept until `vpm cleanup` removes them. vpm only
    /// prunes this directory; the front end that receives query uploads fills it.
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,

    #[serde(default = "default_uploads_max_age_hours")]
    pub uploads_max_age_hours: u64,

    /// Public URL image refs are served under, as `<url>/db/<image_ref>`.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog_dir: default_catalog_dir(),
            products_subdir: default_products_subdir(),
            uploads_dir: default_uploads_dir(),
            uploads_max_age_hours: DEFAULT_UPLOADS_MAX_AGE_HOURS,
            public_base_url: default_public_base_url(),
            embedding: EmbeddingConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let subdir = Path::new(&self.products_subdir);
        if subdir
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(invalid(
                "products_subdir",
                format!(
                    "must be a relative path inside the catalog, got '{}'",
                    self.products_subdir
                ),
            ));
        }

        if self.catalog_dir.trim().is_empty() {
            return Err(invalid("catalog_dir", "must not be empty"));
        }

        if self.uploads_dir.trim().is_empty() {
            return Err(invalid("uploads_dir", "must not be empty"));
        }

        if self.uploads_max_age_hours == 0 {
            return Err(invalid("uploads_max_age_hours", "must be greater than 0"));
        }

        self.image_base_url()?;

        parse_model_name(&self.embedding.model)
            .map_err(|e| invalid("embedding.model", e.to_string()))?;

        if self.embedding.download_timeout_secs == 0 {
            return Err(invalid(
                "embedding.download_timeout_secs",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing defaults on first run.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            log::info!("Writing default config to {}", base_path.join(CONFIG_FILE).display());
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, dir: &str) -> PathBuf {
        let path = Path::new(dir);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    pub fn catalog_root(&self) -> PathBuf {
        self.resolve(&self.catalog_dir)
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.catalog_root().join("catalog.bin")
    }

    /// Directory scanned for product images.
    pub fn products_dir(&self) -> PathBuf {
        let subdir = self.products_subdir.trim_matches('/');
        if subdir.is_empty() {
            self.catalog_root()
        } else {
            self.catalog_root().join(subdir)
        }
    }

    pub fn uploads_path(&self) -> PathBuf {
        self.resolve(&self.uploads_dir)
    }

    /// Base URL image refs are joined onto.
    pub fn image_base_url(&self) -> Result<Url, ConfigError> {
        let mut base = self.public_base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }

        let url = Url::parse(&base)
            .and_then(|url| url.join("db/"))
            .map_err(|e| invalid("public_base_url", format!("'{}': {}", self.public_base_url, e)))?;

        if url.cannot_be_a_base() {
            return Err(invalid(
                "public_base_url",
                format!("'{}' cannot be a base URL", self.public_base_url),
            ));
        }
        Ok(url)
    }
}
