use crate::{app::local::AppLocal, config::Config};
use anyhow::{Context, Result};
use homedir::my_home;
use std::path::{Path, PathBuf};

/// Application factory for creating and configuring application components
pub struct AppFactory;

impl AppFactory {
    /// Create a local application instance backed by the configured model.
    /// Holds the catalog lock until the app is dropped.
    pub fn create_local_app(paths: &AppPaths) -> Result<AppLocal> {
        let config = Self::create_config(&paths.base_path)?;
        AppLocal::open(config).context("Failed to open catalog")
    }

    /// Create an application instance that only reads the catalog
    pub fn create_read_only_app(paths: &AppPaths) -> Result<AppLocal> {
        let config = Self::create_config(&paths.base_path)?;
        AppLocal::open_read_only(config).context("Failed to open catalog")
    }

    /// Load configuration from the base directory
    pub fn create_config(base_path: &Path) -> Result<Config> {
        Config::load_with(base_path)
            .with_context(|| format!("Failed to load config from {}", base_path.display()))
    }

    /// Get application paths with validation
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;

        // Ensure base directory exists
        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(AppPaths { base_path })
    }

    /// Get the base path for the application
    fn get_base_path() -> Result<PathBuf> {
        if let Ok(base_path) = std::env::var("VPM_BASE_PATH") {
            return Ok(PathBuf::from(base_path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/vpm"))
    }
}

/// Application paths
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
}
