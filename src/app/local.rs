use crate::{
    catalog::{CatalogEntry, CatalogEntryUpdate, CatalogFile, CatalogStore, Embedding, NewCatalogEntry},
    cleanup::{self, CleanupReport},
    config::Config,
    images,
    lock::FileLock,
    semantic::{
        embeddings::model_id_hash, reconcile::ReconcileTask, CancelFlag, EmbeddingProvider,
        Reconciler, SearchOutcome, SimilaritySearch,
    },
    storage::{BackendLocal, StorageManager},
};

use regex::Regex;
use std::{
    path::Path,
    sync::{Arc, OnceLock},
    time::Duration,
};

use super::errors::AppError;

/// Catalog, model and services wired together for one base directory.
pub struct AppLocal {
    config: Config,
    store: Arc<dyn CatalogStore>,
    reconciler: Arc<Reconciler>,
    search: SimilaritySearch,
    // held for the lifetime of a writable app
    _lock: Option<FileLock>,
}

impl std::fmt::Debug for AppLocal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppLocal").finish_non_exhaustive()
    }
}

impl AppLocal {
    /// Lock the base directory, then open the catalog for writing.
    pub fn open(config: Config) -> Result<Self, AppError> {
        let provider = Self::fastembed_provider(&config);
        Self::with_provider(config, provider)
    }

    /// Open the catalog without taking the lock; every mutation fails.
    pub fn open_read_only(config: Config) -> Result<Self, AppError> {
        let provider = Self::fastembed_provider(&config);
        Self::read_only_with_provider(config, provider)
    }

    pub fn with_provider(config: Config, provider: Arc<EmbeddingProvider>) -> Result<Self, AppError> {
        // the catalog snapshot is only read while the lock is held
        let lock = FileLock::try_acquire(config.base_path()).map_err(AppError::from_lock)?;
        let store = CatalogFile::open(config.catalog_file(), model_id_hash(provider.model_name()))?;
        Self::assemble(config, provider, Arc::new(store), Some(lock))
    }

    pub fn read_only_with_provider(
        config: Config,
        provider: Arc<EmbeddingProvider>,
    ) -> Result<Self, AppError> {
        let store = CatalogFile::open_read_only(
            config.catalog_file(),
            model_id_hash(provider.model_name()),
        )?;
        Self::assemble(config, provider, Arc::new(store), None)
    }

    fn fastembed_provider(config: &Config) -> Arc<EmbeddingProvider> {
        Arc::new(EmbeddingProvider::fastembed(
            &config.embedding,
            config.base_path().to_path_buf(),
        ))
    }

    fn assemble(
        config: Config,
        provider: Arc<EmbeddingProvider>,
        store: Arc<dyn CatalogStore>,
        lock: Option<FileLock>,
    ) -> Result<Self, AppError> {
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            provider.clone(),
            config.catalog_root(),
            &config.products_subdir,
        ));

        let search = SimilaritySearch::new(store.clone(), provider, config.image_base_url()?);

        Ok(Self {
            config,
            store,
            reconciler,
            search,
            _lock: lock,
        })
    }

    /// Start a reconciliation pass on a background thread.
    pub fn reconcile(&self, cancel: CancelFlag) -> ReconcileTask {
        self.reconciler.spawn(cancel)
    }

    pub fn search_bytes(&self, data: &[u8]) -> Result<SearchOutcome, AppError> {
        Ok(self.search.search_image(data)?)
    }

    pub fn search_file(&self, path: &Path) -> Result<SearchOutcome, AppError> {
        let data = std::fs::read(path)?;
        self.search_bytes(&data)
    }

    /// Store an admin upload in the products directory and register it as pending.
    ///
    /// The embedding is filled in by the next reconciliation.
    pub fn add_upload(&self, original_name: &str, data: &[u8]) -> Result<CatalogEntry, AppError> {
        let sniffed_ext = images::validate_upload(data)?;
        let file_name = safe_file_name(original_name, sniffed_ext, chrono::Utc::now().timestamp_millis())?;

        let image_ref = match self.config.products_subdir.trim_matches('/') {
            "" => file_name.clone(),
            subdir => format!("{subdir}/{file_name}"),
        };

        let products = BackendLocal::new(self.config.products_dir())?;
        if products.exists(&file_name) || self.store.find_by_image_ref(&image_ref)?.is_some() {
            return Err(AppError::InvalidName(format!("{file_name} already exists")));
        }
        products.write(&file_name, data)?;

        match self
            .store
            .insert(NewCatalogEntry::for_image(&image_ref, Embedding::Pending))
        {
            Ok(entry) => {
                log::info!("uploaded new product image {} as entry {}", image_ref, entry.id);
                Ok(entry)
            }
            Err(err) => {
                if let Err(e) = products.delete(&file_name) {
                    log::error!("failed to remove {} after rejected upload: {}", file_name, e);
                }
                Err(err.into())
            }
        }
    }

    pub fn edit(&self, id: u64, update: CatalogEntryUpdate) -> Result<CatalogEntry, AppError> {
        self.find(id)?;
        Ok(self.store.update_details(id, update)?)
    }

    /// Remove an entry together with its image, so reconciliation does not bring it back.
    pub fn delete(&self, id: u64) -> Result<CatalogEntry, AppError> {
        let entry = self.find(id)?;
        self.store.delete_by_id(id)?;

        let image_path = self.config.catalog_root().join(&entry.image_ref);
        match std::fs::remove_file(&image_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("failed to remove {}: {}", image_path.display(), err),
        }

        log::info!("deleted entry {} ({})", entry.id, entry.image_ref);
        Ok(entry)
    }

    pub fn find(&self, id: u64) -> Result<CatalogEntry, AppError> {
        self.store.find_by_id(id)?.ok_or(AppError::NotFound(id))
    }

    pub fn list(&self) -> Result<Vec<CatalogEntry>, AppError> {
        Ok(self.store.find_all()?)
    }

    pub fn cleanup(&self) -> Result<CleanupReport, AppError> {
        let max_age = Duration::from_secs(self.config.uploads_max_age_hours.saturating_mul(60 * 60));
        Ok(cleanup::prune_uploads(
            &self.config.uploads_path(),
            max_age,
            self.store.as_ref(),
        )?)
    }
}

fn whitespace() -> &'static Regex {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

/// `<millis>-<name>` with whitespace runs replaced by `_`, lowercased.
/// Names without an image extension get the sniffed one appended.
fn safe_file_name(original_name: &str, sniffed_ext: &str, millis: i64) -> Result<String, AppError> {
    let base = Path::new(original_name)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.starts_with('.'))
        .ok_or_else(|| AppError::InvalidName(original_name.to_string()))?;

    let mut name = whitespace().replace_all(base, "_").to_lowercase();
    if !images::has_image_extension(Path::new(&name)) {
        name = format!("{name}.{sniffed_ext}");
    }

    Ok(format!("{millis}-{name}"))
}
