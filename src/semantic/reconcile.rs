//! Reconciliation of the catalog store against the product image directory.
//!
//! A pass lists the scanned directory, partitions it against the store into
//! a [`ReconcilePlan`] and then applies the plan: embed what is missing,
//! leave valid entries alone and prune entries whose file disappeared.
//! Only one pass runs at a time per [`Reconciler`].

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::catalog::{CatalogEntry, CatalogStore, Embedding, NewCatalogEntry, StoreError};
use crate::images::{self, ImageError};
use crate::semantic::embeddings::{EmbeddingError, ImageEmbedder};
use crate::semantic::vector::{self, UNIT_TOLERANCE};
use crate::semantic::EmbeddingProvider;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("image directory {path} is unavailable: {source}")]
    DirectoryUnavailable {
        path: String,
        source: std::io::Error,
    },

    #[error("{0}")]
    ModelUnavailable(#[from] EmbeddingError),

    #[error("a reconciliation pass is already running")]
    AlreadyRunning,

    #[error("catalog error: {0}")]
    Store(#[from] StoreError),

    #[error("reconciliation task interrupted: {0}")]
    Interrupted(String),
}

/// Per-image errors; recorded in the report, never returned.
#[derive(Debug, thiserror::Error)]
enum ImageStepError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("model returned a malformed embedding ({0} components, zero magnitude)")]
    MalformedEmbedding(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cooperative cancellation shared between a pass and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageFailure {
    pub image_ref: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// New entries created for files with no catalog entry.
    pub added: usize,
    /// Existing entries whose pending or invalid embedding was recomputed.
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub failures: Vec<ImageFailure>,
    pub cancelled: bool,
}

impl ReconcileReport {
    fn record_failure(&mut self, image_ref: &str, reason: String) {
        log::warn!("reconcile: failed to process {}: {}", image_ref, reason);
        self.failed += 1;
        self.failures.push(ImageFailure {
            image_ref: image_ref.to_string(),
            reason,
        });
    }
}

/// What to do for an image that needs an embedding.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedTarget {
    /// No entry yet; insert one with default name and category.
    Insert,
    /// Entry exists with a pending or invalid embedding.
    Update(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedJob {
    pub image_ref: String,
    pub target: EmbedTarget,
}

/// Three-way partition of the scanned directory against the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Entries with a valid embedding and a backing file.
    pub keep: Vec<CatalogEntry>,
    pub embed: Vec<EmbedJob>,
    /// Entries whose backing file is gone.
    pub prune: Vec<CatalogEntry>,
}

impl ReconcilePlan {
    /// Partition `expected` image refs against the current store `entries`.
    pub fn build(expected: &[String], entries: Vec<CatalogEntry>, dimensions: Option<usize>) -> Self {
        let expected_set: HashSet<&str> = expected.iter().map(String::as_str).collect();
        let mut plan = ReconcilePlan::default();
        let mut by_ref = std::collections::HashMap::new();

        for entry in entries {
            if expected_set.contains(entry.image_ref.as_str()) {
                by_ref.insert(entry.image_ref.clone(), entry);
            } else {
                plan.prune.push(entry);
            }
        }

        for image_ref in expected {
            match by_ref.remove(image_ref) {
                Some(entry) if has_valid_embedding(&entry, dimensions) => plan.keep.push(entry),
                Some(entry) => plan.embed.push(EmbedJob {
                    image_ref: image_ref.clone(),
                    target: EmbedTarget::Update(entry.id),
                }),
                None => plan.embed.push(EmbedJob {
                    image_ref: image_ref.clone(),
                    target: EmbedTarget::Insert,
                }),
            }
        }

        plan
    }
}

/// A stored embedding is trusted only if it has the store's dimension and unit length.
fn has_valid_embedding(entry: &CatalogEntry, dimensions: Option<usize>) -> bool {
    match entry.embedding.as_slice() {
        Some(v) => dimensions.map_or(true, |d| v.len() == d) && vector::is_unit(v, UNIT_TOLERANCE),
        None => false,
    }
}

/// Progress of the embedding phase, reported once per image.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileProgress {
    pub done: usize,
    pub total: usize,
    pub image_ref: String,
}

pub struct Reconciler {
    store: Arc<dyn CatalogStore>,
    provider: Arc<EmbeddingProvider>,
    catalog_root: PathBuf,
    subdir: String,
    running: Mutex<()>,
}

impl Reconciler {
    /// Reconcile images under `catalog_root/subdir`; refs are relative to `catalog_root`.
    pub fn new(
        store: Arc<dyn CatalogStore>,
        provider: Arc<EmbeddingProvider>,
        catalog_root: PathBuf,
        subdir: &str,
    ) -> Self {
        Self {
            store,
            provider,
            catalog_root,
            subdir: subdir.trim_matches('/').to_string(),
            running: Mutex::new(()),
        }
    }

    /// Directory that is listed for images.
    pub fn scan_dir(&self) -> PathBuf {
        if self.subdir.is_empty() {
            self.catalog_root.clone()
        } else {
            self.catalog_root.join(&self.subdir)
        }
    }

    /// Sorted image refs currently present in the scanned directory.
    pub fn expected_refs(&self) -> Result<Vec<String>, ReconcileError> {
        let dir = self.scan_dir();
        let mut refs = vec![];
        collect_images(&self.catalog_root, &dir, &mut refs).map_err(|source| {
            ReconcileError::DirectoryUnavailable {
                path: dir.display().to_string(),
                source,
            }
        })?;
        refs.sort();
        Ok(refs)
    }

    /// Compute the plan for a pass without changing anything.
    pub fn plan(&self) -> Result<ReconcilePlan, ReconcileError> {
        let expected = self.expected_refs()?;
        let entries = self.store.find_all()?;
        let dimensions = self.store.dimensions()?;
        Ok(ReconcilePlan::build(&expected, entries, dimensions))
    }

    /// Run one pass, calling `progress` after every image that needed embedding.
    ///
    /// A model that failed to load earlier is tried again, since a pass is
    /// an explicit admin request.
    pub fn run<F>(
        &self,
        cancel: &CancelFlag,
        mut progress: F,
    ) -> Result<ReconcileReport, ReconcileError>
    where
        F: FnMut(&ReconcileProgress),
    {
        let _running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ReconcileError::AlreadyRunning),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let span = tracing::info_span!("reconcile", dir = %self.scan_dir().display());
        let _enter = span.enter();
        let now = Instant::now();

        let plan = self.plan()?;
        log::info!(
            "reconcile: {} to keep, {} to embed, {} to prune",
            plan.keep.len(),
            plan.embed.len(),
            plan.prune.len()
        );

        let mut report = ReconcileReport {
            unchanged: plan.keep.len(),
            ..Default::default()
        };

        if !plan.embed.is_empty() {
            let model = match self.provider.retry() {
                Ok(model) => model,
                Err(err) => {
                    // pruning depends only on the listing, which succeeded
                    self.prune(&plan.prune, &mut report)?;
                    log::error!(
                        "reconcile: model unavailable, pruned {} orphaned entries: {}",
                        report.removed,
                        err
                    );
                    return Err(ReconcileError::ModelUnavailable(err));
                }
            };

            let total = plan.embed.len();
            log::info!(
                "reconcile: embedding {} images with '{}' ({} dimensions)",
                total,
                model.name(),
                model.dimensions()
            );
            for (idx, job) in plan.embed.iter().enumerate() {
                if cancel.is_cancelled() {
                    break;
                }

                match self.embed_job(model.as_ref(), job) {
                    Ok(EmbedTarget::Insert) => report.added += 1,
                    Ok(EmbedTarget::Update(_)) => report.updated += 1,
                    Err(err) => report.record_failure(&job.image_ref, err.to_string()),
                }

                progress(&ReconcileProgress {
                    done: idx + 1,
                    total,
                    image_ref: job.image_ref.clone(),
                });
            }
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            log::warn!(
                "reconcile: cancelled after {} added, {} updated, {} failed; pruning skipped",
                report.added,
                report.updated,
                report.failed
            );
            return Ok(report);
        }

        self.prune(&plan.prune, &mut report)?;

        log::info!(
            "reconcile: {} added, {} updated, {} removed, {} unchanged, {} failed in {}ms",
            report.added,
            report.updated,
            report.removed,
            report.unchanged,
            report.failed,
            now.elapsed().as_millis()
        );

        Ok(report)
    }

    /// Run a pass on a background thread, stopping early once `cancel` is set.
    pub fn spawn(self: &Arc<Self>, cancel: CancelFlag) -> ReconcileTask {
        let status = Arc::new(Mutex::new(TaskStatus::Pending));
        let progress = Arc::new(Mutex::new(ReconcileProgress::default()));

        let handle = std::thread::spawn({
            let reconciler = self.clone();
            let status = status.clone();
            let progress = progress.clone();
            move || {
                set_shared(&status, TaskStatus::InProgress);
                let result = reconciler.run(&cancel, |current| {
                    set_shared(&progress, current.clone());
                });
                set_shared(
                    &status,
                    match &result {
                        Ok(report) if report.cancelled => TaskStatus::Cancelled,
                        Ok(_) => TaskStatus::Done,
                        Err(err) => TaskStatus::Error(err.to_string()),
                    },
                );
                result
            }
        });

        ReconcileTask {
            status,
            progress,
            handle,
        }
    }

    fn embed_job(
        &self,
        model: &dyn ImageEmbedder,
        job: &EmbedJob,
    ) -> Result<EmbedTarget, ImageStepError> {
        let path = self.catalog_root.join(&job.image_ref);
        let image = images::decode_file(&path)?;
        let raw = model.embed(&image)?;

        if raw.is_empty() || vector::l2_norm(&raw) == 0.0 {
            return Err(ImageStepError::MalformedEmbedding(raw.len()));
        }
        let embedding = vector::normalize(&raw);

        match job.target {
            EmbedTarget::Insert => {
                let entry = self.store.insert(NewCatalogEntry::for_image(
                    &job.image_ref,
                    Embedding::Computed(embedding),
                ))?;
                log::debug!("reconcile: added {} as entry {}", job.image_ref, entry.id);
            }
            EmbedTarget::Update(id) => {
                self.store.update_embedding(id, embedding)?;
                log::debug!("reconcile: embedded entry {} ({})", id, job.image_ref);
            }
        }

        Ok(job.target.clone())
    }

    fn prune(
        &self,
        orphans: &[CatalogEntry],
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        for entry in orphans {
            match self.store.delete_by_id(entry.id) {
                Ok(()) => {
                    log::info!("reconcile: removed entry {} ({})", entry.id, entry.image_ref);
                    report.removed += 1;
                }
                // deleted concurrently by an admin edit
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Recursively collect `/`-separated refs (relative to `root`) of image files under `dir`.
fn collect_images(root: &Path, dir: &Path, refs: &mut Vec<String>) -> std::io::Result<()> {
    for dir_entry in std::fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let path = dir_entry.path();

        if dir_entry.file_type()?.is_dir() {
            collect_images(root, &path, refs)?;
            continue;
        }
        if !path.is_file() || !images::has_image_extension(&path) {
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        match parts {
            Some(parts) => refs.push(parts.join("/")),
            None => log::warn!("reconcile: skipping non UTF-8 path {}", path.display()),
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Cancelled,
    Error(String),
}

fn set_shared<T>(slot: &Mutex<T>, next: T) {
    match slot.lock() {
        Ok(mut current) => *current = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

fn get_shared<T: Clone>(slot: &Mutex<T>) -> T {
    match slot.lock() {
        Ok(current) => current.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Handle to a reconciliation pass running on its own thread.
pub struct ReconcileTask {
    status: Arc<Mutex<TaskStatus>>,
    progress: Arc<Mutex<ReconcileProgress>>,
    handle: JoinHandle<Result<ReconcileReport, ReconcileError>>,
}

impl ReconcileTask {
    pub fn status(&self) -> TaskStatus {
        get_shared(&self.status)
    }

    /// Latest per-image progress; all zero until the first image is done.
    pub fn progress(&self) -> ReconcileProgress {
        get_shared(&self.progress)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<ReconcileReport, ReconcileError> {
        self.handle.join().map_err(|err| {
            log::error!("reconcile task panicked: {err:?}");
            ReconcileError::Interrupted(format!("{err:?}"))
        })?
    }
}
