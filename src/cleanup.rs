//! Removal of stale query uploads.
//!
//! `vpm search` reads its image in place; the uploads directory is filled by
//! whatever serves query uploads and only pruned here.

use serde::Serialize;
use std::{
    collections::HashSet,
    path::Path,
    time::{Duration, SystemTime},
};

use crate::{
    catalog::{CatalogStore, StoreError},
    storage::{BackendLocal, StorageManager},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub checked: usize,
    pub deleted: usize,
    /// Files kept because a catalog entry still points at them.
    pub skipped: usize,
}

/// Delete files in `dir` older than `max_age` that no catalog entry references.
///
/// A missing directory is not an error; nothing is checked.
pub fn prune_uploads(
    dir: &Path,
    max_age: Duration,
    store: &dyn CatalogStore,
) -> Result<CleanupReport, StoreError> {
    let mut report = CleanupReport::default();

    if !dir.is_dir() {
        log::warn!("upload folder {} not found, skipping cleanup", dir.display());
        return Ok(report);
    }

    let referenced: HashSet<String> = store
        .find_all()?
        .into_iter()
        .filter_map(|entry| entry.image_ref.rsplit('/').next().map(str::to_string))
        .collect();

    let cutoff = SystemTime::now().checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
    let uploads = BackendLocal::open(dir);

    for file in uploads.list() {
        report.checked += 1;

        if referenced.contains(&file) {
            report.skipped += 1;
            continue;
        }

        let modified = match uploads.modified(&file) {
            Ok(modified) => modified,
            Err(err) => {
                log::error!("cleanup: failed to stat {}: {}", file, err);
                continue;
            }
        };

        if modified < cutoff {
            match uploads.delete(&file) {
                Ok(()) => {
                    log::info!("cleanup: deleted old upload {}", file);
                    report.deleted += 1;
                }
                Err(err) => log::error!("cleanup: failed to delete {}: {}", file, err),
            }
        }
    }

    log::info!(
        "cleanup: checked {}, deleted {}, skipped {} (still in catalog)",
        report.checked,
        report.deleted,
        report.skipped
    );

    Ok(report)
}
