use crate::{
    app::AppLocal,
    catalog::{CatalogEntry, CatalogEntryUpdate},
    semantic::{reconcile::TaskStatus, CancelFlag, ReconcileReport, SearchMatch, SearchOutcome},
};
use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::error::InquireResult;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use super::errors::CliError;
use super::validation::{validate_edit, validate_threshold};

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn handle_reconcile(app: &AppLocal, json: bool) -> Result<()> {
    let cancel = CancelFlag::new();
    ctrlc::set_handler({
        let cancel = cancel.clone();
        move || {
            log::warn!("Received interrupt, stopping after the current image");
            cancel.cancel();
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    let bar = if json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(0)
    };
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {wide_msg}")?
            .progress_chars("=> "),
    );

    let task = app.reconcile(cancel);
    while !task.is_finished() {
        let progress = task.progress();
        bar.set_length(progress.total as u64);
        bar.set_position(progress.done as u64);
        bar.set_message(progress.image_ref);
        std::thread::sleep(PROGRESS_POLL_INTERVAL);
    }
    bar.finish_and_clear();

    if let TaskStatus::Error(reason) = task.status() {
        log::debug!("reconcile task failed: {}", reason);
    }

    let report = task.join()?;
    if json {
        print_json(&report)
    } else {
        print_report(&report);
        Ok(())
    }
}

fn print_report(report: &ReconcileReport) {
    println!(
        "{} added, {} updated, {} removed, {} unchanged, {} failed",
        report.added, report.updated, report.removed, report.unchanged, report.failed
    );
    for failure in &report.failures {
        println!("failed: {}: {}", failure.image_ref, failure.reason);
    }
    if report.cancelled {
        println!("reconciliation was cancelled, orphaned entries were not pruned");
    }
}

/// Apply the presentation filters to a ranked list.
pub fn filter_matches(
    matches: &[SearchMatch],
    threshold: Option<f32>,
    limit: Option<usize>,
) -> Vec<SearchMatch> {
    matches
        .iter()
        .filter(|m| threshold.map_or(true, |t| m.similarity >= t))
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

pub fn handle_search(
    app: &AppLocal,
    image: PathBuf,
    threshold: Option<f32>,
    limit: Option<usize>,
) -> Result<()> {
    if let Some(threshold) = threshold {
        validate_threshold(threshold)?;
    }

    let outcome = app
        .search_file(&image)
        .with_context(|| format!("Search with {} failed", image.display()))?;

    if let SearchOutcome::EmptyCatalog = outcome {
        eprintln!("No product embeddings found in the catalog. Run `vpm reconcile` first.");
    }

    print_json(&filter_matches(outcome.matches(), threshold, limit))
}

pub fn handle_add(app: &AppLocal, file: PathBuf) -> Result<()> {

    let data = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
    let original_name = file
        .file_name()
        .and_then(|name| name.to_str())
        .context("File name is not valid utf8")?;

    let entry = app.add_upload(original_name, &data)?;
    eprintln!("Product uploaded. Run `vpm reconcile` to compute its embedding.");
    print_json(&CatalogListItem::from(&entry))
}

pub fn handle_edit(
    app: &AppLocal,
    id: u64,
    name: Option<String>,
    category: Option<String>,
) -> Result<()> {
    validate_edit(&name, &category)?;

    let entry = app.edit(id, CatalogEntryUpdate { name, category })?;
    print_json(&CatalogListItem::from(&entry))
}

pub fn handle_delete(app: &AppLocal, id: u64, yes: bool) -> Result<()> {
    let entry = app.find(id)?;

    if !yes {
        match inquire::prompt_confirmation(format!(
            "Delete \"{}\" ({}) and its image?",
            entry.name, entry.image_ref
        )) {
            InquireResult::Ok(true) => {}
            InquireResult::Ok(false) => return Err(CliError::UserCancelled.into()),
            InquireResult::Err(err) => bail!("An error occurred: {}", err),
        }
    }

    app.delete(id)?;
    println!("entry {} removed", id);
    Ok(())
}

pub fn handle_list(app: &AppLocal) -> Result<()> {
    let items: Vec<CatalogListItem> = app.list()?.iter().map(CatalogListItem::from).collect();
    print_json(&items)
}

pub fn handle_cleanup(app: &AppLocal) -> Result<()> {
    let report = app.cleanup()?;
    print_json(&report)
}

/// Catalog entry as printed by the CLI, without the vector itself.
#[derive(Debug, Serialize)]
pub struct CatalogListItem {
    pub id: u64,
    pub name: String,
    pub category: String,
    pub image_ref: String,
    pub embedded: bool,
}

impl From<&CatalogEntry> for CatalogListItem {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.name.clone(),
            category: entry.category.clone(),
            image_ref: entry.image_ref.clone(),
            embedded: entry.embedding.is_computed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(id: u64, similarity: f32) -> SearchMatch {
        SearchMatch {
            id,
            name: format!("p{id}"),
            category: "c".to_string(),
            image_url: format!("http://localhost:5000/db/products/{id}.jpg"),
            similarity,
        }
    }

    #[test]
    fn test_filter_matches() {
        let matches = vec![m(1, 0.9), m(2, 0.5), m(3, 0.1)];

        assert_eq!(filter_matches(&matches, None, None).len(), 3);
        assert_eq!(
            filter_matches(&matches, Some(0.5), None)
                .iter()
                .map(|m| m.id)
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            filter_matches(&matches, None, Some(1))
                .iter()
                .map(|m| m.id)
                .collect::<Vec<_>>(),
            vec![1]
        );
        assert!(filter_matches(&matches, Some(0.95), Some(2)).is_empty());
    }
}
