//! Product catalog: entry types, the store trait and its file-backed backend.

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::RwLock, time::Instant};

use crate::semantic::storage::{CatalogSnapshot, CatalogStorage, CatalogStorageError};

/// Category assigned to entries nobody has categorized yet.
pub const DEFAULT_CATEGORY: &str = "Uncategorized";

/// Embedding state of a catalog entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "vector", rename_all = "snake_case")]
pub enum Embedding {
    /// Not computed yet; the next reconciliation fills it in.
    #[default]
    Pending,
    /// Unit-normalized vector of the store's dimension.
    Computed(Vec<f32>),
}

impl Embedding {
    pub fn is_computed(&self) -> bool {
        matches!(self, Embedding::Computed(v) if !v.is_empty())
    }

    pub fn as_slice(&self) -> Option<&[f32]> {
        match self {
            Embedding::Computed(v) if !v.is_empty() => Some(v.as_slice()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: u64,
    pub name: String,
    pub category: String,
    pub image_ref: String,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCatalogEntry {
    pub name: String,
    pub category: String,
    pub image_ref: String,
    #[serde(default)]
    pub embedding: Embedding,
}

impl NewCatalogEntry {
    /// Entry for `image_ref` with the derived default name and category.
    pub fn for_image(image_ref: &str, embedding: Embedding) -> Self {
        Self {
            name: default_name(image_ref),
            category: DEFAULT_CATEGORY.to_string(),
            image_ref: image_ref.to_string(),
            embedding,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogEntryUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Display name derived from an image reference: the file stem with `-` and
/// `_` turned into spaces.
pub fn default_name(image_ref: &str) -> String {
    let file_name = image_ref.rsplit('/').next().unwrap_or(image_ref);
    let stem = match file_name.rfind('.') {
        Some(0) | None => file_name,
        Some(idx) => &file_name[..idx],
    };
    stem.replace(['-', '_'], " ")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] CatalogStorageError),

    #[error("an entry for image {0} already exists")]
    DuplicateImageRef(String),

    #[error("catalog entry {0} not found")]
    NotFound(u64),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("refusing to store an empty embedding")]
    EmptyEmbedding,

    #[error("catalog lock poisoned")]
    Poisoned,

    #[error("catalog was opened read-only")]
    ReadOnly,
}

pub trait CatalogStore: Send + Sync {
    fn find_all(&self) -> Result<Vec<CatalogEntry>, StoreError>;
    fn find_all_with_embedding(&self) -> Result<Vec<CatalogEntry>, StoreError>;
    fn find_by_id(&self, id: u64) -> Result<Option<CatalogEntry>, StoreError>;
    fn find_by_image_ref(&self, image_ref: &str) -> Result<Option<CatalogEntry>, StoreError>;
    fn insert(&self, entry: NewCatalogEntry) -> Result<CatalogEntry, StoreError>;
    fn update_embedding(&self, id: u64, embedding: Vec<f32>) -> Result<(), StoreError>;
    fn update_details(&self, id: u64, update: CatalogEntryUpdate)
        -> Result<CatalogEntry, StoreError>;
    fn delete_by_id(&self, id: u64) -> Result<(), StoreError>;
    /// Embedding dimension shared by every computed entry, once known.
    fn dimensions(&self) -> Result<Option<usize>, StoreError>;
}

#[derive(Debug, Clone)]
struct CatalogState {
    entries: Vec<CatalogEntry>,
    next_id: u64,
    dimensions: Option<usize>,
}

impl CatalogState {
    fn check_dimensions(&mut self, len: usize) -> Result<(), StoreError> {
        if len == 0 {
            return Err(StoreError::EmptyEmbedding);
        }
        match self.dimensions {
            Some(expected) if expected != len => Err(StoreError::DimensionMismatch {
                expected,
                got: len,
            }),
            Some(_) => Ok(()),
            None => {
                self.dimensions = Some(len);
                Ok(())
            }
        }
    }

    fn position(&self, id: u64) -> Result<usize, StoreError> {
        self.entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(StoreError::NotFound(id))
    }
}

/// Catalog persisted to a single checksummed binary file.
///
/// Every mutation is applied to a copy of the state, written to disk, and
/// only then published, so a failed write leaves memory and disk in agreement.
pub struct CatalogFile {
    state: RwLock<CatalogState>,
    storage: CatalogStorage,
    model_id: [u8; 32],
    writable: bool,
}

impl CatalogFile {
    /// Open (or create) the catalog at `path` for the model identified by `model_id`.
    ///
    /// A catalog written with a different model keeps its entries but has
    /// every embedding reset to pending. Callers sharing the file with other
    /// processes must hold the base directory lock before opening.
    pub fn open(path: PathBuf, model_id: [u8; 32]) -> Result<Self, StoreError> {
        let storage = CatalogStorage::new(path);
        let (state, dirty) = Self::load(&storage, model_id)?;

        if dirty {
            if let Some(parent) = storage.path().parent() {
                std::fs::create_dir_all(parent).map_err(CatalogStorageError::from)?;
            }
            storage.save(&Self::snapshot_of(&state, model_id))?;
        }

        Ok(Self {
            state: RwLock::new(state),
            storage,
            model_id,
            writable: true,
        })
    }

    /// Open the catalog for reading only. Nothing is written: a missing file
    /// reads as empty and a model change is applied in memory.
    pub fn open_read_only(path: PathBuf, model_id: [u8; 32]) -> Result<Self, StoreError> {
        let storage = CatalogStorage::new(path);
        let (state, _) = Self::load(&storage, model_id)?;

        Ok(Self {
            state: RwLock::new(state),
            storage,
            model_id,
            writable: false,
        })
    }

    /// Read the stored state; the flag is set when it differs from the file.
    fn load(storage: &CatalogStorage, model_id: [u8; 32]) -> Result<(CatalogState, bool), StoreError> {
        if !storage.exists() {
            log::info!("No catalog at {}, starting empty", storage.path().display());
            let state = CatalogState {
                entries: vec![],
                next_id: 1,
                dimensions: None,
            };
            return Ok((state, true));
        }

        let now = Instant::now();
        let snapshot = storage.load()?;
        log::debug!(
            "took {}ms to read catalog",
            now.elapsed().as_micros() as f64 / 1000.0
        );

        let mut state = CatalogState {
            entries: snapshot.entries,
            next_id: snapshot.next_id.max(1),
            dimensions: snapshot.dimensions,
        };

        if snapshot.model_id == model_id {
            return Ok((state, false));
        }

        log::warn!(
            "catalog {} was embedded with a different model; {} embeddings reset to pending",
            storage.path().display(),
            state.entries.iter().filter(|e| e.embedding.is_computed()).count()
        );
        for entry in state.entries.iter_mut() {
            entry.embedding = Embedding::Pending;
        }
        state.dimensions = None;
        Ok((state, true))
    }

    fn snapshot_of(state: &CatalogState, model_id: [u8; 32]) -> CatalogSnapshot {
        CatalogSnapshot {
            model_id,
            dimensions: state.dimensions,
            next_id: state.next_id,
            entries: state.entries.clone(),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&CatalogState) -> R) -> Result<R, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&state))
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut CatalogState) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        let mut next = state.clone();
        let out = f(&mut next)?;
        self.storage.save(&Self::snapshot_of(&next, self.model_id))?;
        *state = next;
        Ok(out)
    }
}

impl CatalogStore for CatalogFile {
    fn find_all(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        self.read(|state| state.entries.clone())
    }

    fn find_all_with_embedding(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        self.read(|state| {
            state
                .entries
                .iter()
                .filter(|e| e.embedding.is_computed())
                .cloned()
                .collect()
        })
    }

    fn find_by_id(&self, id: u64) -> Result<Option<CatalogEntry>, StoreError> {
        self.read(|state| state.entries.iter().find(|e| e.id == id).cloned())
    }

    fn find_by_image_ref(&self, image_ref: &str) -> Result<Option<CatalogEntry>, StoreError> {
        self.read(|state| {
            state
                .entries
                .iter()
                .find(|e| e.image_ref == image_ref)
                .cloned()
        })
    }

    fn insert(&self, entry: NewCatalogEntry) -> Result<CatalogEntry, StoreError> {
        self.mutate(|state| {
            if state.entries.iter().any(|e| e.image_ref == entry.image_ref) {
                return Err(StoreError::DuplicateImageRef(entry.image_ref));
            }
            if let Embedding::Computed(v) = &entry.embedding {
                state.check_dimensions(v.len())?;
            }

            let created = CatalogEntry {
                id: state.next_id,
                name: entry.name,
                category: entry.category,
                image_ref: entry.image_ref,
                embedding: entry.embedding,
            };
            state.next_id += 1;
            state.entries.push(created.clone());
            Ok(created)
        })
    }

    fn update_embedding(&self, id: u64, embedding: Vec<f32>) -> Result<(), StoreError> {
        self.mutate(|state| {
            let idx = state.position(id)?;
            state.check_dimensions(embedding.len())?;
            state.entries[idx].embedding = Embedding::Computed(embedding);
            Ok(())
        })
    }

    fn update_details(
        &self,
        id: u64,
        update: CatalogEntryUpdate,
    ) -> Result<CatalogEntry, StoreError> {
        self.mutate(|state| {
            let idx = state.position(id)?;
            let entry = &mut state.entries[idx];
            if let Some(name) = update.name {
                entry.name = name;
            }
            if let Some(category) = update.category {
                entry.category = category;
            }
            Ok(entry.clone())
        })
    }

    fn delete_by_id(&self, id: u64) -> Result<(), StoreError> {
        self.mutate(|state| {
            let idx = state.position(id)?;
            state.entries.remove(idx);
            Ok(())
        })
    }

    fn dimensions(&self) -> Result<Option<usize>, StoreError> {
        self.read(|state| state.dimensions)
    }
}
