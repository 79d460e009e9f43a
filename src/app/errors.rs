use crate::{
    catalog::StoreError,
    config::ConfigError,
    images::ImageError,
    semantic::{ReconcileError, SearchError},
};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("catalog entry {0} not found")]
    NotFound(u64),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Image(#[from] ImageError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Reconcile(#[from] ReconcileError),

    #[error("{0}")]
    Search(#[from] SearchError),

    #[error("catalog is busy: {0}")]
    Locked(String),

    #[error("invalid upload name: {0}")]
    InvalidName(String),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),
}

impl AppError {
    /// Map a failed lock attempt; contention gets its own variant.
    pub fn from_lock(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => Self::Locked(err.to_string()),
            _ => Self::IO(err),
        }
    }
}
