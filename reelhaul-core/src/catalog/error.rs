use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("video {id} not found")]
    NotFound { id: i64 },
    #[error("batch write rejected: update of video {id} matched {affected} rows")]
    PartialBatch { id: i64, affected: usize },
    #[error("unknown source type: {0}")]
    InvalidSourceType(String),
    #[error("unknown error category: {0}")]
    InvalidCategory(String),
    #[error("catalog path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("blocking task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for CatalogError {
    fn from(err: tokio::task::JoinError) -> Self {
        CatalogError::Task(err.to_string())
    }
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
