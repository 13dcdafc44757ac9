pub mod error;
pub mod models;
pub mod store;

pub use error::{CatalogError, CatalogResult};
pub use models::{
    BatchWriteOutcome, ErrorCategory, ErrorRecord, ErrorSubject, SourceType, VideoDescriptor,
    VideoRecord, VideoUpdate,
};
pub use store::{scan_all, ErrorLog, SqliteVideoStore, SqliteVideoStoreBuilder, VideoStore};
