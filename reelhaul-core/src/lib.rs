pub mod catalog;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod index;
pub mod processor;
pub mod reconcile;
pub mod service;
pub mod sink;
pub mod storage;

pub use catalog::{
    scan_all, BatchWriteOutcome, CatalogError, CatalogResult, ErrorCategory, ErrorLog,
    ErrorRecord, ErrorSubject, SourceType, SqliteVideoStore, SqliteVideoStoreBuilder,
    VideoDescriptor, VideoRecord, VideoStore, VideoUpdate,
};
pub use config::{
    load_ingest_config, DownloadSection, EncoderKind, EncoderSection, IndexSection,
    IngestConfig, PathsSection, SourceEntry, SourcesSection, StorageSection, SystemSection,
};
pub use discovery::{
    DiscoveryError, DiscoveryParams, DiscoveryResult, JsonFeedStrategy, M3uIndexStrategy,
    RequestStrategy, StrategyRegistry,
};
pub use error::{ConfigError, Result};
pub use events::{
    DispatchError, DispatchResult, EventDispatcher, EventDispatcherBuilder, EventEmitter,
    EventEnvelope, EventHandler, EventKind, HandlerError, HandlerResult, Lane, MediaHandle,
    PipelineEvent,
};
pub use index::{
    IndexError, IndexPage, IndexQuery, IndexResult, IndexSynchronizer, SearchIndex,
    SortDirection, SortField, SqliteSearchIndex, SyncReport,
};
pub use processor::{
    build_encoder, encode_url, object_path, BlobUploader, ConcatEncoder, DownloadHandler,
    EncodedMedia, Encoder, FailureLog, ManifestFetcher, MediaContainer, MediaStream,
    OutputDescriptor, ProcessorError, ProcessorResult, RemuxEncoder, RetryPolicy, UploadHandler,
};
pub use reconcile::{
    BatchReconciler, ReconcileError, ReconcileReport, ReconcileResult, SaveBatchHandler,
};
pub use service::{
    DownloadTrigger, IngestComponents, IngestError, IngestResult, IngestRuntime, IngestService,
    PlayableMedia,
};
pub use sink::ErrorSinkHandler;
pub use storage::{BlobStore, LocalBlobStore, StorageError, StorageResult};
