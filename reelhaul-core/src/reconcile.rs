//! Insert-or-update of discovered batches against the catalog.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{
    CatalogError, ErrorCategory, ErrorRecord, ErrorSubject, SourceType, VideoDescriptor,
    VideoRecord, VideoStore, VideoUpdate,
};
use crate::events::{
    EventEmitter, EventHandler, EventKind, HandlerError, HandlerResult, PipelineEvent,
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("descriptor {external_id} belongs to {found}, batch is for {expected}")]
    MixedSources {
        expected: SourceType,
        found: SourceType,
        external_id: String,
    },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub source_type: SourceType,
    pub received: usize,
    pub inserted: Vec<VideoRecord>,
    pub updated: Vec<VideoRecord>,
}

impl ReconcileReport {
    fn empty(source_type: SourceType) -> Self {
        Self {
            source_type,
            received: 0,
            inserted: Vec::new(),
            updated: Vec::new(),
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &VideoRecord> {
        self.inserted.iter().chain(self.updated.iter())
    }
}

#[derive(Clone)]
pub struct BatchReconciler {
    store: Arc<dyn VideoStore>,
}

impl BatchReconciler {
    pub fn new(store: Arc<dyn VideoStore>) -> Self {
        Self { store }
    }

    /// Diffs `videos` against the catalog with one bulk read and applies the
    /// result with one batched write.
    pub async fn reconcile(
        &self,
        videos: Vec<VideoDescriptor>,
        source_type: SourceType,
    ) -> ReconcileResult<ReconcileReport> {
        if videos.is_empty() {
            debug!(source = %source_type, "empty batch, nothing to reconcile");
            return Ok(ReconcileReport::empty(source_type));
        }
        if let Some(stray) = videos.iter().find(|video| video.source_type != source_type) {
            return Err(ReconcileError::MixedSources {
                expected: source_type,
                found: stray.source_type,
                external_id: stray.external_id.clone(),
            });
        }
        let received = videos.len();
        let distinct = collapse_duplicates(videos);

        let keys = distinct
            .iter()
            .map(|video| video.external_id.clone())
            .collect::<Vec<_>>();
        let existing = self
            .store
            .bulk_get_by_keys(source_type, keys)
            .await?
            .into_iter()
            .map(|record| (record.external_id, record.id))
            .collect::<HashMap<_, _>>();

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for descriptor in distinct {
            match existing.get(&descriptor.external_id) {
                Some(&id) => updates.push(VideoUpdate { id, descriptor }),
                None => inserts.push(descriptor),
            }
        }

        let outcome = self.store.batch_write(inserts, updates).await?;
        info!(
            source = %source_type,
            received,
            inserted = outcome.inserted.len(),
            updated = outcome.updated.len(),
            "batch reconciled"
        );
        Ok(ReconcileReport {
            source_type,
            received,
            inserted: outcome.inserted,
            updated: outcome.updated,
        })
    }
}

/// One entry per external id, at the position of its first occurrence,
/// carrying the payload of its last occurrence.
fn collapse_duplicates(videos: Vec<VideoDescriptor>) -> Vec<VideoDescriptor> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(videos.len());
    let mut ordered: Vec<VideoDescriptor> = Vec::with_capacity(videos.len());
    for video in videos {
        match positions.get(&video.external_id) {
            Some(&position) => ordered[position] = video,
            None => {
                positions.insert(video.external_id.clone(), ordered.len());
                ordered.push(video);
            }
        }
    }
    ordered
}

/// Persists discovered batches and, optionally, queues downloads for every
/// reconciled record that has no blob yet.
pub struct SaveBatchHandler {
    reconciler: BatchReconciler,
    auto_enqueue: bool,
}

impl SaveBatchHandler {
    pub const NAME: &'static str = "save_batch";

    pub fn new(reconciler: BatchReconciler, auto_enqueue: bool) -> Self {
        Self {
            reconciler,
            auto_enqueue,
        }
    }
}

#[async_trait]
impl EventHandler for SaveBatchHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn accepts(&self, kind: EventKind) -> bool {
        kind == EventKind::SaveBatch
    }

    async fn handle(&self, event: &PipelineEvent, emitter: &EventEmitter) -> HandlerResult {
        let PipelineEvent::SaveBatch {
            source_type,
            videos,
        } = event
        else {
            return Ok(());
        };
        let emit = |event: PipelineEvent| {
            emitter
                .emit(event)
                .map(|_| ())
                .map_err(|err| HandlerError::new(Self::NAME, err))
        };

        match self.reconciler.reconcile(videos.clone(), *source_type).await {
            Ok(report) => {
                if self.auto_enqueue {
                    for record in report.records().filter(|record| !record.has_blob()) {
                        emit(PipelineEvent::Download {
                            video: record.clone(),
                        })?;
                    }
                }
                Ok(())
            }
            Err(err) => {
                warn!(source = %source_type, size = videos.len(), error = %err, "batch write failed");
                let subject = ErrorSubject::Batch {
                    source_type: *source_type,
                    external_ids: videos.iter().map(|video| video.external_id.clone()).collect(),
                };
                emit(PipelineEvent::Error(ErrorRecord::new(
                    ErrorCategory::BatchWrite,
                    err.to_string(),
                    subject,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_keep_first_position_and_last_payload() {
        let batch = vec![
            VideoDescriptor::new(SourceType::JsonFeed, "a", "first a", "https://x/a"),
            VideoDescriptor::new(SourceType::JsonFeed, "b", "only b", "https://x/b"),
            VideoDescriptor::new(SourceType::JsonFeed, "a", "second a", "https://x/a"),
            VideoDescriptor::new(SourceType::JsonFeed, "a", "third a", "https://x/a"),
        ];
        let collapsed = collapse_duplicates(batch);
        let summary = collapsed
            .iter()
            .map(|video| (video.external_id.as_str(), video.title.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![("a", "third a"), ("b", "only b")]);
    }
}
