use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::catalog::{scan_all, ErrorCategory, ErrorRecord, ErrorSubject, VideoRecord, VideoStore};
use crate::events::{EventEmitter, PipelineEvent};

use super::{IndexResult, SearchIndex};

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub scanned: usize,
    pub indexed: usize,
    pub chunks: usize,
    pub failed_chunks: Vec<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            scanned: 0,
            indexed: 0,
            chunks: 0,
            failed_chunks: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }
}

/// Copies the catalog into the search index in bounded chunks.
#[derive(Clone)]
pub struct IndexSynchronizer {
    store: Arc<dyn VideoStore>,
    index: Arc<dyn SearchIndex>,
    emitter: Option<EventEmitter>,
    chunk_size: usize,
    page_size: usize,
}

impl IndexSynchronizer {
    pub fn new(
        store: Arc<dyn VideoStore>,
        index: Arc<dyn SearchIndex>,
        chunk_size: usize,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            index,
            emitter: None,
            chunk_size: chunk_size.max(1),
            page_size: page_size.max(1),
        }
    }

    /// Failed chunks are also reported as error events through `emitter`.
    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Starts a pass in the background and returns immediately.
    pub fn sync(&self) -> JoinHandle<IndexResult<SyncReport>> {
        let synchronizer = self.clone();
        tokio::spawn(async move { synchronizer.run_pass().await })
    }

    /// Runs a pass every `period`, starting now, until the handle is aborted.
    pub fn spawn_periodic(&self, period: Duration) -> JoinHandle<()> {
        let synchronizer = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = synchronizer.run_pass().await {
                    error!(error = %err, "periodic index sync failed");
                }
            }
        })
    }

    /// One full pass. A failed chunk is recorded and skipped; only a failure
    /// to read the catalog ends the pass early.
    pub async fn run_pass(&self) -> IndexResult<SyncReport> {
        let mut report = SyncReport::begin();
        let mut pages = scan_all(self.store.clone(), self.page_size);
        let mut buffer = Vec::with_capacity(self.chunk_size);
        while let Some(page) = pages.next().await {
            let page = page?;
            report.scanned += page.len();
            for record in page {
                buffer.push(record);
                if buffer.len() == self.chunk_size {
                    let chunk = std::mem::replace(&mut buffer, Vec::with_capacity(self.chunk_size));
                    self.flush(chunk, &mut report).await;
                }
            }
        }
        if !buffer.is_empty() {
            self.flush(buffer, &mut report).await;
        }
        report.finished_at = Utc::now();
        info!(
            scanned = report.scanned,
            indexed = report.indexed,
            chunks = report.chunks,
            failed = report.failed_chunks.len(),
            "index sync pass complete"
        );
        Ok(report)
    }

    async fn flush(&self, chunk: Vec<VideoRecord>, report: &mut SyncReport) {
        report.chunks += 1;
        let number = report.chunks;
        let first_id = chunk.first().map(|record| record.id);
        let last_id = chunk.last().map(|record| record.id);
        match self.index.bulk_upsert(&chunk).await {
            Ok(written) => report.indexed += written,
            Err(err) => {
                warn!(chunk = number, size = chunk.len(), ?first_id, ?last_id, error = %err, "index chunk failed");
                report.failed_chunks.push(number);
                if let Some(emitter) = &self.emitter {
                    let record = ErrorRecord::new(
                        ErrorCategory::IndexChunk,
                        err.to_string(),
                        ErrorSubject::IndexChunk {
                            chunk: number,
                            first_id,
                            last_id,
                        },
                    );
                    if let Err(dispatch) = emitter.emit(PipelineEvent::Error(record)) {
                        warn!(chunk = number, error = %dispatch, "could not report failed chunk");
                    }
                }
            }
        }
    }
}
