use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;

use reelhaul_core::catalog::{
    ErrorCategory, ErrorRecord, ErrorSubject, SourceType, SqliteVideoStore, VideoDescriptor,
    VideoRecord,
};
use reelhaul_core::events::{
    EventDispatcher, EventEmitter, EventHandler, EventKind, HandlerResult, PipelineEvent,
};
use reelhaul_core::index::{
    IndexError, IndexPage, IndexQuery, IndexResult, IndexSynchronizer, SearchIndex,
    SqliteSearchIndex,
};

/// Records every chunk it receives and fails the configured call numbers.
#[derive(Default)]
struct RecordingIndex {
    calls: Mutex<Vec<Vec<i64>>>,
    fail_on: Vec<usize>,
}

impl RecordingIndex {
    fn failing_on(calls: &[usize]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: calls.to_vec(),
        }
    }

    async fn chunk_sizes(&self) -> Vec<usize> {
        self.calls.lock().await.iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl SearchIndex for RecordingIndex {
    async fn bulk_upsert(&self, records: &[VideoRecord]) -> IndexResult<usize> {
        let mut calls = self.calls.lock().await;
        calls.push(records.iter().map(|record| record.id).collect());
        if self.fail_on.contains(&calls.len()) {
            return Err(IndexError::Task(format!("injected failure on call {}", calls.len())));
        }
        Ok(records.len())
    }

    async fn query(&self, _query: &IndexQuery) -> IndexResult<IndexPage> {
        Ok(IndexPage {
            total: 0,
            page: 1,
            size: 0,
            records: Vec::new(),
        })
    }
}

#[derive(Default)]
struct ErrorCollector {
    seen: Mutex<Vec<ErrorRecord>>,
}

#[async_trait]
impl EventHandler for ErrorCollector {
    fn name(&self) -> &'static str {
        "collector"
    }

    fn accepts(&self, kind: EventKind) -> bool {
        kind == EventKind::Error
    }

    async fn handle(&self, event: &PipelineEvent, _emitter: &EventEmitter) -> HandlerResult {
        if let PipelineEvent::Error(record) = event {
            self.seen.lock().await.push(record.clone());
        }
        Ok(())
    }
}

fn seeded_store(base: &TempDir, total: usize) -> Arc<SqliteVideoStore> {
    let store = SqliteVideoStore::new(base.path().join("videos.sqlite")).unwrap();
    store.initialize().unwrap();
    let descriptors = (0..total)
        .map(|n| {
            VideoDescriptor::new(
                SourceType::JsonFeed,
                format!("item-{n}"),
                format!("Item {n}"),
                format!("https://feeds.example.test/watch/{n}"),
            )
        })
        .collect::<Vec<_>>();
    if !descriptors.is_empty() {
        store.write_batch(&descriptors, &[]).unwrap();
    }
    Arc::new(store)
}

#[tokio::test]
async fn pass_flushes_bounded_chunks_covering_catalog() {
    let base = TempDir::new().unwrap();
    let store = seeded_store(&base, 2500);
    let index = Arc::new(RecordingIndex::default());
    let synchronizer = IndexSynchronizer::new(store.clone(), index.clone(), 1000, 300);

    let report = synchronizer.sync().await.unwrap().unwrap();

    assert_eq!(index.chunk_sizes().await, vec![1000, 1000, 500]);
    assert_eq!(report.scanned, 2500);
    assert_eq!(report.indexed, 2500);
    assert_eq!(report.chunks, 3);
    assert!(report.failed_chunks.is_empty());

    let seen = index
        .calls
        .lock()
        .await
        .iter()
        .flatten()
        .copied()
        .collect::<HashSet<_>>();
    let stored = store
        .fetch_page(None, 5000)
        .unwrap()
        .into_iter()
        .map(|record| record.id)
        .collect::<HashSet<_>>();
    assert_eq!(seen, stored);
}

#[tokio::test]
async fn exact_multiple_skips_empty_trailing_chunk() {
    let base = TempDir::new().unwrap();
    let store = seeded_store(&base, 2000);
    let index = Arc::new(RecordingIndex::default());
    let report = IndexSynchronizer::new(store, index.clone(), 1000, 1000)
        .run_pass()
        .await
        .unwrap();
    assert_eq!(index.chunk_sizes().await, vec![1000, 1000]);
    assert_eq!(report.chunks, 2);
}

#[tokio::test]
async fn empty_catalog_makes_no_index_calls() {
    let base = TempDir::new().unwrap();
    let store = seeded_store(&base, 0);
    let index = Arc::new(RecordingIndex::default());
    let report = IndexSynchronizer::new(store, index.clone(), 1000, 500)
        .run_pass()
        .await
        .unwrap();
    assert!(index.chunk_sizes().await.is_empty());
    assert_eq!(report.scanned, 0);
    assert_eq!(report.chunks, 0);
}

#[tokio::test]
async fn failed_chunk_is_reported_and_pass_continues() {
    let base = TempDir::new().unwrap();
    let store = seeded_store(&base, 2500);
    let index = Arc::new(RecordingIndex::failing_on(&[2]));
    let collector = Arc::new(ErrorCollector::default());
    let dispatcher = EventDispatcher::builder()
        .shared_handler(collector.clone())
        .start();

    let report = IndexSynchronizer::new(store, index.clone(), 1000, 400)
        .with_emitter(dispatcher.emitter())
        .run_pass()
        .await
        .unwrap();
    dispatcher.wait_idle().await;

    assert_eq!(index.chunk_sizes().await, vec![1000, 1000, 500]);
    assert_eq!(report.failed_chunks, vec![2]);
    assert_eq!(report.indexed, 1500);

    let seen = collector.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].category, ErrorCategory::IndexChunk);
    let chunk_ids = index.calls.lock().await[1].clone();
    assert_eq!(
        seen[0].subject,
        ErrorSubject::IndexChunk {
            chunk: 2,
            first_id: chunk_ids.first().copied(),
            last_id: chunk_ids.last().copied(),
        }
    );
    drop(seen);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn sqlite_index_reflects_catalog_after_pass() {
    let base = TempDir::new().unwrap();
    let store = seeded_store(&base, 42);
    let index = SqliteSearchIndex::new(base.path().join("index.sqlite"));
    index.initialize().unwrap();
    let index = Arc::new(index);

    let synchronizer = IndexSynchronizer::new(store, index.clone(), 10, 7);
    synchronizer.run_pass().await.unwrap();
    // A second pass replaces documents instead of duplicating them.
    let report = synchronizer.run_pass().await.unwrap();

    assert_eq!(report.chunks, 5);
    assert_eq!(index.document_count().unwrap(), 42);
    let page = index
        .query(&IndexQuery {
            title: Some("item 4".into()),
            ..IndexQuery::default()
        })
        .await
        .unwrap();
    // "Item 4" plus "Item 40" and "Item 41".
    assert_eq!(page.total, 3);
}
