use std::path::{Path, PathBuf};

use tempfile::TempDir;

use reelhaul_core::catalog::{ErrorCategory, ErrorLog, SourceType, SqliteVideoStore, VideoStore};
use reelhaul_core::config::{load_ingest_config, EncoderKind, IngestConfig, SourceEntry};
use reelhaul_core::discovery::{DiscoveryError, DiscoveryParams};
use reelhaul_core::service::{IngestError, IngestRuntime};

fn fixture_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join(relative)
}

fn test_config(base: &TempDir) -> IngestConfig {
    let mut config = load_ingest_config(fixture_path("configs/ingest.toml")).unwrap();
    config.paths.base_dir = base.path().join("reelhaul").to_string_lossy().to_string();
    config.encoder.kind = EncoderKind::Concat;
    config.download.retry_delay_ms = [0, 0];
    config.download.auto_enqueue = false;
    config
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Three linked feed pages. Page two carries an item without an id.
fn write_feed(dir: &Path) -> String {
    std::fs::create_dir_all(dir).unwrap();
    let pages = [
        (
            "page1.json",
            r#"{"items":[
                {"id": 1, "title": "Harbour at dawn", "url": "watch/1", "stream_url": "media/1/index.m3u8",
                 "published_at": "2024-05-01T06:00:00Z"},
                {"id": "two", "title": "Night market", "url": "watch/2"}
            ], "next": "page2.json"}"#,
        ),
        (
            "page2.json",
            r#"{"items":[
                {"id": 3, "title": "Rooftops", "url": "watch/3"},
                {"title": "no identity", "url": "watch/x"},
                {"id": 4, "title": "Tram line", "url": "https://cdn.example.test/watch/4"}
            ], "next": "page3.json"}"#,
        ),
        (
            "page3.json",
            r#"{"items":[{"id": 5, "title": "Beyond the limit", "url": "watch/5"}]}"#,
        ),
    ];
    for (name, body) in pages {
        std::fs::write(dir.join(name), body).unwrap();
    }
    file_url(&dir.join("page1.json"))
}

#[tokio::test]
async fn json_feed_pass_persists_discovered_videos() {
    let base = TempDir::new().unwrap();
    let feed = write_feed(&base.path().join("feed"));
    let config = test_config(&base);
    let runtime = IngestRuntime::start(config.clone()).unwrap();

    let handle = runtime
        .service()
        .trigger_discovery(
            SourceType::JsonFeed,
            DiscoveryParams::default()
                .with_base_url(&feed)
                .with_max_pages(2),
        )
        .unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), 4);
    runtime.wait_idle().await;

    let store = SqliteVideoStore::new(config.videos_db_path()).unwrap();
    let records = store.scan_page(None, 50).await.unwrap();
    let ids = records
        .iter()
        .map(|record| record.external_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["1", "two", "3", "4"]);

    let first = &records[0];
    assert_eq!(first.title, "Harbour at dawn");
    assert!(first
        .real_url
        .as_deref()
        .unwrap()
        .ends_with("feed/media/1/index.m3u8"));
    assert_eq!(first.published_at.to_rfc3339(), "2024-05-01T06:00:00+00:00");
    assert!(records[1].real_url.is_none());
    assert_eq!(records[3].source_url, "https://cdn.example.test/watch/4");

    // A second pass over the same feed updates instead of duplicating.
    let again = runtime
        .service()
        .trigger_discovery(
            SourceType::JsonFeed,
            DiscoveryParams::default().with_base_url(&feed).with_max_pages(2),
        )
        .unwrap();
    assert_eq!(again.await.unwrap().unwrap(), 4);
    runtime.wait_idle().await;
    assert_eq!(store.count().unwrap(), 4);

    runtime.shutdown().await;
}

#[tokio::test]
async fn m3u_index_pass_uses_stream_urls() {
    let base = TempDir::new().unwrap();
    let listing = base.path().join("lists/index.m3u");
    std::fs::create_dir_all(listing.parent().unwrap()).unwrap();
    std::fs::write(
        &listing,
        "#EXTM3U\n\
         #EXTINF:-1 tvg-id=\"harbour\",Harbour cam\n\
         streams/harbour/index.m3u8\n\
         #EXTINF:-1,Untagged\n\
         https://cdn.example.test/untagged/index.m3u8\n",
    )
    .unwrap();
    let mut config = test_config(&base);
    config.sources.m3u_index = Some(SourceEntry {
        enabled: true,
        base_url: file_url(&listing),
        max_pages: 1,
    });
    let runtime = IngestRuntime::start(config.clone()).unwrap();

    let found = runtime
        .service()
        .trigger_discovery(SourceType::M3uIndex, DiscoveryParams::default())
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found, 2);
    runtime.wait_idle().await;

    let store = SqliteVideoStore::new(config.videos_db_path()).unwrap();
    let records = store.scan_page(None, 10).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].external_id, "harbour");
    assert_eq!(records[0].source_type, SourceType::M3uIndex);
    assert!(records[0].source_url.ends_with("lists/streams/harbour/index.m3u8"));
    assert_eq!(records[1].external_id.len(), 16);
    assert_eq!(records[1].title, "Untagged");

    runtime.shutdown().await;
}

#[tokio::test]
async fn unregistered_source_is_rejected_and_recorded() {
    let base = TempDir::new().unwrap();
    let config = test_config(&base);
    let runtime = IngestRuntime::start(config.clone()).unwrap();

    let err = runtime
        .service()
        .trigger_discovery(SourceType::M3uIndex, DiscoveryParams::default())
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::Discovery(DiscoveryError::UnknownSourceType(SourceType::M3uIndex))
    ));
    runtime.wait_idle().await;

    let errors = runtime
        .service()
        .recent_errors(Some(ErrorCategory::UnknownSourceType), 5)
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn unreachable_feed_records_discovery_error() {
    let base = TempDir::new().unwrap();
    let config = test_config(&base);
    let runtime = IngestRuntime::start(config.clone()).unwrap();

    let missing = file_url(&base.path().join("nowhere/page1.json"));
    let outcome = runtime
        .service()
        .trigger_discovery(
            SourceType::JsonFeed,
            DiscoveryParams::default().with_base_url(&missing),
        )
        .unwrap()
        .await
        .unwrap();
    assert!(matches!(outcome, Err(DiscoveryError::Fetch { .. })));
    runtime.wait_idle().await;

    let store = SqliteVideoStore::new(config.videos_db_path()).unwrap();
    let errors = store
        .recent_errors(Some(ErrorCategory::Discovery), 5)
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("nowhere/page1.json"));
    assert_eq!(store.count().unwrap(), 0);
    runtime.shutdown().await;
}
