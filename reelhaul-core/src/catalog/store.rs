use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};

use super::models::{
    BatchWriteOutcome, ErrorCategory, ErrorRecord, SourceType, VideoDescriptor, VideoRecord,
    VideoUpdate,
};
use super::{CatalogError, CatalogResult};

const VIDEO_SCHEMA: &str = include_str!("../../../sql/videos.sql");

/// SQLite caps bound parameters per statement; key lookups are split below it.
const KEY_LOOKUP_CHUNK: usize = 500;

/// The primary record store. It is the only component that assigns internal ids.
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn bulk_get_by_keys(
        &self,
        source_type: SourceType,
        external_ids: Vec<String>,
    ) -> CatalogResult<Vec<VideoRecord>>;

    /// Applies every insert and update in one transaction, or none of them.
    async fn batch_write(
        &self,
        inserts: Vec<VideoDescriptor>,
        updates: Vec<VideoUpdate>,
    ) -> CatalogResult<BatchWriteOutcome>;

    async fn get_one(&self, id: i64) -> CatalogResult<Option<VideoRecord>>;

    /// Keyset page ordered by internal id, strictly after `after_id`.
    async fn scan_page(&self, after_id: Option<i64>, limit: usize)
        -> CatalogResult<Vec<VideoRecord>>;

    async fn set_stored_path(&self, id: i64, stored_path: String) -> CatalogResult<VideoRecord>;
}

#[async_trait]
pub trait ErrorLog: Send + Sync {
    async fn record_error(&self, record: ErrorRecord) -> CatalogResult<i64>;

    async fn recent_errors(
        &self,
        category: Option<ErrorCategory>,
        limit: usize,
    ) -> CatalogResult<Vec<ErrorRecord>>;
}

/// Lazily walks the whole catalog one page at a time.
pub fn scan_all(
    store: Arc<dyn VideoStore>,
    page_size: usize,
) -> BoxStream<'static, CatalogResult<Vec<VideoRecord>>> {
    let page_size = page_size.max(1);
    stream::try_unfold(
        (store, None::<i64>, false),
        move |(store, cursor, exhausted)| async move {
            if exhausted {
                return Ok::<_, CatalogError>(None);
            }
            let page = store.scan_page(cursor, page_size).await?;
            if page.is_empty() {
                return Ok(None);
            }
            let next = page.last().map(|record| record.id);
            let exhausted = page.len() < page_size;
            Ok(Some((page, (store, next, exhausted))))
        },
    )
    .boxed()
}

#[derive(Debug, Clone)]
pub struct SqliteVideoStoreBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for SqliteVideoStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl SqliteVideoStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> CatalogResult<SqliteVideoStore> {
        let path = self.path.ok_or(CatalogError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteVideoStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteVideoStore {
    path: PathBuf,
    flags: OpenFlags,
}

pub(crate) fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

impl SqliteVideoStore {
    pub fn builder() -> SqliteVideoStoreBuilder {
        SqliteVideoStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> CatalogResult<Self> {
        SqliteVideoStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> CatalogResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            CatalogError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| CatalogError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> CatalogResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(VIDEO_SCHEMA)?;
        Ok(())
    }

    pub fn fetch_by_keys(
        &self,
        source_type: SourceType,
        external_ids: &[String],
    ) -> CatalogResult<Vec<VideoRecord>> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let mut records = Vec::with_capacity(external_ids.len());
        for chunk in external_ids.chunks(KEY_LOOKUP_CHUNK) {
            let placeholders = (0..chunk.len())
                .map(|idx| format!("?{}", idx + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT * FROM videos WHERE source_type = ?1 AND external_id IN ({placeholders})"
            );
            let mut values = Vec::with_capacity(chunk.len() + 1);
            values.push(Value::Text(source_type.as_str().to_string()));
            values.extend(chunk.iter().map(|id| Value::Text(id.clone())));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), |row| VideoRecord::from_row(row))?
                .collect::<Result<Vec<_>, _>>()?;
            records.extend(rows);
        }
        Ok(records)
    }

    pub fn write_batch(
        &self,
        inserts: &[VideoDescriptor],
        updates: &[VideoUpdate],
    ) -> CatalogResult<BatchWriteOutcome> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        let mut inserted_ids = Vec::with_capacity(inserts.len());
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO videos (
                    source_type, external_id, title, source_url, real_url, stored_path,
                    published_at, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?7)",
            )?;
            for descriptor in inserts {
                insert.execute(params![
                    descriptor.source_type.as_str(),
                    &descriptor.external_id,
                    &descriptor.title,
                    &descriptor.source_url,
                    &descriptor.real_url,
                    descriptor.publish_time(),
                    now,
                ])?;
                inserted_ids.push(tx.last_insert_rowid());
            }

            // Absent optional fields keep the stored value.
            let mut update = tx.prepare_cached(
                "UPDATE videos
                 SET title = ?4,
                     source_url = ?5,
                     real_url = COALESCE(?6, real_url),
                     published_at = COALESCE(?7, published_at),
                     updated_at = MAX(updated_at, ?8)
                 WHERE id = ?1 AND source_type = ?2 AND external_id = ?3",
            )?;
            for change in updates {
                let descriptor = &change.descriptor;
                let affected = update.execute(params![
                    change.id,
                    descriptor.source_type.as_str(),
                    &descriptor.external_id,
                    &descriptor.title,
                    &descriptor.source_url,
                    &descriptor.real_url,
                    descriptor.published_at,
                    now,
                ])?;
                if affected != 1 {
                    return Err(CatalogError::PartialBatch {
                        id: change.id,
                        affected,
                    });
                }
            }
        }

        let mut outcome = BatchWriteOutcome::default();
        {
            let mut select = tx.prepare_cached("SELECT * FROM videos WHERE id = ?1")?;
            for id in inserted_ids {
                outcome
                    .inserted
                    .push(select.query_row([id], |row| VideoRecord::from_row(row))?);
            }
            for change in updates {
                outcome
                    .updated
                    .push(select.query_row([change.id], |row| VideoRecord::from_row(row))?);
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    pub fn fetch_by_id(&self, id: i64) -> CatalogResult<Option<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM videos WHERE id = ?1")?;
        let record = stmt
            .query_row([id], |row| VideoRecord::from_row(row))
            .optional()?;
        Ok(record)
    }

    pub fn fetch_page(&self, after_id: Option<i64>, limit: usize) -> CatalogResult<Vec<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM videos WHERE id > ?1 ORDER BY id ASC LIMIT ?2")?;
        let rows = stmt
            .query_map(params![after_id.unwrap_or(0), limit as i64], |row| {
                VideoRecord::from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_stored_path(&self, id: i64, stored_path: &str) -> CatalogResult<VideoRecord> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE videos
             SET stored_path = ?2, updated_at = MAX(updated_at, ?3)
             WHERE id = ?1",
            params![id, stored_path, Utc::now()],
        )?;
        if affected == 0 {
            return Err(CatalogError::NotFound { id });
        }
        let record = conn.query_row("SELECT * FROM videos WHERE id = ?1", [id], |row| {
            VideoRecord::from_row(row)
        })?;
        Ok(record)
    }

    pub fn count(&self) -> CatalogResult<usize> {
        let conn = self.open()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM videos", [], |row| row.get(0))?;
        Ok(total as usize)
    }

    pub fn insert_error(&self, record: &ErrorRecord) -> CatalogResult<i64> {
        let conn = self.open()?;
        let subject = serde_json::to_string(&record.subject)?;
        conn.execute(
            "INSERT INTO video_errors (category, message, subject, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.category.as_str(),
                &record.message,
                subject,
                record.created_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_errors(
        &self,
        category: Option<ErrorCategory>,
        limit: usize,
    ) -> CatalogResult<Vec<ErrorRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM video_errors
             WHERE (?1 IS NULL OR category = ?1)
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                (category.as_ref().map(ErrorCategory::as_str), limit as i64),
                |row| ErrorRecord::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn blocking<T, F>(&self, operation: F) -> CatalogResult<T>
    where
        T: Send + 'static,
        F: FnOnce(SqliteVideoStore) -> CatalogResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || operation(store)).await?
    }
}

#[async_trait]
impl VideoStore for SqliteVideoStore {
    async fn bulk_get_by_keys(
        &self,
        source_type: SourceType,
        external_ids: Vec<String>,
    ) -> CatalogResult<Vec<VideoRecord>> {
        self.blocking(move |store| store.fetch_by_keys(source_type, &external_ids))
            .await
    }

    async fn batch_write(
        &self,
        inserts: Vec<VideoDescriptor>,
        updates: Vec<VideoUpdate>,
    ) -> CatalogResult<BatchWriteOutcome> {
        self.blocking(move |store| store.write_batch(&inserts, &updates))
            .await
    }

    async fn get_one(&self, id: i64) -> CatalogResult<Option<VideoRecord>> {
        self.blocking(move |store| store.fetch_by_id(id)).await
    }

    async fn scan_page(
        &self,
        after_id: Option<i64>,
        limit: usize,
    ) -> CatalogResult<Vec<VideoRecord>> {
        self.blocking(move |store| store.fetch_page(after_id, limit))
            .await
    }

    async fn set_stored_path(&self, id: i64, stored_path: String) -> CatalogResult<VideoRecord> {
        self.blocking(move |store| store.update_stored_path(id, &stored_path))
            .await
    }
}

#[async_trait]
impl ErrorLog for SqliteVideoStore {
    async fn record_error(&self, record: ErrorRecord) -> CatalogResult<i64> {
        self.blocking(move |store| store.insert_error(&record)).await
    }

    async fn recent_errors(
        &self,
        category: Option<ErrorCategory>,
        limit: usize,
    ) -> CatalogResult<Vec<ErrorRecord>> {
        self.blocking(move |store| store.list_errors(category, limit))
            .await
    }
}
