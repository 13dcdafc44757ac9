mod sync;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::store::configure_connection;
use crate::catalog::{CatalogError, SourceType, VideoRecord};

pub use sync::{IndexSynchronizer, SyncReport};

const INDEX_SCHEMA: &str = include_str!("../../../sql/search_index.sql");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to open index at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("catalog scan failed: {0}")]
    Catalog(#[from] CatalogError),
    #[error("index task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for IndexError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexError::Task(err.to_string())
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    PublishedAt,
    CreatedAt,
    UpdatedAt,
    Title,
    Id,
}

impl SortField {
    fn column(&self) -> &'static str {
        match self {
            SortField::PublishedAt => "published_at",
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Title => "title",
            SortField::Id => "id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// Filters, ordering and paging for the read path. Pages are 1-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexQuery {
    pub title: Option<String>,
    pub source_type: Option<SourceType>,
    pub sort: SortField,
    pub direction: SortDirection,
    pub page: usize,
    pub size: usize,
}

impl Default for IndexQuery {
    fn default() -> Self {
        Self {
            title: None,
            source_type: None,
            sort: SortField::default(),
            direction: SortDirection::default(),
            page: 1,
            size: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexPage {
    pub total: u64,
    pub page: usize,
    pub size: usize,
    pub records: Vec<VideoRecord>,
}

/// Secondary, eventually consistent copy of the catalog.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Inserts or replaces every record, keyed by internal id.
    async fn bulk_upsert(&self, records: &[VideoRecord]) -> IndexResult<usize>;

    async fn query(&self, query: &IndexQuery) -> IndexResult<IndexPage>;
}

#[derive(Debug, Clone)]
pub struct SqliteSearchIndex {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSearchIndex {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> IndexResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            IndexError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| IndexError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> IndexResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| IndexError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(INDEX_SCHEMA)?;
        Ok(())
    }

    pub fn upsert_documents(&self, records: &[VideoRecord]) -> IndexResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let indexed_at = Utc::now();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO video_documents (
                    id, source_type, external_id, title, source_url, real_url, stored_path,
                    published_at, created_at, updated_at, indexed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(id) DO UPDATE SET
                    source_type = excluded.source_type,
                    external_id = excluded.external_id,
                    title = excluded.title,
                    source_url = excluded.source_url,
                    real_url = excluded.real_url,
                    stored_path = excluded.stored_path,
                    published_at = excluded.published_at,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    indexed_at = excluded.indexed_at",
            )?;
            for record in records {
                stmt.execute(params![
                    record.id,
                    record.source_type.as_str(),
                    &record.external_id,
                    &record.title,
                    &record.source_url,
                    &record.real_url,
                    &record.stored_path,
                    record.published_at,
                    record.created_at,
                    record.updated_at,
                    indexed_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn search(&self, query: &IndexQuery) -> IndexResult<IndexPage> {
        let conn = self.open()?;
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(title) = query.title.as_deref().filter(|title| !title.trim().is_empty()) {
            values.push(Value::Text(format!("%{}%", escape_like(title.trim()))));
            clauses.push(format!("title LIKE ?{} ESCAPE '\\'", values.len()));
        }
        if let Some(source) = query.source_type {
            values.push(Value::Text(source.as_str().to_string()));
            clauses.push(format!("source_type = ?{}", values.len()));
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM video_documents {filter}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let size = query.size.max(1);
        let page = query.page.max(1);
        let direction = match query.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        let offset = (page - 1).saturating_mul(size);
        values.push(Value::Integer(i64::try_from(size).unwrap_or(i64::MAX)));
        let limit_idx = values.len();
        values.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
        let offset_idx = values.len();
        let sql = format!(
            "SELECT id, source_type, external_id, title, source_url, real_url, stored_path,
                    published_at, created_at, updated_at
             FROM video_documents {filter}
             ORDER BY {column} {direction}, id {direction}
             LIMIT ?{limit_idx} OFFSET ?{offset_idx}",
            column = query.sort.column(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values.iter()), |row| VideoRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IndexPage {
            total: total as u64,
            page,
            size,
            records,
        })
    }

    pub fn document_count(&self) -> IndexResult<usize> {
        let conn = self.open()?;
        let total: i64 =
            conn.query_row("SELECT COUNT(*) FROM video_documents", [], |row| row.get(0))?;
        Ok(total as usize)
    }

    async fn blocking<T, F>(&self, operation: F) -> IndexResult<T>
    where
        T: Send + 'static,
        F: FnOnce(SqliteSearchIndex) -> IndexResult<T> + Send + 'static,
    {
        let index = self.clone();
        tokio::task::spawn_blocking(move || operation(index)).await?
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl SearchIndex for SqliteSearchIndex {
    async fn bulk_upsert(&self, records: &[VideoRecord]) -> IndexResult<usize> {
        let records = records.to_vec();
        self.blocking(move |index| index.upsert_documents(&records))
            .await
    }

    async fn query(&self, query: &IndexQuery) -> IndexResult<IndexPage> {
        let query = query.clone();
        self.blocking(move |index| index.search(&query)).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn record(id: i64, title: &str, source_type: SourceType, day: u32) -> VideoRecord {
        let published = Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap();
        VideoRecord {
            id,
            external_id: format!("ext-{id}"),
            source_type,
            title: title.to_string(),
            source_url: format!("https://example.test/{id}"),
            real_url: None,
            stored_path: None,
            published_at: published,
            created_at: published + Duration::hours(1),
            updated_at: published + Duration::hours(1),
        }
    }

    fn seeded_index(dir: &tempfile::TempDir) -> SqliteSearchIndex {
        let index = SqliteSearchIndex::new(dir.path().join("index/search.sqlite"));
        index.initialize().unwrap();
        index
            .upsert_documents(&[
                record(1, "Harbour at dawn", SourceType::JsonFeed, 1),
                record(2, "City lights", SourceType::M3uIndex, 3),
                record(3, "harbour cranes", SourceType::JsonFeed, 2),
                record(4, "100% organic", SourceType::JsonFeed, 4),
            ])
            .unwrap();
        index
    }

    #[test]
    fn default_query_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded_index(&dir);
        let page = index.search(&IndexQuery::default()).unwrap();
        assert_eq!(page.total, 4);
        let ids = page.records.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![4, 2, 3, 1]);
    }

    #[test]
    fn title_filter_is_case_insensitive_and_literal() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded_index(&dir);
        let query = IndexQuery {
            title: Some("HARBOUR".into()),
            sort: SortField::Id,
            direction: SortDirection::Asc,
            ..IndexQuery::default()
        };
        let ids = index
            .search(&query)
            .unwrap()
            .records
            .iter()
            .map(|r| r.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3]);

        let percent = IndexQuery {
            title: Some("0%".into()),
            ..IndexQuery::default()
        };
        assert_eq!(index.search(&percent).unwrap().total, 1);
    }

    #[test]
    fn source_filter_and_paging() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded_index(&dir);
        let query = IndexQuery {
            source_type: Some(SourceType::JsonFeed),
            page: 2,
            size: 2,
            ..IndexQuery::default()
        };
        let page = index.search(&query).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, 1);
    }

    #[test]
    fn page_far_past_the_end_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded_index(&dir);
        let query = IndexQuery {
            page: usize::MAX,
            size: 50,
            ..IndexQuery::default()
        };
        let page = index.search(&query).unwrap();
        assert_eq!(page.total, 4);
        assert!(page.records.is_empty());
    }

    #[test]
    fn upsert_replaces_existing_document() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded_index(&dir);
        let mut changed = record(2, "City lights (remastered)", SourceType::M3uIndex, 3);
        changed.stored_path = Some("videos/m3u_index/2.mp4".into());
        index.upsert_documents(&[changed]).unwrap();
        assert_eq!(index.document_count().unwrap(), 4);
        let query = IndexQuery {
            title: Some("remastered".into()),
            ..IndexQuery::default()
        };
        let page = index.search(&query).unwrap();
        assert_eq!(
            page.records[0].stored_path.as_deref(),
            Some("videos/m3u_index/2.mp4")
        );
    }
}
