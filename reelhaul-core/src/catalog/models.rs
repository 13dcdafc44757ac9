use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::CatalogError;

/// Sites the crawlers know how to walk. Stored as text in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    JsonFeed,
    M3uIndex,
}

impl SourceType {
    pub const ALL: [SourceType; 2] = [SourceType::JsonFeed, SourceType::M3uIndex];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::JsonFeed => "json_feed",
            SourceType::M3uIndex => "m3u_index",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json_feed" | "json-feed" => Ok(SourceType::JsonFeed),
            "m3u_index" | "m3u-index" => Ok(SourceType::M3uIndex),
            other => Err(CatalogError::InvalidSourceType(other.to_string())),
        }
    }
}

/// A video as seen by a crawler, before the catalog has assigned it an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoDescriptor {
    pub external_id: String,
    pub source_type: SourceType,
    pub title: String,
    pub source_url: String,
    pub real_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

impl VideoDescriptor {
    pub fn new(
        source_type: SourceType,
        external_id: impl Into<String>,
        title: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            source_type,
            title: title.into(),
            source_url: source_url.into(),
            real_url: None,
            published_at: None,
            discovered_at: Utc::now(),
        }
    }

    pub fn with_real_url(mut self, real_url: impl Into<String>) -> Self {
        self.real_url = Some(real_url.into());
        self
    }

    pub fn publish_time(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.discovered_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoRecord {
    pub id: i64,
    pub external_id: String,
    pub source_type: SourceType,
    pub title: String,
    pub source_url: String,
    pub real_url: Option<String>,
    pub stored_path: Option<String>,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let source_raw: String = row.get("source_type")?;
        let source_type = source_raw.parse::<SourceType>().map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;
        Ok(Self {
            id: row.get("id")?,
            external_id: row.get("external_id")?,
            source_type,
            title: row.get("title")?,
            source_url: row.get("source_url")?,
            real_url: row.get("real_url")?,
            stored_path: row.get("stored_path")?,
            published_at: row.get("published_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// The URL the fetcher should pull: the resolved direct URL when the
    /// crawler found one, otherwise the page it came from.
    pub fn download_url(&self) -> &str {
        self.real_url.as_deref().unwrap_or(&self.source_url)
    }

    pub fn has_blob(&self) -> bool {
        self.stored_path
            .as_deref()
            .map(|path| !path.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Overwrite of an existing row, addressed by its internal id.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoUpdate {
    pub id: i64,
    pub descriptor: VideoDescriptor,
}

#[derive(Debug, Clone, Default)]
pub struct BatchWriteOutcome {
    pub inserted: Vec<VideoRecord>,
    pub updated: Vec<VideoRecord>,
}

impl BatchWriteOutcome {
    pub fn written(&self) -> usize {
        self.inserted.len() + self.updated.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &VideoRecord> {
        self.inserted.iter().chain(self.updated.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    UnknownSourceType,
    Discovery,
    Download,
    Encode,
    Upload,
    BatchWrite,
    IndexChunk,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UnknownSourceType => "unknown_source_type",
            ErrorCategory::Discovery => "discovery",
            ErrorCategory::Download => "download",
            ErrorCategory::Encode => "encode",
            ErrorCategory::Upload => "upload",
            ErrorCategory::BatchWrite => "batch_write",
            ErrorCategory::IndexChunk => "index_chunk",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown_source_type" => Ok(ErrorCategory::UnknownSourceType),
            "discovery" => Ok(ErrorCategory::Discovery),
            "download" => Ok(ErrorCategory::Download),
            "encode" => Ok(ErrorCategory::Encode),
            "upload" => Ok(ErrorCategory::Upload),
            "batch_write" => Ok(ErrorCategory::BatchWrite),
            "index_chunk" => Ok(ErrorCategory::IndexChunk),
            other => Err(CatalogError::InvalidCategory(other.to_string())),
        }
    }
}

/// What an error record points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorSubject {
    Video {
        video_id: i64,
        source_type: SourceType,
        external_id: String,
    },
    Descriptor {
        descriptor: VideoDescriptor,
    },
    Batch {
        source_type: SourceType,
        external_ids: Vec<String>,
    },
    Source {
        source_type: SourceType,
    },
    Url {
        url: String,
    },
    IndexChunk {
        chunk: usize,
        first_id: Option<i64>,
        last_id: Option<i64>,
    },
}

impl ErrorSubject {
    pub fn video(record: &VideoRecord) -> Self {
        ErrorSubject::Video {
            video_id: record.id,
            source_type: record.source_type,
            external_id: record.external_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub id: Option<i64>,
    pub category: ErrorCategory,
    pub message: String,
    pub subject: ErrorSubject,
    pub created_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(category: ErrorCategory, message: impl Into<String>, subject: ErrorSubject) -> Self {
        Self {
            id: None,
            category,
            message: message.into(),
            subject,
            created_at: Utc::now(),
        }
    }

    pub fn for_video(
        category: ErrorCategory,
        record: &VideoRecord,
        message: impl Into<String>,
    ) -> Self {
        Self::new(category, message, ErrorSubject::video(record))
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let category_raw: String = row.get("category")?;
        let subject_raw: String = row.get("subject")?;
        let category = category_raw.parse::<ErrorCategory>().map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;
        let subject = serde_json::from_str(&subject_raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;
        Ok(Self {
            id: row.get("id")?,
            category,
            message: row.get("message")?,
            subject,
            created_at: row.get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_round_trips_through_text() {
        for source in SourceType::ALL {
            assert_eq!(source.as_str().parse::<SourceType>().unwrap(), source);
        }
        assert!("youtube".parse::<SourceType>().is_err());
    }

    #[test]
    fn descriptor_falls_back_to_discovery_time() {
        let descriptor = VideoDescriptor::new(SourceType::JsonFeed, "42", "t", "https://a/42");
        assert_eq!(descriptor.publish_time(), descriptor.discovered_at);
    }

    #[test]
    fn error_subject_serializes_with_kind_tag() {
        let subject = ErrorSubject::IndexChunk {
            chunk: 2,
            first_id: Some(1001),
            last_id: Some(2000),
        };
        let json = serde_json::to_value(&subject).unwrap();
        assert_eq!(json["kind"], "index_chunk");
        assert_eq!(json["chunk"], 2);
    }
}
