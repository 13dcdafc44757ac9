use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("download of {url} failed: {cause}")]
    DownloadFailed { url: String, cause: String },
    #[error("encode failed for {}: {cause}", describe_video(.video_id))]
    EncodeFailed { video_id: Option<i64>, cause: String },
    #[error("upload failed for video {video_id}: {cause}")]
    UploadFailed { video_id: i64, cause: String },
    #[error("{url} answered with status {status}")]
    Http { url: String, status: u16 },
    #[error("network error fetching {url}: {message}")]
    Network {
        url: String,
        message: String,
        transient: bool,
    },
    #[error("unsupported manifest at {url}: {reason}")]
    UnsupportedManifest { url: String, reason: String },
    #[error("http client setup failed: {0}")]
    ClientSetup(String),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

fn describe_video(video_id: &Option<i64>) -> String {
    match video_id {
        Some(id) => format!("video {id}"),
        None => "ad-hoc output".to_string(),
    }
}

impl ProcessorError {
    pub(crate) fn network(url: &str, error: reqwest::Error) -> Self {
        let transient =
            error.is_timeout() || error.is_connect() || error.is_request() || error.is_body();
        ProcessorError::Network {
            url: url.to_string(),
            message: error.to_string(),
            transient,
        }
    }

    /// Whether repeating the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessorError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ProcessorError::Network { transient, .. } => *transient,
            ProcessorError::Storage(StorageError::Io { .. }) => true,
            ProcessorError::Catalog(CatalogError::Database(_))
            | ProcessorError::Catalog(CatalogError::OpenDatabase { .. })
            | ProcessorError::Catalog(CatalogError::Task(_)) => true,
            _ => false,
        }
    }
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let url = "https://cdn.example.test/a.ts".to_string();
        assert!(ProcessorError::Http {
            url: url.clone(),
            status: 503
        }
        .is_transient());
        assert!(ProcessorError::Http {
            url: url.clone(),
            status: 429
        }
        .is_transient());
        assert!(!ProcessorError::Http { url, status: 404 }.is_transient());
        assert!(!ProcessorError::Io {
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
            path: PathBuf::from("/missing.m3u8"),
        }
        .is_transient());
    }

    #[test]
    fn encode_failure_names_its_subject() {
        let err = ProcessorError::EncodeFailed {
            video_id: Some(9),
            cause: "bad sync byte".into(),
        };
        assert_eq!(err.to_string(), "encode failed for video 9: bad sync byte");
        let err = ProcessorError::EncodeFailed {
            video_id: None,
            cause: "x".into(),
        };
        assert_eq!(err.to_string(), "encode failed for ad-hoc output: x");
    }
}
