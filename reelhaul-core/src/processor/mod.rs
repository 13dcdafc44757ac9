mod encoder;
mod error;
mod fetcher;
mod handlers;
mod manifest;
mod retry;
mod types;
mod uploader;

use std::path::{Path, PathBuf};

use tracing::info;

pub use encoder::{build_encoder, ConcatEncoder, Encoder, RemuxEncoder};
pub use error::{ProcessorError, ProcessorResult};
pub use fetcher::ManifestFetcher;
pub use handlers::{DownloadHandler, UploadHandler};
pub use retry::{FailureLog, RetryPolicy};
pub use types::{EncodedMedia, MediaContainer, MediaStream, OutputDescriptor};
pub use uploader::{object_path, split_stored_path, BlobUploader};

/// Fetches and encodes `url` into `destination` without touching any store.
pub async fn encode_url(
    fetcher: &ManifestFetcher,
    encoder: &dyn Encoder,
    url: &str,
    destination: &Path,
) -> ProcessorResult<PathBuf> {
    let stream = fetcher.fetch(url).await?;
    let scratch = reserve_scratch(fetcher.spool_dir(), encoder.extension())?;
    let media = encoder
        .encode(stream, &OutputDescriptor::ad_hoc(scratch))
        .await?;
    let path = media.persist(destination).await?;
    info!(url, path = %path.display(), encoder = encoder.name(), "ad-hoc encode complete");
    Ok(path)
}

/// Claims a unique file name in `dir` so concurrent ad-hoc encodes never
/// share an output path. The encoder overwrites the placeholder.
fn reserve_scratch(dir: &Path, extension: &str) -> ProcessorResult<PathBuf> {
    let io_err = |source| ProcessorError::Io {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let (_, path) = tempfile::Builder::new()
        .prefix("encode-")
        .suffix(&format!(".{extension}"))
        .tempfile_in(dir)
        .map_err(io_err)?
        .keep()
        .map_err(|err| io_err(err.error))?;
    Ok(path)
}
