pub mod discover;
pub mod download;
pub mod errors;
pub mod index;
pub mod media;

pub use discover::DiscoverArgs;
pub use download::DownloadArgs;
pub use errors::ErrorsArgs;
pub use index::SearchArgs;
pub use media::{EncodeArgs, WatchArgs};
