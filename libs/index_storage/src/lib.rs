//! Abstraction over the remote object store that holds index tables.
//!
//! An index "table" is a per-day bucket of index files. Within a table, files
//! are either *common* (useful to every tenant) or scoped to a single user.
//! The cache manager only ever needs to list tables, list the contents of a
//! table, and fetch individual files, so that is the entire surface here.
//!
//! Every operation takes a [`CancellationToken`]; implementations are
//! expected to return [`DownloadError::Cancelled`] promptly once it fires
//! rather than finishing the request.

mod local_fs;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub use self::local_fs::LocalFs;

/// Reference to a single file within a table, as named in remote storage.
///
/// Contents are opaque at this level; the cache manager downloads files
/// byte-for-byte and hands them to an opener it does not interpret.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexFile {
    pub name: String,
}

impl IndexFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The requested table or file does not exist in remote storage.
    #[error("resource not found")]
    NotFound,
    /// The operation was cancelled before completing.
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DownloadError {
    /// Shortcut for callers that must not log cancellations as failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

/// Client for the object store backing the index tables.
///
/// Listing calls may be served from an implementation-side cache;
/// `bypass_cache` forces a round-trip to storage. Download primitives always
/// go to storage.
#[async_trait::async_trait]
pub trait IndexStorageClient: Send + Sync + 'static {
    /// Names of all tables present in remote storage.
    async fn list_tables(&self, cancel: &CancellationToken)
        -> Result<Vec<String>, DownloadError>;

    /// Common files in `table`, plus the IDs of users that have per-user
    /// files in it.
    async fn list_files(
        &self,
        table: &str,
        bypass_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<(Vec<IndexFile>, Vec<String>), DownloadError>;

    /// Per-user files of `user_id` in `table`. A user without files is not an
    /// error; the result is simply empty.
    async fn list_user_files(
        &self,
        table: &str,
        user_id: &str,
        bypass_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexFile>, DownloadError>;

    /// Fetch a common file.
    async fn get_file(
        &self,
        table: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError>;

    /// Fetch a per-user file.
    async fn get_user_file(
        &self,
        table: &str,
        user_id: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError>;
}
