//! Filesystem-backed [`IndexStorageClient`], for tests and local development.
//!
//! Layout mirrors the remote key scheme: `<root>/<table>/<file>` for common
//! files and `<root>/<table>/<user>/<file>` for per-user files. Listings are
//! never cached, so `bypass_cache` is accepted and ignored.

use std::io::ErrorKind;

use anyhow::Context;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

use crate::{DownloadError, IndexFile, IndexStorageClient};

pub struct LocalFs {
    storage_root: Utf8PathBuf,
}

impl LocalFs {
    /// Attempts to create local FS storage, along with its root directory.
    pub fn new(storage_root: Utf8PathBuf) -> anyhow::Result<Self> {
        if !storage_root.exists() {
            std::fs::create_dir_all(&storage_root).with_context(|| {
                format!("Failed to create all directories in the given path {storage_root:?}")
            })?;
        }
        Ok(Self { storage_root })
    }

    fn table_path(&self, table: &str) -> Utf8PathBuf {
        self.storage_root.join(table)
    }
}

fn entry_name(entry: &tokio::fs::DirEntry) -> anyhow::Result<String> {
    entry
        .file_name()
        .into_string()
        .map_err(|name| anyhow::anyhow!("non-utf8 storage entry name {name:?}"))
}

/// Lists `dir`, splitting entries into plain files and subdirectories.
/// A missing directory yields empty listings.
async fn list_dir(dir: &Utf8Path) -> Result<(Vec<IndexFile>, Vec<String>), DownloadError> {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((files, subdirs)),
        Err(e) => {
            return Err(DownloadError::Other(
                anyhow::Error::new(e).context(format!("Failed to list {dir:?}")),
            ))
        }
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to list {dir:?}"))?
    {
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("Failed to stat an entry of {dir:?}"))?;
        if file_type.is_dir() {
            subdirs.push(entry_name(&entry)?);
        } else {
            files.push(IndexFile::new(entry_name(&entry)?));
        }
    }
    Ok((files, subdirs))
}

async fn read_file(path: Utf8PathBuf) -> Result<Bytes, DownloadError> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Bytes::from(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(DownloadError::NotFound),
        Err(e) => Err(DownloadError::Other(
            anyhow::Error::new(e).context(format!("Failed to read {path:?}")),
        )),
    }
}

#[async_trait::async_trait]
impl IndexStorageClient for LocalFs {
    async fn list_tables(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let (_files, tables) = list_dir(&self.storage_root).await?;
        Ok(tables)
    }

    async fn list_files(
        &self,
        table: &str,
        _bypass_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<(Vec<IndexFile>, Vec<String>), DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        list_dir(&self.table_path(table)).await
    }

    async fn list_user_files(
        &self,
        table: &str,
        user_id: &str,
        _bypass_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexFile>, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let (files, _subdirs) = list_dir(&self.table_path(table).join(user_id)).await?;
        Ok(files)
    }

    async fn get_file(
        &self,
        table: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        read_file(self.table_path(table).join(file_name)).await
    }

    async fn get_user_file(
        &self,
        table: &str,
        user_id: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        read_file(self.table_path(table).join(user_id).join(file_name)).await
    }
}
