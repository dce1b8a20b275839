//! Shared harness for table and manager tests: tempdir-backed "remote"
//! storage, a trivial index-file format, and a recording storage client for
//! download accounting and shutdown choreography.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use index_storage::{DownloadError, IndexFile, IndexStorageClient, LocalFs};
use tokio_util::sync::CancellationToken;

use crate::config::{IndexCacheConfig, Limits, QueryReadyLimits};
use crate::table::{OpenIndex, OpenIndexFileFn};

/// An index file is just its contents; `open` fails on empty files the way a
/// real format opener fails on a partial write.
pub(crate) struct TestIndex {
    path: Utf8PathBuf,
    pub(crate) contents: String,
}

impl OpenIndex for TestIndex {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn close(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

pub(crate) fn open_test_index() -> OpenIndexFileFn {
    Arc::new(|path| {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;
        if contents.is_empty() {
            anyhow::bail!("empty index file {path:?}");
        }
        Ok(Box::new(TestIndex {
            path: path.to_owned(),
            contents,
        }) as Box<dyn OpenIndex>)
    })
}

pub(crate) struct TestHarness {
    remote_dir: Utf8TempDir,
    cache_dir_parent: Utf8TempDir,
}

impl TestHarness {
    pub(crate) fn new() -> Self {
        init_logging();
        Self {
            remote_dir: camino_tempfile::tempdir().unwrap(),
            cache_dir_parent: camino_tempfile::tempdir().unwrap(),
        }
    }

    pub(crate) fn remote_root(&self) -> &Utf8Path {
        self.remote_dir.path()
    }

    pub(crate) fn cache_dir(&self) -> Utf8PathBuf {
        self.cache_dir_parent.path().join("cache")
    }

    pub(crate) fn seed_remote(&self, rel: &str, contents: &str) {
        seed(self.remote_root(), rel, contents);
    }

    pub(crate) fn seed_cache(&self, rel: &str, contents: &str) {
        seed(&self.cache_dir(), rel, contents);
    }

    pub(crate) fn storage(&self) -> Arc<LocalFs> {
        Arc::new(LocalFs::new(self.remote_root().to_owned()).unwrap())
    }

    /// Intervals are long enough that background ticks never interfere with
    /// a test driving the maintenance entry points directly.
    pub(crate) fn conf(&self, query_ready_num_days: usize) -> IndexCacheConfig {
        IndexCacheConfig {
            cache_dir: self.cache_dir(),
            sync_interval: Duration::from_secs(3600),
            cache_ttl: Duration::from_secs(3600),
            query_ready_num_days,
        }
    }
}

fn seed(root: &Utf8Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// Best-effort; every harness construction attempts it and only the first
/// one in the process wins.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Default)]
pub(crate) struct TestLimits {
    pub(crate) default: QueryReadyLimits,
    pub(crate) by_user: HashMap<String, QueryReadyLimits>,
}

impl TestLimits {
    pub(crate) fn none() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_default(num_days: usize) -> Arc<Self> {
        Arc::new(Self {
            default: QueryReadyLimits {
                query_ready_index_num_days: num_days,
            },
            by_user: HashMap::new(),
        })
    }

    pub(crate) fn with_override(user_id: &str, num_days: usize) -> Arc<Self> {
        Arc::new(Self {
            default: QueryReadyLimits::default(),
            by_user: HashMap::from([(
                user_id.to_owned(),
                QueryReadyLimits {
                    query_ready_index_num_days: num_days,
                },
            )]),
        })
    }
}

impl Limits for TestLimits {
    fn default_limits(&self) -> QueryReadyLimits {
        self.default
    }

    fn by_user_id(&self) -> HashMap<String, QueryReadyLimits> {
        self.by_user.clone()
    }
}

/// Wraps a storage client, counting downloads per remote key and letting a
/// test block all storage calls by holding the gate's write half.
pub(crate) struct RecordingStorageClient {
    inner: Arc<dyn IndexStorageClient>,
    downloads: Mutex<HashMap<String, usize>>,
    list_calls: AtomicUsize,
    gate: Arc<tokio::sync::RwLock<()>>,
}

impl RecordingStorageClient {
    pub(crate) fn wrap(inner: Arc<dyn IndexStorageClient>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            downloads: Mutex::new(HashMap::new()),
            list_calls: AtomicUsize::new(0),
            gate: Arc::new(tokio::sync::RwLock::new(())),
        })
    }

    /// Total downloads, across all keys.
    pub(crate) fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().values().sum()
    }

    /// Download count for one remote key (`table/file` or
    /// `table/user/file`).
    pub(crate) fn downloads_of(&self, key: &str) -> usize {
        self.downloads.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub(crate) fn downloaded_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.downloads.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::Relaxed)
    }

    /// While the returned guard lives, every storage call blocks.
    pub(crate) async fn block_storage(&self) -> tokio::sync::OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.gate).write_owned().await
    }

    fn record_download(&self, key: String) {
        *self.downloads.lock().unwrap().entry(key).or_insert(0) += 1;
    }
}

#[async_trait::async_trait]
impl IndexStorageClient for RecordingStorageClient {
    async fn list_tables(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DownloadError> {
        let _pass = self.gate.read().await;
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.list_tables(cancel).await
    }

    async fn list_files(
        &self,
        table: &str,
        bypass_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<(Vec<IndexFile>, Vec<String>), DownloadError> {
        let _pass = self.gate.read().await;
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.list_files(table, bypass_cache, cancel).await
    }

    async fn list_user_files(
        &self,
        table: &str,
        user_id: &str,
        bypass_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexFile>, DownloadError> {
        let _pass = self.gate.read().await;
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        self.inner
            .list_user_files(table, user_id, bypass_cache, cancel)
            .await
    }

    async fn get_file(
        &self,
        table: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        let _pass = self.gate.read().await;
        self.record_download(format!("{table}/{file_name}"));
        self.inner.get_file(table, file_name, cancel).await
    }

    async fn get_user_file(
        &self,
        table: &str,
        user_id: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        let _pass = self.gate.read().await;
        self.record_download(format!("{table}/{user_id}/{file_name}"));
        self.inner
            .get_user_file(table, user_id, file_name, cancel)
            .await
    }
}

/// A client that refuses every call; used to prove a path performs no
/// storage access at all.
pub(crate) struct RefusingStorageClient;

#[async_trait::async_trait]
impl IndexStorageClient for RefusingStorageClient {
    async fn list_tables(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>, DownloadError> {
        Err(DownloadError::Other(anyhow::anyhow!(
            "unexpected storage access"
        )))
    }

    async fn list_files(
        &self,
        table: &str,
        _bypass_cache: bool,
        _cancel: &CancellationToken,
    ) -> Result<(Vec<IndexFile>, Vec<String>), DownloadError> {
        Err(DownloadError::Other(anyhow::anyhow!(
            "unexpected storage access: list_files {table}"
        )))
    }

    async fn list_user_files(
        &self,
        table: &str,
        user_id: &str,
        _bypass_cache: bool,
        _cancel: &CancellationToken,
    ) -> Result<Vec<IndexFile>, DownloadError> {
        Err(DownloadError::Other(anyhow::anyhow!(
            "unexpected storage access: list_user_files {table}/{user_id}"
        )))
    }

    async fn get_file(
        &self,
        table: &str,
        file_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        Err(DownloadError::Other(anyhow::anyhow!(
            "unexpected storage access: get_file {table}/{file_name}"
        )))
    }

    async fn get_user_file(
        &self,
        table: &str,
        user_id: &str,
        file_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        Err(DownloadError::Other(anyhow::anyhow!(
            "unexpected storage access: get_user_file {table}/{user_id}/{file_name}"
        )))
    }
}
