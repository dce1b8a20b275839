//! A locally cached index table.
//!
//! A [`Table`] owns one subdirectory of the cache root, named after the
//! table, and splits its contents into *index sets*: one set of files common
//! to all tenants, stored directly in the table directory, and one set per
//! user, stored in a subdirectory named after the user. The set is the unit
//! of download, read access and eviction, which lets readiness and TTL act
//! at per-tenant granularity without discarding shared data.
//!
//! Downloads happen on demand: the first reader (or a readiness pass) that
//! needs a set triggers exactly one listing-and-download, concurrent callers
//! wait for it. Periodic sync reconciles already-downloaded sets against the
//! remote listing. Readers iterate open files under a read lock, so sync and
//! eviction, which remove files under the write lock, can never delete a
//! file out from under an active reader.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use index_storage::{IndexFile, IndexStorageClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::QUERY_TIME_TABLE_DOWNLOAD_DURATION;

/// Suffix of in-flight downloads. A crash can leave these behind; they are
/// removed when the table is loaded again.
const TEMP_FILE_SUFFIX: &str = "temp_download";

/// An opened local index file, satisfying the iteration contract of
/// [`Table::for_each`]. The cache treats contents as opaque; query code
/// downcasts via [`OpenIndex::as_any`] to its concrete index type.
pub trait OpenIndex: Send + Sync {
    /// Local path of the backing file.
    fn path(&self) -> &Utf8Path;

    fn as_any(&self) -> &dyn std::any::Any;

    /// Releases the file without deleting it. Errors are reported, never
    /// retried.
    fn close(self: Box<Self>) -> anyhow::Result<()>;
}

/// Opens a downloaded file into an [`OpenIndex`]. Zero-length or truncated
/// files from a previous crash surface here as errors.
pub type OpenIndexFileFn =
    Arc<dyn Fn(&Utf8Path) -> anyhow::Result<Box<dyn OpenIndex>> + Send + Sync>;

/// Callback invoked by [`Table::for_each`] for every open index file of the
/// requested user and of the common set.
pub type ForEachCallback<'a> = &'a mut (dyn FnMut(&dyn OpenIndex) -> anyhow::Result<()> + Send);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum IndexSetId {
    Common,
    User(String),
}

impl std::fmt::Display for IndexSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexSetId::Common => f.write_str("common"),
            IndexSetId::User(user_id) => f.write_str(user_id),
        }
    }
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn temp_download_path(final_path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{final_path}.{TEMP_FILE_SUFFIX}"))
}

fn is_temp_file(name: &str) -> bool {
    name.ends_with(&format!(".{TEMP_FILE_SUFFIX}"))
}

/// The files of one (table, user) pair, or of the table's common part.
pub(crate) struct IndexSet {
    table_name: String,
    id: IndexSetId,
    /// The table directory for the common set, `<table_dir>/<user>` for
    /// per-user sets.
    dir: Utf8PathBuf,
    storage: Arc<dyn IndexStorageClient>,
    open_index_file: OpenIndexFileFn,
    /// Completed once the initial listing-and-download has succeeded.
    /// `get_or_try_init` admits one initializer at a time, which is what
    /// bounds concurrent downloads per (table, user) to one, and leaves the
    /// cell empty after a failure so the next caller retries.
    ready: tokio::sync::OnceCell<()>,
    /// Open index files by remote name. Removal requires the write lock.
    index: tokio::sync::RwLock<HashMap<String, Box<dyn OpenIndex>>>,
    /// Serializes sync passes over this set.
    sync_lock: tokio::sync::Mutex<()>,
    /// Unix seconds of the last read access.
    last_used_at: AtomicU64,
}

impl IndexSet {
    fn new(
        table_name: String,
        id: IndexSetId,
        table_dir: &Utf8Path,
        storage: Arc<dyn IndexStorageClient>,
        open_index_file: OpenIndexFileFn,
    ) -> Self {
        let dir = match &id {
            IndexSetId::Common => table_dir.to_owned(),
            IndexSetId::User(user_id) => table_dir.join(user_id),
        };
        Self {
            table_name,
            id,
            dir,
            storage,
            open_index_file,
            ready: tokio::sync::OnceCell::new(),
            index: tokio::sync::RwLock::new(HashMap::new()),
            sync_lock: tokio::sync::Mutex::new(()),
            last_used_at: AtomicU64::new(unix_seconds(SystemTime::now())),
        }
    }

    /// Wraps files already opened from disk at bootstrap; the set starts out
    /// ready and is reconciled against remote by the next sync.
    fn from_loaded(
        table_name: String,
        id: IndexSetId,
        table_dir: &Utf8Path,
        storage: Arc<dyn IndexStorageClient>,
        open_index_file: OpenIndexFileFn,
        files: HashMap<String, Box<dyn OpenIndex>>,
    ) -> Self {
        let mut set = Self::new(table_name, id, table_dir, storage, open_index_file);
        set.ready = tokio::sync::OnceCell::new_with(Some(()));
        set.index = tokio::sync::RwLock::new(files);
        set
    }

    fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    fn record_access(&self) {
        self.last_used_at
            .store(unix_seconds(SystemTime::now()), Ordering::Relaxed);
    }

    fn last_used_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.last_used_at.load(Ordering::Relaxed))
    }

    fn is_expired(&self, ttl: Duration, now: SystemTime) -> bool {
        // the last access can be in the future of `now` under clock skew, or
        // when a reader races this check; either way the set is not idle
        match now.duration_since(self.last_used_at()) {
            Ok(idle) => idle > ttl,
            Err(_) => false,
        }
    }

    async fn list_remote_files(
        &self,
        bypass_cache: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<IndexFile>> {
        let files = match &self.id {
            IndexSetId::Common => {
                let (files, _user_ids) = self
                    .storage
                    .list_files(&self.table_name, bypass_cache, cancel)
                    .await?;
                files
            }
            IndexSetId::User(user_id) => {
                self.storage
                    .list_user_files(&self.table_name, user_id, bypass_cache, cancel)
                    .await?
            }
        };
        Ok(files)
    }

    /// Downloads one file to a temp path, renames it into place and opens it.
    async fn download_file(
        &self,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Box<dyn OpenIndex>> {
        let bytes = match &self.id {
            IndexSetId::Common => {
                self.storage
                    .get_file(&self.table_name, file_name, cancel)
                    .await?
            }
            IndexSetId::User(user_id) => {
                self.storage
                    .get_user_file(&self.table_name, user_id, file_name, cancel)
                    .await?
            }
        };

        let final_path = self.dir.join(file_name);
        let temp_path = temp_download_path(&final_path);
        tokio::fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("write downloaded index to {temp_path:?}"))?;
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("rename {temp_path:?} to {final_path:?}"))?;

        (self.open_index_file)(&final_path)
            .with_context(|| format!("open downloaded index file {final_path:?}"))
    }

    async fn fetch_and_open(
        &self,
        names: Vec<String>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<(String, Box<dyn OpenIndex>)>> {
        let mut downloaded = Vec::with_capacity(names.len());
        for name in names {
            let open = self.download_file(&name, cancel).await?;
            downloaded.push((name, open));
        }
        Ok(downloaded)
    }

    /// Makes the set's files present locally. At most one download runs per
    /// set; concurrent callers wait on it, and a failed attempt is retried by
    /// the next caller.
    async fn ensure_ready(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        self.ready
            .get_or_try_init(|| async {
                let files = self.list_remote_files(false, cancel).await?;
                let missing: Vec<String> = {
                    let index = self.index.read().await;
                    files
                        .iter()
                        .filter(|f| !index.contains_key(&f.name))
                        .map(|f| f.name.clone())
                        .collect()
                };
                if missing.is_empty() {
                    return Ok(());
                }
                tokio::fs::create_dir_all(&self.dir)
                    .await
                    .with_context(|| format!("create index set directory {:?}", self.dir))?;
                let downloaded = self.fetch_and_open(missing, cancel).await?;
                let mut index = self.index.write().await;
                for (name, open) in downloaded {
                    index.insert(name, open);
                }
                anyhow::Ok(())
            })
            .await?;
        Ok(())
    }

    /// Reconciles local files against a fresh remote listing: fetches new
    /// files, drops files that no longer exist remotely. A set whose initial
    /// download has not completed is skipped; that download sees a current
    /// listing anyway.
    async fn sync(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        let _guard = self.sync_lock.lock().await;

        let files = self.list_remote_files(true, cancel).await?;
        let remote_names: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();
        let (missing, stale) = {
            let index = self.index.read().await;
            let missing: Vec<String> = files
                .iter()
                .filter(|f| !index.contains_key(&f.name))
                .map(|f| f.name.clone())
                .collect();
            let stale: Vec<String> = index
                .keys()
                .filter(|name| !remote_names.contains(name.as_str()))
                .cloned()
                .collect();
            (missing, stale)
        };
        if missing.is_empty() && stale.is_empty() {
            return Ok(());
        }

        // downloads run without holding the lock; only the map update and
        // the stale-file removal need to exclude readers
        if !missing.is_empty() {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .with_context(|| format!("create index set directory {:?}", self.dir))?;
        }
        let downloaded = self.fetch_and_open(missing, cancel).await?;

        let mut index = self.index.write().await;
        for (name, open) in downloaded {
            index.insert(name, open);
        }
        for name in stale {
            if let Some(open) = index.remove(&name) {
                if let Err(e) = open.close() {
                    warn!(
                        table = %self.table_name, index_set = %self.id,
                        "failed to close removed index file {name}: {e:#}"
                    );
                }
            }
            let path = self.dir.join(&name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("remove stale index file {path:?}")))
                }
            }
        }
        Ok(())
    }

    /// Invokes `callback` over every open file. Files stay on disk and in
    /// memory; only the access stamp changes.
    async fn for_each(&self, callback: ForEachCallback<'_>) -> anyhow::Result<()> {
        self.record_access();
        let index = self.index.read().await;
        for open in index.values() {
            callback(open.as_ref())?;
        }
        Ok(())
    }

    /// Closes every open file; with `delete_files` the on-disk copies (and,
    /// for per-user sets, the subdirectory) are removed too. Waits out any
    /// reader currently iterating the set.
    async fn unload(&self, delete_files: bool) -> anyhow::Result<()> {
        let mut index = self.index.write().await;
        for (name, open) in index.drain() {
            if let Err(e) = open.close() {
                warn!(
                    table = %self.table_name, index_set = %self.id,
                    "failed to close index file {name}: {e:#}"
                );
            }
            if delete_files {
                let path = self.dir.join(&name);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("remove index file {path:?}")))
                    }
                }
            }
        }
        if delete_files && matches!(self.id, IndexSetId::User(_)) {
            match tokio::fs::remove_dir_all(&self.dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("remove index set directory {:?}", self.dir)))
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .finish()
    }
}

/// One cached table: the collection of its index sets plus the directory
/// they live in. Owned exclusively by the table manager.
pub(crate) struct Table {
    name: String,
    dir: Utf8PathBuf,
    storage: Arc<dyn IndexStorageClient>,
    open_index_file: OpenIndexFileFn,
    index_sets: std::sync::RwLock<HashMap<IndexSetId, Arc<IndexSet>>>,
}

impl Table {
    /// Creates the table's directory and an empty table; files are fetched
    /// on demand.
    pub(crate) fn create(
        name: &str,
        cache_dir: &Utf8Path,
        storage: Arc<dyn IndexStorageClient>,
        open_index_file: OpenIndexFileFn,
    ) -> anyhow::Result<Self> {
        let dir = cache_dir.join(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create table directory {dir:?}"))?;
        Ok(Self {
            name: name.to_owned(),
            dir,
            storage,
            open_index_file,
            index_sets: std::sync::RwLock::new(HashMap::new()),
        })
    }

    /// Loads a table directory left by a previous run, opening every index
    /// file in it. Stray temp files from interrupted downloads are deleted;
    /// any other file that fails to open aborts the load.
    pub(crate) fn load(
        name: &str,
        cache_dir: &Utf8Path,
        storage: Arc<dyn IndexStorageClient>,
        open_index_file: OpenIndexFileFn,
    ) -> anyhow::Result<Self> {
        let table = Self::create(name, cache_dir, storage, open_index_file)?;

        let mut common_files = HashMap::new();
        let mut index_sets = HashMap::new();
        for entry in table
            .dir
            .read_dir_utf8()
            .with_context(|| format!("list table directory {:?}", table.dir))?
        {
            let entry = entry.with_context(|| format!("list table directory {:?}", table.dir))?;
            let file_type = entry
                .file_type()
                .with_context(|| format!("stat {:?}", entry.path()))?;
            if file_type.is_dir() {
                let user_id = entry.file_name().to_owned();
                let files = load_index_dir(entry.path(), &table.open_index_file)?;
                if files.is_empty() {
                    continue;
                }
                let id = IndexSetId::User(user_id);
                index_sets.insert(
                    id.clone(),
                    Arc::new(IndexSet::from_loaded(
                        table.name.clone(),
                        id,
                        &table.dir,
                        Arc::clone(&table.storage),
                        Arc::clone(&table.open_index_file),
                        files,
                    )),
                );
            } else {
                let file_name = entry.file_name().to_owned();
                if is_temp_file(&file_name) {
                    std::fs::remove_file(entry.path())
                        .with_context(|| format!("remove temp file {:?}", entry.path()))?;
                    continue;
                }
                let open = (table.open_index_file)(entry.path())
                    .with_context(|| format!("open index file {:?}", entry.path()))?;
                common_files.insert(file_name, open);
            }
        }
        if !common_files.is_empty() {
            index_sets.insert(
                IndexSetId::Common,
                Arc::new(IndexSet::from_loaded(
                    table.name.clone(),
                    IndexSetId::Common,
                    &table.dir,
                    Arc::clone(&table.storage),
                    Arc::clone(&table.open_index_file),
                    common_files,
                )),
            );
        }
        *table.index_sets.write().unwrap() = index_sets;
        Ok(table)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index_sets.read().unwrap().is_empty()
    }

    pub(crate) fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Resolving a set counts as an access, and the stamp must land while
    /// the map lock is held: eviction re-checks expiry under the write lock
    /// before unloading, so a set handed out here can never be drained
    /// between the caller's resolve and its read.
    fn get_or_create_index_set(&self, id: IndexSetId) -> Arc<IndexSet> {
        {
            let index_sets = self.index_sets.read().unwrap();
            if let Some(set) = index_sets.get(&id) {
                set.record_access();
                return Arc::clone(set);
            }
        }
        let mut index_sets = self.index_sets.write().unwrap();
        // another caller may have won the race between the locks
        if let Some(set) = index_sets.get(&id) {
            set.record_access();
            return Arc::clone(set);
        }
        let set = Arc::new(IndexSet::new(
            self.name.clone(),
            id.clone(),
            &self.dir,
            Arc::clone(&self.storage),
            Arc::clone(&self.open_index_file),
        ));
        index_sets.insert(id, Arc::clone(&set));
        set
    }

    /// Guarantees the user's files and the common files are present locally,
    /// then invokes `callback` over each open index file of both sets.
    pub(crate) async fn for_each(
        &self,
        cancel: &CancellationToken,
        user_id: &str,
        callback: ForEachCallback<'_>,
    ) -> anyhow::Result<()> {
        let sets = [
            self.get_or_create_index_set(IndexSetId::User(user_id.to_owned())),
            self.get_or_create_index_set(IndexSetId::Common),
        ];
        for set in &sets {
            if !set.is_ready() {
                // account time a query spends blocked on downloads
                let started_at = std::time::Instant::now();
                let res = set.ensure_ready(cancel).await;
                QUERY_TIME_TABLE_DOWNLOAD_DURATION
                    .with_label_values(&[&self.name])
                    .inc_by(started_at.elapsed().as_secs_f64());
                res?;
            }
        }
        for set in &sets {
            set.for_each(callback).await?;
        }
        Ok(())
    }

    /// [`Table::for_each`] minus the callback: pre-downloads the common set
    /// and every listed user's set.
    pub(crate) async fn ensure_query_readiness(
        &self,
        cancel: &CancellationToken,
        users: &[String],
    ) -> anyhow::Result<()> {
        self.get_or_create_index_set(IndexSetId::Common)
            .ensure_ready(cancel)
            .await?;
        for user_id in users {
            self.get_or_create_index_set(IndexSetId::User(user_id.clone()))
                .ensure_ready(cancel)
                .await?;
        }
        Ok(())
    }

    /// Reconciles every index set against the remote listing. Stops at the
    /// first failing set; the remaining ones are retried on the next tick.
    pub(crate) async fn sync(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let sets: Vec<Arc<IndexSet>> =
            self.index_sets.read().unwrap().values().cloned().collect();
        for set in sets {
            set.sync(cancel)
                .await
                .with_context(|| format!("sync index set {} of table {}", set.id, self.name))?;
        }
        Ok(())
    }

    /// Drops index sets idle for longer than `ttl`, deleting their files.
    /// Returns whether the table has nothing left and can itself be dropped.
    pub(crate) async fn drop_unused_index(
        &self,
        ttl: Duration,
        now: SystemTime,
    ) -> anyhow::Result<bool> {
        let sets: Vec<(IndexSetId, Arc<IndexSet>)> = self
            .index_sets
            .read()
            .unwrap()
            .iter()
            .map(|(id, set)| (id.clone(), Arc::clone(set)))
            .collect();
        for (id, set) in sets {
            if !set.is_expired(ttl, now) {
                continue;
            }
            // unlink from the map before touching files, so concurrent
            // readers build a fresh set instead of finding this one half
            // gone. The expiry re-check under the write lock pairs with
            // get_or_create_index_set stamping access under the same lock:
            // a set resolved by a reader is re-stamped before this point.
            let unlinked = {
                let mut index_sets = self.index_sets.write().unwrap();
                match index_sets.get(&id) {
                    Some(current)
                        if Arc::ptr_eq(current, &set) && set.is_expired(ttl, now) =>
                    {
                        index_sets.remove(&id);
                        true
                    }
                    _ => false,
                }
            };
            if unlinked {
                info!(table = %self.name, index_set = %id, "dropping expired index");
                set.unload(true).await?;
            }
        }
        Ok(self.index_sets.read().unwrap().is_empty())
    }

    /// Moves every index set's last access into the past, as if the table
    /// had sat idle for `by`.
    #[cfg(test)]
    pub(crate) fn age_index_sets(&self, by: Duration) {
        for set in self.index_sets.read().unwrap().values() {
            let aged = set.last_used_at() - by;
            set.last_used_at.store(unix_seconds(aged), Ordering::Relaxed);
        }
    }

    /// Releases all in-memory file references; on-disk files stay.
    pub(crate) async fn close(&self) {
        let sets: Vec<Arc<IndexSet>> = self
            .index_sets
            .write()
            .unwrap()
            .drain()
            .map(|(_id, set)| set)
            .collect();
        for set in sets {
            if let Err(e) = set.unload(false).await {
                warn!(table = %self.name, "failed to close index set: {e:#}");
            }
        }
    }
}

fn load_index_dir(
    dir: &Utf8Path,
    open_index_file: &OpenIndexFileFn,
) -> anyhow::Result<HashMap<String, Box<dyn OpenIndex>>> {
    let mut files = HashMap::new();
    for entry in dir
        .read_dir_utf8()
        .with_context(|| format!("list index directory {dir:?}"))?
    {
        let entry = entry.with_context(|| format!("list index directory {dir:?}"))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {:?}", entry.path()))?;
        if file_type.is_dir() {
            warn!("unexpected directory inside index set, ignoring: {:?}", entry.path());
            continue;
        }
        let file_name = entry.file_name().to_owned();
        if is_temp_file(&file_name) {
            std::fs::remove_file(entry.path())
                .with_context(|| format!("remove temp file {:?}", entry.path()))?;
            continue;
        }
        let open = open_index_file(entry.path())
            .with_context(|| format!("open index file {:?}", entry.path()))?;
        files.insert(file_name, open);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        open_test_index, RecordingStorageClient, RefusingStorageClient, TestHarness, TestIndex,
    };

    fn collect_into(seen: &mut Vec<String>) -> impl FnMut(&dyn OpenIndex) -> anyhow::Result<()> + Send + '_ {
        |index| {
            let index = index
                .as_any()
                .downcast_ref::<TestIndex>()
                .expect("test indexes only");
            seen.push(index.contents.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn downloads_on_demand_and_serves_repeat_reads_locally() {
        let h = TestHarness::new();
        h.seed_remote("t1/common.idx", "common");
        h.seed_remote("t1/user-a/a1.idx", "a1");
        h.seed_remote("t1/user-b/b1.idx", "b1");
        let storage = RecordingStorageClient::wrap(h.storage());
        let cancel = CancellationToken::new();

        let table = Table::create(
            "t1",
            &h.cache_dir(),
            storage.clone(),
            open_test_index(),
        )
        .unwrap();

        let mut seen = Vec::new();
        table
            .for_each(&cancel, "user-a", &mut collect_into(&mut seen))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a1", "common"]);
        assert_eq!(storage.downloads_of("t1/user-a/a1.idx"), 1);
        assert_eq!(storage.downloads_of("t1/common.idx"), 1);
        // nothing asked for user-b yet
        assert_eq!(storage.downloads_of("t1/user-b/b1.idx"), 0);
        assert!(h.cache_dir().join("t1/common.idx").exists());
        assert!(h.cache_dir().join("t1/user-a/a1.idx").exists());

        // a second read is served from the already-open files
        let downloads_before = storage.download_count();
        let mut seen = Vec::new();
        table
            .for_each(&cancel, "user-a", &mut collect_into(&mut seen))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a1", "common"]);
        assert_eq!(storage.download_count(), downloads_before);

        // another user only fetches its own files, the common set is shared
        let mut seen = Vec::new();
        table
            .for_each(&cancel, "user-b", &mut collect_into(&mut seen))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["b1", "common"]);
        assert_eq!(storage.downloads_of("t1/user-b/b1.idx"), 1);
        assert_eq!(storage.downloads_of("t1/common.idx"), 1);
    }

    #[tokio::test]
    async fn sync_reconciles_local_files_against_remote() {
        let h = TestHarness::new();
        h.seed_remote("t1/c1.idx", "c1");
        h.seed_remote("t1/user-a/a1.idx", "a1");
        let storage = RecordingStorageClient::wrap(h.storage());
        let cancel = CancellationToken::new();

        let table =
            Table::create("t1", &h.cache_dir(), storage.clone(), open_test_index()).unwrap();
        let mut seen = Vec::new();
        table
            .for_each(&cancel, "user-a", &mut collect_into(&mut seen))
            .await
            .unwrap();

        // remote moves on: a common file appears, the user file is replaced
        h.seed_remote("t1/c2.idx", "c2");
        h.seed_remote("t1/user-a/a2.idx", "a2");
        std::fs::remove_file(h.remote_root().join("t1/user-a/a1.idx")).unwrap();

        table.sync(&cancel).await.unwrap();

        let mut seen = Vec::new();
        table
            .for_each(&cancel, "user-a", &mut collect_into(&mut seen))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a2", "c1", "c2"]);
        assert!(!h.cache_dir().join("t1/user-a/a1.idx").exists());
        assert!(h.cache_dir().join("t1/user-a/a2.idx").exists());

        // an unchanged remote makes the next sync a no-op
        let downloads_before = storage.download_count();
        table.sync(&cancel).await.unwrap();
        assert_eq!(storage.download_count(), downloads_before);
    }

    #[tokio::test]
    async fn drop_unused_index_reaps_only_expired_sets() {
        let h = TestHarness::new();
        h.seed_remote("t1/c1.idx", "c1");
        h.seed_remote("t1/user-a/a1.idx", "a1");
        let storage = RecordingStorageClient::wrap(h.storage());
        let cancel = CancellationToken::new();
        let ttl = Duration::from_secs(3600);

        let table =
            Table::create("t1", &h.cache_dir(), storage.clone(), open_test_index()).unwrap();
        let mut seen = Vec::new();
        table
            .for_each(&cancel, "user-a", &mut collect_into(&mut seen))
            .await
            .unwrap();

        // everything was accessed just now
        let is_empty = table
            .drop_unused_index(ttl, SystemTime::now())
            .await
            .unwrap();
        assert!(!is_empty);
        assert!(h.cache_dir().join("t1/user-a/a1.idx").exists());

        // two hours later nothing has been touched again
        let later = SystemTime::now() + Duration::from_secs(2 * 3600);
        let is_empty = table.drop_unused_index(ttl, later).await.unwrap();
        assert!(is_empty);
        assert!(!h.cache_dir().join("t1/user-a").exists());
        assert!(!h.cache_dir().join("t1/c1.idx").exists());
        // the table directory itself is the manager's to remove
        assert!(h.cache_dir().join("t1").exists());
    }

    #[tokio::test]
    async fn resolving_an_index_set_shields_it_from_eviction() {
        let h = TestHarness::new();
        h.seed_remote("t1/c1.idx", "c1");
        h.seed_remote("t1/user-a/a1.idx", "a1");
        let storage = RecordingStorageClient::wrap(h.storage());
        let cancel = CancellationToken::new();
        let ttl = Duration::from_secs(3600);

        let table =
            Table::create("t1", &h.cache_dir(), storage.clone(), open_test_index()).unwrap();
        let mut seen = Vec::new();
        table
            .for_each(&cancel, "user-a", &mut collect_into(&mut seen))
            .await
            .unwrap();

        // idle long enough to be eviction candidates
        table.age_index_sets(Duration::from_secs(2 * 3600));

        // resolving the sets re-stamps them, so a reader that has the sets
        // in hand cannot have its files reaped before it iterates
        table
            .ensure_query_readiness(&cancel, &["user-a".to_string()])
            .await
            .unwrap();
        let is_empty = table
            .drop_unused_index(ttl, SystemTime::now())
            .await
            .unwrap();
        assert!(!is_empty);
        assert!(h.cache_dir().join("t1/user-a/a1.idx").exists());
        assert!(h.cache_dir().join("t1/c1.idx").exists());

        // with no interleaved resolve the aged sets do get reaped
        table.age_index_sets(Duration::from_secs(2 * 3600));
        let is_empty = table
            .drop_unused_index(ttl, SystemTime::now())
            .await
            .unwrap();
        assert!(is_empty);
        assert!(!h.cache_dir().join("t1/user-a").exists());
    }

    #[tokio::test]
    async fn load_serves_cached_files_without_storage_access() {
        let h = TestHarness::new();
        h.seed_cache("t1/c1.idx", "c1");
        h.seed_cache("t1/user-a/a1.idx", "a1");
        // leftovers of downloads interrupted by a crash
        h.seed_cache("t1/c2.idx.temp_download", "partial");
        h.seed_cache("t1/user-a/a2.idx.temp_download", "partial");
        let cancel = CancellationToken::new();

        let table = Table::load(
            "t1",
            &h.cache_dir(),
            Arc::new(RefusingStorageClient),
            open_test_index(),
        )
        .unwrap();
        assert!(!h.cache_dir().join("t1/c2.idx.temp_download").exists());
        assert!(!h.cache_dir().join("t1/user-a/a2.idx.temp_download").exists());

        let mut seen = Vec::new();
        table
            .for_each(&cancel, "user-a", &mut collect_into(&mut seen))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a1", "c1"]);

        // a user with nothing on disk needs storage, which this client refuses
        let mut noop = |_: &dyn OpenIndex| anyhow::Ok(());
        assert!(table.for_each(&cancel, "user-z", &mut noop).await.is_err());
    }

    #[tokio::test]
    async fn load_rejects_partially_written_files() {
        let h = TestHarness::new();
        h.seed_cache("t1/c1.idx", "");
        let err = Table::load(
            "t1",
            &h.cache_dir(),
            Arc::new(RefusingStorageClient),
            open_test_index(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("empty index file"));
    }
}
