//! The table manager: owns the collection of cached [`Table`]s and the
//! single background task that keeps them fresh.
//!
//! Bootstrap loads every table directory found under the cache root, makes
//! the tables recent queries are expected to need ready, and only then
//! starts serving; a restart therefore picks up exactly the cache a previous
//! process left behind. The background task drives three activities off two
//! timers: reconciling cached tables against the remote listing and topping
//! up query readiness on every `sync_interval` tick, and dropping tables
//! whose index has been idle past the TTL on a fixed hourly tick.
//!
//! The `tables` map sits behind a `std::sync::RwLock` that is never held
//! across an await: lookups and inserts touch the map only (creating a
//! table's directory is the one piece of I/O allowed under the write lock),
//! while sync and cleanup snapshot the `Arc<Table>`s and release the lock
//! before doing any storage or file I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::Context;
use index_storage::{DownloadError, IndexStorageClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{IndexCacheConfig, Limits, OwnsTenantFn, CACHE_CLEANUP_INTERVAL};
use crate::metrics::{
    QUERY_READINESS_DURATION, TABLES_SYNC_DURATION, TABLES_SYNC_OPERATIONS,
};
use crate::readiness::{active_table_number, table_number_from_name, users_for_query_readiness};
use crate::table::{ForEachCallback, OpenIndexFileFn, Table};
use crate::tasks::{warn_when_period_overrun, BackgroundLoopKind};

pub struct TableManager {
    conf: IndexCacheConfig,
    limits: Arc<dyn Limits>,
    storage: Arc<dyn IndexStorageClient>,
    open_index_file: OpenIndexFileFn,
    owns_tenant: Option<OwnsTenantFn>,
    tables: std::sync::RwLock<HashMap<String, Arc<Table>>>,
    cancel: CancellationToken,
    background_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TableManager {
    /// Creates the cache directory if needed, loads every table already on
    /// disk, runs one query-readiness pass and starts the background loop.
    /// The manager serves reads as soon as this returns. On failure all file
    /// references picked up by the partial bootstrap are released and no
    /// manager is produced.
    pub async fn new(
        conf: IndexCacheConfig,
        limits: Arc<dyn Limits>,
        storage: Arc<dyn IndexStorageClient>,
        open_index_file: OpenIndexFileFn,
        owns_tenant: Option<OwnsTenantFn>,
    ) -> anyhow::Result<Arc<Self>> {
        // a zero period would panic inside the background task's timer, long
        // after this call has returned Ok
        if conf.sync_interval.is_zero() {
            anyhow::bail!("sync_interval must be positive");
        }
        std::fs::create_dir_all(&conf.cache_dir)
            .with_context(|| format!("create cache directory {:?}", conf.cache_dir))?;

        let manager = Arc::new(Self {
            conf,
            limits,
            storage,
            open_index_file,
            owns_tenant,
            tables: std::sync::RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            background_task: std::sync::Mutex::new(None),
        });

        if let Err(e) = manager.init().await {
            manager.close_all_tables().await;
            return Err(e);
        }

        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.background_loop().await }
        });
        *manager.background_task.lock().unwrap() = Some(task);

        Ok(manager)
    }

    async fn init(&self) -> anyhow::Result<()> {
        self.load_local_tables()?;
        self.ensure_query_readiness(&self.cancel)
            .await
            .context("initial query readiness")?;
        Ok(())
    }

    fn load_local_tables(&self) -> anyhow::Result<()> {
        let mut tables = HashMap::new();
        for entry in self
            .conf
            .cache_dir
            .read_dir_utf8()
            .with_context(|| format!("list cache directory {:?}", self.conf.cache_dir))?
        {
            let entry =
                entry.with_context(|| format!("list cache directory {:?}", self.conf.cache_dir))?;
            if !entry
                .file_type()
                .with_context(|| format!("stat {:?}", entry.path()))?
                .is_dir()
            {
                warn!("unexpected file at cache root, ignoring: {:?}", entry.path());
                continue;
            }
            let name = entry.file_name().to_owned();
            let table = Table::load(
                &name,
                &self.conf.cache_dir,
                Arc::clone(&self.storage),
                Arc::clone(&self.open_index_file),
            )
            .with_context(|| format!("load table {name}"))?;
            tables.insert(name, Arc::new(table));
        }
        if !tables.is_empty() {
            info!(count = tables.len(), "loaded local tables");
        }
        *self.tables.write().unwrap() = tables;
        Ok(())
    }

    /// Resolves or creates the table, then iterates the user's and the
    /// common index files, downloading them first if need be.
    pub async fn for_each(
        &self,
        cancel: &CancellationToken,
        table_name: &str,
        user_id: &str,
        callback: ForEachCallback<'_>,
    ) -> anyhow::Result<()> {
        let table = self.get_or_create_table(table_name)?;
        table.for_each(cancel, user_id, callback).await
    }

    /// Cancels the background loop, waits for it to exit, then closes every
    /// table. On-disk files stay for the next process.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.background_task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("background loop task failed: {e}");
                }
            }
        }
        self.close_all_tables().await;
        info!("table manager stopped");
    }

    async fn close_all_tables(&self) {
        let tables: Vec<Arc<Table>> = self
            .tables
            .write()
            .unwrap()
            .drain()
            .map(|(_name, table)| table)
            .collect();
        for table in tables {
            table.close().await;
        }
    }

    /// Read-locked lookup first; on miss, re-check under the write lock so
    /// concurrent callers for a new table agree on one object. Creating the
    /// directory is the only I/O done while the lock is held; downloads
    /// happen later, inside the table.
    fn get_or_create_table(&self, table_name: &str) -> anyhow::Result<Arc<Table>> {
        if let Some(table) = self.tables.read().unwrap().get(table_name) {
            return Ok(Arc::clone(table));
        }
        let mut tables = self.tables.write().unwrap();
        if let Some(table) = tables.get(table_name) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(Table::create(
            table_name,
            &self.conf.cache_dir,
            Arc::clone(&self.storage),
            Arc::clone(&self.open_index_file),
        )?);
        tables.insert(table_name.to_owned(), Arc::clone(&table));
        Ok(table)
    }

    async fn background_loop(&self) {
        let mut sync_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.conf.sync_interval,
            self.conf.sync_interval,
        );
        sync_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cleanup_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + CACHE_CLEANUP_INTERVAL,
            CACHE_CLEANUP_INTERVAL,
        );
        cleanup_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("background loop exiting");
                    return;
                }
                _ = sync_ticker.tick() => {
                    let iteration = async {
                        let started_at = Instant::now();
                        match self.sync_tables(&self.cancel).await {
                            Ok(()) => {}
                            Err(e) if is_cancelled_error(&e) => {}
                            Err(e) => warn!("failed to sync tables: {e:#}"),
                        }
                        // readiness runs after sync: it may create tables the
                        // sync pass has no need to revisit this tick
                        match self.ensure_query_readiness(&self.cancel).await {
                            Ok(()) => {}
                            Err(e) if is_cancelled_error(&e) => {}
                            Err(e) => warn!("failed to ensure query readiness: {e:#}"),
                        }
                        warn_when_period_overrun(
                            started_at.elapsed(),
                            self.conf.sync_interval,
                            BackgroundLoopKind::TableSync,
                        );
                    };
                    // racing against cancellation aborts in-flight work even
                    // when a storage client fails to honor the token
                    tokio::select! {
                        _ = iteration => {}
                        _ = self.cancel.cancelled() => {
                            debug!("background loop exiting");
                            return;
                        }
                    }
                }
                _ = cleanup_ticker.tick() => {
                    let iteration = async {
                        let started_at = Instant::now();
                        match self.cleanup_cache(SystemTime::now()).await {
                            Ok(()) => {}
                            Err(e) if is_cancelled_error(&e) => {}
                            Err(e) => warn!("failed to clean up cache: {e:#}"),
                        }
                        warn_when_period_overrun(
                            started_at.elapsed(),
                            CACHE_CLEANUP_INTERVAL,
                            BackgroundLoopKind::CacheCleanup,
                        );
                    };
                    tokio::select! {
                        _ = iteration => {}
                        _ = self.cancel.cancelled() => {
                            debug!("background loop exiting");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Reconciles every cached table against the remote listing. Stops at
    /// the first failing table; already-synced tables remain valid.
    pub(crate) async fn sync_tables(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let started_at = Instant::now();
        let result = self.sync_tables0(cancel).await;
        match &result {
            Err(e) if is_cancelled_error(e) => {}
            Ok(()) => {
                TABLES_SYNC_OPERATIONS.with_label_values(&["success"]).inc();
                TABLES_SYNC_DURATION.set(started_at.elapsed().as_secs_f64());
            }
            Err(_) => {
                TABLES_SYNC_OPERATIONS.with_label_values(&["failure"]).inc();
                TABLES_SYNC_DURATION.set(started_at.elapsed().as_secs_f64());
            }
        }
        result
    }

    async fn sync_tables0(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let tables: Vec<Arc<Table>> = self.tables.read().unwrap().values().cloned().collect();
        debug!(count = tables.len(), "syncing tables");
        for table in tables {
            table
                .sync(cancel)
                .await
                .with_context(|| format!("sync table {}", table.name()))?;
        }
        Ok(())
    }

    /// Drops per-user and common index that nothing has read for
    /// `cache_ttl`, and forgets tables that end up empty.
    pub(crate) async fn cleanup_cache(&self, now: SystemTime) -> anyhow::Result<()> {
        let tables: Vec<(String, Arc<Table>)> = self
            .tables
            .read()
            .unwrap()
            .iter()
            .map(|(name, table)| (name.clone(), Arc::clone(table)))
            .collect();
        for (name, table) in tables {
            let empty = table
                .drop_unused_index(self.conf.cache_ttl, now)
                .await
                .with_context(|| format!("drop unused index of table {name}"))?;
            if !empty {
                continue;
            }
            let removed = {
                let mut map = self.tables.write().unwrap();
                match map.get(&name) {
                    // a concurrent reader may have resurrected an index set
                    // in this table; keep it in that case
                    Some(current) if Arc::ptr_eq(current, &table) && table.is_empty() => {
                        map.remove(&name);
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                info!(table = %name, "dropping table, index unused within ttl");
                match tokio::fs::remove_dir_all(table.dir()).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("remove table directory {:?}", table.dir())))
                    }
                }
            }
        }
        Ok(())
    }

    /// Pre-downloads the tables and per-user index that recent queries are
    /// expected to hit, per the configured and per-tenant look-back windows
    /// and the shard-ownership predicate.
    pub(crate) async fn ensure_query_readiness(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let active_table_number = active_table_number(SystemTime::now());

        let default_num_days = self.limits.default_limits().query_ready_index_num_days;
        // only explicitly-set, non-zero overrides participate in the per-user map
        let mut query_readiness_num_by_user_id = HashMap::new();
        let mut largest_num_days = self.conf.query_ready_num_days.max(default_num_days);
        for (user_id, limits) in self.limits.by_user_id() {
            let num_days = limits.query_ready_index_num_days;
            if num_days == 0 {
                continue;
            }
            largest_num_days = largest_num_days.max(num_days);
            query_readiness_num_by_user_id.insert(user_id, num_days);
        }
        // no tenant wants readiness: skip even the remote listing
        if largest_num_days == 0 {
            return Ok(());
        }

        let _timer = QUERY_READINESS_DURATION.start_timer();

        let table_names = self.storage.list_tables(cancel).await?;
        for table_name in table_names {
            let Some(table_number) = table_number_from_name(&table_name) else {
                continue;
            };
            if active_table_number - table_number > largest_num_days as i64 {
                continue;
            }

            let (_files, users_with_index) =
                self.storage.list_files(&table_name, false, cancel).await?;
            let users_to_be_query_ready_for = users_for_query_readiness(
                table_number,
                active_table_number,
                &users_with_index,
                &query_readiness_num_by_user_id,
                default_num_days,
                self.owns_tenant.as_ref(),
            );
            if users_to_be_query_ready_for.is_empty()
                && active_table_number - table_number > self.conf.query_ready_num_days as i64
            {
                continue;
            }

            let table = self.get_or_create_table(&table_name)?;
            table
                .ensure_query_readiness(cancel, &users_to_be_query_ready_for)
                .await
                .with_context(|| format!("ensure query readiness for table {table_name}"))?;
            debug!(
                table = %table_name,
                users = ?users_to_be_query_ready_for,
                "table ready for queries"
            );
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Cancellation is propagated, never treated as a failure; callers use this
/// to keep it out of error counters and logs.
fn is_cancelled_error(e: &anyhow::Error) -> bool {
    e.root_cause()
        .downcast_ref::<DownloadError>()
        .is_some_and(|e| e.is_cancelled())
}
