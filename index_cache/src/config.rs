//! Configuration surface of the index cache, plus the per-tenant limits
//! interface consumed by query readiness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// How often [`crate::table_manager::TableManager`] scans its tables for
/// expired index and drops it. Not configurable; only the idle TTL is.
pub const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexCacheConfig {
    /// Directory that holds one subdirectory per cached table. Created on
    /// startup if absent.
    pub cache_dir: Utf8PathBuf,

    /// Period of the remote-listing reconciliation and query-readiness pass.
    /// Must be positive; [`crate::table_manager::TableManager::new`] rejects
    /// zero.
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    /// Idle time after which a table's per-user (or common) index is dropped
    /// from disk.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// How many days back from the active table every tenant is kept query
    /// ready, before per-tenant limits widen the window. 0 disables the
    /// common window.
    pub query_ready_num_days: usize,
}

/// Per-tenant knobs consumed by the cache. The wider limits surface of the
/// surrounding system does not concern us here.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryReadyLimits {
    /// Look-back window, in days from the active table, that must be
    /// pre-downloaded for this tenant. 0 means no readiness required.
    pub query_ready_index_num_days: usize,
}

/// Source of per-tenant limits. Implemented by the surrounding system's
/// runtime-reloadable overrides machinery; queried fresh on every readiness
/// pass so changes take effect on the next tick.
pub trait Limits: Send + Sync + 'static {
    fn default_limits(&self) -> QueryReadyLimits;

    /// Tenants with an explicitly-set override. Tenants absent here fall
    /// back to [`Limits::default_limits`].
    fn by_user_id(&self) -> HashMap<String, QueryReadyLimits>;
}

/// Shard-ownership predicate. In a sharded deployment only some tenants are
/// this process's responsibility; `None` means "owns all".
pub type OwnsTenantFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
