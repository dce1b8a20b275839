use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_int_counter_vec,
    CounterVec, Gauge, Histogram, IntCounterVec,
};

// Buckets for background operations: a readiness pass may download entire
// tables, so the range extends well past interactive latencies.
const BACKGROUND_OP_BUCKETS: &[f64] = &[0.010, 0.100, 1.0, 10.0, 100.0, 1000.0];

pub(crate) static TABLES_SYNC_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "index_cache_tables_sync_operations_total",
        "Number of table sync passes, by outcome",
        &["status"],
    )
    .expect("failed to define a metric")
});

pub(crate) static TABLES_SYNC_DURATION: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "index_cache_tables_sync_duration_seconds",
        "Wall time of the last sync pass over all tables",
    )
    .expect("failed to define a metric")
});

pub(crate) static QUERY_READINESS_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "index_cache_query_readiness_duration_seconds",
        "Time spent making tables ready for expected queries",
        BACKGROUND_OP_BUCKETS.into(),
    )
    .expect("failed to define a metric")
});

pub(crate) static QUERY_TIME_TABLE_DOWNLOAD_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "index_cache_query_time_table_download_duration_seconds",
        "Time spent downloading index inside the query path, i.e. for tables \
         that were not ready when a query needed them",
        &["table"],
    )
    .expect("failed to define a metric")
});

pub(crate) static BACKGROUND_LOOP_PERIOD_OVERRUN_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "index_cache_background_loop_period_overruns_total",
        "Incremented whenever a background iteration takes longer than its period",
        &["task", "period"],
    )
    .expect("failed to define a metric")
});
