//! Pure query-readiness policy.
//!
//! Decides, for one remote table, which users must have their index present
//! locally before queries arrive. Kept free of I/O and clocks so the rules
//! can be tested exhaustively; the manager feeds it listings and wall time.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::OwnsTenantFn;

const SECONDS_IN_DAY: u64 = 24 * 60 * 60;

/// Number of the table covering `now`. Table numbers count days since the
/// unix epoch; older numbers denote historical buckets.
pub(crate) fn active_table_number(now: SystemTime) -> i64 {
    let unix_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    (unix_secs / SECONDS_IN_DAY) as i64
}

/// Extracts the table number from the trailing decimal suffix of a table
/// name. Not every remote key is a dated table; names without a suffix get
/// `None` and are skipped by readiness.
pub(crate) fn table_number_from_name(name: &str) -> Option<i64> {
    let bytes = name.as_bytes();
    let mut start = bytes.len();
    while start > 0 && bytes[start - 1].is_ascii_digit() {
        start -= 1;
    }
    if start == bytes.len() {
        return None;
    }
    name[start..].parse::<i64>().ok()
}

/// Users of `users_with_index` whose look-back window covers `table_number`
/// and whom this process owns. Output preserves input order.
pub(crate) fn users_for_query_readiness(
    table_number: i64,
    active_table_number: i64,
    users_with_index: &[String],
    query_readiness_num_by_user_id: &HashMap<String, usize>,
    default_num_days: usize,
    owns_tenant: Option<&OwnsTenantFn>,
) -> Vec<String> {
    let mut users = Vec::new();
    for user_id in users_with_index {
        let num_days = query_readiness_num_by_user_id
            .get(user_id)
            .copied()
            .unwrap_or(default_num_days);
        // zero window: tenant requires no readiness
        if num_days == 0 {
            continue;
        }
        if let Some(owns_tenant) = owns_tenant {
            if !owns_tenant(user_id) {
                continue;
            }
        }
        if active_table_number - table_number <= num_days as i64 {
            users.push(user_id.clone());
        }
    }
    users
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn user_ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn table_number_parsing() {
        assert_eq!(table_number_from_name("index_19400"), Some(19400));
        assert_eq!(table_number_from_name("19400"), Some(19400));
        assert_eq!(table_number_from_name("index_0012"), Some(12));
        assert_eq!(table_number_from_name("tbl_junk"), None);
        assert_eq!(table_number_from_name("index_"), None);
        assert_eq!(table_number_from_name(""), None);
        // a suffix too long for i64 is treated the same as no suffix
        assert_eq!(table_number_from_name("index_99999999999999999999"), None);
    }

    #[test]
    fn active_table_number_is_days_since_epoch() {
        let day = Duration::from_secs(24 * 60 * 60);
        assert_eq!(active_table_number(UNIX_EPOCH), 0);
        assert_eq!(active_table_number(UNIX_EPOCH + day * 19400), 19400);
        // mid-day stays in the same bucket
        assert_eq!(
            active_table_number(UNIX_EPOCH + day * 19400 + Duration::from_secs(12 * 60 * 60)),
            19400
        );
        // non-decreasing across increasing wall time
        let mut prev = 0;
        for hours in 0..100 {
            let n = active_table_number(UNIX_EPOCH + Duration::from_secs(hours * 60 * 60));
            assert!(n >= prev);
            prev = n;
        }
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let users = user_ids(&["u"]);
        let overrides = HashMap::new();
        // active 102, default window 2: tables 100..=102 are covered, 99 is not
        for (table_number, expected) in [(102, true), (100, true), (99, false)] {
            let ready =
                users_for_query_readiness(table_number, 102, &users, &overrides, 2, None);
            assert_eq!(!ready.is_empty(), expected, "table_number={table_number}");
        }
        // tables from the future are always inside the window
        assert_eq!(
            users_for_query_readiness(103, 102, &users, &overrides, 1, None),
            user_ids(&["u"])
        );
    }

    #[test]
    fn zero_window_excludes() {
        let users = user_ids(&["u", "v"]);
        let overrides = HashMap::from([("u".to_string(), 5usize)]);
        // default 0: only the explicit override is readied
        assert_eq!(
            users_for_query_readiness(100, 102, &users, &overrides, 0, None),
            user_ids(&["u"])
        );
        // an explicit 0 override beats a non-zero default
        let overrides = HashMap::from([("u".to_string(), 0usize)]);
        assert_eq!(
            users_for_query_readiness(100, 102, &users, &overrides, 5, None),
            user_ids(&["v"])
        );
    }

    #[test]
    fn ownership_predicate_filters() {
        let users = user_ids(&["u", "v", "w"]);
        let overrides = HashMap::new();
        let owns: OwnsTenantFn = Arc::new(|user_id| user_id != "v");
        assert_eq!(
            users_for_query_readiness(100, 102, &users, &overrides, 5, Some(&owns)),
            user_ids(&["u", "w"])
        );
        // no predicate admits every tenant
        assert_eq!(
            users_for_query_readiness(100, 102, &users, &overrides, 5, None),
            user_ids(&["u", "v", "w"])
        );
    }

    #[test]
    fn insertion_order_and_determinism() {
        let users = user_ids(&["c", "a", "b"]);
        let overrides = HashMap::from([("a".to_string(), 3usize), ("b".to_string(), 3usize)]);
        let first = users_for_query_readiness(100, 102, &users, &overrides, 3, None);
        let second = users_for_query_readiness(100, 102, &users, &overrides, 3, None);
        assert_eq!(first, user_ids(&["c", "a", "b"]));
        assert_eq!(first, second);
    }
}
