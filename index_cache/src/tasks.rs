//! Helpers shared by the manager's background activities.

use std::time::Duration;

use tracing::info;

#[derive(Debug, PartialEq, Eq, Clone, Copy, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum BackgroundLoopKind {
    TableSync,
    CacheCleanup,
}

impl BackgroundLoopKind {
    fn as_static_str(&self) -> &'static str {
        let s: &'static str = self.into();
        s
    }
}

/// Attention: the `task` and `period` become labels of a process-wide prometheus metric.
pub(crate) fn warn_when_period_overrun(
    elapsed: Duration,
    period: Duration,
    task: BackgroundLoopKind,
) {
    if elapsed >= period && period != Duration::ZERO {
        info!(
            ?elapsed,
            period = %humantime::format_duration(period),
            ?task,
            "task iteration took longer than the configured period"
        );
        crate::metrics::BACKGROUND_LOOP_PERIOD_OVERRUN_COUNT
            .with_label_values(&[task.as_static_str(), &format!("{}", period.as_secs())])
            .inc();
    }
}
