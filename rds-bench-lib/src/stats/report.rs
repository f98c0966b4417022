use std::time::Duration;

use super::{FailureKind, WindowStats};
use crate::config::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    pub min: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub p999: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub action: Action,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// failure counts in [`FailureKind::ALL`] order
    pub failures: [(FailureKind, u64); 4],
    pub expected_misses: u64,
    pub skipped: u64,
    /// `None` when nothing was attempted
    pub latency: Option<LatencySummary>,
}

/// Aggregate of one measurement window across all workers.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowReport {
    /// 0-based window number
    pub window: u64,
    /// offset of the window start from the run start
    pub start: Duration,
    pub end: Duration,
    /// actions that were drawn at least once, in [`Action::ALL`] order
    pub actions: Vec<ActionReport>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// existing-count per keyspace at the end of the window, `None` where untracked
    pub existing: Vec<Option<u64>>,
}

impl WindowReport {
    pub fn new(
        window: u64,
        start: Duration,
        end: Duration,
        stats: &WindowStats,
        existing: Vec<Option<u64>>,
    ) -> Self {
        let actions = Action::ALL
            .into_iter()
            .filter_map(|action| {
                let stats = stats.action(action);
                if stats.attempted == 0 && stats.skipped == 0 {
                    return None;
                }

                let latency = (stats.attempted > 0).then(|| {
                    let at = |q: f64| Duration::from_micros(stats.latency.value_at_quantile(q));
                    LatencySummary {
                        min: Duration::from_micros(stats.latency.min()),
                        p50: at(0.5),
                        p90: at(0.9),
                        p99: at(0.99),
                        p999: at(0.999),
                        max: Duration::from_micros(stats.latency.max()),
                    }
                });

                Some(ActionReport {
                    action,
                    attempted: stats.attempted,
                    succeeded: stats.succeeded,
                    failed: stats.failed_total(),
                    failures: FailureKind::ALL.map(|kind| (kind, stats.failed[kind as usize])),
                    expected_misses: stats.expected_misses,
                    skipped: stats.skipped,
                    latency,
                })
            })
            .collect();

        Self {
            window,
            start,
            end,
            actions,
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            existing,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    pub fn attempted(&self) -> u64 {
        self.actions.iter().map(|action| action.attempted).sum()
    }

    pub fn succeeded(&self) -> u64 {
        self.actions.iter().map(|action| action.succeeded).sum()
    }

    pub fn failed(&self) -> u64 {
        self.actions.iter().map(|action| action.failed).sum()
    }

    pub fn skipped(&self) -> u64 {
        self.actions.iter().map(|action| action.skipped).sum()
    }

    /// Attempted operations per second over the window.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs == 0. {
            0.
        } else {
            self.attempted() as f64 / secs
        }
    }

    pub fn action(&self, action: Action) -> Option<&ActionReport> {
        self.actions.iter().find(|report| report.action == action)
    }
}
