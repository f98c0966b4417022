//! Windowed statistics.
//!
//! Every worker records into its own [`WindowStats`] buffer. At each window
//! boundary the [`StatsCollector`] swaps all buffers for fresh ones and merges
//! them; merging is plain counter and histogram addition, so the order in
//! which buffers are merged does not matter.

use std::{sync::Arc, time::Duration};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use rama::telemetry::tracing;

use crate::config::Action;

mod report;

pub use self::report::{ActionReport, LatencySummary, WindowReport};

#[cfg(test)]
mod tests;

/// Highest latency the histograms track, in microseconds.
const MAX_LATENCY_US: u64 = 60 * 1_000_000;
const SIGNIFICANT_DIGITS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Connection,
    Timeout,
    Protocol,
    Io,
}

impl FailureKind {
    pub const ALL: [FailureKind; 4] = [
        FailureKind::Connection,
        FailureKind::Timeout,
        FailureKind::Protocol,
        FailureKind::Io,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Connection => "connection",
            FailureKind::Timeout => "timeout",
            FailureKind::Protocol => "protocol",
            FailureKind::Io => "io",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureKind),
    /// rejected by the server for a structure known not to exist
    ExpectedMiss,
    /// suppressed by the watermark policy, never sent
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ActionStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: [u64; 4],
    pub expected_misses: u64,
    pub skipped: u64,
    /// microseconds
    pub latency: Histogram<u64>,
}

impl ActionStats {
    fn try_new() -> Result<Self, StatsError> {
        Ok(Self {
            attempted: 0,
            succeeded: 0,
            failed: [0; 4],
            expected_misses: 0,
            skipped: 0,
            latency: Histogram::new_with_bounds(1, MAX_LATENCY_US, SIGNIFICANT_DIGITS)
                .map_err(|err| StatsError(format!("create latency histogram: {err:?}")))?,
        })
    }

    pub fn failed_total(&self) -> u64 {
        self.failed.iter().sum()
    }

    fn merge(&mut self, other: &ActionStats) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        for (into, from) in self.failed.iter_mut().zip(other.failed) {
            *into += from;
        }
        self.expected_misses += other.expected_misses;
        self.skipped += other.skipped;
        if let Err(err) = self.latency.add(&other.latency) {
            tracing::warn!("merge latency histogram: {err:?}");
        }
    }
}

/// Counters of a single window (or of a whole run, once merged).
#[derive(Debug, Clone)]
pub struct WindowStats {
    actions: Vec<ActionStats>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl WindowStats {
    pub fn try_new() -> Result<Self, StatsError> {
        let mut actions = Vec::with_capacity(Action::ALL.len());
        for _ in Action::ALL {
            actions.push(ActionStats::try_new()?);
        }
        Ok(Self {
            actions,
            bytes_sent: 0,
            bytes_received: 0,
        })
    }

    pub fn record(&mut self, action: Action, outcome: Outcome, latency: Duration) {
        let stats = &mut self.actions[action.index()];
        match outcome {
            Outcome::Skipped => {
                stats.skipped += 1;
                return;
            }
            Outcome::Success => stats.succeeded += 1,
            Outcome::ExpectedMiss => stats.expected_misses += 1,
            Outcome::Failure(kind) => stats.failed[kind as usize] += 1,
        }
        stats.attempted += 1;
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        stats.latency.saturating_record(micros.max(1));
    }

    pub fn record_bytes(&mut self, sent: usize, received: usize) {
        self.bytes_sent += sent as u64;
        self.bytes_received += received as u64;
    }

    pub fn action(&self, action: Action) -> &ActionStats {
        &self.actions[action.index()]
    }

    pub fn merge(&mut self, other: &WindowStats) {
        for (into, from) in self.actions.iter_mut().zip(&other.actions) {
            into.merge(from);
        }
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
    }

    pub fn reset(&mut self) {
        for stats in &mut self.actions {
            stats.attempted = 0;
            stats.succeeded = 0;
            stats.failed = [0; 4];
            stats.expected_misses = 0;
            stats.skipped = 0;
            stats.latency.reset();
        }
        self.bytes_sent = 0;
        self.bytes_received = 0;
    }

    pub fn attempted(&self) -> u64 {
        self.actions.iter().map(|stats| stats.attempted).sum()
    }
}

/// Histogram construction failed.
#[derive(Debug, Clone)]
pub struct StatsError(String);

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StatsError {}

/// Per worker recording handle.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    buffer: Arc<Mutex<WindowStats>>,
}

impl WorkerStats {
    pub fn record(&self, action: Action, outcome: Outcome, latency: Duration) {
        self.buffer.lock().record(action, outcome, latency);
    }

    pub fn record_request(
        &self,
        action: Action,
        outcome: Outcome,
        latency: Duration,
        sent: usize,
        received: usize,
    ) {
        let mut buffer = self.buffer.lock();
        buffer.record(action, outcome, latency);
        buffer.record_bytes(sent, received);
    }
}

/// Merge point of all worker buffers.
#[derive(Debug)]
pub struct StatsCollector {
    template: WindowStats,
    workers: Vec<Arc<Mutex<WindowStats>>>,
}

impl StatsCollector {
    pub fn try_new() -> Result<Self, StatsError> {
        Ok(Self {
            template: WindowStats::try_new()?,
            workers: Vec::new(),
        })
    }

    pub fn register(&mut self) -> WorkerStats {
        let buffer = Arc::new(Mutex::new(self.template.clone()));
        self.workers.push(buffer.clone());
        WorkerStats { buffer }
    }

    /// Empty stats with the same histogram layout.
    pub fn empty(&self) -> WindowStats {
        self.template.clone()
    }

    /// Seals the current window: takes every worker buffer, leaving fresh
    /// ones behind, and returns their merge.
    pub fn flush(&self) -> WindowStats {
        let mut merged = self.template.clone();
        let mut sealed = self.template.clone();
        for worker in &self.workers {
            std::mem::swap(&mut *worker.lock(), &mut sealed);
            merged.merge(&sealed);
            sealed.reset();
        }
        merged
    }
}
