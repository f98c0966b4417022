//! Run orchestration: spawns the workers, seals one window per interval and
//! stops everything after the configured number of windows.

use std::{sync::Arc, time::Duration};

use rama::telemetry::tracing;
use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::{Instant, interval_at, timeout},
};

use crate::{
    codec::Codec,
    config::{Config, ConfigError},
    pool::Connector,
    stats::{StatsCollector, StatsError, WindowReport, WindowStats},
    worker::{Health, Worker},
    workload::{InvariantViolation, Workload},
};

#[derive(Debug)]
pub enum RunError {
    Config(ConfigError),
    Invariant(InvariantViolation),
    NoHealthyWorkers,
    Stats(StatsError),
    /// a worker task panicked or was cancelled
    Worker(String),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid config: {err}"),
            Self::Invariant(err) => err.fmt(f),
            Self::NoHealthyWorkers => write!(f, "no worker can reach any endpoint"),
            Self::Stats(err) => write!(f, "stats: {err}"),
            Self::Worker(err) => write!(f, "worker task: {err}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Invariant(err) => Some(err),
            Self::Stats(err) => Some(err),
            Self::NoHealthyWorkers | Self::Worker(_) => None,
        }
    }
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<InvariantViolation> for RunError {
    fn from(err: InvariantViolation) -> Self {
        Self::Invariant(err)
    }
}

impl From<StatsError> for RunError {
    fn from(err: StatsError) -> Self {
        Self::Stats(err)
    }
}

/// What a finished (or interrupted) run adds up to.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// number of window reports emitted
    pub windows: u64,
    /// false when the run was stopped before its last window
    pub completed: bool,
    pub elapsed: Duration,
    /// merge of all emitted windows
    pub total: WindowReport,
}

pub struct Runner<C: Connector, K: Codec> {
    workload: Arc<Workload>,
    codec: Arc<K>,
    connector: Arc<C>,
}

impl<C: Connector, K: Codec> std::fmt::Debug for Runner<C, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("workload", &self.workload)
            .finish()
    }
}

impl<C: Connector, K: Codec> Runner<C, K> {
    pub fn try_new(config: Config, codec: K, connector: C) -> Result<Self, RunError> {
        if config.endpoints().is_empty() {
            return Err(ConfigError::NoEndpoints.into());
        }
        Ok(Self {
            workload: Arc::new(Workload::new(Arc::new(config))),
            codec: Arc::new(codec),
            connector: Arc::new(connector),
        })
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Runs the workload for `windows * interval`, sending one report per
    /// window to `reports`.
    ///
    /// `shutdown` resolving ends the run early; the window in progress is
    /// then dropped. Workers always get up to `request_timeout` to finish
    /// their in-flight request before they are aborted.
    pub async fn run(
        self,
        reports: mpsc::Sender<WindowReport>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunSummary, RunError> {
        let general = self.workload.config().general().clone();

        let mut collector = StatsCollector::try_new()?;
        let health = Arc::new(Health::new(general.clients));
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut seeds = match general.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };

        let mut workers = JoinSet::new();
        for id in 0..general.clients {
            let worker = Worker::new(
                id,
                self.workload.clone(),
                self.codec.clone(),
                self.connector.clone(),
                SmallRng::seed_from_u64(seeds.random()),
                collector.register(),
                health.clone(),
            );
            workers.spawn(worker.run(stop_rx.clone()));
        }

        tracing::info!(
            clients = general.clients,
            poolsize = general.poolsize,
            endpoints = ?self.workload.config().endpoints(),
            windows = general.windows,
            interval = ?general.interval,
            "run started",
        );

        let start = Instant::now();
        let mut ticker = interval_at(start + general.interval, general.interval);
        let mut total = collector.empty();
        let mut window = 0;
        let mut shutdown = std::pin::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = collector.flush();
                    total.merge(&stats);

                    let report = self.report(window, window + 1, general.interval, &stats);
                    tracing::info!(
                        window,
                        attempted = report.attempted(),
                        failed = report.failed(),
                        skipped = report.skipped(),
                        "window sealed",
                    );
                    if reports.send(report).await.is_err() {
                        tracing::debug!("report receiver dropped");
                    }

                    window += 1;
                    if window >= general.windows {
                        break Ok(true);
                    }
                }
                Some(joined) = workers.join_next() => {
                    match joined {
                        Ok(Ok(())) => tracing::debug!("worker exited before the run ended"),
                        Ok(Err(violation)) => break Err(RunError::Invariant(violation)),
                        Err(err) => break Err(RunError::Worker(err.to_string())),
                    }
                }
                _ = health.exhausted() => {
                    tracing::error!("all workers degraded");
                    break Err(RunError::NoHealthyWorkers);
                }
                _ = shutdown.as_mut() => {
                    tracing::info!(window, "shutdown requested: stop run early");
                    break Ok(false);
                }
            }
        };

        let elapsed = start.elapsed();
        let drained = drain(&mut workers, &stop_tx, general.request_timeout).await;
        let completed = result?;
        drained?;

        tracing::info!(windows = window, ?elapsed, completed, "run finished");

        Ok(RunSummary {
            windows: window,
            completed,
            elapsed,
            total: self.report(0, window, general.interval, &total),
        })
    }

    /// Report spanning windows `[first, end)`.
    fn report(&self, first: u64, end: u64, interval: Duration, stats: &WindowStats) -> WindowReport {
        let offset = |n: u64| interval.saturating_mul(u32::try_from(n).unwrap_or(u32::MAX));
        WindowReport::new(
            first,
            offset(first),
            offset(end),
            stats,
            self.workload.existing(),
        )
    }
}

/// Signals the workers to stop and waits up to `grace` for them, aborting
/// whatever is still running afterwards.
async fn drain(
    workers: &mut JoinSet<Result<(), InvariantViolation>>,
    stop: &watch::Sender<bool>,
    grace: Duration,
) -> Result<(), RunError> {
    let _ = stop.send(true);

    let mut violation = None;
    let joined = timeout(grace, async {
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => (),
                Ok(Err(err)) => violation = Some(err),
                Err(err) => tracing::debug!("worker task ended abnormally: {err}"),
            }
        }
    })
    .await;

    if joined.is_err() {
        tracing::warn!(
            remaining = workers.len(),
            "workers still busy after {grace:?}: abort",
        );
        workers.shutdown().await;
    }

    match violation {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
