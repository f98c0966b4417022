//! Request loop of a single client.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rama::telemetry::tracing;
use rand::rngs::SmallRng;
use tokio::{
    sync::{Notify, watch},
    time::Instant,
};

use crate::{
    codec::{Codec, Request, Response},
    config::Action,
    keyspace::write_key,
    pool::{ConnectionError, ConnectionPool, Connector, RequestError},
    stats::{FailureKind, Outcome, WorkerStats},
    workload::{InvariantViolation, Operation, Selection, Workload, fill_values},
};

/// Consecutive failed acquires after which a worker reports itself degraded.
pub const DEGRADED_AFTER: u32 = 16;

/// Number of workers currently able to reach at least one endpoint.
#[derive(Debug)]
pub struct Health {
    healthy: AtomicUsize,
    exhausted: Notify,
}

impl Health {
    pub fn new(workers: usize) -> Self {
        Self {
            healthy: AtomicUsize::new(workers),
            exhausted: Notify::new(),
        }
    }

    pub fn healthy(&self) -> usize {
        self.healthy.load(Ordering::Acquire)
    }

    /// Resolves once the last healthy worker degraded and none recovered since.
    pub async fn exhausted(&self) {
        loop {
            self.exhausted.notified().await;
            if self.healthy() == 0 {
                return;
            }
        }
    }

    fn degrade(&self) {
        if self.healthy.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.exhausted.notify_one();
        }
    }

    fn recover(&self) {
        self.healthy.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct Degradation {
    health: Arc<Health>,
    consecutive_errors: u32,
    degraded: bool,
}

impl Degradation {
    fn on_connected(&mut self, worker: usize) {
        self.consecutive_errors = 0;
        if self.degraded {
            self.degraded = false;
            self.health.recover();
            tracing::info!(worker, "worker recovered");
        }
    }

    fn on_error(&mut self, worker: usize, err: &ConnectionError) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if !self.degraded && self.consecutive_errors >= DEGRADED_AFTER {
            self.degraded = true;
            self.health.degrade();
            tracing::warn!(
                worker,
                consecutive_errors = self.consecutive_errors,
                healthy_workers = self.health.healthy(),
                "worker degraded: {err}",
            );
        }
    }
}

pub struct Worker<C: Connector, K: Codec> {
    id: usize,
    workload: Arc<Workload>,
    codec: Arc<K>,
    pools: Vec<ConnectionPool<C>>,
    next_pool: usize,
    rng: SmallRng,
    stats: WorkerStats,
    degradation: Degradation,
    request_timeout: Duration,
    key: Vec<u8>,
    values: Vec<u8>,
}

impl<C: Connector, K: Codec> std::fmt::Debug for Worker<C, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pools", &self.pools)
            .field("degraded", &self.degradation.degraded)
            .finish()
    }
}

impl<C: Connector, K: Codec> Worker<C, K> {
    /// Creates worker `id` with a sub-pool of `poolsize` connections for
    /// every configured endpoint.
    pub fn new(
        id: usize,
        workload: Arc<Workload>,
        codec: Arc<K>,
        connector: Arc<C>,
        rng: SmallRng,
        stats: WorkerStats,
        health: Arc<Health>,
    ) -> Self {
        let general = workload.config().general();
        let pools = workload
            .config()
            .endpoints()
            .iter()
            .map(|endpoint| {
                ConnectionPool::new(
                    endpoint.clone(),
                    connector.clone(),
                    general.poolsize,
                    general.connect_timeout,
                )
            })
            .collect();
        let request_timeout = general.request_timeout;

        Self {
            id,
            workload,
            codec,
            pools,
            next_pool: 0,
            rng,
            stats,
            degradation: Degradation {
                health,
                consecutive_errors: 0,
                degraded: false,
            },
            request_timeout,
            key: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Drives operations until `stop` flips to `true` (or its sender goes away).
    ///
    /// An operation already on the wire is allowed to finish, which takes at
    /// most `request_timeout`. Only a corrupted lifecycle state ends the loop
    /// with an error.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<(), InvariantViolation> {
        tracing::debug!(worker = self.id, endpoints = self.pools.len(), "worker started");

        let mut operations: u64 = 0;
        while !*stop.borrow() && stop.has_changed().is_ok() {
            if self.step(&mut stop).await.inspect_err(|err| {
                tracing::error!(worker = self.id, "abort worker: {err}");
            })? {
                operations += 1;
            }
        }

        tracing::debug!(worker = self.id, operations, "worker stopped");
        Ok(())
    }

    /// Runs one draw of the workload; returns whether a request went out.
    async fn step(&mut self, stop: &mut watch::Receiver<bool>) -> Result<bool, InvariantViolation> {
        let Self {
            id,
            workload,
            codec,
            pools,
            next_pool,
            rng,
            stats,
            degradation,
            request_timeout,
            key,
            values,
        } = self;

        let operation = match workload.select(rng)? {
            Selection::Dispatch(operation) => operation,
            Selection::Skipped { action, .. } => {
                stats.record(action, Outcome::Skipped, Duration::ZERO);
                tokio::task::yield_now().await;
                return Ok(false);
            }
        };
        let action = operation.action();

        write_key(operation.keyspace, operation.key_index, key);
        values.clear();
        let items = operation.command.items;
        let value_len = match operation.value {
            Some(spec) => {
                let count = if action == Action::Find { 1 } else { items };
                fill_values(spec, count, rng, values);
                spec.length
            }
            None => 0,
        };
        let request = Request {
            action,
            key: key.as_slice(),
            values: values.as_slice(),
            value_len,
            items,
            element_size: operation.keyspace.element_size(),
            watermarks: operation.command.watermarks,
        };

        let Some(pool) = pools.get(*next_pool) else {
            return Err(InvariantViolation(format!("worker {id} has no endpoint")));
        };
        *next_pool = (*next_pool + 1) % pools.len();

        let acquire_start = Instant::now();
        let acquired = tokio::select! {
            biased;
            _ = stop.changed() => return Ok(false),
            acquired = pool.acquire() => acquired,
        };
        let mut connection = match acquired {
            Ok(connection) => {
                degradation.on_connected(*id);
                connection
            }
            Err(err) => {
                tracing::debug!(worker = *id, "acquire connection: {err}");
                degradation.on_error(*id, &err);
                stats.record(
                    action,
                    Outcome::Failure(FailureKind::Connection),
                    acquire_start.elapsed(),
                );
                tokio::task::yield_now().await;
                return Ok(false);
            }
        };

        let start = Instant::now();
        let result = connection
            .execute(codec.as_ref(), &request, *request_timeout)
            .await;
        let latency = start.elapsed();

        match result {
            Ok(exchange) => {
                workload.complete(&operation, &exchange.response);
                let outcome = classify(&operation, &exchange.response);
                pool.release(connection, true);
                stats.record_request(action, outcome, latency, exchange.sent, exchange.received);
            }
            Err(err) => {
                tracing::debug!(
                    worker = *id,
                    endpoint = pool.endpoint(),
                    connection = connection.id(),
                    %action,
                    "request failed: {err}",
                );
                pool.release(connection, false);
                stats.record(action, Outcome::Failure(failure_kind(&err)), latency);
            }
        }

        Ok(true)
    }
}

fn classify(operation: &Operation<'_>, response: &Response) -> Outcome {
    match response {
        Response::Success => Outcome::Success,
        Response::Rejected(_) if operation.expects_miss() => Outcome::ExpectedMiss,
        Response::Rejected(reason) => {
            tracing::trace!(action = %operation.action(), "request rejected: {reason}");
            Outcome::Failure(FailureKind::Protocol)
        }
    }
}

fn failure_kind(err: &RequestError) -> FailureKind {
    match err {
        RequestError::Timeout => FailureKind::Timeout,
        RequestError::Protocol(_) => FailureKind::Protocol,
        RequestError::Io(_) | RequestError::Closed => FailureKind::Io,
    }
}
