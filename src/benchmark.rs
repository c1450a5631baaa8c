use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BenchRun, Config, Workload};
use crate::error::{IngestError, Result};
use crate::generator::{BatchGenerator, LakeGenerator, LakeRow, TransactionGenerator, TransactionRow};
use crate::pool::{Lease, Pool, PoolConfig};
use crate::report::{self, RunMetrics};
use crate::schema::Record;
use crate::session::Connector;
use crate::writer::BatchWriter;

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Shared progress counters, read by the periodic reporter.
#[derive(Clone)]
pub struct Progress {
    rows: Arc<AtomicU64>,
    batches: Arc<AtomicU64>,
    reconnects: Arc<AtomicU64>,
    connection_errors: Arc<AtomicU64>,
    exhausted_errors: Arc<AtomicU64>,
    other_errors: Arc<AtomicU64>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(AtomicU64::new(0)),
            batches: Arc::new(AtomicU64::new(0)),
            reconnects: Arc::new(AtomicU64::new(0)),
            connection_errors: Arc::new(AtomicU64::new(0)),
            exhausted_errors: Arc::new(AtomicU64::new(0)),
            other_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    fn record_batch(&self, rows: u64) {
        self.rows.fetch_add(rows, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, err: &IngestError) {
        let counter = match err {
            IngestError::ConnectionLost { .. } | IngestError::Connect { .. } => {
                &self.connection_errors
            }
            IngestError::PoolExhausted { .. } => &self.exhausted_errors,
            _ => &self.other_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            rows: self.rows.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            exhausted_errors: self.exhausted_errors.load(Ordering::Relaxed),
            other_errors: self.other_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressSnapshot {
    pub rows: u64,
    pub batches: u64,
    pub reconnects: u64,
    pub connection_errors: u64,
    pub exhausted_errors: u64,
    pub other_errors: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after `PoolExhausted`.
    pub acquire_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(MAX_BACKOFF)
    }
}

/// Acquire, write, release, with the retry rules shared by both drivers:
/// `PoolExhausted` backs off and retries, `ConnectionLost` discards the
/// session and retries the batch once on a fresh one.
pub struct BatchSink<C: Connector, R: Record> {
    pool: Pool<C>,
    writer: Arc<BatchWriter<R>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<C: Connector, R: Record> Clone for BatchSink<C, R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            writer: Arc::clone(&self.writer),
            retry: self.retry,
            cancel: self.cancel.clone(),
        }
    }
}

impl<C: Connector, R: Record> BatchSink<C, R> {
    pub fn new(
        pool: Pool<C>,
        writer: Arc<BatchWriter<R>>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            writer,
            retry,
            cancel,
        }
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Creates the target table ahead of the timed section.
    pub async fn prepare(&self) -> Result<()> {
        let mut lease = self.acquire(0).await?;
        match self.writer.ensure_table(&mut *lease).await {
            Ok(()) => {
                self.pool.release(lease).await;
                Ok(())
            }
            Err(e) => {
                self.give_back(lease, &e).await;
                Err(e)
            }
        }
    }

    async fn acquire(&self, worker_id: usize) -> Result<Lease<C>> {
        let mut attempt = 0;
        loop {
            let acquired = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                res = self.pool.acquire() => res,
            };
            match acquired {
                Err(IngestError::PoolExhausted { waited }) if attempt < self.retry.acquire_retries => {
                    let backoff = self.retry.backoff_for(attempt);
                    attempt += 1;
                    warn!(
                        worker_id,
                        attempt,
                        waited_ms = waited.as_millis() as u64,
                        backoff_ms = backoff.as_millis() as u64,
                        "pool_exhausted_retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                        _ = time::sleep(backoff) => {}
                    }
                }
                other => return other,
            }
        }
    }

    async fn give_back(&self, lease: Lease<C>, err: &IngestError) {
        if err.is_connection_lost() {
            self.pool.discard(lease).await;
        } else {
            self.pool.release(lease).await;
        }
    }

    /// Writes one batch. `reconnects` is bumped for each replacement
    /// session, even when the batch ultimately fails.
    pub async fn write(&self, worker_id: usize, batch: &[R], reconnects: &mut u32) -> Result<u64> {
        let mut reconnected = false;
        loop {
            let mut lease = self.acquire(worker_id).await?;

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                res = self.writer.write(&mut *lease, batch) => Some(res),
            };

            match outcome {
                None => {
                    // Abandoned mid-statement; the session state is unknown.
                    self.pool.discard(lease).await;
                    return Err(IngestError::Cancelled);
                }
                Some(Ok(rows)) => {
                    self.pool.release(lease).await;
                    return Ok(rows);
                }
                Some(Err(e)) if e.is_connection_lost() && !reconnected => {
                    warn!(error = %e, worker_id, "connection_error_reconnecting");
                    self.pool.discard(lease).await;
                    reconnected = true;
                    *reconnects += 1;
                }
                Some(Err(e)) => {
                    self.give_back(lease, &e).await;
                    return Err(e);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestPlan {
    pub workers: usize,
    pub batch_size: usize,
    pub iterations: u64,
    /// Stop starting new batches after this long.
    pub deadline: Option<Duration>,
    pub metrics_interval: Duration,
}

impl IngestPlan {
    pub fn from_run(run: &BenchRun) -> Self {
        Self {
            workers: run.workers,
            batch_size: run.batch_size,
            iterations: run.iterations,
            deadline: (run.duration_secs > 0).then(|| Duration::from_secs(run.duration_secs)),
            metrics_interval: Duration::from_secs(run.metrics_interval_secs.max(1)),
        }
    }

    pub fn label(&self) -> String {
        format!("Workers {} Batch {}", self.workers, self.batch_size)
    }
}

#[derive(Debug)]
pub struct WorkerResult {
    pub worker_index: usize,
    /// Rows attempted in committed batches.
    pub rows_inserted: u64,
    pub batches_committed: u64,
    pub reconnects: u32,
    /// Set when the worker halted early; counts above are partial.
    pub error: Option<IngestError>,
}

impl WorkerResult {
    fn new(worker_index: usize) -> Self {
        Self {
            worker_index,
            rows_inserted: 0,
            batches_committed: 0,
            reconnects: 0,
            error: None,
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    /// Indexed by worker, not completion order.
    pub results: Vec<WorkerResult>,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl RunOutcome {
    /// The failure of the lowest-indexed failed worker.
    pub fn first_error(&self) -> Option<(usize, &IngestError)> {
        self.results
            .iter()
            .find_map(|r| r.error.as_ref().map(|e| (r.worker_index, e)))
    }

    pub fn failed_workers(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }
}

/// Worker configuration to avoid too many function parameters
struct WorkerConfig<C: Connector, R: Record> {
    worker_id: usize,
    sink: BatchSink<C, R>,
    batch_size: usize,
    iterations: u64,
    deadline: Option<Instant>,
    progress: Progress,
    cancel: CancellationToken,
}

async fn run_worker<C, G>(config: WorkerConfig<C, G::Row>, mut generator: G) -> WorkerResult
where
    C: Connector,
    G: BatchGenerator,
{
    let WorkerConfig {
        worker_id,
        sink,
        batch_size,
        iterations,
        deadline,
        progress,
        cancel,
    } = config;

    let mut result = WorkerResult::new(worker_id);
    // Reused across iterations.
    let mut batch: Vec<G::Row> = Vec::with_capacity(batch_size);

    for _ in 0..iterations {
        if cancel.is_cancelled() {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        batch.clear();
        generator.fill(batch_size, &mut batch);

        let mut reconnects = 0;
        let written = sink.write(worker_id, &batch, &mut reconnects).await;
        result.reconnects += reconnects;
        for _ in 0..reconnects {
            progress.record_reconnect();
        }

        match written {
            Ok(rows) => {
                result.rows_inserted += rows;
                result.batches_committed += 1;
                progress.record_batch(rows);
            }
            Err(IngestError::Cancelled) => break,
            Err(e) => {
                progress.record_error(&e);
                warn!(
                    error = %e,
                    worker_id,
                    kind = e.kind().as_str(),
                    batches_committed = result.batches_committed,
                    "worker_halted"
                );
                result.error = Some(e);
                break;
            }
        }
    }

    result
}

/// Spawns `plan.workers` workers over `sink` and waits for all of them.
pub async fn run<C, G, F>(
    sink: &BatchSink<C, G::Row>,
    plan: &IngestPlan,
    mut make_generator: F,
) -> RunOutcome
where
    C: Connector,
    G: BatchGenerator,
    F: FnMut(usize) -> G,
{
    let progress = Progress::new();
    let start = Instant::now();
    let deadline = plan.deadline.map(|d| start + d);

    let mut handles = Vec::with_capacity(plan.workers);
    for worker_id in 0..plan.workers {
        handles.push(tokio::spawn(run_worker(
            WorkerConfig {
                worker_id,
                sink: sink.clone(),
                batch_size: plan.batch_size,
                iterations: plan.iterations,
                deadline,
                progress: progress.clone(),
                cancel: sink.cancel.clone(),
            },
            make_generator(worker_id),
        )));
    }

    let reporter = tokio::spawn(report_progress_loop(
        progress.clone(),
        plan.clone(),
        start,
    ));

    let mut results: Vec<WorkerResult> = (0..plan.workers).map(WorkerResult::new).collect();
    for (worker_index, handle) in handles.into_iter().enumerate() {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => WorkerResult {
                error: Some(IngestError::Worker {
                    worker_index,
                    message: e.to_string(),
                }),
                ..WorkerResult::new(worker_index)
            },
        };
        let slot = result.worker_index;
        results[slot] = result;
    }
    let elapsed = start.elapsed();

    reporter.abort();
    let _ = reporter.await;

    RunOutcome {
        results,
        elapsed,
        cancelled: sink.cancel.is_cancelled(),
    }
}

async fn report_progress_loop(progress: Progress, plan: IngestPlan, start: Instant) {
    let mut prev = progress.snapshot();
    let label = plan.label();
    let interval_secs = plan.metrics_interval.as_secs_f64();

    loop {
        time::sleep(plan.metrics_interval).await;

        let current = progress.snapshot();
        let elapsed = start.elapsed().as_secs_f64();
        let interval_rows = current.rows.saturating_sub(prev.rows);
        let interval_batches = current.batches.saturating_sub(prev.batches);

        info!(
            event = "ingest_tick",
            benchmark = %label,
            workers = plan.workers,
            batch_size = plan.batch_size,
            total_rows = current.rows,
            total_batches = current.batches,
            rows_per_sec = interval_rows as f64 / interval_secs,
            tps = interval_batches as f64 / interval_secs,
            elapsed_secs = elapsed,
            reconnects = current.reconnects,
            connection_errors = current.connection_errors,
            exhausted_errors = current.exhausted_errors,
            other_errors = current.other_errors,
        );
        println!(
            "[{label}] {elapsed:.1}s: {} rows via {} transactions ({:.0} rows/sec, {:.1} TPS)",
            current.rows,
            current.batches,
            interval_rows as f64 / interval_secs,
            interval_batches as f64 / interval_secs,
        );

        prev = current;
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run: BenchRun,
    pub outcome: RunOutcome,
    pub metrics: RunMetrics,
}

impl RunReport {
    pub fn failed(&self) -> bool {
        self.outcome.failed_workers() > 0
    }
}

/// Runs every enabled `[[bench.runs]]` entry in order, each with its own
/// pool. `connector` builds the connector for each run's pool.
pub async fn run_suite<C, F>(
    cfg: &Config,
    mut connector: F,
    cancel: &CancellationToken,
) -> Result<Vec<RunReport>>
where
    C: Connector,
    F: FnMut() -> Result<C>,
{
    let enabled: Vec<&BenchRun> = cfg.bench.runs.iter().filter(|r| r.enabled).collect();
    let total = enabled.len();
    let mut reports = Vec::with_capacity(total);

    for (i, run) in enabled.into_iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }

        let max_size = cfg.pool.max_size.unwrap_or(run.workers).max(1);
        let pool_cfg = PoolConfig::new(cfg.pool.min_size.min(max_size), max_size)
            .with_acquire_timeout(cfg.pool.acquire_timeout_ms.map(Duration::from_millis))
            .with_non_blocking(cfg.pool.non_blocking);
        let pool = Pool::open(pool_cfg, connector()?).await?;
        let retry = RetryPolicy {
            acquire_retries: cfg.pool.acquire_retries,
            backoff: Duration::from_millis(cfg.pool.retry_backoff_ms),
        };
        let plan = IngestPlan::from_run(run);

        info!(
            workers = plan.workers,
            batch_size = plan.batch_size,
            iterations = plan.iterations,
            pool_min = pool.config().min_size,
            pool_max = pool.config().max_size,
            table = %cfg.bench.table,
            "ingest_started"
        );

        let outcome = match cfg.bench.workload {
            Workload::Lake => {
                let writer = Arc::new(BatchWriter::<LakeRow>::new(cfg.bench.table.as_str())?);
                let sink = BatchSink::new(pool.clone(), writer, retry, cancel.clone());
                let key_space = cfg.bench.key_space;
                run_prepared(&sink, &plan, |worker| LakeGenerator::new(worker, key_space)).await
            }
            Workload::Transactions => {
                let writer =
                    Arc::new(BatchWriter::<TransactionRow>::new(cfg.bench.table.as_str())?);
                let sink = BatchSink::new(pool.clone(), writer, retry, cancel.clone());
                let promo = cfg.stream.promo_items.clone();
                run_prepared(&sink, &plan, |_| TransactionGenerator::new(&promo)).await
            }
        };
        let stats = pool.stats().await;
        info!(
            peak_in_use = stats.peak_in_use,
            total_created = stats.total_created,
            max_size = stats.max_size,
            "pool_usage"
        );
        pool.close().await;
        let outcome = outcome?;

        let metrics = report::summarize(
            &outcome.results,
            outcome.elapsed.as_secs_f64(),
            plan.workers,
            plan.iterations,
        );
        report::log_final_results(&plan.label(), &metrics, &outcome);
        reports.push(RunReport {
            run: run.clone(),
            outcome,
            metrics,
        });

        if i + 1 < total && !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(Duration::from_secs(cfg.bench.pause_between_runs_secs)) => {}
            }
        }
    }

    Ok(reports)
}

async fn run_prepared<C, G, F>(
    sink: &BatchSink<C, G::Row>,
    plan: &IngestPlan,
    make_generator: F,
) -> Result<RunOutcome>
where
    C: Connector,
    G: BatchGenerator,
    F: FnMut(usize) -> G,
{
    sink.prepare().await?;
    Ok(run(sink, plan, make_generator).await)
}
