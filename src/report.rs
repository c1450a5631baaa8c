//! Post-join throughput accounting.

use std::fmt;
use tracing::{info, warn};

use crate::benchmark::{RunOutcome, WorkerResult};

/// Elapsed times below this are treated as zero.
const MIN_ELAPSED_SECS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunMetrics {
    pub elapsed_seconds: f64,
    pub total_transactions: u64,
    pub total_rows: u64,
    pub tps: f64,
    pub rows_per_sec: f64,
    /// `workers * iterations`; equals `total_transactions` for a run where
    /// every worker finished.
    pub planned_transactions: u64,
}

impl RunMetrics {
    pub fn complete(&self) -> bool {
        self.total_transactions == self.planned_transactions
    }
}

impl fmt::Display for RunMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Inserted {} rows via {} transactions in {:.2} sec | TPS: {:.1} Rows/sec: {:.0}",
            self.total_rows, self.total_transactions, self.elapsed_seconds, self.tps, self.rows_per_sec
        )
    }
}

/// One commit per iteration, so a finished run has exactly
/// `workers * iterations` transactions whatever the conflict rate. Workers
/// that stopped early contribute only the batches they committed.
pub fn summarize(
    results: &[WorkerResult],
    elapsed_seconds: f64,
    workers: usize,
    iterations: u64,
) -> RunMetrics {
    let planned_transactions = workers as u64 * iterations;
    let total_transactions: u64 = results
        .iter()
        .map(|r| r.batches_committed.min(iterations))
        .sum();
    let total_rows: u64 = results.iter().map(|r| r.rows_inserted).sum();

    RunMetrics {
        elapsed_seconds,
        total_transactions,
        total_rows,
        tps: per_second(total_transactions, elapsed_seconds),
        rows_per_sec: per_second(total_rows, elapsed_seconds),
        planned_transactions,
    }
}

fn per_second(count: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds < MIN_ELAPSED_SECS {
        if count == 0 { 0.0 } else { f64::INFINITY }
    } else {
        count as f64 / elapsed_seconds
    }
}

/// One consolidated line for all failed workers, `None` if none failed.
pub fn error_summary(outcome: &RunOutcome) -> Option<String> {
    let (worker, first) = outcome.first_error()?;
    let failed = outcome.failed_workers();
    Some(format!(
        "{failed} of {} workers failed; first failure (worker {worker}, {}): {first}",
        outcome.results.len(),
        first.kind().as_str()
    ))
}

pub fn log_final_results(label: &str, metrics: &RunMetrics, outcome: &RunOutcome) {
    let reconnects: u64 = outcome.results.iter().map(|r| r.reconnects as u64).sum();

    info!(
        event = "ingest_done",
        benchmark = %label,
        workers = outcome.results.len(),
        elapsed_secs = metrics.elapsed_seconds,
        total_transactions = metrics.total_transactions,
        planned_transactions = metrics.planned_transactions,
        total_rows = metrics.total_rows,
        tps = metrics.tps,
        rows_per_sec = metrics.rows_per_sec,
        reconnects,
        failed_workers = outcome.failed_workers(),
        cancelled = outcome.cancelled,
    );
    println!("[{label}] {metrics}");

    if let Some(summary) = error_summary(outcome) {
        warn!(benchmark = %label, summary = %summary, "ingest_failures");
        println!("[{label}] {summary}");
    }
}
