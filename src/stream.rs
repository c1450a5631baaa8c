//! Single-loop generator: one batch at a time until a deadline or Ctrl-C.

use chrono::Utc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::benchmark::BatchSink;
use crate::config::StreamConfig;
use crate::error::{IngestError, Result};
use crate::generator::BatchGenerator;
use crate::session::Connector;

#[derive(Debug, Clone)]
pub struct StreamPlan {
    pub duration: Duration,
    pub batch_size: usize,
    pub batch_interval: Duration,
}

impl StreamPlan {
    pub fn from_config(cfg: &StreamConfig) -> Self {
        Self {
            duration: Duration::from_secs(cfg.duration_secs),
            batch_size: cfg.batch_size,
            batch_interval: Duration::from_millis(cfg.batch_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamOutcome {
    pub batches: u64,
    pub rows: u64,
    pub reconnects: u32,
    pub elapsed_seconds: f64,
    pub interrupted: bool,
}

/// Runs until `plan.duration` elapses or `cancel` fires. The caller owns
/// the pool and closes it afterwards.
pub async fn run<C, G>(
    sink: &BatchSink<C, G::Row>,
    plan: &StreamPlan,
    mut generator: G,
    cancel: &CancellationToken,
) -> Result<StreamOutcome>
where
    C: Connector,
    G: BatchGenerator,
{
    println!("Starting transaction generator...");
    info!(
        duration_secs = plan.duration.as_secs(),
        batch_size = plan.batch_size,
        "stream_started"
    );

    let start = Instant::now();
    let end = start + plan.duration;
    let mut outcome = StreamOutcome::default();
    let mut batch = Vec::with_capacity(plan.batch_size);

    while Instant::now() < end {
        if cancel.is_cancelled() {
            break;
        }

        batch.clear();
        generator.fill(plan.batch_size, &mut batch);

        match sink.write(0, &batch, &mut outcome.reconnects).await {
            Ok(rows) => {
                outcome.batches += 1;
                outcome.rows += rows;
                println!("Inserted {} transactions at {}", rows, Utc::now().to_rfc3339());
            }
            Err(IngestError::Cancelled) => break,
            Err(e) => {
                warn!(error = %e, kind = e.kind().as_str(), "stream_batch_failed");
                return Err(e);
            }
        }

        if !plan.batch_interval.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(plan.batch_interval) => {}
            }
        }
    }

    outcome.interrupted = cancel.is_cancelled();
    outcome.elapsed_seconds = start.elapsed().as_secs_f64();
    if outcome.interrupted {
        println!("Generator stopped manually.");
    }
    info!(
        batches = outcome.batches,
        rows = outcome.rows,
        reconnects = outcome.reconnects,
        elapsed_secs = outcome.elapsed_seconds,
        interrupted = outcome.interrupted,
        "stream_finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::RetryPolicy;
    use crate::generator::{TransactionGenerator, TransactionRow};
    use crate::memory::{MemoryConnector, MemoryDatabase};
    use crate::pool::{Pool, PoolConfig};
    use crate::writer::BatchWriter;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    const TABLE: &str = "public.transactions";

    async fn sink(
        db: &Arc<MemoryDatabase>,
        cancel: &CancellationToken,
    ) -> BatchSink<MemoryConnector, TransactionRow> {
        let pool = Pool::open(PoolConfig::new(1, 2), MemoryConnector::new(db.clone()))
            .await
            .unwrap();
        let writer = Arc::new(BatchWriter::<TransactionRow>::new(TABLE).unwrap());
        BatchSink::new(
            pool,
            writer,
            RetryPolicy {
                acquire_retries: 1,
                backoff: Duration::from_millis(1),
            },
            cancel.clone(),
        )
    }

    fn generator() -> TransactionGenerator {
        TransactionGenerator::with_rng(&["Phone".to_string()], StdRng::seed_from_u64(3))
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_deadline_then_pool_drains() {
        let db = MemoryDatabase::new();
        let cancel = CancellationToken::new();
        let sink = sink(&db, &cancel).await;
        let plan = StreamPlan {
            duration: Duration::from_millis(60),
            batch_size: 10,
            batch_interval: Duration::from_millis(10),
        };

        let outcome = run(&sink, &plan, generator(), &cancel).await.unwrap();
        assert!(!outcome.interrupted);
        // One batch every 10 ms inside a 60 ms window.
        assert_eq!(outcome.batches, 6);
        assert_eq!(outcome.rows, 60);
        assert_eq!(db.row_count(TABLE) as u64, outcome.rows);

        sink.pool().close().await;
        let stats = sink.pool().stats().await;
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.live, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_the_loop() {
        let db = MemoryDatabase::new();
        let cancel = CancellationToken::new();
        let sink = sink(&db, &cancel).await;
        let plan = StreamPlan {
            duration: Duration::from_secs(3600),
            batch_size: 10,
            batch_interval: Duration::from_millis(5),
        };

        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            })
        };
        let outcome = run(&sink, &plan, generator(), &cancel).await.unwrap();
        stopper.await.unwrap();

        assert!(outcome.interrupted);
        assert!((outcome.elapsed_seconds - 0.030).abs() < 1e-6);
        // The stop and the sixth sleep land on the same tick.
        assert!((6..=7).contains(&outcome.batches), "{outcome:?}");
    }

    #[tokio::test]
    async fn repeated_connection_loss_ends_the_stream() {
        let db = MemoryDatabase::new();
        db.inject_connection_loss(1, 2);
        let cancel = CancellationToken::new();
        let sink = sink(&db, &cancel).await;
        let plan = StreamPlan {
            duration: Duration::from_secs(5),
            batch_size: 1,
            batch_interval: Duration::ZERO,
        };

        let err = run(&sink, &plan, generator(), &cancel).await.unwrap_err();
        assert!(err.is_connection_lost());
    }
}
