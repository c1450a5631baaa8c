mod benchmark;
mod config;
mod credentials;
mod error;
mod generator;
#[cfg(test)]
mod memory;
mod pool;
mod report;
mod schema;
mod session;
mod stream;
mod writer;

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::benchmark::{BatchSink, RetryPolicy};
use crate::config::{BenchOverrides, Config, Workload};
use crate::credentials::CredentialProvider;
use crate::generator::{LakeRow, TransactionGenerator, TransactionRow};
use crate::pool::{Pool, PoolConfig};
use crate::session::PgConnector;
use crate::writer::BatchWriter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const MIN_WORKER_THREADS: usize = 10;
const DEFAULT_PARALLELISM: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "lakebase-ingest", version, about = "Connection-pooled bulk-ingestion benchmark")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "INGEST_CONFIG", default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the parallel worker benchmark over the configured runs.
    Bench(BenchArgs),
    /// Insert transaction batches one at a time until a deadline.
    Stream(StreamArgs),
    /// Read back a few keys from a target table.
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    iterations: Option<u64>,
    /// Stop starting new batches after this many seconds (0 = no limit).
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct StreamArgs {
    #[arg(long)]
    duration_secs: Option<u64>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    batch_interval_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Read the stream table instead of the bench table.
    #[arg(long)]
    stream: bool,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::from_file(&cli.config)?;
    apply_cli(&mut cfg, &cli.command);
    cfg.validate()?;

    init_tracing()?;

    let worker_threads = calculate_worker_threads(cfg.runtime_threads);

    // Ctrl-C cancels in-flight work; workers stop at the next boundary.
    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("shutdown_signal_received");
        shutdown_signal.cancel();
    })?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    let ok = rt.block_on(async move {
        tracing::info!(
            instance = %cfg.database.instance,
            worker_threads,
            "starting_lakebase_ingest"
        );

        match dispatch(&cfg, cli.command, &shutdown).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!(error = %e, "ingest_failed");
                println!("error: {e:#}");
                false
            }
        }
    });

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn apply_cli(cfg: &mut Config, command: &Command) {
    match command {
        Command::Bench(args) => cfg.apply_bench_overrides(&BenchOverrides {
            workers: args.workers,
            batch_size: args.batch_size,
            iterations: args.iterations,
            duration_secs: args.duration_secs,
        }),
        Command::Stream(args) => {
            if let Some(v) = args.duration_secs {
                cfg.stream.duration_secs = v;
            }
            if let Some(v) = args.batch_size {
                cfg.stream.batch_size = v;
            }
            if let Some(v) = args.batch_interval_ms {
                cfg.stream.batch_interval_ms = v;
            }
        }
        Command::Verify(_) => {}
    }
}

/// Returns whether the command completed without any failed worker.
async fn dispatch(cfg: &Config, command: Command, shutdown: &CancellationToken) -> Result<bool> {
    let provider = credentials::from_config(&cfg.database)?;
    preflight(provider.as_ref(), &cfg.database.instance).await?;

    let connector = || {
        PgConnector::new(
            Arc::clone(&provider),
            cfg.database.instance.clone(),
            cfg.database.sslmode,
            cfg.database.connect_timeout(),
        )
    };

    match command {
        Command::Bench(_) => {
            let reports = benchmark::run_suite(cfg, connector, shutdown).await?;
            for report in reports.iter().filter(|r| r.failed()) {
                tracing::error!(
                    workers = report.run.workers,
                    batch_size = report.run.batch_size,
                    failed_workers = report.outcome.failed_workers(),
                    complete = report.metrics.complete(),
                    "run_failed"
                );
            }
            Ok(reports.iter().all(|r| !r.failed()))
        }
        Command::Stream(_) => {
            let pool = Pool::open(stream_pool_config(cfg), connector()?).await?;
            let writer = Arc::new(BatchWriter::<TransactionRow>::new(cfg.stream.table.as_str())?);
            let sink = BatchSink::new(pool.clone(), writer, retry_policy(cfg), shutdown.clone());
            let plan = stream::StreamPlan::from_config(&cfg.stream);

            let result = stream::run(
                &sink,
                &plan,
                TransactionGenerator::new(&cfg.stream.promo_items),
                shutdown,
            )
            .await;
            pool.close().await;
            println!("Connection pool closed.");

            let outcome = result?;
            println!(
                "Inserted {} rows via {} transactions in {:.2} sec",
                outcome.rows, outcome.batches, outcome.elapsed_seconds
            );
            Ok(true)
        }
        Command::Verify(args) => {
            let pool = Pool::open(PoolConfig::new(0, 1), connector()?).await?;
            let keys = if args.stream {
                verify_table::<TransactionRow>(&pool, &cfg.stream.table, args.limit).await
            } else {
                match cfg.bench.workload {
                    Workload::Lake => {
                        verify_table::<LakeRow>(&pool, &cfg.bench.table, args.limit).await
                    }
                    Workload::Transactions => {
                        verify_table::<TransactionRow>(&pool, &cfg.bench.table, args.limit).await
                    }
                }
            };
            pool.close().await;

            let keys = keys?;
            for key in &keys {
                println!("{key}");
            }
            println!("{} rows read", keys.len());
            Ok(true)
        }
    }
}

/// Credentials are fatal before any worker starts.
async fn preflight(provider: &dyn CredentialProvider, instance: &str) -> Result<()> {
    let host = provider.resolve_host(instance).await?;
    let cred = provider.issue(instance).await?;
    tracing::info!(
        instance,
        host = %host,
        user = %cred.username,
        database = %cred.database,
        issued_at = %cred.issued_at,
        "credential_ready"
    );
    Ok(())
}

async fn verify_table<R: schema::Record>(
    pool: &Pool<PgConnector>,
    table: &str,
    limit: usize,
) -> error::Result<Vec<String>> {
    let writer = BatchWriter::<R>::new(table)?;
    let mut lease = pool.acquire().await?;
    let keys = writer.verify(&mut *lease, limit).await;
    if let Ok(keys) = &keys {
        tracing::info!(table = writer.schema().name(), rows = keys.len(), "verify_done");
    }
    match &keys {
        Err(e) if e.is_connection_lost() => pool.discard(lease).await,
        _ => pool.release(lease).await,
    }
    keys
}

fn stream_pool_config(cfg: &Config) -> PoolConfig {
    let max_size = cfg.pool.max_size.unwrap_or(1).max(1);
    PoolConfig::new(cfg.pool.min_size.min(max_size), max_size)
        .with_acquire_timeout(cfg.pool.acquire_timeout_ms.map(Duration::from_millis))
        .with_non_blocking(cfg.pool.non_blocking)
}

fn retry_policy(cfg: &Config) -> RetryPolicy {
    RetryPolicy {
        acquire_retries: cfg.pool.acquire_retries,
        backoff: Duration::from_millis(cfg.pool.retry_backoff_ms),
    }
}

fn init_tracing() -> Result<()> {
    // stdout carries status and summary lines; structured logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_writer(std::io::stderr)
                .with_file(false)
                .with_line_number(false)
                .with_target(false),
        )
        .with(EnvFilter::from_default_env().add_directive("lakebase_ingest=info".parse()?))
        .try_init()
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    Ok(())
}

fn calculate_worker_threads(config_threads: Option<usize>) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_PARALLELISM);

    config_threads
        .unwrap_or(available)
        .max(available)
        .max(MIN_WORKER_THREADS)
}
