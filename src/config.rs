use serde::Deserialize;
use std::time::Duration;

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_DATABASE: &str = "databricks_postgres";
const DEFAULT_PASSWORD_ENV: &str = "PGPASSWORD";
const OVERRIDE_ENV: &str = "INGEST_OVERRIDE";

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    Prefer,
    #[default]
    Require,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Logical instance name handed to the credential provider.
    pub instance: String,
    /// `postgres://user@host:port/db`; discrete fields below take precedence.
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// External command printing a token (or `{"token": ..}`) to stdout.
    pub token_command: Option<Vec<String>>,
    #[serde(default)]
    pub sslmode: SslMode,
    pub connect_timeout_ms: Option<u64>,
}

/// Fully resolved connection endpoint, minus the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Option<String>,
    pub port: u16,
    pub database: String,
    pub user: String,
}

impl DatabaseConfig {
    pub fn endpoint(&self) -> anyhow::Result<Endpoint> {
        let parsed = match &self.url {
            Some(raw) => Some(url::Url::parse(raw)?),
            None => None,
        };

        let host = self
            .host
            .clone()
            .or_else(|| parsed.as_ref().and_then(|u| u.host_str().map(str::to_string)));
        let port = self
            .port
            .or_else(|| parsed.as_ref().and_then(|u| u.port()))
            .unwrap_or(DEFAULT_PORT);
        let database = self
            .database
            .clone()
            .or_else(|| {
                parsed
                    .as_ref()
                    .map(|u| u.path().trim_start_matches('/').to_string())
                    .filter(|p| !p.is_empty())
            })
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());
        let user = self
            .user
            .clone()
            .or_else(|| {
                parsed
                    .as_ref()
                    .map(|u| u.username().to_string())
                    .filter(|u| !u.is_empty())
            })
            .ok_or_else(|| anyhow::anyhow!("database.user is required (or a user in database.url)"))?;

        Ok(Endpoint {
            host,
            port,
            database,
            user,
        })
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    /// Defaults to the worker count of each run.
    pub max_size: Option<usize>,
    pub acquire_timeout_ms: Option<u64>,
    #[serde(default)]
    pub non_blocking: bool,
    #[serde(default = "default_acquire_retries")]
    pub acquire_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: None,
            acquire_timeout_ms: None,
            non_blocking: false,
            acquire_retries: default_acquire_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    /// `(id BIGINT, name TEXT)` rows with random ids.
    #[default]
    Lake,
    /// Ten-field retail transactions.
    Transactions,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BenchRun {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub workers: usize,
    pub batch_size: usize,
    pub iterations: u64,
    /// 0 means no deadline.
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BenchConfig {
    #[serde(default = "default_bench_table")]
    pub table: String,
    #[serde(default)]
    pub workload: Workload,
    /// Upper bound of the random id space for lake rows.
    #[serde(default = "default_key_space")]
    pub key_space: u64,
    #[serde(default)]
    pub runs: Vec<BenchRun>,
    #[serde(default = "default_pause_between_runs")]
    pub pause_between_runs_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_stream_table")]
    pub table: String,
    #[serde(default = "default_stream_duration")]
    pub duration_secs: u64,
    #[serde(default = "default_stream_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub batch_interval_ms: u64,
    #[serde(default = "default_promo_items")]
    pub promo_items: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            table: default_stream_table(),
            duration_secs: default_stream_duration(),
            batch_size: default_stream_batch_size(),
            batch_interval_ms: 0,
            promo_items: default_promo_items(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    pub bench: BenchConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    pub runtime_threads: Option<usize>,
}

/// Command-line values layered over the `[bench]` table.
#[derive(Debug, Clone, Default)]
pub struct BenchOverrides {
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub iterations: Option<u64>,
    pub duration_secs: Option<u64>,
}

impl BenchOverrides {
    pub fn is_empty(&self) -> bool {
        self.workers.is_none()
            && self.batch_size.is_none()
            && self.iterations.is_none()
            && self.duration_secs.is_none()
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {path}: {e}"))?;
        let mut cfg = Self::parse(&s)?;

        // Example: INGEST_OVERRIDE='workers = 8, batch_size = 100, iterations = 500'
        if let Ok(run) = std::env::var(OVERRIDE_ENV) {
            cfg = Self::apply_run_override(cfg, &run)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    fn apply_run_override(mut cfg: Config, run_str: &str) -> anyhow::Result<Self> {
        // Inline key/values, comma or newline separated.
        let normalized = run_str.replace(", ", "\n").replace(',', "\n");

        let run: BenchRun = toml::from_str(&normalized).map_err(|e| {
            anyhow::anyhow!(
                "failed to parse {OVERRIDE_ENV}: {e}. Expected format: 'workers = 8, batch_size = 100, iterations = 500, duration_secs = 0'"
            )
        })?;

        // Tracing is not initialized yet.
        eprintln!(
            "{OVERRIDE_ENV} detected: workers={}, batch_size={}, iterations={}",
            run.workers, run.batch_size, run.iterations
        );

        cfg.bench.runs = vec![run];
        Ok(cfg)
    }

    /// Replaces the run list with one run built from the first enabled run
    /// (or defaults) and the given overrides.
    pub fn apply_bench_overrides(&mut self, overrides: &BenchOverrides) {
        if overrides.is_empty() {
            return;
        }
        let base = self
            .bench
            .runs
            .iter()
            .find(|r| r.enabled)
            .cloned()
            .unwrap_or_else(BenchRun::baseline);

        self.bench.runs = vec![BenchRun {
            enabled: true,
            workers: overrides.workers.unwrap_or(base.workers),
            batch_size: overrides.batch_size.unwrap_or(base.batch_size),
            iterations: overrides.iterations.unwrap_or(base.iterations),
            duration_secs: overrides.duration_secs.unwrap_or(base.duration_secs),
            metrics_interval_secs: base.metrics_interval_secs,
        }];
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.database.endpoint()?;
        if let Some(max) = self.pool.max_size {
            anyhow::ensure!(max >= 1, "pool.max_size must be at least 1");
            anyhow::ensure!(
                self.pool.min_size <= max,
                "pool.min_size ({}) must not exceed pool.max_size ({})",
                self.pool.min_size,
                max
            );
        }
        anyhow::ensure!(self.bench.key_space >= 1, "bench.key_space must be at least 1");
        for (idx, run) in self.bench.runs.iter().enumerate() {
            anyhow::ensure!(run.workers >= 1, "bench.runs[{idx}].workers must be at least 1");
        }
        Ok(())
    }
}

impl BenchRun {
    /// The notebook-sized run: 4 workers, 100-row batches, 500 iterations.
    pub fn baseline() -> Self {
        Self {
            enabled: true,
            workers: 4,
            batch_size: 100,
            iterations: 500,
            duration_secs: 0,
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

fn default_password_env() -> String {
    DEFAULT_PASSWORD_ENV.to_string()
}

fn default_min_size() -> usize {
    4
}

fn default_acquire_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_metrics_interval() -> u64 {
    5
}

fn default_bench_table() -> String {
    "public.lakebase_data".to_string()
}

fn default_key_space() -> u64 {
    1_000_000_000
}

fn default_pause_between_runs() -> u64 {
    5
}

fn default_stream_table() -> String {
    "public.transactions".to_string()
}

fn default_stream_duration() -> u64 {
    15 * 60
}

fn default_stream_batch_size() -> usize {
    10
}

fn default_promo_items() -> Vec<String> {
    vec!["Phone".to_string(), "Laptop".to_string()]
}
