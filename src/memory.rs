//! In-memory `Session` / `Connector` used by the tests.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::credentials::CredentialProvider;
use crate::error::{IngestError, Result};
use crate::schema::{ColumnData, TableSchema};
use crate::session::{Connector, Session};

#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<HashMap<String, BTreeSet<String>>>,
    pub create_calls: AtomicU64,
    pub transactions: AtomicU64,
    pub insert_attempts: AtomicU64,
    fail_from_attempt: AtomicU64,
    failures_left: AtomicU32,
    insert_delay_ms: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The `count` inserts starting at attempt number `from` (1-based) fail
    /// with a transport error and break their session.
    pub fn inject_connection_loss(&self, from: u64, count: u32) {
        self.fail_from_attempt.store(from, Ordering::SeqCst);
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn set_insert_delay(&self, delay: Duration) {
        self.insert_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map_or(0, BTreeSet::len)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.lock().unwrap().contains_key(table)
    }

    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::SeqCst)
    }

    fn take_failure(&self, attempt: u64) -> bool {
        if attempt < self.fail_from_attempt.load(Ordering::SeqCst) {
            return false;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct MemorySession {
    db: Arc<MemoryDatabase>,
    broken: bool,
}

#[async_trait]
impl Session for MemorySession {
    async fn create_table(&mut self, schema: &TableSchema) -> Result<()> {
        self.db.create_calls.fetch_add(1, Ordering::SeqCst);
        self.db
            .tables
            .lock()
            .unwrap()
            .entry(schema.name().to_string())
            .or_default();
        Ok(())
    }

    async fn insert_batch(&mut self, schema: &TableSchema, columns: &[ColumnData]) -> Result<u64> {
        if self.broken {
            return Err(IngestError::connection_lost("connection closed"));
        }
        let attempt = self.db.insert_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.db.take_failure(attempt) {
            self.broken = true;
            return Err(IngestError::connection_lost("connection reset by peer"));
        }

        let delay = self.db.insert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let key_col = &columns[schema.key_index()];
        let mut tables = self.db.tables.lock().unwrap();
        let Some(table) = tables.get_mut(schema.name()) else {
            return Err(IngestError::statement(
                "42P01",
                format!("relation \"{}\" does not exist", schema.name()),
            ));
        };
        let inserted = (0..key_col.len())
            .filter_map(|i| key_col.render(i))
            .filter(|key| table.insert(key.clone()))
            .count();
        self.db.transactions.fetch_add(1, Ordering::SeqCst);
        Ok(inserted as u64)
    }

    async fn select_keys(&mut self, schema: &TableSchema, limit: usize) -> Result<Vec<String>> {
        let tables = self.db.tables.lock().unwrap();
        let table = tables.get(schema.name()).ok_or_else(|| {
            IngestError::statement("42P01", format!("relation \"{}\" does not exist", schema.name()))
        })?;
        Ok(table.iter().take(limit).cloned().collect())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

pub struct MemoryConnector {
    db: Arc<MemoryDatabase>,
    provider: Option<(Arc<dyn CredentialProvider>, String)>,
    pub connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self {
            db,
            provider: None,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn with_provider(
        db: Arc<MemoryDatabase>,
        provider: Arc<dyn CredentialProvider>,
        instance: &str,
    ) -> Self {
        Self {
            db,
            provider: Some((provider, instance.to_string())),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession> {
        if let Some((provider, instance)) = &self.provider {
            provider.issue(instance).await?;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            db: Arc::clone(&self.db),
            broken: false,
        })
    }
}
