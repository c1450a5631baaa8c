//! Batch writer: one conflict-skipping multi-row insert per transaction.
//!
//! `write` reports the rows it *attempted*. Rows skipped because their key
//! already exists still count, so throughput does not depend on the
//! collision rate. The server's own count is only logged.

use std::marker::PhantomData;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::Result;
use crate::schema::{Record, TableSchema};
use crate::session::Session;

pub struct BatchWriter<R: Record> {
    schema: TableSchema,
    table_ready: OnceCell<()>,
    _rows: PhantomData<fn(&R)>,
}

impl<R: Record> BatchWriter<R> {
    pub fn new(table: impl Into<String>) -> Result<Self> {
        Ok(Self::with_schema(TableSchema::for_record::<R>(table)?))
    }

    pub fn with_schema(schema: TableSchema) -> Self {
        Self {
            schema,
            table_ready: OnceCell::new(),
            _rows: PhantomData,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Creates the table if it does not exist. Runs once per writer; safe to
    /// call concurrently.
    pub async fn ensure_table<S: Session>(&self, session: &mut S) -> Result<()> {
        self.table_ready
            .get_or_try_init(|| session.create_table(&self.schema))
            .await?;
        Ok(())
    }

    pub async fn write<S: Session>(&self, session: &mut S, batch: &[R]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.ensure_table(session).await?;

        let columns = R::to_columns(batch);
        debug_assert!(columns.iter().all(|c| c.len() == batch.len()));
        let persisted = session.insert_batch(&self.schema, &columns).await?;
        let attempted = batch.len() as u64;
        if persisted < attempted {
            debug!(
                table = self.schema.name(),
                attempted,
                persisted,
                first_key = %batch[0].key(),
                "batch_conflicts_skipped"
            );
        }
        Ok(attempted)
    }

    /// `SELECT ... LIMIT n` over the target table, returning primary keys.
    pub async fn verify<S: Session>(&self, session: &mut S, limit: usize) -> Result<Vec<String>> {
        session.select_keys(&self.schema, limit).await
    }
}
