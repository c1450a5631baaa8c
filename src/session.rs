//! The connection seam: what the pool hands out and how new sessions are
//! opened. `PgSession` / `PgConnector` speak the Postgres wire protocol via
//! `tokio-postgres`.

use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::Client;
use tracing::warn;

use crate::config::SslMode;
use crate::credentials::CredentialProvider;
use crate::error::{IngestError, Result};
use crate::schema::{ColumnData, TableSchema};

const APPLICATION_NAME: &str = "lakebase-ingest";

/// A single authenticated session. Owned by exactly one caller at a time.
#[async_trait]
pub trait Session: Send + 'static {
    /// `CREATE TABLE IF NOT EXISTS` for `schema`.
    async fn create_table(&mut self, schema: &TableSchema) -> Result<()>;

    /// Inserts one column-wise batch inside a single transaction and
    /// returns the number of rows the server reports as inserted.
    async fn insert_batch(&mut self, schema: &TableSchema, columns: &[ColumnData]) -> Result<u64>;

    /// Primary keys of up to `limit` rows, rendered as text.
    async fn select_keys(&mut self, schema: &TableSchema, limit: usize) -> Result<Vec<String>>;

    /// True once the transport is known to be unusable.
    fn is_broken(&self) -> bool;
}

/// Opens new physical sessions for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn connect(&self) -> Result<Self::Session>;
}

pub struct PgSession {
    client: Client,
}

#[async_trait]
impl Session for PgSession {
    async fn create_table(&mut self, schema: &TableSchema) -> Result<()> {
        self.client
            .batch_execute(&schema.create_sql())
            .await
            .map_err(classify)
    }

    async fn insert_batch(&mut self, schema: &TableSchema, columns: &[ColumnData]) -> Result<u64> {
        let sql = schema.insert_sql();
        let params: Vec<_> = columns.iter().map(ColumnData::as_param).collect();

        let tx = self.client.transaction().await.map_err(classify)?;
        let inserted = tx.execute(sql.as_str(), &params).await.map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(inserted)
    }

    async fn select_keys(&mut self, schema: &TableSchema, limit: usize) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(schema.select_keys_sql(limit).as_str(), &[])
            .await
            .map_err(classify)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(classify))
            .collect()
    }

    fn is_broken(&self) -> bool {
        self.client.is_closed()
    }
}

/// Asks the credential provider for a fresh credential on every connect.
pub struct PgConnector {
    provider: Arc<dyn CredentialProvider>,
    instance: String,
    sslmode: SslMode,
    connect_timeout: Option<Duration>,
    tls: MakeTlsConnector,
}

impl PgConnector {
    pub fn new(
        provider: Arc<dyn CredentialProvider>,
        instance: impl Into<String>,
        sslmode: SslMode,
        connect_timeout: Option<Duration>,
    ) -> Result<Self> {
        // Actual TLS use is governed by sslmode.
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| IngestError::config(format!("failed to build TLS connector: {e}")))?;
        Ok(Self {
            provider,
            instance: instance.into(),
            sslmode,
            connect_timeout,
            tls: MakeTlsConnector::new(tls),
        })
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    async fn connect(&self) -> Result<PgSession> {
        let cred = self.provider.issue(&self.instance).await?;

        let mut pg = tokio_postgres::Config::new();
        pg.host(&cred.host)
            .port(cred.port)
            .dbname(&cred.database)
            .user(&cred.username)
            .password(&cred.password)
            .application_name(APPLICATION_NAME)
            .ssl_mode(match self.sslmode {
                SslMode::Disable => tokio_postgres::config::SslMode::Disable,
                SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
                SslMode::Require => tokio_postgres::config::SslMode::Require,
            });
        if let Some(timeout) = self.connect_timeout {
            pg.connect_timeout(timeout);
        }

        let (client, connection) =
            pg.connect(self.tls.clone())
                .await
                .map_err(|e| IngestError::Connect {
                    host: cred.host.clone(),
                    message: e.to_string(),
                    source: Some(Box::new(e)),
                })?;

        let host = cred.host;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, host = %host, "connection_task_error");
            }
        });

        Ok(PgSession { client })
    }
}

fn is_connection_error(msg: &str) -> bool {
    const CONNECTION_ERROR_PATTERNS: &[&str] =
        &["closed", "connection", "broken pipe", "reset", "EOF"];
    CONNECTION_ERROR_PATTERNS
        .iter()
        .any(|pattern| msg.contains(pattern))
}

/// Server-side errors become `Statement`, transport failures
/// `ConnectionLost`.
fn classify(err: tokio_postgres::Error) -> IngestError {
    if let Some(db) = err.as_db_error() {
        return IngestError::Statement {
            sqlstate: Some(db.code().code().to_string()),
            message: db.message().to_string(),
            detail: db.detail().map(str::to_string),
        };
    }

    let msg = err.to_string();
    if err.is_closed() || is_connection_error(&msg) {
        IngestError::ConnectionLost {
            message: msg,
            source: Some(Box::new(err)),
        }
    } else {
        IngestError::Statement {
            sqlstate: None,
            message: msg,
            detail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_patterns() {
        assert!(is_connection_error("connection closed"));
        assert!(is_connection_error("error communicating with the server: broken pipe"));
        assert!(is_connection_error("unexpected EOF"));
        assert!(!is_connection_error("duplicate key value violates unique constraint"));
    }
}
