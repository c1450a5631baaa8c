use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Coarse classification used for counters and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Credential,
    PoolExhausted,
    PoolClosed,
    ConnectionLost,
    Connect,
    Statement,
    Cancelled,
    Config,
    Worker,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::PoolExhausted => "pool_exhausted",
            Self::PoolClosed => "pool_closed",
            Self::ConnectionLost => "connection_lost",
            Self::Connect => "connect",
            Self::Statement => "statement",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
            Self::Worker => "worker",
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    /// Token issuance failed. Fatal before any worker starts.
    #[error("credential issuance failed for instance {instance}: {message}")]
    Credential { instance: String, message: String },

    #[error("no connection available after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("connection pool is closed")]
    PoolClosed,

    /// Transport failure on an established session.
    #[error("connection lost: {message}")]
    ConnectionLost {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("failed to connect to {host}: {message}")]
    Connect {
        host: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Server rejected a statement.
    #[error("statement failed: {message}")]
    Statement {
        sqlstate: Option<String>,
        message: String,
        detail: Option<String>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("worker {worker_index} aborted: {message}")]
    Worker { worker_index: usize, message: String },
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Credential { .. } => ErrorKind::Credential,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::PoolClosed => ErrorKind::PoolClosed,
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::Connect { .. } => ErrorKind::Connect,
            Self::Statement { .. } => ErrorKind::Statement,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config { .. } => ErrorKind::Config,
            Self::Worker { .. } => ErrorKind::Worker,
        }
    }

    #[inline]
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    #[cfg(test)]
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn credential(instance: &str, message: impl Into<String>) -> Self {
        Self::Credential {
            instance: instance.to_string(),
            message: message.into(),
        }
    }

    #[cfg(test)]
    pub fn statement(sqlstate: &str, message: impl Into<String>) -> Self {
        Self::Statement {
            sqlstate: Some(sqlstate.to_string()),
            message: message.into(),
            detail: None,
        }
    }
}
