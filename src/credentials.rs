//! Credential issuance for the database endpoint.
//!
//! Tokens are short-lived and opaque. Callers ask for a fresh one on every
//! physical connection instead of caching them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use crate::config::{DatabaseConfig, Endpoint};
use crate::error::{IngestError, Result};

#[derive(Clone)]
pub struct Credential {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn issue(&self, instance: &str) -> Result<Credential>;

    async fn resolve_host(&self, instance: &str) -> Result<String>;
}

/// Build the provider described by the `[database]` table.
pub fn from_config(cfg: &DatabaseConfig) -> anyhow::Result<Arc<dyn CredentialProvider>> {
    let endpoint = cfg.endpoint()?;
    match &cfg.token_command {
        Some(argv) => Ok(Arc::new(CommandCredentials::new(argv.clone(), endpoint)?)),
        None => Ok(Arc::new(StaticCredentials::new(endpoint, cfg.password_env.clone()))),
    }
}

/// Endpoint from configuration, password read from an environment variable
/// each time a credential is issued.
pub struct StaticCredentials {
    endpoint: Endpoint,
    password_env: String,
}

impl StaticCredentials {
    pub fn new(endpoint: Endpoint, password_env: String) -> Self {
        Self {
            endpoint,
            password_env,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn issue(&self, instance: &str) -> Result<Credential> {
        let host = self.resolve_host(instance).await?;
        let password = std::env::var(&self.password_env).map_err(|_| {
            IngestError::credential(
                instance,
                format!("environment variable {} is not set", self.password_env),
            )
        })?;
        Ok(Credential {
            host,
            port: self.endpoint.port,
            database: self.endpoint.database.clone(),
            username: self.endpoint.user.clone(),
            password,
            issued_at: Utc::now(),
        })
    }

    async fn resolve_host(&self, instance: &str) -> Result<String> {
        self.endpoint
            .host
            .clone()
            .ok_or_else(|| IngestError::credential(instance, "no host configured"))
    }
}

/// Runs an external command per issuance. Its stdout is either the bare
/// token or a JSON object carrying `token` and optionally `host`.
pub struct CommandCredentials {
    program: String,
    args: Vec<String>,
    endpoint: Endpoint,
}

#[derive(Debug, Deserialize)]
struct TokenOutput {
    token: String,
    host: Option<String>,
}

impl CommandCredentials {
    pub fn new(argv: Vec<String>, endpoint: Endpoint) -> anyhow::Result<Self> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .ok_or_else(|| anyhow::anyhow!("database.token_command must not be empty"))?;
        Ok(Self {
            program,
            args: argv.collect(),
            endpoint,
        })
    }

    async fn run(&self, instance: &str) -> Result<TokenOutput> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .env("INGEST_INSTANCE", instance)
            .output()
            .await
            .map_err(|e| {
                IngestError::credential(instance, format!("failed to run {}: {e}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IngestError::credential(
                instance,
                format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_token_output(&stdout).ok_or_else(|| {
            IngestError::credential(instance, format!("{} printed no token", self.program))
        })
    }
}

#[async_trait]
impl CredentialProvider for CommandCredentials {
    async fn issue(&self, instance: &str) -> Result<Credential> {
        let out = self.run(instance).await?;
        let host = out
            .host
            .or_else(|| self.endpoint.host.clone())
            .ok_or_else(|| IngestError::credential(instance, "no host configured or issued"))?;
        debug!(instance, host = %host, "credential_issued");
        Ok(Credential {
            host,
            port: self.endpoint.port,
            database: self.endpoint.database.clone(),
            username: self.endpoint.user.clone(),
            password: out.token,
            issued_at: Utc::now(),
        })
    }

    async fn resolve_host(&self, instance: &str) -> Result<String> {
        match &self.endpoint.host {
            Some(host) => Ok(host.clone()),
            None => Ok(self.issue(instance).await?.host),
        }
    }
}

fn parse_token_output(stdout: &str) -> Option<TokenOutput> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') {
        return serde_json::from_str::<TokenOutput>(trimmed)
            .ok()
            .filter(|t| !t.token.is_empty());
    }
    Some(TokenOutput {
        token: trimmed.to_string(),
        host: None,
    })
}
