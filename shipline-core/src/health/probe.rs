use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tokio::net::TcpStream;
use url::Url;

use crate::command::{command_from_line, describe, CommandExecutor, SystemCommandExecutor};
use crate::pipeline::{CheckKind, HealthCheckSpec};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {actual} (expected {expected})")]
    UnexpectedStatus { expected: u16, actual: u16 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("probe task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Executes one attempt of a health check against its target.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Returns a short description of what was observed on success.
    async fn probe(&self, check: &HealthCheckSpec) -> Result<String, ProbeError>;
}

/// Probes real endpoints: HTTP, TCP, databases and local commands.
#[derive(Clone)]
pub struct SystemProbe {
    client: reqwest::Client,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemProbe").finish_non_exhaustive()
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SystemProbe {
    pub fn new(executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            client: reqwest::Client::new(),
            executor,
        }
    }

    async fn probe_http(&self, check: &HealthCheckSpec) -> Result<String, ProbeError> {
        let response = self.client.get(&check.target).send().await?;
        let actual = response.status().as_u16();
        if actual != check.expected_status {
            return Err(ProbeError::UnexpectedStatus {
                expected: check.expected_status,
                actual,
            });
        }
        Ok(format!("HTTP {actual}"))
    }

    async fn probe_tcp(&self, address: &str) -> Result<String, ProbeError> {
        let stream = TcpStream::connect(address).await?;
        let peer = stream.peer_addr()?;
        Ok(format!("connected to {peer}"))
    }

    async fn probe_database(&self, check: &HealthCheckSpec) -> Result<String, ProbeError> {
        if let Some(path) = check.target.strip_prefix("sqlite://") {
            let path = path.to_string();
            let value = tokio::task::spawn_blocking(move || -> rusqlite::Result<i64> {
                let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
                conn.query_row("SELECT 1", [], |row| row.get(0))
            })
            .await??;
            return Ok(format!("SELECT 1 returned {value}"));
        }

        let url = Url::parse(&check.target).map_err(|err| ProbeError::InvalidTarget {
            target: check.target.clone(),
            reason: err.to_string(),
        })?;
        let host = url.host_str().ok_or_else(|| ProbeError::InvalidTarget {
            target: check.target.clone(),
            reason: "missing host".into(),
        })?;
        let port = url
            .port_or_known_default()
            .or_else(|| default_database_port(url.scheme()))
            .ok_or_else(|| ProbeError::InvalidTarget {
                target: check.target.clone(),
                reason: "missing port".into(),
            })?;
        self.probe_tcp(&format!("{host}:{port}")).await
    }

    async fn probe_command(&self, check: &HealthCheckSpec) -> Result<String, ProbeError> {
        let mut command =
            command_from_line(&check.target).ok_or_else(|| ProbeError::InvalidTarget {
                target: check.target.clone(),
                reason: "empty command or unbalanced quotes".into(),
            })?;
        let output = self.executor.run(&mut command).await?;
        if !output.status.success() {
            return Err(ProbeError::CommandFailure {
                command: describe(&command),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn default_database_port(scheme: &str) -> Option<u16> {
    match scheme {
        "postgres" | "postgresql" => Some(5432),
        "mysql" | "mariadb" => Some(3306),
        "redis" => Some(6379),
        "mongodb" => Some(27017),
        _ => None,
    }
}

#[async_trait]
impl Probe for SystemProbe {
    async fn probe(&self, check: &HealthCheckSpec) -> Result<String, ProbeError> {
        match check.kind {
            CheckKind::Http => self.probe_http(check).await,
            CheckKind::Tcp => self.probe_tcp(&check.target).await,
            CheckKind::Database => self.probe_database(check).await,
            CheckKind::Custom => self.probe_command(check).await,
        }
    }
}
