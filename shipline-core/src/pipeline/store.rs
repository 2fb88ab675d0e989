use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::Utc;
use rusqlite::backup::Backup;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::sqlite::configure_connection;

use super::error::{StoreError, StoreResult};
use super::models::{
    ConfigRef, ExecutionStatus, PipelineConfig, PipelineExecution, RollbackRecord,
};

const EXECUTION_SCHEMA: &str = include_str!("../../../sql/executions.sql");

/// Durable home of pipeline definitions and execution records. An execution paused for
/// approval must survive a process restart, so implementations backed by real storage
/// are expected in production.
pub trait ExecutionStore: Send + Sync {
    /// Stores a config revision. Re-saving identical content is a no-op; different content
    /// under an existing revision is rejected.
    fn save_config(&self, config: &PipelineConfig) -> StoreResult<()>;
    fn load_config(&self, config_ref: &ConfigRef) -> StoreResult<Option<PipelineConfig>>;
    /// Inserts or updates an execution. Once a stored execution is terminal it can no
    /// longer be overwritten.
    fn save(&self, execution: &PipelineExecution) -> StoreResult<()>;
    fn load(&self, execution_id: &str) -> StoreResult<Option<PipelineExecution>>;
    /// Newest first.
    fn list(
        &self,
        pipeline: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> StoreResult<Vec<PipelineExecution>>;
    /// Version of the most recent succeeded execution of `pipeline`.
    fn latest_version(&self, pipeline: &str) -> StoreResult<Option<String>>;
    fn save_rollback(&self, record: &RollbackRecord) -> StoreResult<()>;
    fn rollbacks(&self, execution_id: &str) -> StoreResult<Vec<RollbackRecord>>;
}

fn ensure_mutable(execution_id: &str, stored: Option<ExecutionStatus>) -> StoreResult<()> {
    match stored {
        Some(status) if status.terminal() => Err(StoreError::Immutable {
            execution_id: execution_id.to_string(),
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct SqliteExecutionStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteExecutionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteExecutionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteExecutionStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteExecutionStore { path, flags })
    }
}

/// SQLite-backed store. Each call opens its own connection; records are kept as JSON
/// bodies next to the columns used for lookups.
#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteExecutionStore {
    pub fn builder() -> SqliteExecutionStoreBuilder {
        SqliteExecutionStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteExecutionStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        // read-only handles cannot switch the journal mode
        if !self.flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY) {
            configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(EXECUTION_SCHEMA)?;
        Ok(())
    }

    /// Online copy of the database, safe while executions are being written.
    pub fn backup_to(&self, destination: impl AsRef<Path>) -> StoreResult<()> {
        let destination_path = destination.as_ref();
        let source = self.open()?;
        let mut dest =
            Connection::open(destination_path).map_err(|source| StoreError::OpenDatabase {
                path: destination_path.to_path_buf(),
                source,
            })?;
        let backup = Backup::new(&source, &mut dest)?;
        backup.run_to_completion(10, StdDuration::from_millis(50), None)?;
        Ok(())
    }
}

fn decode_executions(bodies: Vec<String>) -> StoreResult<Vec<PipelineExecution>> {
    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(StoreError::from))
        .collect()
}

impl ExecutionStore for SqliteExecutionStore {
    fn save_config(&self, config: &PipelineConfig) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let body = serde_json::to_string(config)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT body FROM pipeline_configs WHERE name = ?1 AND revision = ?2",
                params![config.name, config.revision],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(stored) => {
                let stored: PipelineConfig = serde_json::from_str(&stored)?;
                if &stored != config {
                    return Err(StoreError::ConfigConflict {
                        config_ref: config.config_ref(),
                    });
                }
            }
            None => {
                tx.execute(
                    "INSERT INTO pipeline_configs (name, revision, body, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![config.name, config.revision, body, Utc::now()],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_config(&self, config_ref: &ConfigRef) -> StoreResult<Option<PipelineConfig>> {
        let conn = self.open()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM pipeline_configs WHERE name = ?1 AND revision = ?2",
                params![config_ref.name, config_ref.revision],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| serde_json::from_str(&body).map_err(StoreError::from))
            .transpose()
    }

    fn save(&self, execution: &PipelineExecution) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let stored: Option<String> = tx
            .query_row(
                "SELECT status FROM executions WHERE execution_id = ?1",
                params![execution.execution_id],
                |row| row.get(0),
            )
            .optional()?;
        let stored = stored.and_then(|status| status.parse::<ExecutionStatus>().ok());
        ensure_mutable(&execution.execution_id, stored)?;

        let body = serde_json::to_string(execution)?;
        tx.execute(
            "INSERT INTO executions (
                execution_id, pipeline, revision, version, status, current_stage,
                start_time, end_time, body, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(execution_id) DO UPDATE SET
                status = excluded.status,
                current_stage = excluded.current_stage,
                end_time = excluded.end_time,
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![
                execution.execution_id,
                execution.config_ref.name,
                execution.config_ref.revision,
                execution.version,
                execution.status.as_str(),
                execution.current_stage,
                execution.start_time,
                execution.end_time,
                body,
                Utc::now(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load(&self, execution_id: &str) -> StoreResult<Option<PipelineExecution>> {
        let conn = self.open()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM executions WHERE execution_id = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| serde_json::from_str(&body).map_err(StoreError::from))
            .transpose()
    }

    fn list(
        &self,
        pipeline: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> StoreResult<Vec<PipelineExecution>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM executions
             WHERE (?1 IS NULL OR pipeline = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY start_time DESC, execution_id DESC
             LIMIT ?3",
        )?;
        let bodies = stmt
            .query_map(
                params![pipeline, status.map(|status| status.as_str()), limit as i64],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        decode_executions(bodies)
    }

    fn latest_version(&self, pipeline: &str) -> StoreResult<Option<String>> {
        let conn = self.open()?;
        let version = conn
            .query_row(
                "SELECT version FROM executions
                 WHERE pipeline = ?1 AND status = 'succeeded'
                 ORDER BY start_time DESC LIMIT 1",
                params![pipeline],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    fn save_rollback(&self, record: &RollbackRecord) -> StoreResult<()> {
        let conn = self.open()?;
        let body = serde_json::to_string(record)?;
        conn.execute(
            "INSERT INTO rollbacks (
                rollback_id, execution_id, environment, target_deployment_id, status,
                requested_at, body
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(rollback_id) DO UPDATE SET
                status = excluded.status,
                body = excluded.body",
            params![
                record.rollback_id,
                record.execution_id,
                record.environment,
                record.target_deployment_id,
                record.status.as_str(),
                record.requested_at,
                body,
            ],
        )?;
        Ok(())
    }

    fn rollbacks(&self, execution_id: &str) -> StoreResult<Vec<RollbackRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM rollbacks WHERE execution_id = ?1 ORDER BY requested_at, rollback_id",
        )?;
        let bodies = stmt
            .query_map(params![execution_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    configs: HashMap<ConfigRef, PipelineConfig>,
    executions: HashMap<String, PipelineExecution>,
    rollbacks: Vec<RollbackRecord>,
}

/// Process-local store for tests and dry runs. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    state: Mutex<MemoryState>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn save_config(&self, config: &PipelineConfig) -> StoreResult<()> {
        let mut state = self.state()?;
        let key = config.config_ref();
        if let Some(stored) = state.configs.get(&key) {
            if stored != config {
                return Err(StoreError::ConfigConflict { config_ref: key });
            }
            return Ok(());
        }
        state.configs.insert(key, config.clone());
        Ok(())
    }

    fn load_config(&self, config_ref: &ConfigRef) -> StoreResult<Option<PipelineConfig>> {
        Ok(self.state()?.configs.get(config_ref).cloned())
    }

    fn save(&self, execution: &PipelineExecution) -> StoreResult<()> {
        let mut state = self.state()?;
        let stored = state
            .executions
            .get(&execution.execution_id)
            .map(|stored| stored.status);
        ensure_mutable(&execution.execution_id, stored)?;
        state
            .executions
            .insert(execution.execution_id.clone(), execution.clone());
        Ok(())
    }

    fn load(&self, execution_id: &str) -> StoreResult<Option<PipelineExecution>> {
        Ok(self.state()?.executions.get(execution_id).cloned())
    }

    fn list(
        &self,
        pipeline: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> StoreResult<Vec<PipelineExecution>> {
        let state = self.state()?;
        let mut executions: Vec<PipelineExecution> = state
            .executions
            .values()
            .filter(|execution| pipeline.map_or(true, |name| execution.config_ref.name == name))
            .filter(|execution| status.map_or(true, |status| execution.status == status))
            .cloned()
            .collect();
        executions.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then_with(|| b.execution_id.cmp(&a.execution_id))
        });
        executions.truncate(limit);
        Ok(executions)
    }

    fn latest_version(&self, pipeline: &str) -> StoreResult<Option<String>> {
        let state = self.state()?;
        Ok(state
            .executions
            .values()
            .filter(|execution| {
                execution.config_ref.name == pipeline
                    && execution.status == ExecutionStatus::Succeeded
            })
            .max_by_key(|execution| execution.start_time)
            .map(|execution| execution.version.clone()))
    }

    fn save_rollback(&self, record: &RollbackRecord) -> StoreResult<()> {
        let mut state = self.state()?;
        match state
            .rollbacks
            .iter_mut()
            .find(|stored| stored.rollback_id == record.rollback_id)
        {
            Some(stored) => *stored = record.clone(),
            None => state.rollbacks.push(record.clone()),
        }
        Ok(())
    }

    fn rollbacks(&self, execution_id: &str) -> StoreResult<Vec<RollbackRecord>> {
        Ok(self
            .state()?
            .rollbacks
            .iter()
            .filter(|record| record.execution_id == execution_id)
            .cloned()
            .collect())
    }
}
