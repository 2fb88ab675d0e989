use std::path::PathBuf;

use thiserror::Error;

use super::models::{ConfigRef, ExecutionStatus};
use super::validation::ValidationError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("execution store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("execution {execution_id} is terminal and can no longer be modified")]
    Immutable { execution_id: String },
    #[error("pipeline config {config_ref} already stored with different content")]
    ConfigConflict { config_ref: ConfigRef },
    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("execution {execution_id} not found")]
    NotFound { execution_id: String },
    #[error("deployment {deployment_id} not found in execution {execution_id}")]
    DeploymentNotFound {
        execution_id: String,
        deployment_id: String,
    },
    #[error("execution {execution_id} in unexpected status: {status}")]
    InvalidStatus {
        execution_id: String,
        status: ExecutionStatus,
    },
    #[error("execution {execution_id} cannot move from {from} to {to}")]
    InvalidTransition {
        execution_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    #[error("pipeline config {config_ref} missing from store")]
    MissingConfig { config_ref: ConfigRef },
    #[error("environment {environment} not defined in pipeline config {config_ref}")]
    UnknownEnvironment {
        config_ref: ConfigRef,
        environment: String,
    },
    #[error("execution {execution_id} already exists")]
    AlreadyExists { execution_id: String },
    #[error("orchestrator component not configured: {0}")]
    MissingComponent(&'static str),
    #[error("orchestrator state lock poisoned")]
    Poisoned,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
