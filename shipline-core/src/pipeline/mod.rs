pub mod error;
pub mod models;
pub mod orchestrator;
pub mod stage;
pub mod store;
pub mod validation;

pub use error::{PipelineError, PipelineResult, StoreError, StoreResult};
pub use models::{
    AggregateMetrics, CheckKind, ConfigRef, EnvironmentSpec, ExecutionStatus, FailureReason,
    HealthCheckSpec, Operator, PipelineConfig, PipelineExecution, RollbackCondition,
    RollbackPolicy, RollbackRecord, RollbackStatus, StageExecution, StageStatus, TriggerType,
};
pub use orchestrator::{
    ExecutionRequest, PipelineOrchestrator, PipelineOrchestratorBuilder, RollbackRequest,
};
pub use stage::{StageContext, StageRunner};
pub use store::{
    ExecutionStore, MemoryExecutionStore, SqliteExecutionStore, SqliteExecutionStoreBuilder,
};
pub use validation::{validate, ValidationError, ValidationIssue};
