pub mod cancel;
pub mod clock;
pub mod command;
pub mod config;
pub mod deployer;
pub mod error;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod rollback;
pub mod sqlite;
pub mod strategy;

pub use cancel::CancelToken;
pub use clock::RunClock;
pub use config::{
    load_pipeline_config, load_settings, ApprovalSettings, ChannelKind, ChannelSettings,
    DeployerSettings, MetricsSettings, MetricsSourceKind, NotificationSettings,
    OrchestratorSettings, RiskMultipliers, StoreSettings, StrategySettings,
};
pub use deployer::{CommandDeployer, Deployer, DeployerError};
pub use error::{ConfigError, Result};
pub use health::{HealthCheckResult, HealthChecker, HealthStatus, Probe, ProbeError, SystemProbe};
pub use metrics::{
    source_from_settings, FixedMetricsSource, HttpMetricsSource, MetricsError, MetricsSource,
    MetricsWindow, PhaseContext, RawPhaseMetrics, SimulatedMetricsSource,
};
pub use monitor::{MonitorError, MonitorRegistry, MonitorSnapshot, MonitorSpec};
pub use notify::{
    LogNotifier, Notification, NotificationRouter, Notifier, NotifyError, PipelineEvent, Severity,
    WebhookNotifier,
};
pub use pipeline::{
    validate, EnvironmentSpec, ExecutionRequest, ExecutionStatus, ExecutionStore, FailureReason,
    HealthCheckSpec, MemoryExecutionStore, PipelineConfig, PipelineError, PipelineExecution,
    PipelineOrchestrator, PipelineResult, RollbackRecord, RollbackRequest, RollbackStatus,
    SqliteExecutionStore, StageExecution, StageRunner, StageStatus, StoreError, TriggerType,
    ValidationError,
};
pub use rollback::{RollbackDecision, RollbackEvaluator};
pub use strategy::{
    DeployRequest, DeploymentResult, DeploymentStrategyExecutor, MetricsSummary, PhaseMetrics,
    Strategy, StrategyError, UpdateType,
};
