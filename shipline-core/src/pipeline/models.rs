use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::{HealthCheckResult, HealthStatus};
use crate::strategy::{DeploymentResult, Strategy, UpdateType};

use super::error::PipelineError;

fn default_revision() -> u32 {
    1
}

fn default_deployment_timeout() -> u64 {
    30
}

fn default_rollback_timeout() -> u64 {
    10
}

fn default_stage_attempts() -> u32 {
    1
}

fn default_expected_status() -> u16 {
    200
}

fn default_check_timeout() -> u64 {
    5
}

fn default_check_interval() -> u64 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

/// Immutable pipeline definition. A new revision replaces an old one; it is never edited
/// in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default = "default_revision")]
    pub revision: u32,
    pub strategy: Strategy,
    #[serde(default)]
    pub rollback_policy: RollbackPolicy,
    #[serde(default)]
    pub environments: Vec<EnvironmentSpec>,
}

impl PipelineConfig {
    pub fn config_ref(&self) -> ConfigRef {
        ConfigRef {
            name: self.name.clone(),
            revision: self.revision,
        }
    }

    /// Environments sorted by ascending `order`.
    pub fn ordered_environments(&self) -> Vec<&EnvironmentSpec> {
        let mut environments: Vec<&EnvironmentSpec> = self.environments.iter().collect();
        environments.sort_by_key(|env| env.order);
        environments
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentSpec> {
        self.environments.iter().find(|env| env.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConfigRef {
    pub name: String,
    pub revision: u32,
}

impl fmt::Display for ConfigRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@r{}", self.name, self.revision)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentSpec {
    pub name: String,
    pub order: u32,
    /// Keep rolling out to later environments even when this one fails.
    #[serde(default)]
    pub auto_promote: bool,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub health_checks: Vec<HealthCheckSpec>,
    #[serde(default = "default_deployment_timeout")]
    pub deployment_timeout_minutes: u64,
    #[serde(default = "default_rollback_timeout")]
    pub rollback_timeout_minutes: u64,
    /// Attempts allowed for a stage that fails on a retryable cause.
    #[serde(default = "default_stage_attempts")]
    pub stage_attempts: u32,
}

impl EnvironmentSpec {
    pub fn new(name: impl Into<String>, order: u32) -> Self {
        Self {
            name: name.into(),
            order,
            auto_promote: false,
            approval_required: false,
            health_checks: Vec::new(),
            deployment_timeout_minutes: default_deployment_timeout(),
            rollback_timeout_minutes: default_rollback_timeout(),
            stage_attempts: default_stage_attempts(),
        }
    }

    pub fn with_check(mut self, check: HealthCheckSpec) -> Self {
        self.health_checks.push(check);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Http,
    Tcp,
    Database,
    Custom,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Http => "http",
            CheckKind::Tcp => "tcp",
            CheckKind::Database => "database",
            CheckKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckSpec {
    pub name: String,
    pub kind: CheckKind,
    /// URL, `host:port`, database DSN or command line depending on `kind`.
    pub target: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default = "default_check_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_check_interval")]
    pub interval_seconds: u64,
}

impl HealthCheckSpec {
    pub fn new(name: impl Into<String>, kind: CheckKind, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            expected_status: default_expected_status(),
            timeout_seconds: default_check_timeout(),
            retry_count: 0,
            interval_seconds: default_check_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub conditions: Vec<RollbackCondition>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            automatic: false,
            conditions: Vec::new(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackCondition {
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
    #[serde(default)]
    pub sustained_seconds: u64,
}

impl RollbackCondition {
    pub fn new(
        metric: impl Into<String>,
        operator: Operator,
        threshold: f64,
        sustained_seconds: u64,
    ) -> Self {
        Self {
            metric: metric.into(),
            operator,
            threshold,
            sustained_seconds,
        }
    }

    pub fn violated_by(&self, value: f64) -> bool {
        self.operator.holds(value, self.threshold)
    }
}

impl fmt::Display for RollbackCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} sustained {}s",
            self.metric,
            self.operator.as_str(),
            self.threshold,
            self.sustained_seconds
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::GreaterThan => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::LessThan => "<",
            Operator::LessOrEqual => "<=",
            Operator::Equal => "==",
        }
    }

    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::GreaterThan => value > threshold,
            Operator::GreaterOrEqual => value >= threshold,
            Operator::LessThan => value < threshold,
            Operator::LessOrEqual => value <= threshold,
            Operator::Equal => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Automatic,
    Scheduled,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Automatic => "automatic",
            TriggerType::Scheduled => "scheduled",
        }
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "automatic" => Ok(TriggerType::Automatic),
            "scheduled" => Ok(TriggerType::Scheduled),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    PendingApproval,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::PendingApproval => "pending_approval",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Running => next != ExecutionStatus::Running,
            ExecutionStatus::PendingApproval => matches!(
                next,
                ExecutionStatus::Running | ExecutionStatus::Failed | ExecutionStatus::Cancelled
            ),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "pending_approval" => Ok(ExecutionStatus::PendingApproval),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Deploying,
    HealthChecking,
    Promoted,
    AwaitingApproval,
    Failed,
    RolledBack,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Deploying => "deploying",
            StageStatus::HealthChecking => "health_checking",
            StageStatus::Promoted => "promoted",
            StageStatus::AwaitingApproval => "awaiting_approval",
            StageStatus::Failed => "failed",
            StageStatus::RolledBack => "rolled_back",
        }
    }

    pub fn settled(&self) -> bool {
        matches!(
            self,
            StageStatus::Promoted
                | StageStatus::AwaitingApproval
                | StageStatus::Failed
                | StageStatus::RolledBack
        )
    }

    pub fn unsuccessful(&self) -> bool {
        matches!(self, StageStatus::Failed | StageStatus::RolledBack)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    DeployerError,
    DeploymentTimeout,
    HealthCheckFailed,
    RollbackBreach,
    CanaryAbort,
    RollbackFailed,
    ApprovalExpired,
    Rejected,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Cancelled => "cancelled",
            FailureReason::DeployerError => "deployer_error",
            FailureReason::DeploymentTimeout => "deployment_timeout",
            FailureReason::HealthCheckFailed => "health_check_failed",
            FailureReason::RollbackBreach => "rollback_breach",
            FailureReason::CanaryAbort => "canary_abort",
            FailureReason::RollbackFailed => "rollback_failed",
            FailureReason::ApprovalExpired => "approval_expired",
            FailureReason::Rejected => "rejected",
        }
    }

    /// Causes that a fresh attempt of the same stage may clear.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::DeployerError
                | FailureReason::DeploymentTimeout
                | FailureReason::HealthCheckFailed
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One environment's pass through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageExecution {
    pub environment: String,
    pub order: u32,
    pub attempt: u32,
    pub status: StageStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub health_results: Vec<HealthCheckResult>,
    pub deployment_result: Option<DeploymentResult>,
    pub breaches: Vec<RollbackCondition>,
    pub failure_reason: Option<FailureReason>,
    pub rollback_deployment_id: Option<String>,
    pub approved_by: Option<String>,
    pub logs: Vec<String>,
}

impl StageExecution {
    pub fn new(environment: &EnvironmentSpec, attempt: u32, start_time: DateTime<Utc>) -> Self {
        Self {
            environment: environment.name.clone(),
            order: environment.order,
            attempt,
            status: StageStatus::Pending,
            start_time,
            end_time: None,
            health_results: Vec::new(),
            deployment_result: None,
            breaches: Vec::new(),
            failure_reason: None,
            rollback_deployment_id: None,
            approved_by: None,
            logs: Vec::new(),
        }
    }

    /// Appends a log line stamped with the run clock's `at`.
    pub fn log(&mut self, at: DateTime<Utc>, message: impl AsRef<str>) {
        self.logs
            .push(format!("{} {}", at.to_rfc3339(), message.as_ref()));
    }

    pub fn advance(&mut self, status: StageStatus, at: DateTime<Utc>) {
        self.log(at, format!("{} -> {}", self.status, status));
        self.status = status;
    }

    pub fn settle(&mut self, status: StageStatus, at: DateTime<Utc>) {
        self.advance(status, at);
        self.end_time = Some(at);
    }

    pub fn fail(&mut self, reason: FailureReason, message: impl AsRef<str>, at: DateTime<Utc>) {
        self.log(at, format!("{reason}: {}", message.as_ref()));
        self.failure_reason = Some(reason);
        self.settle(StageStatus::Failed, at);
    }

    pub fn deployment_id(&self) -> Option<&str> {
        self.deployment_result
            .as_ref()
            .map(|result| result.deployment_id.as_str())
    }

    pub fn health_passed(&self) -> bool {
        self.health_results
            .iter()
            .all(|result| result.status == HealthStatus::Pass)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregateMetrics {
    pub stages_attempted: u32,
    pub stages_promoted: u32,
    pub stages_failed: u32,
    pub stages_rolled_back: u32,
    pub worst_error_rate: Option<f64>,
    pub worst_response_time_ms: Option<f64>,
    pub lowest_success_rate: Option<f64>,
}

impl AggregateMetrics {
    pub fn from_stages(stages: &[StageExecution]) -> Self {
        let mut aggregate = AggregateMetrics {
            stages_attempted: stages.len() as u32,
            ..Default::default()
        };
        for stage in stages {
            match stage.status {
                StageStatus::Promoted => aggregate.stages_promoted += 1,
                StageStatus::Failed => aggregate.stages_failed += 1,
                StageStatus::RolledBack => aggregate.stages_rolled_back += 1,
                _ => {}
            }
            if let Some(result) = &stage.deployment_result {
                let worst = &result.worst;
                aggregate.worst_error_rate = Some(
                    aggregate
                        .worst_error_rate
                        .map_or(worst.error_rate, |value| value.max(worst.error_rate)),
                );
                aggregate.worst_response_time_ms = Some(
                    aggregate
                        .worst_response_time_ms
                        .map_or(worst.response_time_ms, |value| {
                            value.max(worst.response_time_ms)
                        }),
                );
                aggregate.lowest_success_rate = Some(
                    aggregate
                        .lowest_success_rate
                        .map_or(worst.success_rate, |value| value.min(worst.success_rate)),
                );
            }
        }
        aggregate
    }
}

/// Mutable record of a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineExecution {
    pub execution_id: String,
    pub config_ref: ConfigRef,
    pub version: String,
    pub update_type: UpdateType,
    pub trigger: TriggerType,
    pub triggered_by: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub current_stage: Option<String>,
    pub approval_requested_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageExecution>,
    pub aggregate_metrics: AggregateMetrics,
}

impl PipelineExecution {
    pub fn new(
        execution_id: impl Into<String>,
        config: &PipelineConfig,
        version: impl Into<String>,
        update_type: UpdateType,
        trigger: TriggerType,
        triggered_by: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            config_ref: config.config_ref(),
            version: version.into(),
            update_type,
            trigger,
            triggered_by: triggered_by.into(),
            start_time,
            end_time: None,
            status: ExecutionStatus::Running,
            current_stage: None,
            approval_requested_at: None,
            stages: Vec::new(),
            aggregate_metrics: AggregateMetrics::default(),
        }
    }

    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                execution_id: self.execution_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Appends a stage, or replaces the latest attempt for the same environment.
    pub fn record_stage(&mut self, stage: StageExecution) {
        match self.stages.last_mut() {
            Some(last) if last.environment == stage.environment => *last = stage,
            _ => self.stages.push(stage),
        }
        self.aggregate_metrics = AggregateMetrics::from_stages(&self.stages);
    }

    pub fn stage(&self, environment: &str) -> Option<&StageExecution> {
        self.stages
            .iter()
            .find(|stage| stage.environment == environment)
    }

    pub fn awaiting_stage_mut(&mut self) -> Option<&mut StageExecution> {
        self.stages
            .last_mut()
            .filter(|stage| stage.status == StageStatus::AwaitingApproval)
    }

    pub fn all_promoted(&self) -> bool {
        !self.stages.is_empty()
            && self
                .stages
                .iter()
                .all(|stage| stage.status == StageStatus::Promoted)
    }

    pub fn refresh_aggregate(&mut self) {
        self.aggregate_metrics = AggregateMetrics::from_stages(&self.stages);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Succeeded,
    Failed,
}

impl RollbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStatus::Succeeded => "succeeded",
            RollbackStatus::Failed => "failed",
        }
    }
}

impl FromStr for RollbackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(RollbackStatus::Succeeded),
            "failed" => Ok(RollbackStatus::Failed),
            other => Err(format!("unknown rollback status: {other}")),
        }
    }
}

/// Operator-requested rollback of a deployment made by an earlier execution. Kept apart
/// from the execution record, which is read-only once terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackRecord {
    pub rollback_id: String,
    pub execution_id: String,
    pub environment: String,
    pub target_deployment_id: String,
    pub rollback_deployment_id: Option<String>,
    pub reason: String,
    pub requested_by: String,
    pub status: RollbackStatus,
    pub attempts: u32,
    pub requested_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}
