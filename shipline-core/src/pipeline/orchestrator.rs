use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::clock::RunClock;
use crate::config::{OrchestratorSettings, StrategySettings};
use crate::deployer::Deployer;
use crate::health::HealthChecker;
use crate::metrics::{MetricsSource, SimulatedMetricsSource};
use crate::notify::{Notification, NotificationRouter, Notifier, PipelineEvent};
use crate::strategy::{DeploymentStrategyExecutor, UpdateType};

use super::error::{PipelineError, PipelineResult};
use super::models::{
    EnvironmentSpec, ExecutionStatus, FailureReason, PipelineConfig, PipelineExecution,
    RollbackRecord, RollbackStatus, StageExecution, StageStatus, TriggerType,
};
use super::stage::{revert, StageContext, StageRunner};
use super::store::ExecutionStore;
use super::validation::validate;

/// Parameters of a new pipeline run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub version: String,
    pub trigger: TriggerType,
    pub triggered_by: String,
    /// Inferred from the last succeeded version when unset.
    pub update_type: Option<UpdateType>,
    pub execution_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(
        version: impl Into<String>,
        trigger: TriggerType,
        triggered_by: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            trigger,
            triggered_by: triggered_by.into(),
            update_type: None,
            execution_id: None,
        }
    }

    pub fn with_update_type(mut self, update_type: UpdateType) -> Self {
        self.update_type = Some(update_type);
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

/// Operator request to revert a deployment made by an earlier execution.
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub execution_id: String,
    pub target_deployment_id: String,
    pub reason: String,
    pub requested_by: String,
}

#[derive(Default)]
pub struct PipelineOrchestratorBuilder {
    store: Option<Arc<dyn ExecutionStore>>,
    deployer: Option<Arc<dyn Deployer>>,
    metrics: Option<Arc<dyn MetricsSource>>,
    checker: Option<HealthChecker>,
    notifier: Option<Arc<dyn Notifier>>,
    strategy: StrategySettings,
    approval_expiry: Option<chrono::Duration>,
    retention: Option<chrono::Duration>,
}

impl PipelineOrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn health_checker(mut self, checker: HealthChecker) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn strategy_settings(mut self, settings: StrategySettings) -> Self {
        self.strategy = settings;
        self
    }

    pub fn approval_expiry(mut self, expiry: Option<chrono::Duration>) -> Self {
        self.approval_expiry = expiry;
        self
    }

    /// Applies the tunables of a settings file. Collaborators are still supplied
    /// separately.
    pub fn with_settings(mut self, settings: &OrchestratorSettings) -> Self {
        self.strategy = settings.strategy.clone();
        self.approval_expiry = settings
            .approval
            .expiry_hours
            .and_then(|hours| i64::try_from(hours).ok())
            .and_then(chrono::Duration::try_hours);
        // out-of-range values mean no expiry and no pruning
        self.retention = i64::try_from(settings.metrics.retention_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds);
        self
    }

    pub fn build(self) -> PipelineResult<PipelineOrchestrator> {
        let store = self.store.ok_or(PipelineError::MissingComponent("store"))?;
        let deployer = self
            .deployer
            .ok_or(PipelineError::MissingComponent("deployer"))?;
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(SimulatedMetricsSource::new(0)));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(NotificationRouter::new()));
        let executor = DeploymentStrategyExecutor::new(deployer, metrics, self.strategy);
        let mut runner = StageRunner::new(
            executor,
            self.checker.unwrap_or_default(),
            Arc::clone(&notifier),
        );
        if let Some(retention) = self.retention {
            runner = runner.with_retention(retention);
        }
        Ok(PipelineOrchestrator {
            store,
            runner,
            notifier,
            approval_expiry: self.approval_expiry,
            active: Mutex::new(HashMap::new()),
        })
    }
}

/// Sequences stages across environments and owns every execution it starts.
///
/// An execution runs as one sequential task. Approval gates are persisted, so a paused
/// execution can be resumed by a different process after a restart.
pub struct PipelineOrchestrator {
    store: Arc<dyn ExecutionStore>,
    runner: StageRunner,
    notifier: Arc<dyn Notifier>,
    approval_expiry: Option<chrono::Duration>,
    active: Mutex<HashMap<String, CancelToken>>,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("runner", &self.runner)
            .field("approval_expiry", &self.approval_expiry)
            .finish_non_exhaustive()
    }
}

/// Removes an execution's cancel token when its run ends, however it ends.
struct ActiveRun<'a> {
    active: &'a Mutex<HashMap<String, CancelToken>>,
    execution_id: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.execution_id);
        }
    }
}

impl PipelineOrchestrator {
    pub fn builder() -> PipelineOrchestratorBuilder {
        PipelineOrchestratorBuilder::new()
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Validates `config` and runs it from the first environment. Validation problems are
    /// returned before anything is stored or deployed; stage failures are reported in the
    /// returned execution, not as errors.
    pub async fn execute(
        &self,
        config: &PipelineConfig,
        request: ExecutionRequest,
    ) -> PipelineResult<PipelineExecution> {
        validate(config)?;
        self.store.save_config(config)?;

        let execution_id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| format!("exec-{}", Uuid::new_v4().simple()));
        if self.store.load(&execution_id)?.is_some() {
            return Err(PipelineError::AlreadyExists { execution_id });
        }
        let update_type = match request.update_type {
            Some(update_type) => update_type,
            None => {
                let previous = self.store.latest_version(&config.name)?;
                UpdateType::infer(previous.as_deref(), &request.version)
            }
        };

        let clock = RunClock::start();
        let mut execution = PipelineExecution::new(
            execution_id,
            config,
            request.version,
            update_type,
            request.trigger,
            request.triggered_by,
            clock.now(),
        );
        let (_run, cancel) = self.register(&execution.execution_id)?;
        self.store.save(&execution)?;
        info!(
            target: "pipeline.orchestrator",
            execution_id = %execution.execution_id,
            pipeline = %execution.config_ref,
            version = %execution.version,
            update_type = update_type.as_str(),
            trigger = execution.trigger.as_str(),
            triggered_by = %execution.triggered_by,
            "pipeline execution started"
        );
        self.notify(
            &execution,
            None,
            PipelineEvent::PipelineStart,
            format!(
                "{} {} started by {}",
                execution.config_ref, execution.version, execution.triggered_by
            ),
        )
        .await;

        self.drive(config, &mut execution, 0, &clock, &cancel)
            .await?;
        Ok(execution)
    }

    /// Approves the stage an execution is paused on and continues with the next
    /// environment. If the approval has expired the execution fails instead.
    pub async fn resume(
        &self,
        execution_id: &str,
        approver_id: &str,
    ) -> PipelineResult<PipelineExecution> {
        let mut execution = self.load_pending(execution_id)?;
        let config = self.load_config(&execution)?;
        let clock = RunClock::start();
        let now = clock.now();

        if self.approval_expired(&execution, now) {
            self.expire(&mut execution, now).await?;
            return Ok(execution);
        }

        let approved_env = {
            let stage = awaiting_stage(&mut execution)?;
            stage.approved_by = Some(approver_id.to_string());
            stage.log(now, format!("approved by {approver_id}"));
            stage.settle(StageStatus::Promoted, now);
            stage.environment.clone()
        };
        execution.refresh_aggregate();
        execution.transition(ExecutionStatus::Running)?;
        execution.approval_requested_at = None;
        let (_run, cancel) = self.register(&execution.execution_id)?;
        self.store.save(&execution)?;
        info!(
            target: "pipeline.orchestrator",
            execution_id = %execution.execution_id,
            environment = %approved_env,
            approver = approver_id,
            "stage approved"
        );
        self.notify(
            &execution,
            Some(&approved_env),
            PipelineEvent::StageSuccess,
            format!("approved by {approver_id}"),
        )
        .await;

        let next_index = config
            .ordered_environments()
            .iter()
            .position(|env| env.name == approved_env)
            .map(|index| index + 1)
            .ok_or_else(|| PipelineError::UnknownEnvironment {
                config_ref: config.config_ref(),
                environment: approved_env.clone(),
            })?;
        self.drive(&config, &mut execution, next_index, &clock, &cancel)
            .await?;
        Ok(execution)
    }

    /// Declines the stage an execution is paused on. The execution fails.
    pub async fn reject(
        &self,
        execution_id: &str,
        approver_id: &str,
        reason: &str,
    ) -> PipelineResult<PipelineExecution> {
        let mut execution = self.load_pending(execution_id)?;
        let now = Utc::now();
        let environment = {
            let stage = awaiting_stage(&mut execution)?;
            stage.fail(
                FailureReason::Rejected,
                format!("rejected by {approver_id}: {reason}"),
                now,
            );
            stage.environment.clone()
        };
        execution.refresh_aggregate();
        self.notify(
            &execution,
            Some(&environment),
            PipelineEvent::StageFailure,
            format!("rejected by {approver_id}: {reason}"),
        )
        .await;
        self.finalize(&mut execution, ExecutionStatus::Failed, now)
            .await?;
        Ok(execution)
    }

    /// Fails every paused execution whose approval window has passed. Returns the ids of
    /// the executions that were expired.
    pub async fn expire_stale_approvals(&self) -> PipelineResult<Vec<String>> {
        if self.approval_expiry.is_none() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let pending = self
            .store
            .list(None, Some(ExecutionStatus::PendingApproval), usize::MAX)?;
        let mut expired = Vec::new();
        for mut execution in pending {
            if self.approval_expired(&execution, now) {
                self.expire(&mut execution, now).await?;
                expired.push(execution.execution_id);
            }
        }
        Ok(expired)
    }

    /// Cancels an execution. A running execution is signalled and settles on its own:
    /// the current stage fails with reason `cancelled` and no further environment is
    /// attempted. An execution paused for approval is cancelled immediately.
    pub async fn cancel(&self, execution_id: &str) -> PipelineResult<()> {
        let token = self.active()?.get(execution_id).cloned();
        if let Some(token) = token {
            info!(target: "pipeline.orchestrator", execution_id, "cancellation requested");
            token.cancel();
            return Ok(());
        }

        let mut execution = self.load_pending(execution_id)?;
        let now = Utc::now();
        if let Some(stage) = execution.awaiting_stage_mut() {
            stage.fail(
                FailureReason::Cancelled,
                "cancelled while awaiting approval",
                now,
            );
        }
        execution.refresh_aggregate();
        self.finalize(&mut execution, ExecutionStatus::Cancelled, now)
            .await
    }

    /// Reverts a deployment made by one of an execution's stages. The outcome is kept as
    /// a separate [`RollbackRecord`]; the execution record itself is left untouched.
    pub async fn request_rollback(
        &self,
        request: RollbackRequest,
    ) -> PipelineResult<RollbackRecord> {
        let execution = self.get(&request.execution_id)?;
        if execution.status == ExecutionStatus::Running {
            return Err(PipelineError::InvalidStatus {
                execution_id: execution.execution_id,
                status: execution.status,
            });
        }
        let stage = execution
            .stages
            .iter()
            .find(|stage| stage.deployment_id() == Some(request.target_deployment_id.as_str()))
            .ok_or_else(|| PipelineError::DeploymentNotFound {
                execution_id: execution.execution_id.clone(),
                deployment_id: request.target_deployment_id.clone(),
            })?;
        let config = self.load_config(&execution)?;
        let environment = config.environment(&stage.environment).ok_or_else(|| {
            PipelineError::UnknownEnvironment {
                config_ref: config.config_ref(),
                environment: stage.environment.clone(),
            }
        })?;

        let requested_at = Utc::now();
        self.notify(
            &execution,
            Some(&environment.name),
            PipelineEvent::RollbackStart,
            format!(
                "rollback of {} requested by {}: {}",
                request.target_deployment_id, request.requested_by, request.reason
            ),
        )
        .await;
        let outcome = revert(
            self.runner.executor().deployer().as_ref(),
            environment,
            &request.target_deployment_id,
            config.rollback_policy.max_attempts,
        )
        .await;

        let record = RollbackRecord {
            rollback_id: format!("rb-{}", Uuid::new_v4().simple()),
            execution_id: execution.execution_id.clone(),
            environment: environment.name.clone(),
            target_deployment_id: request.target_deployment_id.clone(),
            status: if outcome.rollback_deployment_id.is_some() {
                RollbackStatus::Succeeded
            } else {
                RollbackStatus::Failed
            },
            rollback_deployment_id: outcome.rollback_deployment_id.clone(),
            reason: request.reason,
            requested_by: request.requested_by,
            attempts: outcome.attempts,
            requested_at,
            completed_at: Utc::now(),
            error: match outcome.rollback_deployment_id {
                Some(_) => None,
                None => outcome.logs.last().cloned(),
            },
        };
        self.store.save_rollback(&record)?;

        match record.status {
            RollbackStatus::Succeeded => {
                info!(
                    target: "pipeline.orchestrator",
                    execution_id = %record.execution_id,
                    environment = %record.environment,
                    target = %record.target_deployment_id,
                    "manual rollback succeeded"
                );
                self.notify(
                    &execution,
                    Some(&record.environment),
                    PipelineEvent::RollbackSuccess,
                    format!(
                        "{} rolled back by {}",
                        record.target_deployment_id, record.requested_by
                    ),
                )
                .await;
            }
            RollbackStatus::Failed => warn!(
                target: "pipeline.orchestrator",
                execution_id = %record.execution_id,
                environment = %record.environment,
                target = %record.target_deployment_id,
                attempts = record.attempts,
                "manual rollback failed"
            ),
        }
        Ok(record)
    }

    pub fn get(&self, execution_id: &str) -> PipelineResult<PipelineExecution> {
        self.store
            .load(execution_id)?
            .ok_or_else(|| PipelineError::NotFound {
                execution_id: execution_id.to_string(),
            })
    }

    /// Most recent executions first, optionally limited to one pipeline.
    pub fn history(
        &self,
        pipeline: Option<&str>,
        limit: usize,
    ) -> PipelineResult<Vec<PipelineExecution>> {
        Ok(self.store.list(pipeline, None, limit)?)
    }

    pub fn rollbacks(&self, execution_id: &str) -> PipelineResult<Vec<RollbackRecord>> {
        Ok(self.store.rollbacks(execution_id)?)
    }

    pub fn is_active(&self, execution_id: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(execution_id))
            .unwrap_or(false)
    }

    /// Runs environments from `from_index` (in ascending order) until the execution
    /// succeeds, fails, is cancelled or pauses for approval.
    async fn drive(
        &self,
        config: &PipelineConfig,
        execution: &mut PipelineExecution,
        from_index: usize,
        clock: &RunClock,
        cancel: &CancelToken,
    ) -> PipelineResult<()> {
        for environment in config.ordered_environments().into_iter().skip(from_index) {
            if cancel.is_cancelled() {
                return self
                    .finalize(execution, ExecutionStatus::Cancelled, clock.now())
                    .await;
            }
            execution.current_stage = Some(environment.name.clone());
            let stage = self
                .run_stage(config, execution, environment, clock, cancel)
                .await?;

            match stage.status {
                StageStatus::Promoted => {}
                StageStatus::AwaitingApproval => {
                    execution.transition(ExecutionStatus::PendingApproval)?;
                    execution.approval_requested_at = Some(clock.now());
                    self.store.save(execution)?;
                    info!(
                        target: "pipeline.orchestrator",
                        execution_id = %execution.execution_id,
                        environment = %environment.name,
                        "execution paused for approval"
                    );
                    return Ok(());
                }
                _ if stage.failure_reason == Some(FailureReason::Cancelled) => {
                    return self
                        .finalize(execution, ExecutionStatus::Cancelled, clock.now())
                        .await;
                }
                _ if environment.auto_promote => {
                    warn!(
                        target: "pipeline.orchestrator",
                        execution_id = %execution.execution_id,
                        environment = %environment.name,
                        status = %stage.status,
                        "stage unsuccessful, continuing under auto_promote"
                    );
                }
                _ => {
                    return self
                        .finalize(execution, ExecutionStatus::Failed, clock.now())
                        .await;
                }
            }
        }

        let status = if execution.all_promoted() {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        };
        self.finalize(execution, status, clock.now()).await
    }

    /// Runs one environment, retrying retryable failures up to `stage_attempts`. Each
    /// attempt replaces the previous one in the execution record.
    async fn run_stage(
        &self,
        config: &PipelineConfig,
        execution: &mut PipelineExecution,
        environment: &EnvironmentSpec,
        clock: &RunClock,
        cancel: &CancelToken,
    ) -> PipelineResult<StageExecution> {
        let max_attempts = environment.stage_attempts.max(1);
        let mut attempt = 1;
        loop {
            let ctx = StageContext {
                execution_id: &execution.execution_id,
                pipeline: &config.name,
                environment,
                strategy: config.strategy,
                policy: &config.rollback_policy,
                version: &execution.version,
                update_type: execution.update_type,
                attempt,
            };
            let stage = self.runner.run(&ctx, clock, cancel).await;
            let retry = attempt < max_attempts
                && !cancel.is_cancelled()
                && stage
                    .failure_reason
                    .map(|reason| reason.retryable())
                    .unwrap_or(false);
            execution.record_stage(stage.clone());
            self.store.save(execution)?;
            if !retry {
                return Ok(stage);
            }
            info!(
                target: "pipeline.orchestrator",
                execution_id = %execution.execution_id,
                environment = %environment.name,
                attempt,
                reason = ?stage.failure_reason,
                "retrying stage"
            );
            attempt += 1;
        }
    }

    async fn finalize(
        &self,
        execution: &mut PipelineExecution,
        status: ExecutionStatus,
        at: DateTime<Utc>,
    ) -> PipelineResult<()> {
        execution.transition(status)?;
        execution.end_time = Some(at);
        execution.approval_requested_at = None;
        self.store.save(execution)?;
        info!(
            target: "pipeline.orchestrator",
            execution_id = %execution.execution_id,
            status = %execution.status,
            stages = execution.stages.len(),
            "pipeline execution finished"
        );
        let (event, message) = match status {
            ExecutionStatus::Succeeded => (
                PipelineEvent::PipelineSuccess,
                format!("{} deployed everywhere", execution.version),
            ),
            _ => (
                PipelineEvent::PipelineFailure,
                format!(
                    "{} {} at {}",
                    execution.version,
                    status,
                    execution.current_stage.as_deref().unwrap_or("start")
                ),
            ),
        };
        self.notify(execution, None, event, message).await;
        Ok(())
    }

    fn approval_expired(&self, execution: &PipelineExecution, now: DateTime<Utc>) -> bool {
        match (self.approval_expiry, execution.approval_requested_at) {
            (Some(expiry), Some(requested_at)) => now - requested_at > expiry,
            _ => false,
        }
    }

    async fn expire(
        &self,
        execution: &mut PipelineExecution,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let environment = {
            let stage = awaiting_stage(execution)?;
            stage.fail(
                FailureReason::ApprovalExpired,
                "approval window elapsed",
                now,
            );
            stage.environment.clone()
        };
        execution.refresh_aggregate();
        warn!(
            target: "pipeline.orchestrator",
            execution_id = %execution.execution_id,
            environment = %environment,
            "approval expired"
        );
        self.notify(
            execution,
            Some(&environment),
            PipelineEvent::StageFailure,
            "approval expired",
        )
        .await;
        self.finalize(execution, ExecutionStatus::Failed, now).await
    }

    fn load_pending(&self, execution_id: &str) -> PipelineResult<PipelineExecution> {
        let execution = self.get(execution_id)?;
        if execution.status != ExecutionStatus::PendingApproval {
            return Err(PipelineError::InvalidStatus {
                execution_id: execution.execution_id,
                status: execution.status,
            });
        }
        Ok(execution)
    }

    fn load_config(&self, execution: &PipelineExecution) -> PipelineResult<PipelineConfig> {
        self.store
            .load_config(&execution.config_ref)?
            .ok_or_else(|| PipelineError::MissingConfig {
                config_ref: execution.config_ref.clone(),
            })
    }

    fn active(&self) -> PipelineResult<MutexGuard<'_, HashMap<String, CancelToken>>> {
        self.active.lock().map_err(|_| PipelineError::Poisoned)
    }

    fn register(&self, execution_id: &str) -> PipelineResult<(ActiveRun<'_>, CancelToken)> {
        let token = CancelToken::new();
        self.active()?
            .insert(execution_id.to_string(), token.clone());
        Ok((
            ActiveRun {
                active: &self.active,
                execution_id: execution_id.to_string(),
            },
            token,
        ))
    }

    async fn notify(
        &self,
        execution: &PipelineExecution,
        environment: Option<&str>,
        event: PipelineEvent,
        message: impl Into<String>,
    ) {
        let mut notification = Notification::new(
            event,
            &execution.execution_id,
            &execution.config_ref.name,
            message,
        );
        if let Some(environment) = environment {
            notification = notification.for_environment(environment);
        }
        if let Err(err) = self.notifier.notify(&notification).await {
            warn!(
                target: "pipeline.orchestrator",
                event = event.as_str(),
                error = %err,
                "notification failed"
            );
        }
    }
}

fn awaiting_stage(execution: &mut PipelineExecution) -> PipelineResult<&mut StageExecution> {
    let execution_id = execution.execution_id.clone();
    let status = execution.status;
    execution
        .awaiting_stage_mut()
        .ok_or(PipelineError::InvalidStatus {
            execution_id,
            status,
        })
}
