use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::clock::RunClock;
use crate::deployer::Deployer;
use crate::health::{HealthChecker, HealthStatus};
use crate::metrics::MetricsWindow;
use crate::notify::{Notification, Notifier, PipelineEvent};
use crate::rollback::RollbackEvaluator;
use crate::strategy::{
    DeployRequest, DeploymentResult, DeploymentStrategyExecutor, Strategy, StrategyError,
    UpdateType,
};

use super::models::{EnvironmentSpec, FailureReason, RollbackPolicy, StageExecution, StageStatus};

/// Everything a single stage attempt needs to know about its run.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub execution_id: &'a str,
    pub pipeline: &'a str,
    pub environment: &'a EnvironmentSpec,
    pub strategy: Strategy,
    pub policy: &'a RollbackPolicy,
    pub version: &'a str,
    pub update_type: UpdateType,
    pub attempt: u32,
}

/// Drives one environment through deploy, health checks and the rollback decision.
///
/// Never returns an error: every failure ends up as a settled [`StageExecution`] with a
/// [`FailureReason`] and the details in its logs.
#[derive(Clone)]
pub struct StageRunner {
    executor: DeploymentStrategyExecutor,
    checker: HealthChecker,
    evaluator: RollbackEvaluator,
    notifier: Arc<dyn Notifier>,
    retention: Option<chrono::Duration>,
}

impl fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRunner")
            .field("executor", &self.executor)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    pub fn new(
        executor: DeploymentStrategyExecutor,
        checker: HealthChecker,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            executor,
            checker,
            evaluator: RollbackEvaluator::new(),
            notifier,
            retention: None,
        }
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn executor(&self) -> &DeploymentStrategyExecutor {
        &self.executor
    }

    pub async fn run(
        &self,
        ctx: &StageContext<'_>,
        clock: &RunClock,
        cancel: &CancelToken,
    ) -> StageExecution {
        let environment = ctx.environment;
        let mut stage = StageExecution::new(environment, ctx.attempt, clock.now());
        stage.log(
            clock.now(),
            format!(
                "attempt {} of {} for version {} ({}, {})",
                ctx.attempt,
                environment.stage_attempts.max(1),
                ctx.version,
                ctx.strategy,
                ctx.update_type
            ),
        );
        info!(
            target: "pipeline.stage",
            execution_id = ctx.execution_id,
            environment = %environment.name,
            attempt = ctx.attempt,
            "stage started"
        );

        if cancel.is_cancelled() {
            stage.fail(
                FailureReason::Cancelled,
                "cancelled before deployment",
                clock.now(),
            );
            self.finish(ctx, &stage).await;
            return stage;
        }

        let deadline = deadline_after(environment.deployment_timeout_minutes);
        let mut window = match self.retention {
            Some(retention) => MetricsWindow::with_retention(retention),
            None => MetricsWindow::new(),
        };

        stage.advance(StageStatus::Deploying, clock.now());
        let request = DeployRequest {
            environment,
            strategy: ctx.strategy,
            version: ctx.version,
            update_type: ctx.update_type,
        };
        let deploying = self.executor.deploy(&request, &mut window, clock, cancel);
        let deployed = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, deploying).await,
            None => Ok(deploying.await),
        };
        let result = match deployed {
            Ok(Ok(result)) => result,
            Ok(Err(StrategyError::Cancelled { deployment_id })) => {
                if let Some(id) = deployment_id {
                    stage.log(clock.now(), format!("deployment {id} left in place"));
                }
                stage.fail(
                    FailureReason::Cancelled,
                    "cancelled during deployment",
                    clock.now(),
                );
                self.finish(ctx, &stage).await;
                return stage;
            }
            Ok(Err(err)) => {
                stage.fail(FailureReason::DeployerError, err.to_string(), clock.now());
                self.finish(ctx, &stage).await;
                return stage;
            }
            Err(_) => {
                stage.fail(
                    FailureReason::DeploymentTimeout,
                    format!(
                        "deployment did not finish within {} minutes",
                        environment.deployment_timeout_minutes
                    ),
                    clock.now(),
                );
                self.finish(ctx, &stage).await;
                return stage;
            }
        };
        log_phases(&mut stage, &result, clock.now());
        // judged at the last sample so slow health checks cannot age the breach out
        let judged_at = result
            .phases
            .last()
            .map(|phase| phase.recorded_at)
            .unwrap_or_else(|| clock.now());
        let stopped_early = result.stopped_early;
        stage.deployment_result = Some(result);

        if stopped_early {
            if ctx.policy.enabled && ctx.policy.automatic {
                self.roll_back(ctx, &mut stage, clock, "canary aborted")
                    .await;
            } else {
                stage.fail(
                    FailureReason::CanaryAbort,
                    "canary aborted at the smallest phase",
                    clock.now(),
                );
            }
            self.finish(ctx, &stage).await;
            return stage;
        }

        stage.advance(StageStatus::HealthChecking, clock.now());
        let results = self
            .checker
            .run_all(&environment.health_checks, deadline, cancel)
            .await;
        for result in &results {
            stage.log(
                clock.now(),
                format!(
                    "check {} {} in {}ms after {} attempt(s): {}",
                    result.check_name,
                    result.status,
                    result.response_time_ms,
                    result.attempts,
                    result.message
                ),
            );
        }
        stage.health_results = results;

        if cancel.is_cancelled() {
            stage.fail(
                FailureReason::Cancelled,
                "cancelled during health checks",
                clock.now(),
            );
            self.finish(ctx, &stage).await;
            return stage;
        }
        if !stage.health_passed() {
            let failing: Vec<String> = stage
                .health_results
                .iter()
                .filter(|result| result.status != HealthStatus::Pass)
                .map(|result| format!("{} ({})", result.check_name, result.status))
                .collect();
            stage.fail(
                FailureReason::HealthCheckFailed,
                format!("checks did not pass: {}", failing.join(", ")),
                clock.now(),
            );
            self.finish(ctx, &stage).await;
            return stage;
        }

        let decision = self
            .evaluator
            .should_rollback(ctx.policy, &window, judged_at);
        if decision.breached() {
            for breach in &decision.breaches {
                stage.log(clock.now(), format!("sustained breach: {breach}"));
            }
            stage.breaches = decision.breaches.clone();
        }
        if decision.rollback {
            self.roll_back(ctx, &mut stage, clock, "rollback conditions breached")
                .await;
        } else if decision.deferred {
            stage.fail(
                FailureReason::RollbackBreach,
                "rollback conditions breached, awaiting a manual decision",
                clock.now(),
            );
        } else if environment.approval_required {
            stage.advance(StageStatus::AwaitingApproval, clock.now());
        } else {
            stage.settle(StageStatus::Promoted, clock.now());
        }
        self.finish(ctx, &stage).await;
        stage
    }

    /// Reverts the stage's deployment, giving up after the policy's attempt budget.
    async fn roll_back(
        &self,
        ctx: &StageContext<'_>,
        stage: &mut StageExecution,
        clock: &RunClock,
        cause: &str,
    ) {
        let environment = ctx.environment;
        let Some(deployment_id) = stage.deployment_id().map(str::to_string) else {
            stage.fail(
                FailureReason::RollbackFailed,
                "no deployment to roll back",
                clock.now(),
            );
            return;
        };
        self.notify(
            ctx,
            PipelineEvent::RollbackStart,
            format!("rolling back {deployment_id}: {cause}"),
        )
        .await;
        stage.log(
            clock.now(),
            format!("rolling back {deployment_id}: {cause}"),
        );

        let outcome = revert(
            self.executor.deployer().as_ref(),
            environment,
            &deployment_id,
            ctx.policy.max_attempts,
        )
        .await;
        for line in &outcome.logs {
            stage.log(clock.now(), line);
        }
        match outcome.rollback_deployment_id {
            Some(rollback_id) => {
                stage.rollback_deployment_id = Some(rollback_id.clone());
                stage.settle(StageStatus::RolledBack, clock.now());
                info!(
                    target: "pipeline.stage",
                    execution_id = ctx.execution_id,
                    environment = %environment.name,
                    rollback_deployment_id = %rollback_id,
                    "stage rolled back"
                );
                self.notify(
                    ctx,
                    PipelineEvent::RollbackSuccess,
                    format!("{deployment_id} rolled back as {rollback_id}"),
                )
                .await;
            }
            None => {
                warn!(
                    target: "pipeline.stage",
                    execution_id = ctx.execution_id,
                    environment = %environment.name,
                    attempts = outcome.attempts,
                    "rollback attempts exhausted"
                );
                stage.fail(
                    FailureReason::RollbackFailed,
                    format!(
                        "rollback of {deployment_id} failed after {} attempt(s)",
                        outcome.attempts
                    ),
                    clock.now(),
                );
            }
        }
    }

    async fn finish(&self, ctx: &StageContext<'_>, stage: &StageExecution) {
        info!(
            target: "pipeline.stage",
            execution_id = ctx.execution_id,
            environment = %stage.environment,
            status = %stage.status,
            failure_reason = ?stage.failure_reason,
            "stage settled"
        );
        match stage.status {
            StageStatus::Promoted => {
                self.notify(ctx, PipelineEvent::StageSuccess, "promoted")
                    .await
            }
            status if status.unsuccessful() => {
                let reason = stage
                    .failure_reason
                    .map(|reason| reason.to_string())
                    .unwrap_or_else(|| status.to_string());
                self.notify(ctx, PipelineEvent::StageFailure, reason).await
            }
            _ => {}
        }
    }

    async fn notify(
        &self,
        ctx: &StageContext<'_>,
        event: PipelineEvent,
        message: impl Into<String>,
    ) {
        let notification = Notification::new(event, ctx.execution_id, ctx.pipeline, message)
            .for_environment(&ctx.environment.name);
        if let Err(err) = self.notifier.notify(&notification).await {
            warn!(
                target: "pipeline.stage",
                event = event.as_str(),
                error = %err,
                "notification failed"
            );
        }
    }
}

/// Result of reverting one deployment.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RevertOutcome {
    pub rollback_deployment_id: Option<String>,
    pub attempts: u32,
    pub logs: Vec<String>,
}

/// Calls [`Deployer::rollback`] until it succeeds or `max_attempts` (at least one) is
/// used up. Each attempt is bounded by the environment's rollback timeout.
pub(crate) async fn revert(
    deployer: &dyn Deployer,
    environment: &EnvironmentSpec,
    deployment_id: &str,
    max_attempts: u32,
) -> RevertOutcome {
    let max_attempts = max_attempts.max(1);
    let timeout = Duration::from_secs(environment.rollback_timeout_minutes.saturating_mul(60));
    let mut logs = Vec::new();
    for attempt in 1..=max_attempts {
        match tokio::time::timeout(timeout, deployer.rollback(environment, deployment_id)).await {
            Ok(Ok(rollback_id)) => {
                logs.push(format!(
                    "rollback attempt {attempt} succeeded: {rollback_id}"
                ));
                return RevertOutcome {
                    rollback_deployment_id: Some(rollback_id),
                    attempts: attempt,
                    logs,
                };
            }
            Ok(Err(err)) => logs.push(format!("rollback attempt {attempt} failed: {err}")),
            Err(_) => logs.push(format!(
                "rollback attempt {attempt} timed out after {} minutes",
                environment.rollback_timeout_minutes
            )),
        }
    }
    RevertOutcome {
        rollback_deployment_id: None,
        attempts: max_attempts,
        logs,
    }
}

/// `None` when the timeout is too far out to be represented, which leaves the stage
/// unbounded.
fn deadline_after(minutes: u64) -> Option<Instant> {
    minutes
        .checked_mul(60)
        .and_then(|seconds| Instant::now().checked_add(Duration::from_secs(seconds)))
}

fn log_phases(stage: &mut StageExecution, result: &DeploymentResult, at: DateTime<Utc>) {
    stage.log(
        at,
        format!(
            "deployment {} via {}",
            result.deployment_id, result.strategy
        ),
    );
    for phase in &result.phases {
        stage.log(
            phase.recorded_at,
            format!(
                "phase {}%: error_rate={:.2} response_time_ms={:.1} success_rate={:.2}",
                phase.traffic_percent, phase.error_rate, phase.response_time_ms, phase.success_rate
            ),
        );
    }
    if result.stopped_early {
        let skipped: Vec<String> = result
            .skipped_phases
            .iter()
            .map(|phase| format!("{phase}%"))
            .collect();
        stage.log(
            at,
            format!(
                "stopped early at {}%, skipped {}",
                result.trigger_phase.unwrap_or_default(),
                skipped.join(", ")
            ),
        );
    }
}
