mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use shipline_core::pipeline::{
    ExecutionRequest, FailureReason, MemoryExecutionStore, PipelineError, RollbackRequest,
    RollbackStatus, StageStatus,
};
use shipline_core::{
    ExecutionStatus, ExecutionStore, HealthStatus, PipelineEvent, RawPhaseMetrics, Strategy,
    TriggerType, UpdateType,
};

fn request(version: &str) -> ExecutionRequest {
    ExecutionRequest::new(version, TriggerType::Manual, "release-bot")
        .with_update_type(UpdateType::Patch)
}

fn memory_store() -> Arc<MemoryExecutionStore> {
    Arc::new(MemoryExecutionStore::new())
}

#[tokio::test(start_paused = true)]
async fn stages_run_in_ascending_order() {
    let mut config = three_stage_config();
    config.environments.reverse();
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
    );

    let execution = h
        .orchestrator
        .execute(&config, request("1.4.1"))
        .await
        .unwrap();

    let visited: Vec<&str> = execution
        .stages
        .iter()
        .map(|stage| stage.environment.as_str())
        .collect();
    assert_eq!(visited, vec!["dev", "staging", "prod"]);
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert!(execution.end_time.is_some());
    assert_eq!(execution.aggregate_metrics.stages_promoted, 3);
    assert_eq!(
        h.deployer.deployed_environments(),
        vec!["dev", "staging", "prod"]
    );
    assert_eq!(
        h.notifier.events(),
        vec![
            PipelineEvent::PipelineStart,
            PipelineEvent::StageSuccess,
            PipelineEvent::StageSuccess,
            PipelineEvent::StageSuccess,
            PipelineEvent::PipelineSuccess,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn staging_breach_rolls_back_and_halts_before_prod() {
    let metrics = healthy_metrics().with_environment("staging", RawPhaseMetrics::new(8.0, 150.0));
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        metrics,
        ScriptedProbe::new(),
    );

    let execution = h
        .orchestrator
        .execute(&three_stage_config(), request("1.5.0"))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.stages.len(), 2);
    assert_eq!(execution.stages[0].status, StageStatus::Promoted);

    let staging = &execution.stages[1];
    assert_eq!(staging.status, StageStatus::RolledBack);
    assert_eq!(staging.breaches.len(), 1);
    assert_eq!(
        staging.rollback_deployment_id.as_deref(),
        Some("rollback-staging-2")
    );
    let result = staging.deployment_result.as_ref().unwrap();
    assert_eq!(result.phases.len(), 4);
    assert_eq!(
        (result.phases[3].recorded_at - result.phases[0].recorded_at).num_seconds(),
        45
    );

    assert!(execution.stage("prod").is_none());
    assert_eq!(h.deployer.deployed_environments(), vec!["dev", "staging"]);
    let events = h.notifier.events();
    assert!(events.contains(&PipelineEvent::RollbackStart));
    assert!(events.contains(&PipelineEvent::RollbackSuccess));
    assert_eq!(events.last(), Some(&PipelineEvent::PipelineFailure));
}

#[tokio::test(start_paused = true)]
async fn slow_health_checks_do_not_hide_a_sustained_breach() {
    let mut config = three_stage_config();
    config.environments[1].health_checks[0].timeout_seconds = 60;
    let metrics = healthy_metrics().with_environment("staging", RawPhaseMetrics::new(8.0, 150.0));
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        metrics,
        ScriptedProbe::new().with(
            "http://staging.internal/health",
            ProbeBehavior::Slow(Duration::from_secs(40)),
        ),
    );

    let execution = h
        .orchestrator
        .execute(&config, request("1.5.1"))
        .await
        .unwrap();

    let staging = &execution.stages[1];
    assert_eq!(staging.health_results[0].status, HealthStatus::Pass);
    assert!(staging.health_results[0].response_time_ms >= 40_000);
    assert_eq!(staging.status, StageStatus::RolledBack);
    assert_eq!(staging.breaches.len(), 1);
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.stage("prod").is_none());
}

#[tokio::test(start_paused = true)]
async fn stuck_deploy_hits_the_stage_deadline() {
    let mut config = three_stage_config();
    config.environments[0].deployment_timeout_minutes = 1;
    let h = harness(
        memory_store(),
        ScriptedDeployer::new().hang_deploys("dev"),
        healthy_metrics(),
        ScriptedProbe::new(),
    );

    let execution = h
        .orchestrator
        .execute(&config, request("1.4.3"))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.stages.len(), 1);
    let dev = &execution.stages[0];
    assert_eq!(dev.status, StageStatus::Failed);
    assert_eq!(dev.failure_reason, Some(FailureReason::DeploymentTimeout));
    assert!(dev.deployment_result.is_none());
    assert!(dev.health_results.is_empty());
    assert_eq!((dev.end_time.unwrap() - dev.start_time).num_seconds(), 60);
    assert!(h.deployer.deployed_environments().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unresponsive_health_check_times_out_and_fails_the_stage() {
    let mut config = three_stage_config();
    let check = &mut config.environments[0].health_checks[0];
    check.timeout_seconds = 1;
    check.retry_count = 0;
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new().with("http://dev.internal/health", ProbeBehavior::Hang),
    );

    let execution = h
        .orchestrator
        .execute(&config, request("1.4.2"))
        .await
        .unwrap();

    let dev = &execution.stages[0];
    assert_eq!(dev.status, StageStatus::Failed);
    assert_eq!(dev.failure_reason, Some(FailureReason::HealthCheckFailed));
    assert_eq!(dev.health_results[0].status, HealthStatus::Timeout);
    assert!(dev.health_results[0].response_time_ms >= 1000);
    assert!(dev.health_results[0].response_time_ms < 1100);
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.stages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn auto_promote_keeps_going_after_a_failed_stage() {
    let mut config = three_stage_config();
    config.environments[0].auto_promote = true;
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new().with("http://dev.internal/health", ProbeBehavior::Fail),
    );

    let execution = h
        .orchestrator
        .execute(&config, request("1.4.3"))
        .await
        .unwrap();

    let statuses: Vec<StageStatus> = execution.stages.iter().map(|stage| stage.status).collect();
    assert_eq!(
        statuses,
        vec![
            StageStatus::Failed,
            StageStatus::Promoted,
            StageStatus::Promoted
        ]
    );
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.aggregate_metrics.stages_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn approval_gates_pause_and_resume_one_gate_at_a_time() {
    let mut config = three_stage_config();
    config.environments[0].approval_required = true;
    config.environments[2].approval_required = true;
    let store = memory_store();
    let h = harness(
        store.clone(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
    );

    let paused = h
        .orchestrator
        .execute(&config, request("2.0.0"))
        .await
        .unwrap();
    assert_eq!(paused.status, ExecutionStatus::PendingApproval);
    assert_eq!(paused.current_stage.as_deref(), Some("dev"));
    assert_eq!(paused.stages.len(), 1);
    assert!(paused.approval_requested_at.is_some());
    assert!(!h.orchestrator.is_active(&paused.execution_id));

    // a fresh orchestrator over the same store stands in for a restarted process
    let restarted = harness(
        store.clone(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
    );
    let second = restarted
        .orchestrator
        .resume(&paused.execution_id, "ops-lead")
        .await
        .unwrap();
    assert_eq!(second.status, ExecutionStatus::PendingApproval);
    assert_eq!(second.current_stage.as_deref(), Some("prod"));
    assert_eq!(second.stages.len(), 3);
    assert_eq!(second.stages[0].status, StageStatus::Promoted);
    assert_eq!(second.stages[0].approved_by.as_deref(), Some("ops-lead"));
    assert_eq!(
        restarted.deployer.deployed_environments(),
        vec!["staging", "prod"]
    );

    let done = restarted
        .orchestrator
        .resume(&paused.execution_id, "cto")
        .await
        .unwrap();
    assert_eq!(done.status, ExecutionStatus::Succeeded);
    assert!(done
        .stages
        .iter()
        .all(|stage| stage.status == StageStatus::Promoted));
    assert_eq!(store.load(&paused.execution_id).unwrap().unwrap(), done);

    let err = restarted
        .orchestrator
        .resume(&paused.execution_id, "cto")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidStatus { .. }));
}

#[tokio::test(start_paused = true)]
async fn rejected_approval_fails_the_execution() {
    let mut config = three_stage_config();
    config.environments[1].approval_required = true;
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
    );
    let paused = h
        .orchestrator
        .execute(&config, request("1.6.0"))
        .await
        .unwrap();

    let rejected = h
        .orchestrator
        .reject(&paused.execution_id, "qa-lead", "release notes missing")
        .await
        .unwrap();

    assert_eq!(rejected.status, ExecutionStatus::Failed);
    let staging = rejected.stage("staging").unwrap();
    assert_eq!(staging.failure_reason, Some(FailureReason::Rejected));
    assert!(staging
        .logs
        .iter()
        .any(|line| line.contains("rejected by qa-lead: release notes missing")));
    assert!(rejected.stage("prod").is_none());
}

#[tokio::test(start_paused = true)]
async fn expired_approval_turns_into_a_failure() {
    let mut config = three_stage_config();
    config.environments[0].approval_required = true;
    let store = memory_store();
    let h = harness_with_expiry(
        store.clone(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
        Some(chrono::Duration::hours(72)),
    );
    let mut paused = h
        .orchestrator
        .execute(&config, request("1.7.0"))
        .await
        .unwrap();
    paused.approval_requested_at = Some(Utc::now() - chrono::Duration::hours(73));
    store.save(&paused).unwrap();

    let expired = h
        .orchestrator
        .resume(&paused.execution_id, "ops-lead")
        .await
        .unwrap();

    assert_eq!(expired.status, ExecutionStatus::Failed);
    assert_eq!(
        expired.stages[0].failure_reason,
        Some(FailureReason::ApprovalExpired)
    );
    assert!(expired.stages[0].approved_by.is_none());
    assert_eq!(h.deployer.deployed_environments(), vec!["dev"]);
}

#[tokio::test(start_paused = true)]
async fn sweep_expires_only_stale_approvals() {
    let mut config = three_stage_config();
    config.environments[0].approval_required = true;
    let store = memory_store();
    let h = harness_with_expiry(
        store.clone(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
        Some(chrono::Duration::hours(1)),
    );
    let mut stale = h
        .orchestrator
        .execute(&config, request("1.7.1").with_execution_id("stale"))
        .await
        .unwrap();
    stale.approval_requested_at = Some(Utc::now() - chrono::Duration::hours(2));
    store.save(&stale).unwrap();
    h.orchestrator
        .execute(&config, request("1.7.2").with_execution_id("fresh"))
        .await
        .unwrap();

    let expired = h.orchestrator.expire_stale_approvals().await.unwrap();

    assert_eq!(expired, vec!["stale".to_string()]);
    assert_eq!(
        h.orchestrator.get("fresh").unwrap().status,
        ExecutionStatus::PendingApproval
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_fails_current_stage_and_keeps_earlier_ones() {
    let config = three_stage_config();
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
    );
    let orchestrator = h.orchestrator.clone();
    let running = tokio::spawn({
        let config = config.clone();
        async move {
            orchestrator
                .execute(&config, request("1.8.0").with_execution_id("exec-cancel"))
                .await
        }
    });

    // dev takes 45s of phases; staging starts right after
    tokio::time::sleep(Duration::from_secs(70)).await;
    assert!(h.orchestrator.is_active("exec-cancel"));
    h.orchestrator.cancel("exec-cancel").await.unwrap();
    let execution = running.await.unwrap().unwrap();

    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.stages.len(), 2);
    assert_eq!(execution.stages[0].status, StageStatus::Promoted);
    assert_eq!(execution.stages[0].rollback_deployment_id, None);
    assert_eq!(execution.stages[1].status, StageStatus::Failed);
    assert_eq!(
        execution.stages[1].failure_reason,
        Some(FailureReason::Cancelled)
    );
    let phases = &execution.stages[1].deployment_result;
    assert!(phases.is_none());
    assert!(h.deployer.rollbacks.lock().unwrap().is_empty());
    assert!(!h.orchestrator.is_active("exec-cancel"));
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_paused_execution_settles_it() {
    let mut config = three_stage_config();
    config.environments[0].approval_required = true;
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
    );
    let paused = h
        .orchestrator
        .execute(&config, request("1.8.1"))
        .await
        .unwrap();

    h.orchestrator.cancel(&paused.execution_id).await.unwrap();

    let cancelled = h.orchestrator.get(&paused.execution_id).unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert_eq!(
        cancelled.stages[0].failure_reason,
        Some(FailureReason::Cancelled)
    );
}

#[tokio::test(start_paused = true)]
async fn retried_stage_replaces_the_failed_attempt() {
    let mut config = three_stage_config();
    config.environments[0].stage_attempts = 2;
    let h = harness(
        memory_store(),
        ScriptedDeployer::new().fail_deploys("dev", 1),
        healthy_metrics(),
        ScriptedProbe::new(),
    );

    let execution = h
        .orchestrator
        .execute(&config, request("1.9.0"))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.stages.len(), 3);
    let dev = &execution.stages[0];
    assert_eq!(dev.environment, "dev");
    assert_eq!(dev.attempt, 2);
    assert_eq!(dev.status, StageStatus::Promoted);
    assert_eq!(execution.aggregate_metrics.stages_failed, 0);
}

#[tokio::test(start_paused = true)]
async fn deployer_error_without_retries_fails_the_run() {
    let h = harness(
        memory_store(),
        ScriptedDeployer::new().fail_deploys("staging", 1),
        healthy_metrics(),
        ScriptedProbe::new(),
    );

    let execution = h
        .orchestrator
        .execute(&three_stage_config(), request("1.9.1"))
        .await
        .unwrap();

    let staging = &execution.stages[1];
    assert_eq!(staging.failure_reason, Some(FailureReason::DeployerError));
    assert!(staging
        .logs
        .iter()
        .any(|line| line.contains("staging cluster unavailable")));
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn canary_abort_without_automatic_policy_fails_stage() {
    let mut config = three_stage_config();
    config.strategy = Strategy::Canary;
    config.rollback_policy.automatic = false;
    let metrics = healthy_metrics().with_environment("dev", RawPhaseMetrics::new(12.0, 150.0));
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        metrics,
        ScriptedProbe::new(),
    );

    let execution = h
        .orchestrator
        .execute(&config, request("3.0.0"))
        .await
        .unwrap();

    let dev = &execution.stages[0];
    assert_eq!(dev.failure_reason, Some(FailureReason::CanaryAbort));
    let result = dev.deployment_result.as_ref().unwrap();
    assert!(result.stopped_early);
    assert_eq!(result.phases.len(), 1);
    assert_eq!(result.trigger_phase, Some(5));
    assert!(dev.health_results.is_empty());
    assert!(h.deployer.rollbacks.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn canary_abort_under_automatic_policy_rolls_back() {
    let mut config = three_stage_config();
    config.strategy = Strategy::Canary;
    let metrics = healthy_metrics().with_environment("dev", RawPhaseMetrics::new(12.0, 150.0));
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        metrics,
        ScriptedProbe::new(),
    );

    let execution = h
        .orchestrator
        .execute(&config, request("3.0.1"))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let dev = &execution.stages[0];
    assert_eq!(dev.status, StageStatus::RolledBack);
    assert_eq!(dev.failure_reason, None);
    assert_eq!(
        dev.rollback_deployment_id.as_deref(),
        Some("rollback-dev-1")
    );
    let result = dev.deployment_result.as_ref().unwrap();
    assert!(result.stopped_early);
    assert_eq!(result.trigger_phase, Some(5));
    assert!(dev.health_results.is_empty());
    assert_eq!(
        *h.deployer.rollbacks.lock().unwrap(),
        vec![("dev".to_string(), "dev-1".to_string())]
    );
    assert!(h
        .notifier
        .events()
        .contains(&PipelineEvent::RollbackSuccess));
}

#[tokio::test(start_paused = true)]
async fn invalid_config_is_rejected_before_any_work() {
    let mut config = three_stage_config();
    config.environments[2].order = 2;
    let store = memory_store();
    let h = harness(
        store.clone(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
    );

    let err = h
        .orchestrator
        .execute(&config, request("1.0.0"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Validation(_)));
    assert!(h.deployer.deployed_environments().is_empty());
    assert!(store.list(None, None, 10).unwrap().is_empty());
    assert!(h.notifier.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn manual_rollback_is_recorded_without_touching_the_execution() {
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
    );
    let execution = h
        .orchestrator
        .execute(&three_stage_config(), request("2.1.0"))
        .await
        .unwrap();
    let prod_deployment = execution
        .stage("prod")
        .and_then(|stage| stage.deployment_id())
        .unwrap()
        .to_string();

    let record = h
        .orchestrator
        .request_rollback(RollbackRequest {
            execution_id: execution.execution_id.clone(),
            target_deployment_id: prod_deployment.clone(),
            reason: "customer reports".into(),
            requested_by: "oncall".into(),
        })
        .await
        .unwrap();

    assert_eq!(record.status, RollbackStatus::Succeeded);
    assert_eq!(record.environment, "prod");
    assert_eq!(
        record.rollback_deployment_id,
        Some(format!("rollback-{prod_deployment}"))
    );
    assert_eq!(
        h.orchestrator.get(&execution.execution_id).unwrap(),
        execution
    );
    assert_eq!(
        h.orchestrator.rollbacks(&execution.execution_id).unwrap(),
        vec![record]
    );

    let err = h
        .orchestrator
        .request_rollback(RollbackRequest {
            execution_id: execution.execution_id.clone(),
            target_deployment_id: "unknown".into(),
            reason: "typo".into(),
            requested_by: "oncall".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::DeploymentNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn manual_rollback_failures_are_bounded() {
    let h = harness(
        memory_store(),
        ScriptedDeployer::new().fail_rollbacks("dev", 10),
        healthy_metrics(),
        ScriptedProbe::new(),
    );
    let execution = h
        .orchestrator
        .execute(&three_stage_config(), request("2.2.0"))
        .await
        .unwrap();

    let record = h
        .orchestrator
        .request_rollback(RollbackRequest {
            execution_id: execution.execution_id.clone(),
            target_deployment_id: "dev-1".into(),
            reason: "bad migration".into(),
            requested_by: "oncall".into(),
        })
        .await
        .unwrap();

    assert_eq!(record.status, RollbackStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert!(record.error.unwrap().contains("previous release missing"));
}

#[tokio::test(start_paused = true)]
async fn update_type_is_inferred_from_the_last_success() {
    let h = harness(
        memory_store(),
        ScriptedDeployer::new(),
        healthy_metrics(),
        ScriptedProbe::new(),
    );
    let config = three_stage_config();
    let first = h
        .orchestrator
        .execute(
            &config,
            ExecutionRequest::new("1.4.0", TriggerType::Automatic, "ci"),
        )
        .await
        .unwrap();
    assert_eq!(first.update_type, UpdateType::Minor);

    let second = h
        .orchestrator
        .execute(
            &config,
            ExecutionRequest::new("1.4.1", TriggerType::Scheduled, "ci"),
        )
        .await
        .unwrap();
    assert_eq!(second.update_type, UpdateType::Patch);
    assert_eq!(h.orchestrator.history(Some("web"), 10).unwrap().len(), 2);
}
