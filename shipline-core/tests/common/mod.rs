#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shipline_core::health::{Probe, ProbeError};
use shipline_core::pipeline::{CheckKind, Operator, RollbackCondition, RollbackPolicy};
use shipline_core::{
    Deployer, DeployerError, EnvironmentSpec, ExecutionStore, FixedMetricsSource, HealthCheckSpec,
    HealthChecker, Notification, Notifier, NotifyError, PipelineConfig, PipelineEvent,
    PipelineOrchestrator, RawPhaseMetrics, Strategy, StrategySettings,
};

/// Deployer double that hands out predictable ids and can fail on demand.
#[derive(Default)]
pub struct ScriptedDeployer {
    deploy_failures: Mutex<HashMap<String, u32>>,
    failing_rollbacks: Mutex<HashMap<String, u32>>,
    hanging: Mutex<Vec<String>>,
    pub deploys: Mutex<Vec<(String, String)>>,
    pub rollbacks: Mutex<Vec<(String, String)>>,
}

impl ScriptedDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` deploys to `environment` fail.
    pub fn fail_deploys(self, environment: &str, count: u32) -> Self {
        self.deploy_failures
            .lock()
            .unwrap()
            .insert(environment.to_string(), count);
        self
    }

    pub fn fail_rollbacks(self, environment: &str, count: u32) -> Self {
        self.failing_rollbacks
            .lock()
            .unwrap()
            .insert(environment.to_string(), count);
        self
    }

    /// Deploys to `environment` never return.
    pub fn hang_deploys(self, environment: &str) -> Self {
        self.hanging.lock().unwrap().push(environment.to_string());
        self
    }

    pub fn deployed_environments(&self) -> Vec<String> {
        self.deploys
            .lock()
            .unwrap()
            .iter()
            .map(|(env, _)| env.clone())
            .collect()
    }
}

fn take_failure(failures: &Mutex<HashMap<String, u32>>, environment: &str) -> bool {
    let mut failures = failures.lock().unwrap();
    match failures.get_mut(environment) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl Deployer for ScriptedDeployer {
    async fn deploy(
        &self,
        environment: &EnvironmentSpec,
        version: &str,
    ) -> Result<String, DeployerError> {
        let hangs = self.hanging.lock().unwrap().contains(&environment.name);
        if hangs {
            return std::future::pending().await;
        }
        if take_failure(&self.deploy_failures, &environment.name) {
            return Err(DeployerError::Rejected(format!(
                "{} cluster unavailable",
                environment.name
            )));
        }
        let mut deploys = self.deploys.lock().unwrap();
        deploys.push((environment.name.clone(), version.to_string()));
        Ok(format!("{}-{}", environment.name, deploys.len()))
    }

    async fn rollback(
        &self,
        environment: &EnvironmentSpec,
        deployment_id: &str,
    ) -> Result<String, DeployerError> {
        if take_failure(&self.failing_rollbacks, &environment.name) {
            return Err(DeployerError::Rejected("previous release missing".into()));
        }
        let mut rollbacks = self.rollbacks.lock().unwrap();
        rollbacks.push((environment.name.clone(), deployment_id.to_string()));
        Ok(format!("rollback-{deployment_id}"))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProbeBehavior {
    Pass,
    Fail,
    Hang,
    /// Passes after the given delay.
    Slow(Duration),
}

/// Probe double keyed by check target. Unknown targets pass.
#[derive(Default)]
pub struct ScriptedProbe {
    behaviors: HashMap<String, ProbeBehavior>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: &str, behavior: ProbeBehavior) -> Self {
        self.behaviors.insert(target.to_string(), behavior);
        self
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, check: &HealthCheckSpec) -> Result<String, ProbeError> {
        match self
            .behaviors
            .get(&check.target)
            .copied()
            .unwrap_or(ProbeBehavior::Pass)
        {
            ProbeBehavior::Pass => Ok("HTTP 200".into()),
            ProbeBehavior::Fail => Err(ProbeError::UnexpectedStatus {
                expected: 200,
                actual: 503,
            }),
            ProbeBehavior::Hang => std::future::pending().await,
            ProbeBehavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok("HTTP 200".into())
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|notification| notification.event)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.notifications
            .lock()
            .unwrap()
            .push(notification.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

pub fn http_check(environment: &str) -> HealthCheckSpec {
    HealthCheckSpec::new(
        format!("{environment}-api"),
        CheckKind::Http,
        format!("http://{environment}.internal/health"),
    )
}

pub fn environment(name: &str, order: u32) -> EnvironmentSpec {
    EnvironmentSpec::new(name, order).with_check(http_check(name))
}

pub fn error_rate_policy() -> RollbackPolicy {
    RollbackPolicy {
        enabled: true,
        automatic: true,
        conditions: vec![RollbackCondition::new(
            "error_rate",
            Operator::GreaterThan,
            5.0,
            30,
        )],
        max_attempts: 3,
    }
}

/// dev -> staging -> prod, rolling, automatic error-rate rollback.
pub fn three_stage_config() -> PipelineConfig {
    PipelineConfig {
        name: "web".into(),
        revision: 1,
        strategy: Strategy::Rolling,
        rollback_policy: error_rate_policy(),
        environments: vec![
            environment("dev", 1),
            environment("staging", 2),
            environment("prod", 3),
        ],
    }
}

pub fn healthy_metrics() -> FixedMetricsSource {
    FixedMetricsSource::new(RawPhaseMetrics::new(1.0, 120.0))
}

pub struct Harness {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub deployer: Arc<ScriptedDeployer>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn harness(
    store: Arc<dyn ExecutionStore>,
    deployer: ScriptedDeployer,
    metrics: FixedMetricsSource,
    probe: ScriptedProbe,
) -> Harness {
    harness_with_expiry(store, deployer, metrics, probe, None)
}

pub fn harness_with_expiry(
    store: Arc<dyn ExecutionStore>,
    deployer: ScriptedDeployer,
    metrics: FixedMetricsSource,
    probe: ScriptedProbe,
    approval_expiry: Option<chrono::Duration>,
) -> Harness {
    let deployer = Arc::new(deployer);
    let notifier = Arc::new(RecordingNotifier::default());
    let orchestrator = PipelineOrchestrator::builder()
        .store(store)
        .deployer(deployer.clone())
        .metrics(Arc::new(metrics))
        .health_checker(HealthChecker::new(Arc::new(probe)))
        .notifier(notifier.clone())
        .strategy_settings(StrategySettings::default())
        .approval_expiry(approval_expiry)
        .build()
        .expect("orchestrator should build");
    Harness {
        orchestrator: Arc::new(orchestrator),
        deployer,
        notifier,
    }
}
