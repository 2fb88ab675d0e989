use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::RunClock;
use crate::config::StrategySettings;
use crate::deployer::Deployer;
use crate::metrics::{
    MetricsSource, MetricsWindow, PhaseContext, ERROR_RATE, RESPONSE_TIME, SUCCESS_RATE,
};
use crate::pipeline::EnvironmentSpec;

use super::{DeploymentResult, MetricsSummary, Strategy, StrategyError, UpdateType};

#[derive(Debug, Clone, Copy)]
pub struct DeployRequest<'a> {
    pub environment: &'a EnvironmentSpec,
    pub strategy: Strategy,
    pub version: &'a str,
    pub update_type: UpdateType,
}

/// Rolls a version out through a strategy's traffic phases, streaming each phase's
/// metrics into the caller's window as it goes.
#[derive(Clone)]
pub struct DeploymentStrategyExecutor {
    deployer: Arc<dyn Deployer>,
    metrics: Arc<dyn MetricsSource>,
    settings: StrategySettings,
}

impl fmt::Debug for DeploymentStrategyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentStrategyExecutor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DeploymentStrategyExecutor {
    pub fn new(
        deployer: Arc<dyn Deployer>,
        metrics: Arc<dyn MetricsSource>,
        settings: StrategySettings,
    ) -> Self {
        Self {
            deployer,
            metrics,
            settings,
        }
    }

    pub fn deployer(&self) -> &Arc<dyn Deployer> {
        &self.deployer
    }

    pub fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    pub async fn deploy(
        &self,
        request: &DeployRequest<'_>,
        window: &mut MetricsWindow,
        clock: &RunClock,
        cancel: &CancelToken,
    ) -> Result<DeploymentResult, StrategyError> {
        if cancel.is_cancelled() {
            return Err(StrategyError::Cancelled {
                deployment_id: None,
            });
        }
        let environment = request.environment;
        let deployment_id = self.deployer.deploy(environment, request.version).await?;
        info!(
            target: "pipeline.strategy",
            environment = %environment.name,
            strategy = request.strategy.as_str(),
            version = request.version,
            deployment_id = %deployment_id,
            "deployment started"
        );

        let phases = request.strategy.phases();
        let risk_multiplier = self.settings.risk.for_update(request.update_type);
        let mut recorded = Vec::with_capacity(phases.len());
        let mut trigger_phase = None;
        let mut skipped_phases = Vec::new();

        for (index, &traffic_percent) in phases.iter().enumerate() {
            if index > 0 && !cancel.sleep(self.settings.phase_interval()).await {
                return Err(StrategyError::Cancelled {
                    deployment_id: Some(deployment_id),
                });
            }
            if cancel.is_cancelled() {
                return Err(StrategyError::Cancelled {
                    deployment_id: Some(deployment_id),
                });
            }

            let at = clock.now();
            let context = PhaseContext {
                environment: environment.name.clone(),
                version: request.version.to_string(),
                strategy: request.strategy,
                traffic_percent,
                phase_index: index,
                at,
            };
            let raw = self.metrics.observe(&context).await?;
            let phase =
                request
                    .strategy
                    .shape(traffic_percent, raw, risk_multiplier, &self.settings, at);
            window.record(ERROR_RATE, phase.error_rate, at)?;
            window.record(RESPONSE_TIME, phase.response_time_ms, at)?;
            window.record(SUCCESS_RATE, phase.success_rate, at)?;
            recorded.push(phase);
            debug!(
                target: "pipeline.strategy",
                environment = %environment.name,
                traffic_percent,
                error_rate = phase.error_rate,
                response_time_ms = phase.response_time_ms,
                "phase recorded"
            );

            if request.strategy == Strategy::Canary
                && index == 0
                && phase.error_rate > self.settings.canary_abort_error_rate
            {
                trigger_phase = Some(traffic_percent);
                skipped_phases = phases[index + 1..].to_vec();
                warn!(
                    target: "pipeline.strategy",
                    environment = %environment.name,
                    traffic_percent,
                    error_rate = phase.error_rate,
                    threshold = self.settings.canary_abort_error_rate,
                    "canary aborted at smallest phase"
                );
                break;
            }
        }

        Ok(DeploymentResult {
            strategy: request.strategy,
            version: request.version.to_string(),
            deployment_id,
            update_type: request.update_type,
            worst: MetricsSummary::worst_of(&recorded),
            phases: recorded,
            stopped_early: trigger_phase.is_some(),
            trigger_phase,
            skipped_phases,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployer::DeployerError;
    use crate::metrics::{FixedMetricsSource, MetricsError, RawPhaseMetrics};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDeployer {
        deployed: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Deployer for RecordingDeployer {
        async fn deploy(
            &self,
            environment: &EnvironmentSpec,
            version: &str,
        ) -> Result<String, DeployerError> {
            if self.fail {
                return Err(DeployerError::Rejected("cluster unavailable".into()));
            }
            self.deployed
                .lock()
                .unwrap()
                .push(format!("{}:{version}", environment.name));
            Ok(format!("dep-{}", environment.name))
        }

        async fn rollback(
            &self,
            environment: &EnvironmentSpec,
            _deployment_id: &str,
        ) -> Result<String, DeployerError> {
            Ok(format!("rb-{}", environment.name))
        }
    }

    struct PerPhaseSource(HashMap<u8, RawPhaseMetrics>);

    #[async_trait]
    impl MetricsSource for PerPhaseSource {
        async fn observe(&self, context: &PhaseContext) -> Result<RawPhaseMetrics, MetricsError> {
            Ok(self
                .0
                .get(&context.traffic_percent)
                .copied()
                .unwrap_or_else(|| RawPhaseMetrics::new(1.0, 100.0)))
        }
    }

    fn executor(metrics: Arc<dyn MetricsSource>) -> DeploymentStrategyExecutor {
        DeploymentStrategyExecutor::new(
            Arc::new(RecordingDeployer::default()),
            metrics,
            StrategySettings::default(),
        )
    }

    fn request<'a>(environment: &'a EnvironmentSpec, strategy: Strategy) -> DeployRequest<'a> {
        DeployRequest {
            environment,
            strategy,
            version: "1.4.0",
            update_type: UpdateType::Patch,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_keeps_worst_phase_metrics() {
        let source = PerPhaseSource(HashMap::from([
            (25, RawPhaseMetrics::new(0.5, 90.0)),
            (75, RawPhaseMetrics::new(4.0, 400.0)),
        ]));
        let env = EnvironmentSpec::new("staging", 2);
        let mut window = MetricsWindow::new();

        let result = executor(Arc::new(source))
            .deploy(
                &request(&env, Strategy::Rolling),
                &mut window,
                &RunClock::start(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let traffic: Vec<u8> = result.phases.iter().map(|p| p.traffic_percent).collect();
        assert_eq!(traffic, vec![25, 50, 75, 100]);
        assert_eq!(result.worst.error_rate, 4.0);
        assert_eq!(result.worst.response_time_ms, 400.0);
        assert_eq!(result.worst.success_rate, 96.0);
        assert!(!result.stopped_early);
        assert_eq!(window.samples(ERROR_RATE).count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn phases_are_spaced_by_the_configured_interval() {
        let env = EnvironmentSpec::new("dev", 1);
        let mut window = MetricsWindow::new();
        let source = FixedMetricsSource::new(RawPhaseMetrics::new(1.0, 100.0));

        let result = executor(Arc::new(source))
            .deploy(
                &request(&env, Strategy::Rolling),
                &mut window,
                &RunClock::start(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let first = result.phases[0].recorded_at;
        let last = result.phases[3].recorded_at;
        assert_eq!((last - first).num_seconds(), 45);
    }

    #[tokio::test(start_paused = true)]
    async fn canary_stops_at_smallest_phase() {
        let source = PerPhaseSource(HashMap::from([(5, RawPhaseMetrics::new(9.0, 150.0))]));
        let env = EnvironmentSpec::new("prod", 3);
        let mut window = MetricsWindow::new();

        let result = executor(Arc::new(source))
            .deploy(
                &request(&env, Strategy::Canary),
                &mut window,
                &RunClock::start(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(result.stopped_early);
        assert_eq!(result.trigger_phase, Some(5));
        assert_eq!(result.phases.len(), 1);
        assert_eq!(result.skipped_phases, vec![10, 25, 50, 100]);
        assert_eq!(window.samples(ERROR_RATE).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_canary_runs_every_phase() {
        let env = EnvironmentSpec::new("prod", 3);
        let mut window = MetricsWindow::new();
        let source = FixedMetricsSource::new(RawPhaseMetrics::new(1.0, 100.0));

        let result = executor(Arc::new(source))
            .deploy(
                &request(&env, Strategy::Canary),
                &mut window,
                &RunClock::start(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.stopped_early);
        assert_eq!(result.phases.len(), 5);
        assert!(result.skipped_phases.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn blue_green_is_a_single_dampened_phase() {
        let env = EnvironmentSpec::new("prod", 3);
        let mut window = MetricsWindow::new();
        let source = FixedMetricsSource::new(RawPhaseMetrics::new(10.0, 100.0));

        let result = executor(Arc::new(source))
            .deploy(
                &request(&env, Strategy::BlueGreen),
                &mut window,
                &RunClock::start(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.phases.len(), 1);
        assert_eq!(result.phases[0].traffic_percent, 100);
        assert!((result.worst.error_rate - 7.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn major_updates_are_scaled_harder_than_patches() {
        let env = EnvironmentSpec::new("staging", 2);
        let source: Arc<dyn MetricsSource> =
            Arc::new(FixedMetricsSource::new(RawPhaseMetrics::new(2.0, 100.0)));
        let executor = executor(source);

        let mut patch_request = request(&env, Strategy::BlueGreen);
        patch_request.update_type = UpdateType::Patch;
        let mut major_request = patch_request;
        major_request.update_type = UpdateType::Major;

        let clock = RunClock::start();
        let patch = executor
            .deploy(
                &patch_request,
                &mut MetricsWindow::new(),
                &clock,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        let major = executor
            .deploy(
                &major_request,
                &mut MetricsWindow::new(),
                &clock,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(major.worst.error_rate > patch.worst.error_rate);
        assert!((major.worst.error_rate / patch.worst.error_rate - 2.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_new_phases() {
        let env = EnvironmentSpec::new("staging", 2);
        let source = FixedMetricsSource::new(RawPhaseMetrics::new(1.0, 100.0));
        let executor = executor(Arc::new(source));
        let token = CancelToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            canceller.cancel();
        });
        let mut window = MetricsWindow::new();

        let err = executor
            .deploy(
                &request(&env, Strategy::Rolling),
                &mut window,
                &RunClock::start(),
                &token,
            )
            .await
            .unwrap_err();

        match err {
            StrategyError::Cancelled { deployment_id } => {
                assert_eq!(deployment_id.as_deref(), Some("dep-staging"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(window.samples(ERROR_RATE).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deployer_error_is_propagated() {
        let env = EnvironmentSpec::new("dev", 1);
        let executor = DeploymentStrategyExecutor::new(
            Arc::new(RecordingDeployer {
                deployed: Mutex::new(Vec::new()),
                fail: true,
            }),
            Arc::new(FixedMetricsSource::new(RawPhaseMetrics::new(1.0, 100.0))),
            StrategySettings::default(),
        );

        let err = executor
            .deploy(
                &request(&env, Strategy::Rolling),
                &mut MetricsWindow::new(),
                &RunClock::start(),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StrategyError::Deployer(_)));
    }
}
