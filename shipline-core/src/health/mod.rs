//! Health checks run against an environment after each deployment.
//!
//! A check makes up to `retry_count + 1` attempts spaced `interval_seconds` apart, each
//! bounded by `timeout_seconds`. The first passing attempt wins. A check whose final
//! attempt ran out of time is reported as [`HealthStatus::Timeout`], which is kept
//! distinct from [`HealthStatus::Fail`] even though both block promotion.

pub mod probe;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::pipeline::HealthCheckSpec;

pub use probe::{Probe, ProbeError, SystemProbe};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Pass,
    Fail,
    Timeout,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Pass => "pass",
            HealthStatus::Fail => "fail",
            HealthStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckResult {
    pub check_name: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
}

impl HealthCheckResult {
    fn new(
        check: &HealthCheckSpec,
        status: HealthStatus,
        response_time_ms: u64,
        message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            check_name: check.name.clone(),
            status,
            response_time_ms,
            message: message.into(),
            timestamp: Utc::now(),
            attempts,
        }
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    probe: Arc<dyn Probe>,
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker").finish_non_exhaustive()
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(Arc::new(SystemProbe::default()))
    }
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self { probe }
    }

    pub async fn run(&self, check: &HealthCheckSpec, cancel: &CancelToken) -> HealthCheckResult {
        let attempts = check.retry_count + 1;
        let timeout = Duration::from_secs(check.timeout_seconds);
        let interval = Duration::from_secs(check.interval_seconds);
        let mut last = HealthCheckResult::new(check, HealthStatus::Fail, 0, "not attempted", 0);

        for attempt in 1..=attempts {
            if attempt > 1 && !cancel.sleep(interval).await {
                return cancelled(check, attempt - 1);
            }
            if cancel.is_cancelled() {
                return cancelled(check, attempt - 1);
            }

            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, self.probe.probe(check)).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            last = match outcome {
                Ok(Ok(message)) => {
                    debug!(
                        target: "pipeline.health",
                        check = %check.name,
                        attempt,
                        elapsed_ms,
                        "health check passed"
                    );
                    return HealthCheckResult::new(
                        check,
                        HealthStatus::Pass,
                        elapsed_ms,
                        message,
                        attempt,
                    );
                }
                Ok(Err(err)) => HealthCheckResult::new(
                    check,
                    HealthStatus::Fail,
                    elapsed_ms,
                    err.to_string(),
                    attempt,
                ),
                Err(_) => HealthCheckResult::new(
                    check,
                    HealthStatus::Timeout,
                    elapsed_ms,
                    format!("no response within {}s", check.timeout_seconds),
                    attempt,
                ),
            };
            debug!(
                target: "pipeline.health",
                check = %check.name,
                attempt,
                status = %last.status,
                message = %last.message,
                "health check attempt did not pass"
            );
        }

        warn!(
            target: "pipeline.health",
            check = %check.name,
            kind = check.kind.as_str(),
            status = %last.status,
            attempts = last.attempts,
            "health check exhausted its attempts"
        );
        last
    }

    /// Runs all checks concurrently. Results keep the order of `checks`. Checks still
    /// pending when `deadline` passes are reported as timed out.
    pub async fn run_all(
        &self,
        checks: &[HealthCheckSpec],
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> Vec<HealthCheckResult> {
        let mut pending: FuturesUnordered<_> = checks
            .iter()
            .enumerate()
            .map(|(index, check)| async move { (index, self.run(check, cancel).await) })
            .collect();
        let mut slots: Vec<Option<HealthCheckResult>> = checks.iter().map(|_| None).collect();

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            target: "pipeline.health",
                            pending = pending.len(),
                            "stage deadline reached with health checks still running"
                        );
                        break;
                    }
                },
                None => pending.next().await,
            };
            match next {
                Some((index, result)) => slots[index] = Some(result),
                None => break,
            }
        }
        drop(pending);

        slots
            .into_iter()
            .zip(checks)
            .map(|(slot, check)| {
                slot.unwrap_or_else(|| {
                    HealthCheckResult::new(
                        check,
                        HealthStatus::Timeout,
                        0,
                        "still pending at stage deadline",
                        0,
                    )
                })
            })
            .collect()
    }
}

fn cancelled(check: &HealthCheckSpec, attempts: u32) -> HealthCheckResult {
    HealthCheckResult::new(check, HealthStatus::Fail, 0, "cancelled", attempts)
}
