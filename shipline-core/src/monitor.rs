//! Background health monitors, one per tenant key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::health::{HealthCheckResult, HealthChecker, HealthStatus};
use crate::pipeline::HealthCheckSpec;

#[derive(Debug, Error, PartialEq)]
pub enum MonitorError {
    #[error("a monitor is already running for {tenant}")]
    AlreadyRunning { tenant: String },
    #[error("monitor {tenant} has no checks")]
    NoChecks { tenant: String },
    #[error("monitor interval must be positive")]
    ZeroInterval,
    #[error("monitor registry lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone)]
pub struct MonitorSpec {
    pub checks: Vec<HealthCheckSpec>,
    pub interval: Duration,
}

/// Results of the latest completed polling round for a tenant.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub monitor_id: Uuid,
    pub round: u64,
    pub at: DateTime<Utc>,
    pub results: Vec<HealthCheckResult>,
}

impl MonitorSnapshot {
    pub fn healthy(&self) -> bool {
        self.results
            .iter()
            .all(|result| result.status == HealthStatus::Pass)
    }
}

struct ActiveMonitor {
    id: Uuid,
    cancel: CancelToken,
    task: JoinHandle<()>,
}

impl ActiveMonitor {
    fn shutdown(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

type Snapshots = Arc<Mutex<HashMap<String, MonitorSnapshot>>>;

/// Owned by the host process and injected where needed. At most one monitor runs per
/// key; starting a replacement stops the previous one first.
pub struct MonitorRegistry {
    checker: HealthChecker,
    monitors: Mutex<HashMap<String, ActiveMonitor>>,
    snapshots: Snapshots,
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("active", &self.active())
            .finish()
    }
}

impl MonitorRegistry {
    pub fn new(checker: HealthChecker) -> Self {
        Self {
            checker,
            monitors: Mutex::new(HashMap::new()),
            snapshots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts a monitor for `tenant`. Fails if one is already running for that key.
    pub fn start(&self, tenant: &str, spec: MonitorSpec) -> Result<Uuid, MonitorError> {
        validate_spec(tenant, &spec)?;
        let mut monitors = self.monitors()?;
        if let Some(existing) = monitors.get(tenant) {
            if !existing.task.is_finished() {
                return Err(MonitorError::AlreadyRunning {
                    tenant: tenant.to_string(),
                });
            }
        }
        let monitor = self.spawn(tenant, spec);
        let id = monitor.id;
        monitors.insert(tenant.to_string(), monitor);
        Ok(id)
    }

    /// Stops any monitor running for `tenant`, then starts a new one.
    pub fn replace(&self, tenant: &str, spec: MonitorSpec) -> Result<Uuid, MonitorError> {
        validate_spec(tenant, &spec)?;
        let mut monitors = self.monitors()?;
        if let Some(previous) = monitors.remove(tenant) {
            info!(target: "pipeline.monitor", tenant, monitor_id = %previous.id, "replacing monitor");
            previous.shutdown();
        }
        let monitor = self.spawn(tenant, spec);
        let id = monitor.id;
        monitors.insert(tenant.to_string(), monitor);
        Ok(id)
    }

    pub fn stop(&self, tenant: &str) -> Result<bool, MonitorError> {
        let removed = self.monitors()?.remove(tenant);
        Ok(match removed {
            Some(monitor) => {
                info!(target: "pipeline.monitor", tenant, monitor_id = %monitor.id, "monitor stopped");
                monitor.shutdown();
                true
            }
            None => false,
        })
    }

    pub fn stop_all(&self) -> Result<usize, MonitorError> {
        let drained: Vec<ActiveMonitor> = self.monitors()?.drain().map(|(_, m)| m).collect();
        let count = drained.len();
        for monitor in drained {
            monitor.shutdown();
        }
        Ok(count)
    }

    pub fn is_running(&self, tenant: &str) -> bool {
        self.monitors
            .lock()
            .map(|monitors| {
                monitors
                    .get(tenant)
                    .map(|monitor| !monitor.task.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub fn active(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .monitors
            .lock()
            .map(|monitors| monitors.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn latest(&self, tenant: &str) -> Option<MonitorSnapshot> {
        self.snapshots
            .lock()
            .ok()
            .and_then(|snapshots| snapshots.get(tenant).cloned())
    }

    fn monitors(&self) -> Result<MutexGuard<'_, HashMap<String, ActiveMonitor>>, MonitorError> {
        self.monitors.lock().map_err(|_| MonitorError::Poisoned)
    }

    fn spawn(&self, tenant: &str, spec: MonitorSpec) -> ActiveMonitor {
        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let checker = self.checker.clone();
        let snapshots = Arc::clone(&self.snapshots);
        let token = cancel.clone();
        let key = tenant.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(spec.interval);
            let mut round = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => break,
                }
                round += 1;
                let results = checker.run_all(&spec.checks, None, &token).await;
                if token.is_cancelled() {
                    break;
                }
                let snapshot = MonitorSnapshot {
                    monitor_id: id,
                    round,
                    at: Utc::now(),
                    results,
                };
                if !snapshot.healthy() {
                    warn!(target: "pipeline.monitor", tenant = %key, round, "monitor round unhealthy");
                } else {
                    debug!(target: "pipeline.monitor", tenant = %key, round, "monitor round healthy");
                }
                match snapshots.lock() {
                    Ok(mut snapshots) => {
                        snapshots.insert(key.clone(), snapshot);
                    }
                    Err(_) => break,
                }
            }
        });
        info!(target: "pipeline.monitor", tenant, monitor_id = %id, "monitor started");
        ActiveMonitor { id, cancel, task }
    }
}

impl Drop for MonitorRegistry {
    fn drop(&mut self) {
        if let Ok(mut monitors) = self.monitors.lock() {
            for (_, monitor) in monitors.drain() {
                monitor.shutdown();
            }
        }
    }
}

fn validate_spec(tenant: &str, spec: &MonitorSpec) -> Result<(), MonitorError> {
    if spec.checks.is_empty() {
        return Err(MonitorError::NoChecks {
            tenant: tenant.to_string(),
        });
    }
    if spec.interval.is_zero() {
        return Err(MonitorError::ZeroInterval);
    }
    Ok(())
}
