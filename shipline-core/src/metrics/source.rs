use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::strategy::Strategy;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metrics endpoint returned status {0}")]
    Status(u16),
    #[error("metrics unavailable for {environment}: {reason}")]
    Unavailable { environment: String, reason: String },
}

/// What the source is asked about: one traffic phase of one deployment.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseContext {
    pub environment: String,
    pub version: String,
    pub strategy: Strategy,
    pub traffic_percent: u8,
    pub phase_index: usize,
    pub at: DateTime<Utc>,
}

/// Unscaled metrics as observed for a phase. Rates are percentages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RawPhaseMetrics {
    pub error_rate: f64,
    pub response_time_ms: f64,
    pub success_rate: f64,
}

impl RawPhaseMetrics {
    pub fn new(error_rate: f64, response_time_ms: f64) -> Self {
        Self {
            error_rate,
            response_time_ms,
            success_rate: (100.0 - error_rate).clamp(0.0, 100.0),
        }
    }
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn observe(&self, context: &PhaseContext) -> Result<RawPhaseMetrics, MetricsError>;
}

/// Deterministic synthetic metrics for dry runs. The same seed and phase context always
/// produce the same numbers.
#[derive(Debug, Clone)]
pub struct SimulatedMetricsSource {
    seed: u64,
    baseline_error_rate: f64,
    baseline_response_ms: f64,
}

impl SimulatedMetricsSource {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            baseline_error_rate: 1.0,
            baseline_response_ms: 120.0,
        }
    }

    pub fn with_baseline(mut self, error_rate: f64, response_ms: f64) -> Self {
        self.baseline_error_rate = error_rate;
        self.baseline_response_ms = response_ms;
        self
    }

    fn phase_seed(&self, context: &PhaseContext) -> u64 {
        let mut hash = fnv1a(self.seed.to_le_bytes().iter().copied(), FNV_OFFSET);
        hash = fnv1a(context.environment.bytes(), hash);
        hash = fnv1a(context.version.bytes(), hash);
        hash = fnv1a(context.strategy.as_str().bytes(), hash);
        fnv1a([context.traffic_percent], hash)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: impl IntoIterator<Item = u8>, mut hash: u64) -> u64 {
    for byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[async_trait]
impl MetricsSource for SimulatedMetricsSource {
    async fn observe(&self, context: &PhaseContext) -> Result<RawPhaseMetrics, MetricsError> {
        let mut rng = ChaCha20Rng::seed_from_u64(self.phase_seed(context));
        // wider exposure surfaces slightly more errors
        let exposure = 1.0 + f64::from(context.traffic_percent) / 200.0;
        let error_rate = self.baseline_error_rate * rng.gen_range(0.5..1.5) * exposure;
        let response_time_ms = self.baseline_response_ms * rng.gen_range(0.8..1.3);
        Ok(RawPhaseMetrics::new(error_rate, response_time_ms))
    }
}

/// Returns fixed metrics per environment, falling back to a default. Useful for dry runs
/// and for reproducing incidents.
#[derive(Debug, Clone)]
pub struct FixedMetricsSource {
    default: RawPhaseMetrics,
    per_environment: HashMap<String, RawPhaseMetrics>,
}

impl FixedMetricsSource {
    pub fn new(default: RawPhaseMetrics) -> Self {
        Self {
            default,
            per_environment: HashMap::new(),
        }
    }

    pub fn with_environment(mut self, environment: &str, metrics: RawPhaseMetrics) -> Self {
        self.per_environment
            .insert(environment.to_string(), metrics);
        self
    }
}

#[async_trait]
impl MetricsSource for FixedMetricsSource {
    async fn observe(&self, context: &PhaseContext) -> Result<RawPhaseMetrics, MetricsError> {
        Ok(*self
            .per_environment
            .get(&context.environment)
            .unwrap_or(&self.default))
    }
}

/// Reads observed metrics from an HTTP endpoint returning [`RawPhaseMetrics`] as JSON.
#[derive(Clone)]
pub struct HttpMetricsSource {
    client: reqwest::Client,
    endpoint: String,
}

impl fmt::Debug for HttpMetricsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMetricsSource")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl HttpMetricsSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn observe(&self, context: &PhaseContext) -> Result<RawPhaseMetrics, MetricsError> {
        let traffic = context.traffic_percent.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("environment", context.environment.as_str()),
                ("version", context.version.as_str()),
                ("strategy", context.strategy.as_str()),
                ("traffic_percent", traffic.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetricsError::Status(status.as_u16()));
        }
        Ok(response.json::<RawPhaseMetrics>().await?)
    }
}
