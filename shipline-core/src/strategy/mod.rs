//! Traffic-shift shapes for a single environment deployment.

mod executor;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::StrategySettings;
use crate::deployer::DeployerError;
use crate::metrics::{MetricsError, RawPhaseMetrics, WindowError};

pub use executor::{DeployRequest, DeploymentStrategyExecutor};

const ROLLING_PHASES: &[u8] = &[25, 50, 75, 100];
const BLUE_GREEN_PHASES: &[u8] = &[100];
const CANARY_PHASES: &[u8] = &[5, 10, 25, 50, 100];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Rolling,
    #[serde(alias = "blue-green")]
    BlueGreen,
    Canary,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Rolling => "rolling",
            Strategy::BlueGreen => "blue_green",
            Strategy::Canary => "canary",
        }
    }

    /// Traffic percentages, smallest first.
    pub fn phases(&self) -> &'static [u8] {
        match self {
            Strategy::Rolling => ROLLING_PHASES,
            Strategy::BlueGreen => BLUE_GREEN_PHASES,
            Strategy::Canary => CANARY_PHASES,
        }
    }

    /// Applies the update-type risk multiplier and the strategy's own adjustment to raw
    /// observed metrics.
    pub(crate) fn shape(
        &self,
        traffic_percent: u8,
        raw: RawPhaseMetrics,
        risk_multiplier: f64,
        settings: &StrategySettings,
        recorded_at: DateTime<Utc>,
    ) -> PhaseMetrics {
        let mut error_rate = raw.error_rate * risk_multiplier;
        if *self == Strategy::BlueGreen {
            error_rate *= settings.blue_green_reliability_factor;
        }
        let error_rate = error_rate.clamp(0.0, 100.0);
        let error_delta = error_rate - raw.error_rate;
        PhaseMetrics {
            traffic_percent,
            error_rate,
            response_time_ms: raw.response_time_ms * risk_multiplier,
            success_rate: (raw.success_rate - error_delta).clamp(0.0, 100.0),
            recorded_at,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rolling" => Ok(Strategy::Rolling),
            "blue_green" | "blue-green" => Ok(Strategy::BlueGreen),
            "canary" => Ok(Strategy::Canary),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Patch,
    Minor,
    Major,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Patch => "patch",
            UpdateType::Minor => "minor",
            UpdateType::Major => "major",
        }
    }

    /// Classifies `next` against the last version that shipped. Versions are compared
    /// as dotted numbers (`v` prefix and pre-release suffixes ignored). Anything that
    /// cannot be compared is treated as a minor update.
    pub fn infer(previous: Option<&str>, next: &str) -> UpdateType {
        let (Some(previous), Some(next)) = (previous.and_then(parse_version), parse_version(next))
        else {
            return UpdateType::Minor;
        };
        if next.0 != previous.0 {
            UpdateType::Major
        } else if next.1 != previous.1 {
            UpdateType::Minor
        } else {
            UpdateType::Patch
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patch" => Ok(UpdateType::Patch),
            "minor" => Ok(UpdateType::Minor),
            "major" => Ok(UpdateType::Major),
            other => Err(format!("unknown update type: {other}")),
        }
    }
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let version = version.trim().trim_start_matches(['v', 'V']);
    let core = version.split(['-', '+']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(part) => part.parse().ok()?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(part) => part.parse().ok()?,
        None => 0,
    };
    Some((major, minor, patch))
}

/// Metrics recorded for one traffic phase after scaling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PhaseMetrics {
    pub traffic_percent: u8,
    pub error_rate: f64,
    pub response_time_ms: f64,
    pub success_rate: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    pub error_rate: f64,
    pub response_time_ms: f64,
    pub success_rate: f64,
}

impl MetricsSummary {
    /// Highest error rate and response time, lowest success rate.
    pub fn worst_of(phases: &[PhaseMetrics]) -> Self {
        let Some(first) = phases.first() else {
            return Self::default();
        };
        phases.iter().skip(1).fold(
            MetricsSummary {
                error_rate: first.error_rate,
                response_time_ms: first.response_time_ms,
                success_rate: first.success_rate,
            },
            |worst, phase| MetricsSummary {
                error_rate: worst.error_rate.max(phase.error_rate),
                response_time_ms: worst.response_time_ms.max(phase.response_time_ms),
                success_rate: worst.success_rate.min(phase.success_rate),
            },
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentResult {
    pub strategy: Strategy,
    pub version: String,
    pub deployment_id: String,
    pub update_type: UpdateType,
    pub phases: Vec<PhaseMetrics>,
    pub worst: MetricsSummary,
    pub stopped_early: bool,
    /// Traffic percent of the phase that stopped the rollout.
    pub trigger_phase: Option<u8>,
    pub skipped_phases: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("deployer error: {0}")]
    Deployer(#[from] DeployerError),
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
    #[error("metrics window error: {0}")]
    Window(#[from] WindowError),
    #[error("deployment cancelled")]
    Cancelled { deployment_id: Option<String> },
}
