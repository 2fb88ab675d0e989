use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::notify::Severity;
use crate::pipeline::PipelineConfig;
use crate::strategy::UpdateType;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OrchestratorSettings {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub strategy: StrategySettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub approval: ApprovalSettings,
    #[serde(default)]
    pub deployer: DeployerSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
}

impl OrchestratorSettings {
    pub fn validate(&self) -> Result<()> {
        let factor = self.strategy.blue_green_reliability_factor;
        if !(factor > 0.0 && factor < 1.0) {
            return Err(ConfigError::Invalid {
                key: "strategy.blue_green_reliability_factor".into(),
                reason: format!("must be within (0, 1), got {factor}"),
            });
        }
        if self.strategy.canary_abort_error_rate < 0.0 {
            return Err(ConfigError::Invalid {
                key: "strategy.canary_abort_error_rate".into(),
                reason: "must not be negative".into(),
            });
        }
        let risk = &self.strategy.risk;
        if !(risk.patch <= risk.minor && risk.minor <= risk.major) {
            return Err(ConfigError::Invalid {
                key: "strategy.risk".into(),
                reason: "multipliers must satisfy patch <= minor <= major".into(),
            });
        }
        for channel in &self.notifications.channels {
            if channel.kind == ChannelKind::Webhook && channel.url.is_none() {
                return Err(ConfigError::Invalid {
                    key: format!("notifications.channels.{}.url", channel.name),
                    reason: "webhook channels need a url".into(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/executions.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    /// Observation time between traffic phases.
    pub phase_interval_seconds: u64,
    /// Error rate (percent) at the smallest canary phase that aborts the rollout.
    pub canary_abort_error_rate: f64,
    pub blue_green_reliability_factor: f64,
    pub risk: RiskMultipliers,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            phase_interval_seconds: 15,
            canary_abort_error_rate: 5.0,
            blue_green_reliability_factor: 0.7,
            risk: RiskMultipliers::default(),
        }
    }
}

impl StrategySettings {
    pub fn phase_interval(&self) -> Duration {
        Duration::from_secs(self.phase_interval_seconds)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskMultipliers {
    pub patch: f64,
    pub minor: f64,
    pub major: f64,
}

impl Default for RiskMultipliers {
    fn default() -> Self {
        Self {
            patch: 1.0,
            minor: 1.5,
            major: 2.5,
        }
    }
}

impl RiskMultipliers {
    pub fn for_update(&self, update_type: UpdateType) -> f64 {
        match update_type {
            UpdateType::Patch => self.patch,
            UpdateType::Minor => self.minor,
            UpdateType::Major => self.major,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricsSourceKind {
    #[default]
    Simulated,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub source: MetricsSourceKind,
    pub seed: u64,
    pub endpoint: Option<String>,
    pub retention_seconds: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            source: MetricsSourceKind::Simulated,
            seed: 0,
            endpoint: None,
            retention_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalSettings {
    pub expiry_hours: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployerSettings {
    pub deploy_script: Option<PathBuf>,
    pub rollback_script: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub channels: Vec<ChannelSettings>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Log,
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSettings {
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub min_severity: Severity,
    pub url: Option<String>,
}

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<OrchestratorSettings> {
    let settings: OrchestratorSettings = load_toml(path)?;
    settings.validate()?;
    Ok(settings)
}

pub fn load_pipeline_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
