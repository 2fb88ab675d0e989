pub mod source;
pub mod window;

use std::sync::Arc;

pub use source::{
    FixedMetricsSource, HttpMetricsSource, MetricsError, MetricsSource, PhaseContext,
    RawPhaseMetrics, SimulatedMetricsSource,
};
pub use window::{MetricSample, MetricsWindow, WindowError};

use crate::config::{MetricsSettings, MetricsSourceKind};
use crate::error::{ConfigError, Result};

pub const ERROR_RATE: &str = "error_rate";
pub const RESPONSE_TIME: &str = "response_time";
pub const SUCCESS_RATE: &str = "success_rate";

/// Builds the metrics source selected in the settings file.
pub fn source_from_settings(settings: &MetricsSettings) -> Result<Arc<dyn MetricsSource>> {
    match settings.source {
        MetricsSourceKind::Simulated => Ok(Arc::new(SimulatedMetricsSource::new(settings.seed))),
        MetricsSourceKind::Http => {
            let endpoint = settings
                .endpoint
                .clone()
                .ok_or_else(|| ConfigError::Invalid {
                    key: "metrics.endpoint".into(),
                    reason: "required when metrics.source = \"http\"".into(),
                })?;
            Ok(Arc::new(HttpMetricsSource::new(endpoint)))
        }
    }
}
