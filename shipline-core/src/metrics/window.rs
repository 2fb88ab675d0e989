use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::RollbackCondition;

#[derive(Debug, Error, PartialEq)]
pub enum WindowError {
    #[error("sample for {metric} at {at} is older than the latest sample at {latest}")]
    OutOfOrder {
        metric: String,
        at: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
    #[error("sample for {metric} is not a finite number")]
    NotFinite { metric: String },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct MetricSample {
    pub value: f64,
    pub at: DateTime<Utc>,
}

/// Rolling, timestamp-ordered samples per metric name.
#[derive(Debug, Clone, Default)]
pub struct MetricsWindow {
    series: HashMap<String, VecDeque<MetricSample>>,
    retention: Option<Duration>,
}

impl MetricsWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples older than `retention` relative to the newest sample of their metric are
    /// dropped on insert.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            series: HashMap::new(),
            retention: Some(retention),
        }
    }

    pub fn record(
        &mut self,
        metric: &str,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), WindowError> {
        if !value.is_finite() {
            return Err(WindowError::NotFinite {
                metric: metric.to_string(),
            });
        }
        let samples = self.series.entry(metric.to_string()).or_default();
        if let Some(latest) = samples.back() {
            if at < latest.at {
                return Err(WindowError::OutOfOrder {
                    metric: metric.to_string(),
                    at,
                    latest: latest.at,
                });
            }
        }
        samples.push_back(MetricSample { value, at });

        if let Some(horizon) = self
            .retention
            .and_then(|retention| at.checked_sub_signed(retention))
        {
            while samples
                .front()
                .map(|sample| sample.at < horizon)
                .unwrap_or(false)
            {
                samples.pop_front();
            }
        }
        Ok(())
    }

    /// True only when every sample inside `[now - sustained, now]` violates the condition
    /// and the violating streak began no later than the start of that window. An empty
    /// window never counts.
    pub fn sustained_breach(&self, condition: &RollbackCondition, now: DateTime<Utc>) -> bool {
        let Some(samples) = self.series.get(&condition.metric) else {
            return false;
        };
        // a sustain period no timestamp can span is never met
        let Some(window_start) = i64::try_from(condition.sustained_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|sustained| now.checked_sub_signed(sustained))
        else {
            return false;
        };

        let mut in_window = samples
            .iter()
            .filter(|sample| sample.at >= window_start && sample.at <= now)
            .peekable();
        if in_window.peek().is_none() {
            return false;
        }
        if !in_window.all(|sample| condition.violated_by(sample.value)) {
            return false;
        }

        let streak_start = samples
            .iter()
            .rev()
            .filter(|sample| sample.at <= now)
            .take_while(|sample| condition.violated_by(sample.value))
            .last()
            .map(|sample| sample.at);
        matches!(streak_start, Some(start) if start <= window_start)
    }

    pub fn samples(&self, metric: &str) -> impl Iterator<Item = &MetricSample> {
        self.series.get(metric).into_iter().flatten()
    }

    pub fn latest(&self, metric: &str) -> Option<MetricSample> {
        self.series
            .get(metric)
            .and_then(|samples| samples.back())
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(VecDeque::is_empty)
    }
}
