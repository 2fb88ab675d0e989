use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics::MetricsWindow;
use crate::pipeline::{RollbackCondition, RollbackPolicy};

/// Outcome of evaluating a rollback policy against a metrics window.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RollbackDecision {
    /// Roll back now. Only set for enabled, automatic policies.
    pub rollback: bool,
    /// Breaches were found but the policy leaves the decision to an operator.
    pub deferred: bool,
    pub breaches: Vec<RollbackCondition>,
}

impl RollbackDecision {
    pub fn breached(&self) -> bool {
        !self.breaches.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackEvaluator;

impl RollbackEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn should_rollback(
        &self,
        policy: &RollbackPolicy,
        window: &MetricsWindow,
        now: DateTime<Utc>,
    ) -> RollbackDecision {
        if !policy.enabled {
            return RollbackDecision::default();
        }
        let breaches: Vec<RollbackCondition> = policy
            .conditions
            .iter()
            .filter(|condition| window.sustained_breach(condition, now))
            .cloned()
            .collect();
        if breaches.is_empty() {
            debug!(target: "pipeline.rollback", "no sustained breach");
            return RollbackDecision::default();
        }

        let rendered: Vec<String> = breaches.iter().map(ToString::to_string).collect();
        warn!(
            target: "pipeline.rollback",
            automatic = policy.automatic,
            breaches = ?rendered,
            "rollback conditions breached"
        );
        RollbackDecision {
            rollback: policy.automatic,
            deferred: !policy.automatic,
            breaches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Operator;
    use chrono::{Duration, TimeZone};

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn policy(automatic: bool) -> RollbackPolicy {
        RollbackPolicy {
            enabled: true,
            automatic,
            conditions: vec![
                RollbackCondition::new("error_rate", Operator::GreaterThan, 5.0, 30),
                RollbackCondition::new("response_time", Operator::GreaterThan, 800.0, 30),
            ],
            max_attempts: 3,
        }
    }

    fn breaching_window() -> MetricsWindow {
        let mut window = MetricsWindow::new();
        for (at, error_rate) in [(0, 8.0), (15, 8.0), (30, 8.0)] {
            window.record("error_rate", error_rate, t(at)).unwrap();
            window.record("response_time", 200.0, t(at)).unwrap();
        }
        window
    }

    #[test]
    fn automatic_policy_rolls_back_on_sustained_breach() {
        let decision =
            RollbackEvaluator::new().should_rollback(&policy(true), &breaching_window(), t(30));
        assert!(decision.rollback);
        assert!(!decision.deferred);
        assert_eq!(decision.breaches.len(), 1);
        assert_eq!(decision.breaches[0].metric, "error_rate");
    }

    #[test]
    fn manual_policy_defers_to_operator() {
        let decision =
            RollbackEvaluator::new().should_rollback(&policy(false), &breaching_window(), t(30));
        assert!(!decision.rollback);
        assert!(decision.deferred);
        assert!(decision.breached());
    }

    #[test]
    fn disabled_policy_never_breaches() {
        let mut disabled = policy(true);
        disabled.enabled = false;
        let decision =
            RollbackEvaluator::new().should_rollback(&disabled, &breaching_window(), t(30));
        assert_eq!(decision, RollbackDecision::default());
    }

    #[test]
    fn healthy_window_is_not_a_breach() {
        let mut window = MetricsWindow::new();
        window.record("error_rate", 1.0, t(0)).unwrap();
        window.record("error_rate", 1.2, t(30)).unwrap();
        let decision = RollbackEvaluator::new().should_rollback(&policy(true), &window, t(30));
        assert!(!decision.breached());
    }
}
