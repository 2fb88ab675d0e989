use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use super::models::PipelineConfig;

/// Longest stage or rollback timeout a pipeline may declare: one week.
pub const MAX_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;
/// Longest sustain period a rollback condition may declare: one week.
pub const MAX_SUSTAINED_SECONDS: u64 = 7 * 24 * 60 * 60;

/// A single problem found in a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("pipeline name cannot be empty")]
    EmptyName,
    #[error("pipeline declares no environments")]
    NoEnvironments,
    #[error("environment #{index} has an empty name")]
    EmptyEnvironmentName { index: usize },
    #[error("environment name {environment} declared more than once")]
    DuplicateEnvironment { environment: String },
    #[error("order {order} shared by environments {}", .environments.join(", "))]
    DuplicateOrder {
        order: u32,
        environments: Vec<String>,
    },
    #[error("environment {environment} declares no health checks")]
    MissingHealthChecks { environment: String },
    #[error("environment {environment}: {field} must be positive")]
    NonPositiveTimeout {
        environment: String,
        field: &'static str,
    },
    #[error("environment {environment}: {field} exceeds {max} minutes")]
    TimeoutTooLong {
        environment: String,
        field: &'static str,
        max: u64,
    },
    #[error("environment {environment}: stage_attempts must be at least 1")]
    NoStageAttempts { environment: String },
    #[error("health check {check} in {environment} has an empty target")]
    EmptyCheckTarget { environment: String, check: String },
    #[error("health check {check} in {environment}: {field} must be positive")]
    NonPositiveCheckSetting {
        environment: String,
        check: String,
        field: &'static str,
    },
    #[error("rollback condition #{index} has an empty metric name")]
    EmptyConditionMetric { index: usize },
    #[error("rollback condition #{index} has a non-finite threshold")]
    InvalidThreshold { index: usize },
    #[error("rollback condition #{index} sustains for longer than {max} seconds")]
    SustainedTooLong { index: usize, max: u64 },
    #[error("rollback policy is enabled but max_attempts is 0")]
    NoRollbackAttempts,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid pipeline configuration: {}", describe(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

fn describe(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Checks a pipeline definition before any execution starts. Issues are reported in a
/// stable order so the same input always yields the same error set.
pub fn validate(config: &PipelineConfig) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    if config.name.trim().is_empty() {
        issues.push(ValidationIssue::EmptyName);
    }
    if config.environments.is_empty() {
        issues.push(ValidationIssue::NoEnvironments);
    }

    let mut seen_names = HashSet::new();
    let mut by_order: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for (index, env) in config.environments.iter().enumerate() {
        by_order
            .entry(env.order)
            .or_default()
            .push(env.name.clone());

        if env.name.trim().is_empty() {
            issues.push(ValidationIssue::EmptyEnvironmentName { index });
        } else if !seen_names.insert(env.name.as_str()) {
            issues.push(ValidationIssue::DuplicateEnvironment {
                environment: env.name.clone(),
            });
        }
        if env.health_checks.is_empty() {
            issues.push(ValidationIssue::MissingHealthChecks {
                environment: env.name.clone(),
            });
        }
        if env.deployment_timeout_minutes == 0 {
            issues.push(ValidationIssue::NonPositiveTimeout {
                environment: env.name.clone(),
                field: "deployment_timeout_minutes",
            });
        } else if env.deployment_timeout_minutes > MAX_TIMEOUT_MINUTES {
            issues.push(ValidationIssue::TimeoutTooLong {
                environment: env.name.clone(),
                field: "deployment_timeout_minutes",
                max: MAX_TIMEOUT_MINUTES,
            });
        }
        if env.rollback_timeout_minutes == 0 {
            issues.push(ValidationIssue::NonPositiveTimeout {
                environment: env.name.clone(),
                field: "rollback_timeout_minutes",
            });
        } else if env.rollback_timeout_minutes > MAX_TIMEOUT_MINUTES {
            issues.push(ValidationIssue::TimeoutTooLong {
                environment: env.name.clone(),
                field: "rollback_timeout_minutes",
                max: MAX_TIMEOUT_MINUTES,
            });
        }
        if env.stage_attempts == 0 {
            issues.push(ValidationIssue::NoStageAttempts {
                environment: env.name.clone(),
            });
        }

        for check in &env.health_checks {
            if check.target.trim().is_empty() {
                issues.push(ValidationIssue::EmptyCheckTarget {
                    environment: env.name.clone(),
                    check: check.name.clone(),
                });
            }
            if check.timeout_seconds == 0 {
                issues.push(ValidationIssue::NonPositiveCheckSetting {
                    environment: env.name.clone(),
                    check: check.name.clone(),
                    field: "timeout_seconds",
                });
            }
            if check.retry_count > 0 && check.interval_seconds == 0 {
                issues.push(ValidationIssue::NonPositiveCheckSetting {
                    environment: env.name.clone(),
                    check: check.name.clone(),
                    field: "interval_seconds",
                });
            }
        }
    }

    for (order, environments) in by_order {
        if environments.len() > 1 {
            issues.push(ValidationIssue::DuplicateOrder {
                order,
                environments,
            });
        }
    }

    let policy = &config.rollback_policy;
    for (index, condition) in policy.conditions.iter().enumerate() {
        if condition.metric.trim().is_empty() {
            issues.push(ValidationIssue::EmptyConditionMetric { index });
        }
        if !condition.threshold.is_finite() {
            issues.push(ValidationIssue::InvalidThreshold { index });
        }
        if condition.sustained_seconds > MAX_SUSTAINED_SECONDS {
            issues.push(ValidationIssue::SustainedTooLong {
                index,
                max: MAX_SUSTAINED_SECONDS,
            });
        }
    }
    if policy.enabled && policy.max_attempts == 0 {
        issues.push(ValidationIssue::NoRollbackAttempts);
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues })
    }
}
