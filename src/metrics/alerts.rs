//! Threshold alerts over collector metrics.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    SuccessRate,
    ErrorRate,
    AverageBatchSize,
    AverageProcessingTimeMs,
    AverageWaitTimeMs,
    Throughput,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::SuccessRate => "success_rate",
            MetricKind::ErrorRate => "error_rate",
            MetricKind::AverageBatchSize => "average_batch_size",
            MetricKind::AverageProcessingTimeMs => "average_processing_time_ms",
            MetricKind::AverageWaitTimeMs => "average_wait_time_ms",
            MetricKind::Throughput => "throughput",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertOperator {
    Gt,
    Lt,
    Eq,
}

impl AlertOperator {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            AlertOperator::Gt => value > threshold,
            AlertOperator::Lt => value < threshold,
            AlertOperator::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub name: String,
    pub metric: MetricKind,
    pub operator: AlertOperator,
    pub threshold: f64,
    /// Minimum time between two firings of this rule.
    pub cooldown: Duration,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        metric: MetricKind,
        operator: AlertOperator,
        threshold: f64,
    ) -> Self {
        Self {
            name: name.into(),
            metric,
            operator,
            threshold,
            cooldown: Duration::from_secs(60),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn defaults() -> Vec<AlertRule> {
        vec![
            AlertRule::new("high_error_rate", MetricKind::ErrorRate, AlertOperator::Gt, 0.1),
            AlertRule::new("low_success_rate", MetricKind::SuccessRate, AlertOperator::Lt, 0.8),
            AlertRule::new(
                "slow_processing",
                MetricKind::AverageProcessingTimeMs,
                AlertOperator::Gt,
                10_000.0,
            ),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredAlert {
    pub rule: String,
    pub metric: MetricKind,
    pub value: f64,
    pub threshold: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operators() {
        assert!(AlertOperator::Gt.holds(0.2, 0.1));
        assert!(!AlertOperator::Gt.holds(0.1, 0.1));
        assert!(AlertOperator::Lt.holds(0.5, 0.8));
        assert!(AlertOperator::Eq.holds(3.0, 3.0));
    }

    #[test]
    fn test_default_rules() {
        let names: Vec<String> = AlertRule::defaults().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["high_error_rate", "low_success_rate", "slow_processing"]);
    }
}
