//! Tri-state health verdicts.

use serde::{Deserialize, Serialize};

/// Ordered from best to worst, so `max` picks the worst signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verdict plus the reasons that led to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self::default()
    }

    /// Record a signal; the report keeps the worst status seen.
    pub fn flag(&mut self, status: HealthStatus, issue: impl Into<String>) {
        self.status = self.status.max(status);
        self.issues.push(issue.into());
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: HealthReport) {
        self.status = self.status.max(other.status);
        self.issues.extend(other.issues);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_signal_wins() {
        let mut report = HealthReport::healthy();
        report.flag(HealthStatus::Critical, "queue nearly full");
        report.flag(HealthStatus::Degraded, "slow processor");
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn test_merge() {
        let mut a = HealthReport::healthy();
        let mut b = HealthReport::healthy();
        b.flag(HealthStatus::Degraded, "circuit half-open");
        a.merge(b);
        assert_eq!(a.status, HealthStatus::Degraded);
        assert_eq!(serde_json::to_value(a.status).unwrap(), "degraded");
    }
}
