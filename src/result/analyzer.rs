//! Result analysis: summary, quality grade, error categories, recommendations.

use super::builder::BatchResult;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static CRITICAL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)auth|unauthori[sz]ed|forbidden|permission|validation|invalid|not[ _-]?found|\b(400|401|403|404|422)\b")
        .expect("critical error pattern is valid")
});

static RETRYABLE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)time[ _-]?out|timed out|network|connection|econn|socket|reset|unavailable|temporar|rate[ _-]?limit|too many requests|queue full|capacity|circuit|overload|\b(429|502|503|504)\b")
        .expect("retryable error pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Retryable,
    Critical,
    Unknown,
}

/// Classify a failure by its error name and message.
///
/// Auth/validation-like failures are critical even when the message also mentions a
/// transient condition.
pub fn categorize_error(name: &str, message: &str) -> ErrorCategory {
    let haystack = format!("{} {}", name, message);
    if CRITICAL_PATTERN.is_match(&haystack) {
        ErrorCategory::Critical
    } else if RETRYABLE_PATTERN.is_match(&haystack) {
        ErrorCategory::Retryable
    } else {
        ErrorCategory::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityGrade {
    A,
    B,
    C,
    D,
    F,
}

impl QualityGrade {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            QualityGrade::A
        } else if score >= 80.0 {
            QualityGrade::B
        } else if score >= 70.0 {
            QualityGrade::C
        } else if score >= 60.0 {
            QualityGrade::D
        } else {
            QualityGrade::F
        }
    }
}

impl std::fmt::Display for QualityGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub total_errors: usize,
    pub retryable: Vec<String>,
    pub critical: Vec<String>,
    pub unknown: Vec<String>,
    /// Error name -> occurrences.
    pub by_name: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultAnalysis {
    pub summary: String,
    pub grade: QualityGrade,
    pub score: f64,
    pub throughput_rps: f64,
    pub errors: ErrorAnalysis,
    pub recommendations: Vec<String>,
}

/// Weighted 0..=1 component scores that make up the grade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub success: f64,
    pub latency: f64,
    pub efficiency: f64,
    pub size_fit: f64,
}

impl ScoreBreakdown {
    /// 40% success rate, 30% latency, 20% efficiency, 10% size fit; scaled to 0..=100.
    pub fn total(&self) -> f64 {
        100.0 * (0.4 * self.success + 0.3 * self.latency + 0.2 * self.efficiency + 0.1 * self.size_fit)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultAnalyzer;

impl ResultAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, result: &BatchResult) -> ResultAnalysis {
        let breakdown = self.score(result);
        let score = breakdown.total();
        let grade = QualityGrade::from_score(score);
        let errors = self.analyze_errors(result);
        let throughput_rps = throughput(result);

        let summary = format!(
            "Batch {}: {}/{} requests succeeded ({:.1}%) in {} ms, grade {}",
            result.batch_id,
            result.success_count(),
            result.results.len(),
            result.metadata.success_rate * 100.0,
            result.metadata.processing_time_ms,
            grade
        );
        let recommendations = self.recommend(result, &errors);

        ResultAnalysis {
            summary,
            grade,
            score,
            throughput_rps,
            errors,
            recommendations,
        }
    }

    pub fn score(&self, result: &BatchResult) -> ScoreBreakdown {
        let ms = result.metadata.processing_time_ms;
        let latency = match ms {
            0..=1000 => 1.0,
            1001..=3000 => 0.8,
            3001..=5000 => 0.6,
            5001..=10000 => 0.4,
            _ => 0.2,
        };
        let size = result.results.len();
        let size_fit = match size {
            0 => 0.0,
            10..=100 => 1.0,
            5..=9 | 101..=200 => 0.7,
            _ => 0.4,
        };
        ScoreBreakdown {
            success: result.metadata.success_rate,
            latency,
            efficiency: (throughput(result) / 50.0).min(1.0),
            size_fit,
        }
    }

    pub fn analyze_errors(&self, result: &BatchResult) -> ErrorAnalysis {
        let mut analysis = ErrorAnalysis::default();
        for r in result.failed() {
            analysis.total_errors += 1;
            let (name, message) = r
                .error
                .as_ref()
                .map(|e| (e.name.as_str(), e.message.as_str()))
                .unwrap_or(("UnknownError", ""));
            *analysis.by_name.entry(name.to_string()).or_insert(0) += 1;
            let bucket = match categorize_error(name, message) {
                ErrorCategory::Retryable => &mut analysis.retryable,
                ErrorCategory::Critical => &mut analysis.critical,
                ErrorCategory::Unknown => &mut analysis.unknown,
            };
            bucket.push(r.request_id.clone());
        }
        analysis
    }

    fn recommend(&self, result: &BatchResult, errors: &ErrorAnalysis) -> Vec<String> {
        let mut out = Vec::new();
        let size = result.results.len();
        let rate = result.metadata.success_rate;
        if size == 0 {
            out.push("Batch produced no results; check processor wiring".to_string());
            return out;
        }
        if rate < 0.8 {
            out.push("Success rate below 80%; use smaller batches to isolate failing requests".to_string());
        }
        if result.metadata.processing_time_ms > 5000 {
            out.push("Batch took longer than 5s; lower max_batch_size or max_wait_time".to_string());
        }
        if size < 5 {
            out.push("Batch is small; raise max_wait_time to group more requests".to_string());
        }
        if size > 200 && rate < 0.95 {
            out.push("Large batch with failures; split it to limit blast radius".to_string());
        }
        if !errors.retryable.is_empty() {
            out.push(format!(
                "{} transient failures detected; they are good retry candidates",
                errors.retryable.len()
            ));
        }
        if !errors.critical.is_empty() {
            out.push(format!(
                "{} critical failures (auth/validation); fix the requests before retrying",
                errors.critical.len()
            ));
        }
        out
    }
}

fn throughput(result: &BatchResult) -> f64 {
    let secs = (result.metadata.processing_time_ms as f64 / 1000.0).max(0.001);
    result.results.len() as f64 / secs
}
