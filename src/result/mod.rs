//! 批处理结果模块：结果构建与质量分析。
//!
//! # Batch Results
//!
//! [`BatchResultBuilder`] accumulates per-request outcomes while a processor works through a
//! batch and freezes them into an immutable [`BatchResult`]. [`ResultAnalyzer`] turns a
//! result into a summary, an A–F grade, an error breakdown and recommendations.

mod analyzer;
mod builder;

pub use analyzer::{
    categorize_error, ErrorAnalysis, ErrorCategory, QualityGrade, ResultAnalysis, ResultAnalyzer,
    ScoreBreakdown,
};
pub use builder::{BatchResult, BatchResultBuilder, RequestError, RequestResult, ResultMetadata};
