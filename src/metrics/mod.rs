//! 指标收集模块：滚动计数、时间序列与阈值告警。
//!
//! # Metrics Collector
//!
//! Leaf component of the pipeline. Every completed batch is recorded here; the manager reads
//! [`MetricsCollector::recent_performance`] back into each strategy decision, which closes the
//! feedback loop between dispatch outcomes and batch sizing.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`MetricsCollector`] | Thread-safe rolling counters, per-strategy/endpoint stats, time series |
//! | [`MetricsSnapshot`] | Serializable point-in-time view |
//! | [`AlertRule`] | Threshold rule (`gt`/`lt`/`eq`) with cooldown |
//! | [`RecentPerformance`] | Short-horizon averages fed to strategies |

mod alerts;

pub use alerts::{AlertOperator, AlertRule, FiredAlert, MetricKind};

use crate::events::{BatchEvent, EventBus};
use crate::result::BatchResult;
use crate::types::epoch_millis;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

/// Trailing window (time-series points) used for [`RecentPerformance`].
const RECENT_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Bound on retained time-series points.
    pub time_series_capacity: usize,
    /// Smoothing factor for processing and wait time averages.
    pub smoothing: f64,
    pub alert_rules: Vec<AlertRule>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            time_series_capacity: 1000,
            smoothing: 0.1,
            alert_rules: AlertRule::defaults(),
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alert_rules(mut self, rules: Vec<AlertRule>) -> Self {
        self.alert_rules = rules;
        self
    }

    pub fn with_time_series_capacity(mut self, n: usize) -> Self {
        self.time_series_capacity = n.max(1);
        self
    }
}

/// Short-horizon averages consumed by strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecentPerformance {
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
}

impl Default for RecentPerformance {
    fn default() -> Self {
        Self {
            avg_response_time_ms: 0.0,
            success_rate: 1.0,
            error_rate: 0.0,
        }
    }
}

/// Rolling stats for one strategy or endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub batches: u64,
    pub requests: u64,
    pub successful_requests: u64,
    pub success_rate: f64,
    pub average_batch_size: f64,
    pub average_processing_time_ms: f64,
}

impl GroupStats {
    fn record(&mut self, size: usize, succeeded: usize, processing_ms: f64) {
        self.batches += 1;
        self.requests += size as u64;
        self.successful_requests += succeeded as u64;
        let n = self.batches as f64;
        self.average_batch_size += (size as f64 - self.average_batch_size) / n;
        self.average_processing_time_ms += (processing_ms - self.average_processing_time_ms) / n;
        self.success_rate = if self.requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.requests as f64
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsPoint {
    pub timestamp: u64,
    pub batch_size: usize,
    pub success_rate: f64,
    pub processing_time_ms: u64,
    pub throughput: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_batches: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub average_batch_size: f64,
    pub average_processing_time_ms: f64,
    pub average_wait_time_ms: f64,
    /// Requests per second since the collector started.
    pub throughput: f64,
    pub estimated_duplicates_removed: u64,
    pub estimated_requests_coalesced: u64,
    pub by_strategy: BTreeMap<String, GroupStats>,
    pub by_endpoint: BTreeMap<String, GroupStats>,
    pub alerts_fired: u64,
}

#[derive(Debug)]
struct State {
    snapshot: MetricsSnapshot,
    /// Wait/processing averages are seeded by their first sample.
    processing_seeded: bool,
    wait_seeded: bool,
    series: VecDeque<MetricsPoint>,
    last_alert: HashMap<String, Instant>,
}

/// Thread-safe metrics registry shared by manager and dispatch tasks.
pub struct MetricsCollector {
    config: MetricsConfig,
    started: Instant,
    state: Mutex<State>,
    events: Option<Arc<EventBus>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            state: Mutex::new(State {
                snapshot: MetricsSnapshot::default(),
                processing_seeded: false,
                wait_seeded: false,
                series: VecDeque::new(),
                last_alert: HashMap::new(),
            }),
            events: None,
        }
    }

    /// Report fired alerts as `metrics.alert` on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of one dispatched batch and evaluate alert rules.
    pub fn record_batch(&self, result: &BatchResult, endpoint: &str) -> Vec<FiredAlert> {
        let size = result.results.len();
        let succeeded = result.success_count();
        let processing_ms = result.metadata.processing_time_ms as f64;
        let alpha = self.config.smoothing;
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        {
            let mut st = self.lock();
            let seeded = st.processing_seeded;
            let s = &mut st.snapshot;
            s.total_batches += 1;
            s.total_requests += size as u64;
            s.successful_requests += succeeded as u64;
            s.failed_requests += (size - succeeded) as u64;
            if s.total_requests > 0 {
                s.success_rate = s.successful_requests as f64 / s.total_requests as f64;
                s.error_rate = s.failed_requests as f64 / s.total_requests as f64;
            }
            let n = s.total_batches as f64;
            s.average_batch_size += (size as f64 - s.average_batch_size) / n;
            s.average_processing_time_ms = if seeded {
                alpha * processing_ms + (1.0 - alpha) * s.average_processing_time_ms
            } else {
                processing_ms
            };
            s.throughput = s.total_requests as f64 / elapsed;

            let strategy = result
                .metadata
                .strategy
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            s.by_strategy
                .entry(strategy)
                .or_default()
                .record(size, succeeded, processing_ms);
            s.by_endpoint
                .entry(endpoint.to_string())
                .or_default()
                .record(size, succeeded, processing_ms);

            let point = MetricsPoint {
                timestamp: epoch_millis(),
                batch_size: size,
                success_rate: result.metadata.success_rate,
                processing_time_ms: result.metadata.processing_time_ms,
                throughput: s.throughput,
            };
            st.processing_seeded = true;
            st.series.push_back(point);
            while st.series.len() > self.config.time_series_capacity {
                st.series.pop_front();
            }
        }
        self.check_alerts()
    }

    /// Record how long a batch waited in the queue before dispatch.
    pub fn record_wait_time(&self, wait: Duration) {
        let ms = wait.as_millis() as f64;
        let alpha = self.config.smoothing;
        let mut st = self.lock();
        st.snapshot.average_wait_time_ms = if st.wait_seeded {
            alpha * ms + (1.0 - alpha) * st.snapshot.average_wait_time_ms
        } else {
            ms
        };
        st.wait_seeded = true;
    }

    /// Coarse optimization estimate: 10% duplicates and 5% coalesced of the input size.
    pub fn record_optimization(&self, original_size: usize) {
        let mut st = self.lock();
        st.snapshot.estimated_duplicates_removed += (original_size as f64 * 0.1).round() as u64;
        st.snapshot.estimated_requests_coalesced += (original_size as f64 * 0.05).round() as u64;
    }

    pub fn value_of(&self, metric: MetricKind) -> f64 {
        let st = self.lock();
        metric_value(&st.snapshot, metric)
    }

    /// Evaluate every rule against current values, honoring per-rule cooldown.
    pub fn check_alerts(&self) -> Vec<FiredAlert> {
        let fired = {
            let mut st = self.lock();
            let now = Instant::now();
            let mut fired = Vec::new();
            for rule in &self.config.alert_rules {
                let value = metric_value(&st.snapshot, rule.metric);
                if !rule.operator.holds(value, rule.threshold) {
                    continue;
                }
                let cooling = st
                    .last_alert
                    .get(&rule.name)
                    .is_some_and(|at| now.duration_since(*at) < rule.cooldown);
                if cooling {
                    continue;
                }
                st.last_alert.insert(rule.name.clone(), now);
                fired.push(FiredAlert {
                    rule: rule.name.clone(),
                    metric: rule.metric,
                    value,
                    threshold: rule.threshold,
                });
            }
            st.snapshot.alerts_fired += fired.len() as u64;
            fired
        };
        for alert in &fired {
            warn!(
                rule = %alert.rule,
                metric = alert.metric.as_str(),
                value = alert.value,
                threshold = alert.threshold,
                "metrics alert"
            );
            if let Some(bus) = &self.events {
                bus.emit(BatchEvent::MetricsAlert {
                    rule: alert.rule.clone(),
                    metric: alert.metric.as_str().to_string(),
                    value: alert.value,
                    threshold: alert.threshold,
                });
            }
        }
        fired
    }

    /// Averages over the trailing time-series window.
    pub fn recent_performance(&self) -> RecentPerformance {
        let st = self.lock();
        let n = st.series.len().min(RECENT_WINDOW);
        if n == 0 {
            return RecentPerformance::default();
        }
        let recent = st.series.iter().rev().take(n);
        let (mut time, mut success) = (0.0, 0.0);
        for p in recent {
            time += p.processing_time_ms as f64;
            success += p.success_rate;
        }
        let success_rate = success / n as f64;
        RecentPerformance {
            avg_response_time_ms: time / n as f64,
            success_rate,
            error_rate: 1.0 - success_rate,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn time_series(&self) -> Vec<MetricsPoint> {
        self.lock().series.iter().cloned().collect()
    }

    pub fn reset(&self) {
        let mut st = self.lock();
        st.snapshot = MetricsSnapshot::default();
        st.processing_seeded = false;
        st.wait_seeded = false;
        st.series.clear();
        st.last_alert.clear();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

fn metric_value(s: &MetricsSnapshot, metric: MetricKind) -> f64 {
    match metric {
        MetricKind::SuccessRate => s.success_rate,
        MetricKind::ErrorRate => s.error_rate,
        MetricKind::AverageBatchSize => s.average_batch_size,
        MetricKind::AverageProcessingTimeMs => s.average_processing_time_ms,
        MetricKind::AverageWaitTimeMs => s.average_wait_time_ms,
        MetricKind::Throughput => s.throughput,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, InMemoryEventSink};
    use crate::result::{BatchResultBuilder, RequestError};
    use serde_json::json;

    fn result(ok: usize, failed: usize, strategy: &str) -> BatchResult {
        let mut b = BatchResultBuilder::new("b").with_strategy(strategy);
        for i in 0..ok {
            b.add_success(format!("ok{i}"), json!(null));
        }
        for i in 0..failed {
            b.add_failure(format!("f{i}"), RequestError::new("TimeoutError", "timed out"));
        }
        b.build()
    }

    #[test]
    fn test_rates_and_group_stats() {
        let m = MetricsCollector::new(MetricsConfig::new().with_alert_rules(vec![]));
        m.record_batch(&result(8, 2, "hybrid"), "/tickets");
        m.record_batch(&result(10, 0, "size-based"), "/tickets");

        let s = m.snapshot();
        assert_eq!(s.total_batches, 2);
        assert_eq!(s.total_requests, 20);
        assert!((s.success_rate - 0.9).abs() < 1e-9);
        assert!((s.error_rate - 0.1).abs() < 1e-9);
        assert!((s.average_batch_size - 10.0).abs() < 1e-9);
        assert_eq!(s.by_strategy["hybrid"].batches, 1);
        assert_eq!(s.by_endpoint["/tickets"].requests, 20);
    }

    #[test]
    fn test_wait_time_is_smoothed() {
        let m = MetricsCollector::default();
        m.record_wait_time(Duration::from_millis(100));
        m.record_wait_time(Duration::from_millis(200));
        let avg = m.snapshot().average_wait_time_ms;
        assert!((avg - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_alert_fires_once_within_cooldown() {
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(InMemoryEventSink::new(100));
        bus.subscribe(sink.clone());
        let m = MetricsCollector::new(MetricsConfig::new().with_alert_rules(vec![AlertRule::new(
            "high_error_rate",
            MetricKind::ErrorRate,
            AlertOperator::Gt,
            0.1,
        )]))
        .with_events(bus);

        let fired = m.record_batch(&result(5, 5, "hybrid"), "/tickets");
        assert_eq!(fired.len(), 1);
        let fired = m.record_batch(&result(5, 5, "hybrid"), "/tickets");
        assert!(fired.is_empty());
        assert_eq!(sink.count(EventKind::MetricsAlert), 1);
    }

    #[test]
    fn test_recent_performance_defaults_to_healthy() {
        let m = MetricsCollector::default();
        let p = m.recent_performance();
        assert_eq!(p.success_rate, 1.0);
        assert_eq!(p.error_rate, 0.0);
    }

    #[test]
    fn test_time_series_is_bounded() {
        let m = MetricsCollector::new(
            MetricsConfig::new()
                .with_alert_rules(vec![])
                .with_time_series_capacity(3),
        );
        for _ in 0..5 {
            m.record_batch(&result(1, 0, "hybrid"), "/t");
        }
        assert_eq!(m.time_series().len(), 3);
    }

    #[test]
    fn test_optimization_estimate_uses_fixed_ratios() {
        let m = MetricsCollector::default();
        m.record_optimization(100);
        let s = m.snapshot();
        assert_eq!(s.estimated_duplicates_removed, 10);
        assert_eq!(s.estimated_requests_coalesced, 5);
    }
}
