mod common;

use api_batcher::events::{BatchEvent, EventKind};
use api_batcher::manager::{CircuitBreakerSettings, QueueSettings, RetrySettings};
use api_batcher::processor::ProcessorHealth;
use api_batcher::resilience::CircuitState;
use api_batcher::strategy::{BatchStrategy, StrategyConfig, StrategyContext};
use api_batcher::types::Batch;
use api_batcher::{
    AddOutcome, BatchManager, BatchManagerConfig, Error, HealthStatus, Preset, StrategyKind,
};
use common::{eventually, memory_sink, ticket, RecordingProcessor};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fast_retries(max_retries: u32) -> RetrySettings {
    RetrySettings {
        max_retries,
        base_delay_ms: 1,
        backoff_multiplier: 1.0,
        max_delay_ms: 5,
    }
}

#[tokio::test]
async fn test_shutdown_drains_then_rejects_new_requests() {
    let processor = RecordingProcessor::new();
    let manager = BatchManager::new(BatchManagerConfig::default(), processor.clone()).unwrap();

    manager.add_request(ticket("a", 2)).unwrap();
    manager.add_request(ticket("b", 2)).unwrap();
    assert_eq!(manager.in_flight_len(), 1);

    assert!(manager.shutdown().await);
    assert_eq!(processor.delivered_ids(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(manager.in_flight_len(), 0);
    assert!(!manager.is_accepting());

    let err = manager.add_request(ticket("late", 2)).unwrap_err();
    assert!(matches!(err, Error::Shutdown));

    // Second call is a no-op.
    assert!(manager.shutdown().await);
    let health = manager.health().await;
    assert!(health.issues.iter().any(|i| i.contains("shutting down")));
}

#[tokio::test]
async fn test_shutdown_delivers_batches_already_queued() {
    let processor = RecordingProcessor::new();
    let manager = BatchManager::new(BatchManagerConfig::default(), processor.clone()).unwrap();

    let outcome = manager.add_request(ticket("urgent", 9)).unwrap();
    assert!(matches!(outcome, AddOutcome::Dispatched { .. }));

    assert!(manager.shutdown().await);
    assert_eq!(processor.calls(), 1);
    assert_eq!(processor.delivered_ids(), vec!["urgent".to_string()]);
}

#[tokio::test]
async fn test_shutdown_deadline_reports_undelivered_requests() {
    let processor = RecordingProcessor::slow(Duration::from_millis(300));
    let sink = memory_sink();
    let config = BatchManagerConfig {
        queue: QueueSettings {
            max_concurrent_batches: 1,
            ..QueueSettings::default()
        },
        shutdown_timeout_ms: 100,
        ..BatchManagerConfig::default()
    };
    let manager = BatchManager::builder()
        .config(config)
        .default_processor(processor.clone())
        .event_sink(sink.clone())
        .build()
        .unwrap();

    manager.add_request(ticket("first", 9)).unwrap();
    let mut second = ticket("second", 9);
    second.zone = "z2".to_string();
    manager.add_request(second).unwrap();
    assert!(eventually(Duration::from_secs(1), || processor.calls() == 1).await);

    assert!(!manager.shutdown().await);
    assert!(
        eventually(Duration::from_secs(1), || {
            sink.events_of(EventKind::RequestFailedPermanent)
                .iter()
                .any(|e| matches!(&e.event, BatchEvent::RequestFailedPermanent { request_id, .. } if request_id == "second"))
        })
        .await
    );
    assert_eq!(processor.calls(), 1);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let manager = BatchManager::new(BatchManagerConfig::default(), RecordingProcessor::new()).unwrap();

    let mut no_endpoint = ticket("a", 5);
    no_endpoint.endpoint = String::new();
    let err = manager.add_request(no_endpoint).unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(
        err.context().and_then(|c| c.field_path.as_deref()),
        Some("request.endpoint")
    );

    let err = manager.add_request(ticket(" ", 5)).unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(manager.in_flight_len(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_critical_request_dispatches_immediately() {
    let processor = RecordingProcessor::new();
    let manager = BatchManager::new(BatchManagerConfig::default(), processor.clone()).unwrap();

    let outcome = manager.add_request(ticket("urgent", 9)).unwrap();
    assert!(matches!(outcome, AddOutcome::Dispatched { .. }));
    assert_eq!(manager.in_flight_len(), 0);
    assert!(eventually(Duration::from_secs(2), || processor.calls() == 1).await);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_default_strategy_switch_is_announced() {
    let sink = memory_sink();
    let manager = BatchManager::builder()
        .default_processor(RecordingProcessor::new())
        .event_sink(sink.clone())
        .build()
        .unwrap();
    assert_eq!(manager.default_strategy(), "hybrid");

    manager.set_default_strategy("size-based").unwrap();
    manager.set_default_strategy("size-based").unwrap();
    assert_eq!(manager.default_strategy(), "size-based");

    let changes = sink.events_of(EventKind::StrategyChanged);
    assert_eq!(changes.len(), 1);
    assert_eq!(
        changes[0].event,
        BatchEvent::StrategyChanged {
            from: "hybrid".to_string(),
            to: "size-based".to_string(),
        }
    );

    let err = manager.set_default_strategy("bogus").unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert_eq!(manager.default_strategy(), "size-based");

    manager.add_request(ticket("a", 3)).unwrap();
    let created = sink.events_of(EventKind::BatchCreated);
    assert!(matches!(
        &created[0].event,
        BatchEvent::BatchCreated { strategy, .. } if strategy == "size-based"
    ));

    manager.shutdown().await;
}

struct Eager;

impl BatchStrategy for Eager {
    fn name(&self) -> &str {
        "eager"
    }

    fn should_process(&self, _batch: &Batch) -> bool {
        true
    }

    fn optimal_batch_size(&self, _ctx: &StrategyContext) -> usize {
        1
    }

    fn batch_timeout(&self, _ctx: &StrategyContext) -> Duration {
        Duration::from_secs(1)
    }
}

#[tokio::test]
async fn test_custom_strategy_can_become_the_default() {
    let processor = RecordingProcessor::new();
    let manager = BatchManager::builder()
        .default_processor(processor.clone())
        .strategy(
            "eager",
            Arc::new(|_: &StrategyConfig| Arc::new(Eager) as Arc<dyn BatchStrategy>),
        )
        .build()
        .unwrap();

    manager.set_default_strategy("eager").unwrap();
    let outcome = manager.add_request(ticket("a", 3)).unwrap();
    assert!(matches!(outcome, AddOutcome::Dispatched { .. }));
    assert!(eventually(Duration::from_secs(2), || processor.calls() == 1).await);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_requests_get_follow_up_events() {
    let processor = RecordingProcessor::new();
    let sink = memory_sink();
    let config = BatchManagerConfig {
        enable_coalescing: false,
        follow_up_delay_ms: 20,
        ..BatchManagerConfig::default()
    };
    let manager = BatchManager::builder()
        .config(config)
        .default_processor(processor.clone())
        .event_sink(sink.clone())
        .build()
        .unwrap();

    let ok = manager.add_request(ticket("ok", 4)).unwrap();
    manager
        .add_request(ticket("slow", 4).with_data(json!({"fail": "connection timeout"})))
        .unwrap();
    manager
        .add_request(ticket("bad", 4).with_data(json!({"fail": "validation failed: subject"})))
        .unwrap();

    let result = manager.process_batch(ok.batch_id()).await.unwrap().unwrap();
    assert_eq!(result.success_count(), 1);
    assert_eq!(result.failure_count(), 2);
    assert!(!result.success);

    assert!(
        eventually(Duration::from_secs(2), || {
            sink.count(EventKind::RequestRetryScheduled) == 1
                && sink.count(EventKind::RequestFailedPermanent) == 1
        })
        .await
    );
    let retry = &sink.events_of(EventKind::RequestRetryScheduled)[0].event;
    assert!(matches!(
        retry,
        BatchEvent::RequestRetryScheduled { request_id, delay_ms: 20, .. } if request_id == "slow"
    ));
    let permanent = &sink.events_of(EventKind::RequestFailedPermanent)[0].event;
    assert!(matches!(
        permanent,
        BatchEvent::RequestFailedPermanent { request_id, .. } if request_id == "bad"
    ));

    let metrics = manager.metrics().await;
    assert_eq!(metrics.metrics.failed_requests, 2);
    assert_eq!(metrics.counters.follow_ups, 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_whole_batch() {
    let processor = RecordingProcessor::new();
    for _ in 0..3 {
        processor.fail_next(Error::processing("upstream unavailable", true));
    }
    let config = BatchManagerConfig {
        retry: fast_retries(2),
        ..BatchManagerConfig::default()
    };
    let manager = BatchManager::new(config, processor.clone()).unwrap();

    let outcome = manager.add_request(ticket("a", 4)).unwrap();
    manager.add_request(ticket("b", 4)).unwrap();
    let err = manager.process_batch(outcome.batch_id()).await.unwrap_err();
    assert!(matches!(err, Error::Processing { retryable: true, .. }));
    assert_eq!(processor.calls(), 3);

    let metrics = manager.metrics().await;
    assert_eq!(metrics.dispatch_retries, 2);
    assert_eq!(metrics.metrics.total_batches, 1);
    assert_eq!(metrics.metrics.failed_requests, 2);
    assert_eq!(manager.circuit_state(), CircuitState::Closed);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_open_circuit_requeues_until_the_trial_call_succeeds() {
    let processor = RecordingProcessor::new();
    processor.fail_next(Error::processing("bad gateway", false));
    let sink = memory_sink();
    let config = BatchManagerConfig {
        // the open-circuit pause is capped by max_delay_ms
        retry: RetrySettings {
            max_delay_ms: 1000,
            ..fast_retries(2)
        },
        circuit_breaker: CircuitBreakerSettings {
            enabled: true,
            failure_threshold: 1,
            timeout_ms: 150,
            ..CircuitBreakerSettings::default()
        },
        ..BatchManagerConfig::default()
    };
    let manager = BatchManager::builder()
        .config(config)
        .default_processor(processor.clone())
        .event_sink(sink.clone())
        .build()
        .unwrap();

    let first = manager.add_request(ticket("a", 4)).unwrap();
    assert!(manager.process_batch(first.batch_id()).await.is_err());
    assert_eq!(manager.circuit_state(), CircuitState::Open);
    let health = manager.health().await;
    assert_eq!(health.status, HealthStatus::Critical);

    let second = manager.add_request(ticket("b", 4)).unwrap();
    let result = manager
        .process_batch(second.batch_id())
        .await
        .unwrap()
        .unwrap();
    assert!(result.success);
    assert_eq!(manager.circuit_state(), CircuitState::Closed);
    assert_eq!(sink.count(EventKind::BatchRetry), 1);
    // closed -> open -> half-open -> closed
    assert_eq!(sink.count(EventKind::CircuitStateChanged), 3);
    assert_eq!(processor.calls(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_batches_behind_the_half_open_trial_are_not_failed() {
    let processor = RecordingProcessor::slow(Duration::from_millis(300));
    processor.fail_next(Error::processing("bad gateway", false));
    let sink = memory_sink();
    let config = BatchManagerConfig {
        retry: RetrySettings {
            max_delay_ms: 1000,
            ..fast_retries(0)
        },
        circuit_breaker: CircuitBreakerSettings {
            enabled: true,
            failure_threshold: 1,
            timeout_ms: 100,
            half_open_retry_ms: 120,
        },
        ..BatchManagerConfig::default()
    };
    let manager = BatchManager::builder()
        .config(config)
        .default_processor(processor.clone())
        .event_sink(sink.clone())
        .build()
        .unwrap();

    let first = manager.add_request(ticket("a", 4)).unwrap();
    assert!(manager.process_batch(first.batch_id()).await.is_err());
    assert_eq!(manager.circuit_state(), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let b = manager.add_request(ticket("b", 4)).unwrap();
    let mut other_zone = ticket("c", 4);
    other_zone.zone = "z2".to_string();
    let c = manager.add_request(other_zone).unwrap();
    let (rb, rc) = tokio::join!(
        manager.process_batch(b.batch_id()),
        manager.process_batch(c.batch_id())
    );

    assert!(rb.unwrap().unwrap().success);
    assert!(rc.unwrap().unwrap().success);
    assert_eq!(manager.circuit_state(), CircuitState::Closed);
    assert!(sink.count(EventKind::BatchRetry) >= 1);
    assert_eq!(processor.calls(), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_backend_rate_limit_pauses_dispatch() {
    let processor = RecordingProcessor::new();
    processor.fail_next(Error::rate_limited("429 Too Many Requests", Duration::from_millis(150)));
    let config = BatchManagerConfig {
        retry: fast_retries(2),
        ..BatchManagerConfig::default()
    };
    let manager = BatchManager::new(config, processor.clone()).unwrap();

    let outcome = manager.add_request(ticket("a", 4)).unwrap();
    let started = std::time::Instant::now();
    let result = manager.process_batch(outcome.batch_id()).await.unwrap().unwrap();

    assert!(result.success);
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(processor.calls(), 2);
    let metrics = manager.metrics().await;
    assert_eq!(metrics.dispatch_retries, 1);
    assert_eq!(manager.circuit_state(), CircuitState::Closed);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_throttle_for_holds_dispatch() {
    let processor = RecordingProcessor::new();
    let manager = BatchManager::new(BatchManagerConfig::default(), processor.clone()).unwrap();
    assert!(manager.metrics().await.rate_limiter.is_none());

    manager.throttle_for(Duration::from_millis(150)).await;
    let throttle = manager.metrics().await.rate_limiter.unwrap();
    assert!(throttle.estimated_wait_ms.is_some());

    let outcome = manager.add_request(ticket("a", 4)).unwrap();
    let started = std::time::Instant::now();
    manager.process_batch(outcome.batch_id()).await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert!(manager.metrics().await.rate_limiter.is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_falls_back_to_individual_dispatch() {
    let processor = RecordingProcessor::slow(Duration::from_millis(200));
    let sink = memory_sink();
    let config = BatchManagerConfig {
        queue: QueueSettings {
            max_queue_size: 1,
            max_concurrent_batches: 1,
            ..QueueSettings::default()
        },
        ..BatchManagerConfig::default()
    };
    let manager = BatchManager::builder()
        .config(config)
        .default_processor(processor.clone())
        .event_sink(sink.clone())
        .build()
        .unwrap();

    let outcomes: Vec<AddOutcome> = ["a", "b", "c"]
        .iter()
        .map(|id| manager.add_request(ticket(id, 9)).unwrap())
        .collect();
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, AddOutcome::ProcessedIndividually { .. })));
    assert!(sink.count(EventKind::QueueFull) >= 1);

    assert!(eventually(Duration::from_secs(3), || processor.delivered_ids().len() == 3).await);
    let metrics = manager.metrics().await;
    assert!(metrics.counters.individual_dispatches >= 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_health_reflects_processor_state() {
    let processor = RecordingProcessor::reporting(ProcessorHealth::new(
        HealthStatus::Degraded,
        "backend slow",
    ));
    let manager = BatchManager::new(BatchManagerConfig::default(), processor).unwrap();

    let health = manager.health().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert!(health.issues.iter().any(|i| i.contains("backend slow")));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_presets_and_throttle_are_applied() {
    let manager = BatchManager::builder()
        .preset(Preset::HighThroughput)
        .rate_limit_rps(50.0)
        .default_processor(RecordingProcessor::new())
        .build()
        .unwrap();

    assert_eq!(manager.config().max_batch_size, 500);
    assert_eq!(manager.config().default_strategy, StrategyKind::SizeBased);
    assert_eq!(manager.default_strategy(), "size-based");
    let metrics = manager.metrics().await;
    assert!(metrics.rate_limiter.is_some());
    assert_eq!(metrics.queue.max_concurrent_batches, 20);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_build_requires_a_default_processor() {
    let err = BatchManager::builder().build().unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert_eq!(
        err.context().and_then(|c| c.field_path.as_deref()),
        Some("processor.default")
    );

    let bad = BatchManagerConfig {
        min_batch_size: 20,
        max_batch_size: 10,
        ..BatchManagerConfig::default()
    };
    let err = BatchManager::new(bad, RecordingProcessor::new()).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[test]
fn test_build_outside_a_runtime_fails() {
    let err = BatchManager::new(BatchManagerConfig::default(), RecordingProcessor::new()).unwrap_err();
    assert!(matches!(err, Error::Runtime { .. }));
}
