mod common;

use api_batcher::events::EventKind;
use api_batcher::{AddOutcome, BatchManager, BatchManagerConfig};
use common::{eventually, memory_sink, ticket, RecordingProcessor};
use serde_json::json;
use std::time::Duration;

fn ticket_config() -> BatchManagerConfig {
    BatchManagerConfig {
        max_batch_size: 10,
        max_wait_time_ms: 300,
        ..BatchManagerConfig::default()
    }
}

#[tokio::test]
async fn test_twelve_tickets_are_grouped_deduplicated_and_delivered() {
    let processor = RecordingProcessor::new();
    let sink = memory_sink();
    let manager = BatchManager::builder()
        .config(ticket_config())
        .default_processor(processor.clone())
        .event_sink(sink.clone())
        .build()
        .unwrap();

    let mut outcomes = Vec::new();
    for i in 0..12 {
        let id = format!("r{:02}", i);
        let priority = if i % 2 == 0 { 3 } else { 8 };
        let mut req = ticket(&id, priority);
        if i == 0 || i == 2 {
            req = req.with_data(json!({"subject": "duplicate"}));
        }
        outcomes.push(manager.add_request(req).unwrap());
    }

    // Priority 8 uses the priority-aware strategy, which fires at 30% of 10.
    let fired = outcomes
        .iter()
        .filter(|o| matches!(o, AddOutcome::Dispatched { .. }))
        .count();
    assert_eq!(fired, 2);

    let expected: Vec<String> = (0..12)
        .filter(|i| *i != 2)
        .map(|i| format!("r{:02}", i))
        .collect();
    assert!(
        eventually(Duration::from_secs(3), || processor.delivered_ids().len() == expected.len()).await,
        "delivered: {:?}",
        processor.delivered_ids()
    );
    assert_eq!(processor.delivered_ids(), expected);

    let batches = processor.batches();
    assert_eq!(batches.len(), 3);
    for batch in &batches {
        assert!(batch.len() <= 11);
        assert!(batch.max_size <= 11);
    }
    let deduplicated: Vec<_> = batches
        .iter()
        .filter_map(|b| b.metadata.optimization.as_ref())
        .filter(|m| m.duplicates_removed == 1)
        .collect();
    assert_eq!(deduplicated.len(), 1);
    assert_eq!(deduplicated[0].original_size, 6);

    assert_eq!(sink.count(EventKind::BatchCreated), 3);
    assert!(eventually(Duration::from_secs(1), || sink.count(EventKind::BatchCompleted) == 3).await);
    assert!(
        eventually(Duration::from_secs(1), || {
            manager.metrics_collector().snapshot().total_batches == 3
        })
        .await
    );

    let metrics = manager.metrics().await;
    assert_eq!(metrics.counters.requests_received, 12);
    assert_eq!(metrics.counters.batches_created, 3);
    assert_eq!(metrics.counters.batches_submitted, 3);
    assert_eq!(metrics.metrics.total_batches, 3);
    assert_eq!(metrics.metrics.failed_requests, 0);
    assert_eq!(manager.in_flight_len(), 0);

    assert!(manager.shutdown().await);
}

#[tokio::test]
async fn test_process_batch_returns_the_result_once() {
    let processor = RecordingProcessor::new();
    let manager = BatchManager::new(ticket_config(), processor.clone()).unwrap();

    let first = manager.add_request(ticket("a", 5)).unwrap();
    let second = manager.add_request(ticket("b", 5)).unwrap();
    assert!(matches!(first, AddOutcome::Collecting { .. }));
    assert_eq!(first.batch_id(), second.batch_id());

    let result = manager
        .process_batch(first.batch_id())
        .await
        .unwrap()
        .expect("batch was still collecting");
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.success_rate(), 1.0);
    assert!(result.success);

    assert!(manager.process_batch(first.batch_id()).await.unwrap().is_none());
    assert!(manager.process_batch("no-such-batch").await.unwrap().is_none());
    assert_eq!(processor.calls(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_timer_fires_an_idle_batch() {
    let processor = RecordingProcessor::new();
    let config = BatchManagerConfig {
        max_wait_time_ms: 100,
        ..ticket_config()
    };
    let manager = BatchManager::new(config, processor.clone()).unwrap();

    let outcome = manager.add_request(ticket("lonely", 1)).unwrap();
    assert!(matches!(outcome, AddOutcome::Collecting { .. }));
    assert_eq!(manager.in_flight_len(), 1);

    assert!(eventually(Duration::from_secs(2), || processor.calls() == 1).await);
    assert_eq!(processor.delivered_ids(), vec!["lonely".to_string()]);
    assert_eq!(manager.in_flight_len(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_zones_and_endpoints_never_share_a_batch() {
    let processor = RecordingProcessor::new();
    let manager = BatchManager::new(ticket_config(), processor.clone()).unwrap();

    let a = manager.add_request(ticket("a", 5)).unwrap();
    let b = manager.add_request(ticket("b", 5)).unwrap();
    let mut other_zone = ticket("c", 5);
    other_zone.zone = "z2".to_string();
    let c = manager.add_request(other_zone).unwrap();
    let mut other_endpoint = ticket("d", 5);
    other_endpoint.endpoint = "/contacts".to_string();
    let d = manager.add_request(other_endpoint).unwrap();

    assert_eq!(a.batch_id(), b.batch_id());
    assert_ne!(a.batch_id(), c.batch_id());
    assert_ne!(a.batch_id(), d.batch_id());
    assert_ne!(c.batch_id(), d.batch_id());
    assert_eq!(manager.in_flight_len(), 3);

    assert!(manager.shutdown().await);
    let batches = processor.batches();
    assert_eq!(batches.len(), 3);
    for batch in batches {
        assert!(batch
            .requests
            .iter()
            .all(|r| r.zone == batch.zone && r.endpoint == batch.endpoint));
    }
}
