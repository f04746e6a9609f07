//! batch-sim — 用模拟处理器驱动批处理管线并输出指标
//!
//! Usage:
//!   batch-sim [--preset <name>] [--requests <n>] [--failure-rate <0..1>]
//!             [--latency-ms <n>] [--zones <n>] [--rps <n>] [--config <path>]
//!
//! Feeds synthetic ticket traffic through a `BatchManager` backed by a processor that sleeps
//! and fails at random, then prints metrics, queue stats and the analysis of every batch as
//! JSON on stdout. Logs go to stderr, filtered by `RUST_LOG` (default `info`).

use anyhow::{bail, Context};
use api_batcher::events::FnEventSink;
use api_batcher::manager::{BatchManagerConfig, Preset};
use api_batcher::processor::BatchProcessor;
use api_batcher::result::{BatchResult, BatchResultBuilder, RequestError, ResultAnalyzer};
use api_batcher::types::{Batch, BatchRequest, HttpMethod};
use api_batcher::{BatchEvent, BatchManager};
use async_trait::async_trait;
use rand::Rng;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const ENDPOINTS: [&str; 3] = ["/tickets", "/contacts", "/assets"];

struct Options {
    preset: Preset,
    config: Option<PathBuf>,
    requests: usize,
    failure_rate: f64,
    latency_ms: u64,
    zones: usize,
    rps: Option<f64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            preset: Preset::Default,
            config: None,
            requests: 200,
            failure_rate: 0.05,
            latency_ms: 40,
            zones: 2,
            rps: None,
        }
    }
}

fn print_usage() {
    println!(
        r#"batch-sim — 批处理管线模拟器

USAGE:
    batch-sim [OPTIONS]

OPTIONS:
    --preset <name>          default | high-throughput | low-latency | development
    --config <path>          YAML or JSON manager configuration (overrides --preset)
    --requests <n>           Number of synthetic requests (default 200)
    --failure-rate <f>       Per-request failure probability, 0..1 (default 0.05)
    --latency-ms <n>         Simulated processor latency (default 40)
    --zones <n>              Number of zones to spread traffic over (default 2)
    --rps <f>                Dispatch throttle in batches per second
    -h, --help               Show this help message

ENVIRONMENT:
    RUST_LOG                 Log filter (default info)
    API_BATCHER_*            Configuration overrides, see BatchManagerConfig"#
    );
}

fn value<'a>(flag: &str, it: &mut impl Iterator<Item = &'a String>) -> anyhow::Result<&'a String> {
    it.next().with_context(|| format!("{flag} needs a value"))
}

fn parse_args(args: &[String]) -> anyhow::Result<Option<Options>> {
    let mut opts = Options::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--preset" => {
                let name = value(arg, &mut it)?;
                opts.preset = Preset::from_str(name)?;
            }
            "--config" => opts.config = Some(PathBuf::from(value(arg, &mut it)?)),
            "--requests" => opts.requests = value(arg, &mut it)?.parse()?,
            "--failure-rate" => {
                opts.failure_rate = value(arg, &mut it)?.parse()?;
                if !(0.0..=1.0).contains(&opts.failure_rate) {
                    bail!("--failure-rate must be within 0..1");
                }
            }
            "--latency-ms" => opts.latency_ms = value(arg, &mut it)?.parse()?,
            "--zones" => opts.zones = value(arg, &mut it)?.parse::<usize>()?.max(1),
            "--rps" => opts.rps = Some(value(arg, &mut it)?.parse()?),
            "help" | "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(Some(opts))
}

/// Sleeps for the configured latency and fails each request with `failure_rate`.
struct SimulatedProcessor {
    latency: Duration,
    failure_rate: f64,
}

#[async_trait]
impl BatchProcessor for SimulatedProcessor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn process_batch(&self, batch: &Batch) -> api_batcher::Result<BatchResult> {
        let jitter = rand::thread_rng().gen_range(0..=self.latency.as_millis() as u64 / 2);
        tokio::time::sleep(self.latency + Duration::from_millis(jitter)).await;

        let mut builder = BatchResultBuilder::for_batch(batch);
        for req in &batch.requests {
            let roll: f64 = rand::thread_rng().gen();
            if roll < self.failure_rate {
                let message = if roll < self.failure_rate / 2.0 {
                    "connection reset by peer"
                } else {
                    "validation failed: missing subject"
                };
                builder.add_failure(req.id.clone(), RequestError::new("RemoteError", message));
            } else {
                builder.add_success(req.id.clone(), serde_json::json!({"id": req.id, "status": 201}));
            }
        }
        Ok(builder.build())
    }
}

fn synthetic_request(i: usize, zones: usize) -> BatchRequest {
    let mut rng = rand::thread_rng();
    let endpoint = ENDPOINTS[i % ENDPOINTS.len()];
    let zone = format!("z{}", i % zones + 1);
    let priority = match rng.gen_range(0..100) {
        0..=4 => 9,
        5..=24 => rng.gen_range(6..=8),
        _ => rng.gen_range(1..=5),
    };
    // every tenth request repeats its predecessor's payload
    let subject = if i % 10 == 9 { i - 1 } else { i };
    BatchRequest::new(format!("req-{i:05}"), endpoint, HttpMethod::Post, zone)
        .with_priority(priority)
        .with_data(serde_json::json!({"subject": format!("ticket {subject}")}))
}

fn load_config(opts: &Options) -> anyhow::Result<BatchManagerConfig> {
    let config = match &opts.config {
        Some(path) => BatchManagerConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => BatchManagerConfig::preset(opts.preset),
    };
    let mut config = config.with_env_overrides();
    if opts.rps.is_some() {
        config.rate_limit_rps = opts.rps;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(opts) = parse_args(&args)? else {
        return Ok(());
    };
    let config = load_config(&opts)?;

    let processor = Arc::new(SimulatedProcessor {
        latency: Duration::from_millis(opts.latency_ms),
        failure_rate: opts.failure_rate,
    });
    let follow_ups = Arc::new(Mutex::new((0u64, 0u64)));
    let counter = follow_ups.clone();
    let manager = BatchManager::builder()
        .config(config)
        .default_processor(processor)
        .event_sink(Arc::new(FnEventSink::new(move |envelope: &api_batcher::events::EventEnvelope| {
            let mut c = counter.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match envelope.event {
                BatchEvent::RequestRetryScheduled { .. } => c.0 += 1,
                BatchEvent::RequestFailedPermanent { .. } => c.1 += 1,
                _ => {}
            }
        })))
        .build()?;

    tracing::info!(requests = opts.requests, zones = opts.zones, "starting simulation");
    let mut pending_ids = Vec::new();
    for i in 0..opts.requests {
        let outcome = manager.add_request(synthetic_request(i, opts.zones))?;
        pending_ids.push(outcome.batch_id().to_string());
        if i % 25 == 24 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // Flush whatever is still collecting and keep its results for analysis.
    pending_ids.sort();
    pending_ids.dedup();
    let analyzer = ResultAnalyzer::new();
    let mut analyses = Vec::new();
    for id in &pending_ids {
        match manager.process_batch(id).await {
            Ok(Some(result)) => analyses.push(analyzer.analyze(&result)),
            Ok(None) => {}
            Err(e) => tracing::warn!(batch_id = %id, error = %e, "batch failed"),
        }
    }

    let drained = manager.shutdown().await;
    // pending follow-ups fire on cancellation; give them a moment to land
    tokio::time::sleep(Duration::from_millis(50)).await;
    let metrics = manager.metrics().await;
    let (retryable, permanent) = *follow_ups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

    let report = serde_json::json!({
        "drained": drained,
        "metrics": metrics.metrics,
        "queue": metrics.queue,
        "counters": metrics.counters,
        "dispatch_retries": metrics.dispatch_retries,
        "follow_up_events": {"retry_scheduled": retryable, "failed_permanent": permanent},
        "flushed_batches": analyses,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
