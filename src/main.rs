use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use futures::StreamExt;
use rand::Rng;
use service_decorators::config::{ChainConfig, parse_duration};
use service_decorators::decorator::{Fallback, InMemorySink, MetricSample, MetricsSink};
use service_decorators::{BoxError, DecoratorError, ServiceFunc};

/// Chain used when no config file is given.
const DEFAULT_CHAIN: &str = r#"
[[decorators]]
rate_limit = { interval = "1ms", quota = 100 }

[[decorators]]
circuit_breaker = { timeout = "100ms", max_concurrent_requests = 1000 }

[[decorators]]
metrics = { operation = "add", time_spent = true, errors = true }
"#;

#[derive(Parser)]
#[command(
    name = "service-decorators",
    about = "Drive a decorated in-process service and report what the decorators did"
)]
struct Cli {
    /// Path to TOML chain config file
    #[arg(short, long)]
    config: Option<String>,

    /// Total number of calls to make
    #[arg(long, default_value_t = 1000)]
    calls: usize,

    /// Calls allowed in flight at once
    #[arg(long, default_value_t = 16)]
    concurrency: usize,

    /// First operand of every call
    #[arg(long, default_value_t = 1)]
    op1: i64,

    /// Second operand of every call
    #[arg(long, default_value_t = 1)]
    op2: i64,

    /// Simulated latency of the wrapped service (e.g., "2ms", "1ms..5ms")
    #[arg(long = "inner-latency")]
    inner_latency: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// A fixed duration (`"2ms"`) or a half-open range (`"1ms..5ms"`).
#[derive(Debug, Clone, PartialEq, Eq)]
enum DurationOrRange {
    Fixed(Duration),
    Range(Duration, Duration),
}

impl DurationOrRange {
    /// The fixed value, or a uniform sample from the range.
    fn sample(&self) -> Duration {
        match self {
            DurationOrRange::Fixed(d) => *d,
            DurationOrRange::Range(lo, hi) if lo < hi => rand::rng().random_range(*lo..*hi),
            DurationOrRange::Range(lo, _) => *lo,
        }
    }
}

impl FromStr for DurationOrRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((lo, hi)) = s.split_once("..") {
            let lo = parse_duration(lo)?;
            let hi = parse_duration(hi)?;
            if hi < lo {
                return Err(format!("range end must not precede start, got '{s}'"));
            }
            Ok(DurationOrRange::Range(lo, hi))
        } else {
            Ok(DurationOrRange::Fixed(parse_duration(s)?))
        }
    }
}

#[derive(Default)]
struct Tally {
    ok: AtomicUsize,
    fallbacks: AtomicUsize,
    rate_limited: AtomicUsize,
    failed: AtomicUsize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("service_decorators=info"));
    let span_events = tracing_subscriber::fmt::format::FmtSpan::CLOSE;
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_span_events(span_events)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_span_events(span_events)
            .init();
    }

    if cli.concurrency == 0 {
        anyhow::bail!("concurrency must be at least 1");
    }

    let config = if let Some(ref path) = cli.config {
        ChainConfig::from_toml_file(path)?
    } else {
        ChainConfig::from_toml(DEFAULT_CHAIN)?
    };

    let latency = cli
        .inner_latency
        .as_deref()
        .map(str::parse::<DurationOrRange>)
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid inner-latency value: {e}"))?;

    let tally = Arc::new(Tally::default());
    let sink = InMemorySink::new();
    let fallback = {
        let tally = tally.clone();
        Fallback::new(move |(a, b): (i64, i64), reason: DecoratorError| {
            tally.fallbacks.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(a, b, %reason, "answering from fallback");
            async { Ok::<i64, BoxError>(0) }
        })
    };

    let chain = config.into_chain(Arc::new(sink.clone()) as Arc<dyn MetricsSink>, Some(fallback))?;
    tracing::info!(decorators = chain.len(), "chain built");

    let add = chain.wrap(ServiceFunc::new(move |(a, b): (i64, i64)| {
        let delay = latency.as_ref().map(DurationOrRange::sample);
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, BoxError>(a + b)
        }
    }));

    let started = Instant::now();
    futures::stream::iter(0..cli.calls)
        .map(|_| add.invoke((cli.op1, cli.op2)))
        .buffer_unordered(cli.concurrency)
        .for_each(|result| {
            let counter = match &result {
                Ok(_) => &tally.ok,
                Err(e) if DecoratorError::from_boxed(e) == Some(&DecoratorError::RateLimitExceeded) => {
                    &tally.rate_limited
                }
                Err(e) => {
                    tracing::warn!(error = %e, "call failed");
                    &tally.failed
                }
            };
            counter.fetch_add(1, Ordering::Relaxed);
            futures::future::ready(())
        })
        .await;
    let wall = started.elapsed();

    // Dropping the last handles waits for queued metric samples.
    drop(add);
    drop(chain);

    // Fallback answers are Ok results too.
    let fallbacks = tally.fallbacks.load(Ordering::Relaxed);
    tracing::info!(
        calls = cli.calls,
        succeeded = tally.ok.load(Ordering::Relaxed).saturating_sub(fallbacks),
        fallbacks,
        rate_limited = tally.rate_limited.load(Ordering::Relaxed),
        failed = tally.failed.load(Ordering::Relaxed),
        wall_ms = wall.as_millis() as u64,
        "run finished"
    );
    report_latency(&sink);

    Ok(())
}

fn report_latency(sink: &InMemorySink) {
    let mut operations: Vec<String> = sink
        .samples()
        .into_iter()
        .filter_map(|s| match s {
            MetricSample::TimeSpent { operation, .. } => Some(operation),
            _ => None,
        })
        .collect();
    operations.sort();
    operations.dedup();

    for operation in operations {
        let mut samples = sink.time_spent(&operation);
        samples.sort();
        let total: Duration = samples.iter().sum();
        let mean = total / samples.len() as u32;
        let p99 = samples[(samples.len() * 99 / 100).min(samples.len() - 1)];
        tracing::info!(
            operation = %operation,
            samples = samples.len(),
            mean_us = mean.as_micros() as u64,
            p99_us = p99.as_micros() as u64,
            max_us = samples.last().map_or(0, |d| d.as_micros() as u64),
            "latency"
        );
    }
}
