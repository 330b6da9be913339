use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::decorator::{
    CircuitBreakDecorator, Decorator, DecoratorChain, Fallback, MetricDecorator, MetricsSink,
    RateLimitDecorator,
};

/// Decorator chain configuration. Format-agnostic (TOML, JSON, YAML via serde).
///
/// ```toml
/// [[decorators]]
/// rate_limit = { interval = "1ms", quota = 100 }
///
/// [[decorators]]
/// circuit_breaker = { timeout = "100ms", max_concurrent_requests = 1000 }
///
/// [[decorators]]
/// metrics = { operation = "add", time_spent = true }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct ChainConfig {
    /// Decorators, outermost first.
    #[serde(default)]
    pub decorators: Vec<DecoratorConfig>,
}

/// One entry of the chain. Exactly one field must be set.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoratorConfig {
    pub rate_limit: Option<RateLimitConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    pub interval: DurationValue,
    pub quota: u64,
    pub burst: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CircuitBreakerConfig {
    pub timeout: DurationValue,
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub operation: Option<String>,
    #[serde(default)]
    pub time_spent: bool,
    #[serde(default)]
    pub errors: bool,
}

/// A single duration, deserialized from a string like `"250us"`, `"10ms"` or
/// `"1.5s"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s)
            .map(DurationValue)
            .map_err(serde::de::Error::custom)
    }
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(us) = s.strip_suffix("us") {
        let n: u64 = us.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Ok(Duration::from_micros(n))
    } else if let Some(ms) = s.strip_suffix("ms") {
        let n: u64 = ms.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Ok(Duration::from_millis(n))
    } else if let Some(secs) = s.strip_suffix('s') {
        let n: f64 = secs.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Duration::try_from_secs_f64(n).map_err(|e| format!("invalid duration: {e}"))
    } else {
        Err(format!(
            "expected duration like '250us', '200ms' or '1s', got '{s}'"
        ))
    }
}

impl ChainConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Build the configured chain.
    ///
    /// `sink` receives samples from every `metrics` entry. `fallback`, when
    /// given, answers both timeouts and over-capacity rejections of every
    /// `circuit_breaker` entry; otherwise those calls fail with the reason.
    pub fn into_chain<Req, Resp>(
        self,
        sink: Arc<dyn MetricsSink>,
        fallback: Option<Fallback<Req, Resp>>,
    ) -> anyhow::Result<DecoratorChain<Req, Resp>>
    where
        Req: Clone + Send + 'static,
        Resp: Send + 'static,
    {
        let mut chain = DecoratorChain::new();
        for (index, entry) in self.decorators.into_iter().enumerate() {
            let decorator = build_entry(entry, &sink, fallback.as_ref())
                .map_err(|e| e.context(format!("decorators[{index}]")))?;
            chain = chain.decorator_boxed(decorator);
        }
        Ok(chain)
    }
}

fn build_entry<Req, Resp>(
    entry: DecoratorConfig,
    sink: &Arc<dyn MetricsSink>,
    fallback: Option<&Fallback<Req, Resp>>,
) -> anyhow::Result<Box<dyn Decorator<Req, Resp>>>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    match entry {
        DecoratorConfig {
            rate_limit: Some(config),
            circuit_breaker: None,
            metrics: None,
        } => Ok(Box::new(build_rate_limiter(config)?)),
        DecoratorConfig {
            rate_limit: None,
            circuit_breaker: Some(config),
            metrics: None,
        } => Ok(Box::new(build_circuit_breaker(config, fallback)?)),
        DecoratorConfig {
            rate_limit: None,
            circuit_breaker: None,
            metrics: Some(config),
        } => Ok(Box::new(build_metrics(config, sink)?)),
        DecoratorConfig {
            rate_limit: None,
            circuit_breaker: None,
            metrics: None,
        } => anyhow::bail!("entry configures no decorator"),
        _ => anyhow::bail!("entry configures more than one decorator"),
    }
}

fn build_rate_limiter(config: RateLimitConfig) -> anyhow::Result<RateLimitDecorator> {
    let limiter = match config.burst {
        Some(burst) => RateLimitDecorator::with_burst(config.interval.0, config.quota, burst)?,
        None => RateLimitDecorator::new(config.interval.0, config.quota)?,
    };
    Ok(limiter)
}

fn build_circuit_breaker<Req, Resp>(
    config: CircuitBreakerConfig,
    fallback: Option<&Fallback<Req, Resp>>,
) -> anyhow::Result<CircuitBreakDecorator<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let mut builder = CircuitBreakDecorator::builder()
        .timeout(config.timeout.0)
        .max_concurrent_requests(config.max_concurrent_requests);
    if let Some(fallback) = fallback {
        builder = builder
            .timeout_fallback(fallback.clone())
            .beyond_max_concurrency_fallback(fallback.clone());
    }
    Ok(builder.build()?)
}

fn build_metrics(
    config: MetricsConfig,
    sink: &Arc<dyn MetricsSink>,
) -> anyhow::Result<MetricDecorator> {
    let mut builder = MetricDecorator::builder(sink.clone());
    if let Some(operation) = config.operation {
        builder = builder.operation(operation);
    }
    if config.time_spent {
        builder = builder.needs_recording_time_spent();
    }
    if config.errors {
        builder = builder.needs_recording_errors();
    }
    Ok(builder.build()?)
}
