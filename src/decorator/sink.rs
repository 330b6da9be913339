use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::service::BoxError;

/// How a decorated call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The wrapped service returned `Ok`.
    Success,
    /// The wrapped service returned `Err`.
    Failure,
    /// The call was dropped before it resolved, e.g. by an outer timeout.
    Cancelled,
}

/// Destination for the samples produced by
/// [`MetricDecorator`](super::MetricDecorator).
///
/// Sinks are owned by the application and shared with decorators through an
/// `Arc`. Each decorator calls its sink from a dedicated thread, one sample at
/// a time, so implementations may block. Errors returned here never reach the
/// decorated call; the decorator logs and drops them.
pub trait MetricsSink: Send + Sync + 'static {
    /// Record how long one call of `operation` took.
    fn record_time_spent(&self, operation: &str, elapsed: Duration) -> Result<(), BoxError>;

    /// Record whether one call of `operation` succeeded.
    fn record_outcome(&self, operation: &str, outcome: Outcome) -> Result<(), BoxError> {
        let _ = (operation, outcome);
        Ok(())
    }
}

/// A single sample captured by [`InMemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricSample {
    TimeSpent {
        operation: String,
        elapsed: Duration,
    },
    Outcome {
        operation: String,
        outcome: Outcome,
    },
}

/// Sink that keeps every sample in memory.
///
/// Cloning shares the underlying buffer.
#[derive(Clone, Default)]
pub struct InMemorySink {
    samples: Arc<Mutex<Vec<MetricSample>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn samples(&self) -> Vec<MetricSample> {
        self.lock().clone()
    }

    /// Durations recorded for `operation`, in recording order.
    pub fn time_spent(&self, operation: &str) -> Vec<Duration> {
        self.lock()
            .iter()
            .filter_map(|s| match s {
                MetricSample::TimeSpent {
                    operation: op,
                    elapsed,
                } if op == operation => Some(*elapsed),
                _ => None,
            })
            .collect()
    }

    /// Number of outcomes of the given kind recorded for `operation`.
    pub fn outcome_count(&self, operation: &str, outcome: Outcome) -> usize {
        self.lock()
            .iter()
            .filter(|s| {
                matches!(s, MetricSample::Outcome { operation: op, outcome: o }
                    if op == operation && *o == outcome)
            })
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MetricSample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetricsSink for InMemorySink {
    fn record_time_spent(&self, operation: &str, elapsed: Duration) -> Result<(), BoxError> {
        self.lock().push(MetricSample::TimeSpent {
            operation: operation.to_string(),
            elapsed,
        });
        Ok(())
    }

    fn record_outcome(&self, operation: &str, outcome: Outcome) -> Result<(), BoxError> {
        self.lock().push(MetricSample::Outcome {
            operation: operation.to_string(),
            outcome,
        });
        Ok(())
    }
}

/// Sink that emits every sample as a `tracing` event at `INFO` level under
/// the `service_decorators::metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record_time_spent(&self, operation: &str, elapsed: Duration) -> Result<(), BoxError> {
        tracing::info!(
            target: "service_decorators::metrics",
            operation,
            elapsed_us = elapsed.as_micros() as u64,
            "time spent"
        );
        Ok(())
    }

    fn record_outcome(&self, operation: &str, outcome: Outcome) -> Result<(), BoxError> {
        tracing::info!(
            target: "service_decorators::metrics",
            operation,
            outcome = ?outcome,
            "call outcome"
        );
        Ok(())
    }
}
