use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tower::{Layer, Service};

use super::sink::{MetricsSink, Outcome};
use crate::error::DecoratorError;
use crate::service::BoxError;

const DEFAULT_OPERATION: &str = "service";
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Builder for [`MetricDecorator`]. At least one measurement must be enabled.
pub struct MetricDecoratorBuilder {
    sink: Arc<dyn MetricsSink>,
    operation: String,
    time_spent: bool,
    errors: bool,
    queue_capacity: usize,
}

impl MetricDecoratorBuilder {
    /// Name every sample is tagged with. Defaults to `"service"`.
    pub fn operation(mut self, name: impl Into<String>) -> Self {
        self.operation = name.into();
        self
    }

    /// Record the wall-clock duration of every call.
    pub fn needs_recording_time_spent(mut self) -> Self {
        self.time_spent = true;
        self
    }

    /// Record whether every call succeeded, failed or was cancelled.
    pub fn needs_recording_errors(mut self) -> Self {
        self.errors = true;
        self
    }

    /// Samples that may wait for the sink before new ones are dropped.
    /// Defaults to 1024.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<MetricDecorator, DecoratorError> {
        if self.operation.trim().is_empty() {
            return Err(DecoratorError::config(
                "metric operation name must not be empty",
            ));
        }
        if !self.time_spent && !self.errors {
            return Err(DecoratorError::config(
                "metric decorator must record time spent, errors, or both",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(DecoratorError::config(
                "metric queue capacity must be greater than zero",
            ));
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let worker = Worker {
            sink: self.sink,
            operation: self.operation.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("metrics-{}", self.operation))
            .spawn(move || worker.run(rx))
            .map_err(|e| DecoratorError::config(format!("cannot start metrics worker: {e}")))?;

        Ok(MetricDecorator {
            recorder: Arc::new(Recorder {
                queue: tx,
                operation: self.operation,
                time_spent: self.time_spent,
                errors: self.errors,
                _worker: WorkerHandle(Some(handle)),
            }),
        })
    }
}

enum Message {
    TimeSpent(Duration),
    Outcome(Outcome),
    Flush(oneshot::Sender<()>),
}

/// Owns the sink. Runs on its own thread so a slow sink only delays other
/// samples, never calls.
struct Worker {
    sink: Arc<dyn MetricsSink>,
    operation: String,
}

impl Worker {
    fn run(self, mut rx: mpsc::Receiver<Message>) {
        while let Some(message) = rx.blocking_recv() {
            match message {
                Message::TimeSpent(elapsed) => self.guarded("time_spent", || {
                    self.sink.record_time_spent(&self.operation, elapsed)
                }),
                Message::Outcome(outcome) => self.guarded("outcome", || {
                    self.sink.record_outcome(&self.operation, outcome)
                }),
                Message::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    /// Run one sink call; failures and panics are logged and dropped.
    fn guarded(&self, metric: &'static str, f: impl FnOnce() -> Result<(), BoxError>) {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                operation = %self.operation,
                metric,
                error = %e,
                "metrics sink rejected sample"
            ),
            Err(_) => tracing::warn!(
                operation = %self.operation,
                metric,
                "metrics sink panicked"
            ),
        }
    }
}

/// Joins the worker once the queue sender is gone, so queued samples reach
/// the sink before the last decorator handle finishes dropping.
struct WorkerHandle(Option<JoinHandle<()>>);

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            let _ = handle.join();
        }
    }
}

// Field order matters: `queue` must drop before `_worker` joins.
struct Recorder {
    queue: mpsc::Sender<Message>,
    operation: String,
    time_spent: bool,
    errors: bool,
    _worker: WorkerHandle,
}

impl Recorder {
    fn record(&self, elapsed: Duration, outcome: Outcome) {
        if self.time_spent {
            self.enqueue(Message::TimeSpent(elapsed));
        }
        if self.errors {
            self.enqueue(Message::Outcome(outcome));
        }
    }

    fn enqueue(&self, message: Message) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.queue.try_send(message) {
            tracing::warn!(
                operation = %self.operation,
                "metrics queue full, dropping sample"
            );
        }
    }
}

/// Records the call when finished, or as cancelled when dropped unfinished.
struct CallTimer {
    recorder: Option<Arc<Recorder>>,
    start: Instant,
}

impl CallTimer {
    fn start(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder: Some(recorder),
            start: Instant::now(),
        }
    }

    fn finish(mut self, outcome: Outcome) {
        if let Some(recorder) = self.recorder.take() {
            recorder.record(self.start.elapsed(), outcome);
        }
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.record(self.start.elapsed(), Outcome::Cancelled);
        }
    }
}

/// Tower layer that reports call latency, and optionally the call outcome,
/// to a [`MetricsSink`].
///
/// The clock starts when the call is made and stops when the wrapped
/// service's future resolves or is dropped. Exactly one sample per enabled
/// measurement is emitted per call; a call dropped before it resolves (for
/// example by an outer timeout) is reported as [`Outcome::Cancelled`].
///
/// Samples are queued to a dedicated thread that feeds the sink, so a slow
/// sink never delays the call. When the queue is full new samples are
/// dropped with a warning. The result is returned untouched, and sink
/// failures never reach the caller. Dropping the last handle to a decorator
/// waits for queued samples to be delivered; [`MetricDecorator::flush`] does
/// the same without dropping.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use service_decorators::decorator::{MetricDecorator, TracingSink};
///
/// # fn main() -> Result<(), service_decorators::DecoratorError> {
/// let metrics = MetricDecorator::builder(Arc::new(TracingSink))
///     .operation("add")
///     .needs_recording_time_spent()
///     .build()?;
/// # let _ = metrics;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MetricDecorator {
    recorder: Arc<Recorder>,
}

impl MetricDecorator {
    pub fn builder(sink: Arc<dyn MetricsSink>) -> MetricDecoratorBuilder {
        MetricDecoratorBuilder {
            sink,
            operation: DEFAULT_OPERATION.to_string(),
            time_spent: false,
            errors: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn operation(&self) -> &str {
        &self.recorder.operation
    }

    /// Wait until every sample queued so far has been handed to the sink.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.recorder.queue.send(Message::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

impl<S> Layer<S> for MetricDecorator {
    type Service = MetricService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricService {
            inner,
            recorder: self.recorder.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MetricService<S> {
    inner: S,
    recorder: Arc<Recorder>,
}

impl<S, Req> Service<Req> for MetricService<S>
where
    S: Service<Req, Error = BoxError>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let timer = CallTimer::start(self.recorder.clone());
        let fut = self.inner.call(req);

        Box::pin(async move {
            let result = fut.await;
            timer.finish(if result.is_ok() {
                Outcome::Success
            } else {
                Outcome::Failure
            });
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decorator::InMemorySink;

    struct FailingSink;

    impl MetricsSink for FailingSink {
        fn record_time_spent(&self, _: &str, _: Duration) -> Result<(), BoxError> {
            Err("disk full".into())
        }
    }

    struct PanickingSink;

    impl MetricsSink for PanickingSink {
        fn record_time_spent(&self, _: &str, _: Duration) -> Result<(), BoxError> {
            panic!("sink bug")
        }
    }

    #[test]
    fn build_requires_a_measurement() {
        let result = MetricDecorator::builder(Arc::new(InMemorySink::new())).build();
        assert!(matches!(result, Err(DecoratorError::Config(_))));
    }

    #[test]
    fn build_rejects_blank_operation() {
        let result = MetricDecorator::builder(Arc::new(InMemorySink::new()))
            .operation("  ")
            .needs_recording_time_spent()
            .build();
        assert!(matches!(result, Err(DecoratorError::Config(_))));
    }

    #[test]
    fn build_rejects_zero_queue_capacity() {
        let result = MetricDecorator::builder(Arc::new(InMemorySink::new()))
            .needs_recording_time_spent()
            .queue_capacity(0)
            .build();
        assert!(matches!(result, Err(DecoratorError::Config(_))));
    }

    #[test]
    fn operation_defaults_to_service() {
        let metrics = MetricDecorator::builder(Arc::new(InMemorySink::new()))
            .needs_recording_errors()
            .build()
            .unwrap();
        assert_eq!(metrics.operation(), "service");
    }

    #[tokio::test]
    async fn recorder_only_emits_enabled_measurements() {
        let sink = InMemorySink::new();
        let metrics = MetricDecorator::builder(Arc::new(sink.clone()))
            .operation("add")
            .needs_recording_errors()
            .build()
            .unwrap();
        metrics
            .recorder
            .record(Duration::from_millis(3), Outcome::Failure);
        metrics.flush().await;
        assert!(sink.time_spent("add").is_empty());
        assert_eq!(sink.outcome_count("add", Outcome::Failure), 1);
    }

    #[test]
    fn dropped_timer_records_cancellation() {
        let sink = InMemorySink::new();
        let metrics = MetricDecorator::builder(Arc::new(sink.clone()))
            .operation("add")
            .needs_recording_time_spent()
            .needs_recording_errors()
            .build()
            .unwrap();
        drop(CallTimer::start(metrics.recorder.clone()));
        CallTimer::start(metrics.recorder.clone()).finish(Outcome::Success);

        // Dropping the last handle drains the queue.
        drop(metrics);
        assert_eq!(sink.time_spent("add").len(), 2);
        assert_eq!(sink.outcome_count("add", Outcome::Cancelled), 1);
        assert_eq!(sink.outcome_count("add", Outcome::Success), 1);
    }

    #[tokio::test]
    async fn sink_errors_and_panics_are_swallowed() {
        for sink in [
            Arc::new(FailingSink) as Arc<dyn MetricsSink>,
            Arc::new(PanickingSink),
        ] {
            let metrics = MetricDecorator::builder(sink)
                .needs_recording_time_spent()
                .needs_recording_errors()
                .build()
                .unwrap();
            metrics.recorder.record(Duration::ZERO, Outcome::Success);
            metrics.recorder.record(Duration::ZERO, Outcome::Success);
            // The worker survives a panicking sink and still answers.
            metrics.flush().await;
        }
    }

    #[test]
    fn full_queue_drops_samples_instead_of_blocking() {
        use std::sync::{Mutex, PoisonError};

        struct BlockedSink(Mutex<()>);

        impl MetricsSink for BlockedSink {
            fn record_time_spent(&self, _: &str, _: Duration) -> Result<(), BoxError> {
                let _held = self.0.lock().unwrap_or_else(PoisonError::into_inner);
                Ok(())
            }
        }

        let sink = Arc::new(BlockedSink(Mutex::new(())));
        let held = sink.0.lock().unwrap();
        let metrics = MetricDecorator::builder(sink.clone())
            .needs_recording_time_spent()
            .queue_capacity(1)
            .build()
            .unwrap();

        let start = Instant::now();
        for _ in 0..100 {
            metrics.recorder.record(Duration::ZERO, Outcome::Success);
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        drop(held);
    }
}
