use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tower::{Layer, Service};

use crate::error::DecoratorError;
use crate::service::BoxError;

type FallbackFn<Req, Resp> =
    dyn Fn(Req, DecoratorError) -> BoxFuture<'static, Result<Resp, BoxError>> + Send + Sync;

/// A substitute for the wrapped service, invoked with the original request and
/// the reason the real call did not happen (or did not finish).
pub struct Fallback<Req, Resp>(Arc<FallbackFn<Req, Resp>>);

impl<Req, Resp> Clone for Fallback<Req, Resp> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<Req, Resp> Fallback<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Req, DecoratorError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, BoxError>> + Send + 'static,
    {
        Self(Arc::new(move |req, reason| Box::pin(f(req, reason))))
    }

    /// Fail the call with the reason the fallback was invoked.
    pub fn reject() -> Self {
        Self::new(|_req: Req, reason| std::future::ready(Err::<Resp, BoxError>(reason.into())))
    }

    /// Run the fallback, turning a panic inside it into
    /// [`DecoratorError::InternalDecorator`].
    async fn run(self, req: Req, reason: DecoratorError) -> Result<Resp, BoxError> {
        let f = self.0;
        match AssertUnwindSafe(async move { f(req, reason).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::warn!(panic = %msg, "fallback panicked");
                Err(DecoratorError::InternalDecorator(msg).into())
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "fallback panicked".to_string()
    }
}

struct InFlight {
    count: AtomicUsize,
    max: usize,
}

impl InFlight {
    /// Take a slot if one is free. Check and increment are a single atomic
    /// step, so concurrent callers can never push the count past `max`.
    fn try_enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| InFlightGuard(self.clone()))
    }
}

/// Releases the slot on drop, which also covers callers that abandon the
/// call future.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Builder for [`CircuitBreakDecorator`].
///
/// Timeout and max concurrency are required. Missing fallbacks default to
/// [`Fallback::reject`].
pub struct CircuitBreakDecoratorBuilder<Req, Resp> {
    timeout: Option<Duration>,
    max_concurrent_requests: Option<usize>,
    timeout_fallback: Option<Fallback<Req, Resp>>,
    beyond_max_concurrency_fallback: Option<Fallback<Req, Resp>>,
}

impl<Req, Resp> CircuitBreakDecoratorBuilder<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Upper bound on how long the wrapped service may take.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Maximum number of calls allowed in flight at once.
    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = Some(max);
        self
    }

    /// Invoked when the wrapped service does not finish within the timeout.
    pub fn timeout_fallback(mut self, fallback: Fallback<Req, Resp>) -> Self {
        self.timeout_fallback = Some(fallback);
        self
    }

    /// Invoked instead of the wrapped service when every slot is taken.
    pub fn beyond_max_concurrency_fallback(mut self, fallback: Fallback<Req, Resp>) -> Self {
        self.beyond_max_concurrency_fallback = Some(fallback);
        self
    }

    pub fn build(self) -> Result<CircuitBreakDecorator<Req, Resp>, DecoratorError> {
        let timeout = self
            .timeout
            .ok_or_else(|| DecoratorError::config("circuit breaker timeout is required"))?;
        if timeout.is_zero() {
            return Err(DecoratorError::config(
                "circuit breaker timeout must be greater than zero",
            ));
        }
        let max = self.max_concurrent_requests.ok_or_else(|| {
            DecoratorError::config("circuit breaker max concurrent requests is required")
        })?;
        if max == 0 {
            return Err(DecoratorError::config(
                "circuit breaker max concurrent requests must be greater than zero",
            ));
        }

        Ok(CircuitBreakDecorator {
            in_flight: Arc::new(InFlight {
                count: AtomicUsize::new(0),
                max,
            }),
            timeout,
            timeout_fallback: self.timeout_fallback.unwrap_or_else(Fallback::reject),
            beyond_max_concurrency_fallback: self
                .beyond_max_concurrency_fallback
                .unwrap_or_else(Fallback::reject),
        })
    }
}

/// Tower layer that bounds concurrency and latency of the wrapped service,
/// answering from fallbacks when either bound is hit.
///
/// Each call first tries to take an in-flight slot. When all
/// `max_concurrent_requests` slots are taken the wrapped service is not
/// called; the beyond-max-concurrency fallback answers with
/// [`DecoratorError::BeyondCapacity`] as the reason. Admitted calls race the
/// wrapped service against `timeout`. If the timer wins, the slot is released
/// first and then the timeout fallback answers with
/// [`DecoratorError::Timeout`].
///
/// A timed-out call is cancelled by dropping its future. Work the wrapped
/// service has handed to another task or thread keeps running until it
/// finishes on its own.
///
/// There is no open/half-open state: every call is judged on the current
/// in-flight count alone.
///
/// Calls must be polled inside a tokio runtime with the time driver enabled
/// (`enable_time`, included in `#[tokio::main]` and `#[tokio::test]`); the
/// timeout panics otherwise.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use service_decorators::decorator::{CircuitBreakDecorator, Fallback};
///
/// # fn main() -> Result<(), service_decorators::DecoratorError> {
/// let zero = Fallback::new(|_req: (i32, i32), _reason| async { Ok(0) });
/// let breaker = CircuitBreakDecorator::builder()
///     .timeout(Duration::from_millis(100))
///     .max_concurrent_requests(1000)
///     .timeout_fallback(zero.clone())
///     .beyond_max_concurrency_fallback(zero)
///     .build()?;
/// # let _ = breaker;
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreakDecorator<Req, Resp> {
    in_flight: Arc<InFlight>,
    timeout: Duration,
    timeout_fallback: Fallback<Req, Resp>,
    beyond_max_concurrency_fallback: Fallback<Req, Resp>,
}

impl<Req, Resp> Clone for CircuitBreakDecorator<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            in_flight: self.in_flight.clone(),
            timeout: self.timeout,
            timeout_fallback: self.timeout_fallback.clone(),
            beyond_max_concurrency_fallback: self.beyond_max_concurrency_fallback.clone(),
        }
    }
}

impl<Req, Resp> CircuitBreakDecorator<Req, Resp> {
    pub fn builder() -> CircuitBreakDecoratorBuilder<Req, Resp> {
        CircuitBreakDecoratorBuilder {
            timeout: None,
            max_concurrent_requests: None,
            timeout_fallback: None,
            beyond_max_concurrency_fallback: None,
        }
    }

    /// Calls currently admitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.in_flight.max
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<S, Req, Resp> Layer<S> for CircuitBreakDecorator<Req, Resp> {
    type Service = CircuitBreakService<S, Req, Resp>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakService {
            inner,
            breaker: self.clone(),
        }
    }
}

pub struct CircuitBreakService<S, Req, Resp> {
    inner: S,
    breaker: CircuitBreakDecorator<Req, Resp>,
}

impl<S: Clone, Req, Resp> Clone for CircuitBreakService<S, Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            breaker: self.breaker.clone(),
        }
    }
}

impl<S, Req, Resp> Service<Req> for CircuitBreakService<S, Req, Resp>
where
    S: Service<Req, Response = Resp, Error = BoxError>,
    S::Future: Send + 'static,
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Resp, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let Some(guard) = self.breaker.in_flight.try_enter() else {
            let max = self.breaker.in_flight.max;
            tracing::debug!(
                max_concurrent_requests = max,
                "beyond max concurrency, invoking fallback"
            );
            let fallback = self.breaker.beyond_max_concurrency_fallback.clone();
            return Box::pin(fallback.run(
                req,
                DecoratorError::BeyondCapacity {
                    max_concurrent_requests: max,
                },
            ));
        };

        let fallback_req = req.clone();
        let fut = self.inner.call(req);
        let timeout = self.breaker.timeout;
        let fallback = self.breaker.timeout_fallback.clone();

        Box::pin(async move {
            let outcome = tokio::time::timeout(timeout, fut).await;
            drop(guard);
            match outcome {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(
                        timeout_ms = timeout.as_millis() as u64,
                        "call timed out, invoking fallback"
                    );
                    fallback
                        .run(fallback_req, DecoratorError::Timeout(timeout))
                        .await
                }
            }
        })
    }
}
