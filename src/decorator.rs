mod chain;
mod circuit_break;
mod metric;
mod rate_limit;
mod sink;

pub use chain::DecoratorChain;
pub use circuit_break::{
    CircuitBreakDecorator, CircuitBreakDecoratorBuilder, CircuitBreakService, Fallback,
};
pub use metric::{MetricDecorator, MetricDecoratorBuilder, MetricService};
pub use rate_limit::{RateLimitDecorator, RateLimitService};
pub use sink::{InMemorySink, MetricSample, MetricsSink, Outcome, TracingSink};

use tower::{Layer, Service};

use crate::service::{BoxError, ServiceFunc};

/// Wraps a [`ServiceFunc`] with a policy and returns the wrapped func.
///
/// Every [`tower::Layer`] whose service speaks the `ServiceFunc` contract is
/// a decorator, so the built-in decorators, [`DecoratorChain`] and
/// third-party tower layers all compose the same way:
///
/// ```rust,no_run
/// # use std::time::Duration;
/// # use service_decorators::{BoxError, Decorator, ServiceFunc};
/// # use service_decorators::decorator::{CircuitBreakDecorator, RateLimitDecorator};
/// # fn main() -> anyhow::Result<()> {
/// let rate = RateLimitDecorator::new(Duration::from_millis(1), 100)?;
/// let breaker = CircuitBreakDecorator::builder()
///     .timeout(Duration::from_millis(100))
///     .max_concurrent_requests(1000)
///     .build()?;
/// let core = ServiceFunc::new(|n: u32| async move { Ok::<_, BoxError>(n + 1) });
/// let decorated = rate.decorate(breaker.decorate(core));
/// # let _ = decorated;
/// # Ok(())
/// # }
/// ```
pub trait Decorator<Req, Resp>: Send + Sync {
    fn decorate(&self, inner: ServiceFunc<Req, Resp>) -> ServiceFunc<Req, Resp>;
}

impl<L, Req, Resp> Decorator<Req, Resp> for L
where
    L: Layer<ServiceFunc<Req, Resp>> + Send + Sync,
    L::Service: Service<Req, Response = Resp, Error = BoxError> + Clone + Send + 'static,
    <L::Service as Service<Req>>::Future: Send + 'static,
    Req: 'static,
    Resp: 'static,
{
    fn decorate(&self, inner: ServiceFunc<Req, Resp>) -> ServiceFunc<Req, Resp> {
        ServiceFunc::from_service(self.layer(inner))
    }
}
