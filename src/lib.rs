//! Composable service decorators.
//!
//! A [`ServiceFunc`] is a cloneable, type-erased [`tower::Service`] that maps
//! a request to a response or an error. Decorators wrap one `ServiceFunc` and
//! return another, adding a policy around the call without touching the core
//! logic:
//!
//! - [`RateLimitDecorator`](decorator::RateLimitDecorator) rejects calls beyond
//!   a token-bucket rate.
//! - [`CircuitBreakDecorator`](decorator::CircuitBreakDecorator) bounds
//!   in-flight calls and call latency, answering from fallbacks instead.
//! - [`MetricDecorator`](decorator::MetricDecorator) reports latency and
//!   outcomes to a [`MetricsSink`](decorator::MetricsSink).
//!
//! Decorators compose by nesting, outermost first:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use service_decorators::decorator::{
//!     CircuitBreakDecorator, DecoratorChain, Fallback, MetricDecorator, RateLimitDecorator,
//!     TracingSink,
//! };
//! use service_decorators::{BoxError, ServiceFunc};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let zero = Fallback::new(|_req: (i64, i64), _reason| async { Ok(0) });
//! let chain = DecoratorChain::new()
//!     .decorator(RateLimitDecorator::new(Duration::from_millis(1), 100)?)
//!     .decorator(
//!         CircuitBreakDecorator::builder()
//!             .timeout(Duration::from_millis(100))
//!             .max_concurrent_requests(1000)
//!             .timeout_fallback(zero.clone())
//!             .beyond_max_concurrency_fallback(zero)
//!             .build()?,
//!     )
//!     .decorator(
//!         MetricDecorator::builder(Arc::new(TracingSink))
//!             .operation("add")
//!             .needs_recording_time_spent()
//!             .build()?,
//!     );
//!
//! let add = chain.wrap(ServiceFunc::new(|(a, b): (i64, i64)| async move {
//!     Ok::<_, BoxError>(a + b)
//! }));
//! assert_eq!(add.invoke((1, 1)).await.map_err(|e| anyhow::anyhow!(e))?, 2);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decorator;
pub mod error;
pub mod service;

pub use decorator::{Decorator, DecoratorChain};
pub use error::DecoratorError;
pub use service::{BoxError, ServiceFunc};
