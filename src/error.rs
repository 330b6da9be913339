use std::time::Duration;

use thiserror::Error;

use crate::service::BoxError;

/// Errors raised by the built-in decorators.
///
/// `Config` is returned from constructors and builders. The other variants
/// travel through a [`ServiceFunc`](crate::ServiceFunc) as a [`BoxError`];
/// use [`DecoratorError::from_boxed`] to get them back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecoratorError {
    #[error("invalid decorator configuration: {0}")]
    Config(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("beyond max concurrency: {max_concurrent_requests} requests already in flight")]
    BeyondCapacity { max_concurrent_requests: usize },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("fallback failed: {0}")]
    InternalDecorator(String),
}

impl DecoratorError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Downcast a boxed call error to a decorator error, if it is one.
    pub fn from_boxed(err: &BoxError) -> Option<&DecoratorError> {
        err.downcast_ref::<DecoratorError>()
    }
}
