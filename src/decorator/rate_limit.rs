use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tower::{Layer, Service};

use crate::error::DecoratorError;
use crate::service::BoxError;

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    burst: f64,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            rate,
            burst,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
    }

    /// Refill, then consume one token if a whole one is available.
    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Tower layer that admits calls through a token bucket and rejects the rest.
///
/// The bucket holds up to `burst` tokens (defaults to `quota`) and refills
/// continuously at `quota` tokens per `interval`. Every admitted call takes
/// one token. When the bucket is empty the call fails immediately with
/// [`DecoratorError::RateLimitExceeded`] and the inner service is never
/// called; there is no fallback and no queueing.
///
/// All services produced by one decorator share a single bucket.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use service_decorators::{BoxError, Decorator, ServiceFunc};
/// use service_decorators::decorator::RateLimitDecorator;
///
/// # fn main() -> Result<(), service_decorators::DecoratorError> {
/// let limiter = RateLimitDecorator::with_burst(Duration::from_secs(1), 30, 5)?;
/// let svc = limiter.decorate(ServiceFunc::new(|()| async { Ok::<_, BoxError>(()) }));
/// # let _ = svc;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimitDecorator {
    bucket: Arc<Mutex<TokenBucket>>,
    interval: Duration,
    quota: u64,
    burst: u64,
}

impl RateLimitDecorator {
    /// Allow `quota` calls per `interval`, with a burst equal to `quota`.
    pub fn new(interval: Duration, quota: u64) -> Result<Self, DecoratorError> {
        Self::with_burst(interval, quota, quota)
    }

    /// Allow `quota` calls per `interval`, letting up to `burst` unused
    /// tokens accumulate while the service is idle.
    pub fn with_burst(interval: Duration, quota: u64, burst: u64) -> Result<Self, DecoratorError> {
        if interval.is_zero() {
            return Err(DecoratorError::config(
                "rate limit interval must be greater than zero",
            ));
        }
        if quota == 0 {
            return Err(DecoratorError::config(
                "rate limit quota must be greater than zero",
            ));
        }
        if burst == 0 {
            return Err(DecoratorError::config(
                "rate limit burst must be greater than zero",
            ));
        }

        let rate = quota as f64 / interval.as_secs_f64();
        Ok(Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(
                rate,
                burst as f64,
                Instant::now(),
            ))),
            interval,
            quota,
            burst,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    fn try_acquire(&self) -> bool {
        // The bucket holds plain numbers, so a poisoned lock is still usable.
        self.bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_take(Instant::now())
    }
}

impl<S> Layer<S> for RateLimitDecorator {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: RateLimitDecorator,
}

impl<S, Req> Service<Req> for RateLimitService<S>
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
        if !self.limiter.try_acquire() {
            tracing::debug!(
                quota = self.limiter.quota,
                interval_us = self.limiter.interval.as_micros() as u64,
                "rate limit exceeded, rejecting call"
            );
            return Box::pin(std::future::ready(Err(
                DecoratorError::RateLimitExceeded.into()
            )));
        }
        Box::pin(self.inner.call(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_starts_full_and_drains() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3.0, 3.0, start);
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start));
    }

    #[test]
    fn bucket_refills_at_rate() {
        let start = Instant::now();
        // 10 tokens per second, burst 1
        let mut bucket = TokenBucket::new(10.0, 1.0, start);
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start + Duration::from_millis(50)));
        assert!(bucket.try_take(start + Duration::from_millis(101)));
    }

    #[test]
    fn bucket_is_capped_at_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(100.0, 2.0, start);
        let later = start + Duration::from_secs(60);
        assert!(bucket.try_take(later));
        assert!(bucket.try_take(later));
        assert!(!bucket.try_take(later));
    }

    #[test]
    fn rejected_attempts_do_not_go_into_debt() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 1.0, start);
        assert!(bucket.try_take(start));
        for _ in 0..50 {
            assert!(!bucket.try_take(start));
        }
        // One refill period later a token is available again, despite the
        // rejected attempts in between.
        assert!(bucket.try_take(start + Duration::from_millis(101)));
    }

    #[test]
    fn clock_going_backwards_does_not_refill() {
        let start = Instant::now() + Duration::from_secs(1);
        let mut bucket = TokenBucket::new(1.0, 1.0, start);
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start - Duration::from_millis(500)));
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(matches!(
            RateLimitDecorator::new(Duration::ZERO, 10),
            Err(DecoratorError::Config(_))
        ));
        assert!(matches!(
            RateLimitDecorator::new(Duration::from_secs(1), 0),
            Err(DecoratorError::Config(_))
        ));
        assert!(matches!(
            RateLimitDecorator::with_burst(Duration::from_secs(1), 10, 0),
            Err(DecoratorError::Config(_))
        ));
    }

    #[test]
    fn burst_defaults_to_quota() {
        let limiter = RateLimitDecorator::new(Duration::from_millis(1), 100).unwrap();
        assert_eq!(limiter.quota(), 100);
        assert_eq!(limiter.burst(), 100);
        assert_eq!(limiter.interval(), Duration::from_millis(1));
    }
}
