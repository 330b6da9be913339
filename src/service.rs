use std::future::Future;
use std::task::{Context, Poll};

use tower::util::{BoxCloneService, Oneshot};
use tower::{Service, ServiceExt};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The callable every decorator wraps and produces.
///
/// A `ServiceFunc` is a type-erased, cloneable [`tower::Service`]. Clones
/// share whatever state the underlying decorators hold, so a single chain can
/// be cloned into as many concurrent tasks as needed.
pub struct ServiceFunc<Req, Resp> {
    inner: BoxCloneService<Req, Resp, BoxError>,
}

impl<Req, Resp> Clone for ServiceFunc<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req, Resp> ServiceFunc<Req, Resp>
where
    Req: 'static,
    Resp: 'static,
{
    /// Build a service func from an async closure.
    ///
    /// ```rust
    /// use service_decorators::{BoxError, ServiceFunc};
    ///
    /// let double = ServiceFunc::new(|n: i64| async move { Ok::<_, BoxError>(n * 2) });
    /// # let _ = double;
    /// ```
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Req) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<Resp, BoxError>> + Send + 'static,
    {
        Self::from_service(tower::service_fn(f))
    }

    /// Erase any cloneable tower service into a service func.
    pub fn from_service<S>(service: S) -> Self
    where
        S: Service<Req, Response = Resp, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self {
            inner: BoxCloneService::new(service),
        }
    }

    /// Invoke the service once on a fresh clone.
    ///
    /// The returned future owns everything it needs, so it can be awaited
    /// in place or moved into a spawned task.
    pub fn invoke(&self, req: Req) -> Oneshot<BoxCloneService<Req, Resp, BoxError>, Req> {
        self.inner.clone().oneshot(req)
    }
}

impl<Req, Resp> Service<Req> for ServiceFunc<Req, Resp> {
    type Response = Resp;
    type Error = BoxError;
    type Future = <BoxCloneService<Req, Resp, BoxError> as Service<Req>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.inner.call(req)
    }
}
