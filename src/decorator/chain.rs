use tower::Layer;

use super::Decorator;
use crate::service::ServiceFunc;

/// An ordered stack of decorators, outermost first.
///
/// `DecoratorChain::new().decorator(a).decorator(b).wrap(core)` is the same
/// as `a.decorate(b.decorate(core))`: `a` sees every call before `b`. A chain
/// is itself a [`Decorator`], so chains nest.
pub struct DecoratorChain<Req, Resp> {
    decorators: Vec<Box<dyn Decorator<Req, Resp>>>,
}

impl<Req, Resp> Default for DecoratorChain<Req, Resp> {
    fn default() -> Self {
        Self {
            decorators: Vec::new(),
        }
    }
}

impl<Req, Resp> std::fmt::Debug for DecoratorChain<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoratorChain")
            .field("len", &self.decorators.len())
            .finish()
    }
}

impl<Req, Resp> DecoratorChain<Req, Resp> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a decorator inside every decorator added so far.
    pub fn decorator(mut self, decorator: impl Decorator<Req, Resp> + 'static) -> Self {
        self.decorators.push(Box::new(decorator));
        self
    }

    /// Add an already-boxed decorator.
    pub fn decorator_boxed(mut self, decorator: Box<dyn Decorator<Req, Resp>>) -> Self {
        self.decorators.push(decorator);
        self
    }

    pub fn len(&self) -> usize {
        self.decorators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decorators.is_empty()
    }

    /// Wrap `inner` with every decorator in the chain.
    pub fn wrap(&self, inner: ServiceFunc<Req, Resp>) -> ServiceFunc<Req, Resp> {
        self.decorators
            .iter()
            .rev()
            .fold(inner, |svc, decorator| decorator.decorate(svc))
    }
}

impl<Req, Resp> Layer<ServiceFunc<Req, Resp>> for DecoratorChain<Req, Resp> {
    type Service = ServiceFunc<Req, Resp>;

    fn layer(&self, inner: ServiceFunc<Req, Resp>) -> Self::Service {
        self.wrap(inner)
    }
}
