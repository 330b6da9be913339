#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use service_decorators::decorator::Fallback;
use service_decorators::{BoxError, DecoratorError, ServiceFunc};
use tokio::sync::Semaphore;

pub type AddService = ServiceFunc<(i64, i64), i64>;

/// `a + b`, counting how many times the core logic actually ran.
pub fn counting_add() -> (AddService, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let svc = ServiceFunc::new(move |(a, b): (i64, i64)| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, BoxError>(a + b) }
    });
    (svc, calls)
}

/// `a + b` after `delay`.
pub fn slow_add(delay: Duration) -> AddService {
    ServiceFunc::new(move |(a, b): (i64, i64)| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, BoxError>(a + b)
    })
}

/// Always fails with `msg`.
pub fn failing_add(msg: &'static str) -> AddService {
    ServiceFunc::new(move |_: (i64, i64)| async move { Err::<i64, BoxError>(msg.into()) })
}

/// Service whose calls park until the test hands out a permit.
pub struct Gated {
    pub svc: AddService,
    pub gate: Arc<Semaphore>,
    pub entered: Arc<AtomicUsize>,
}

impl Gated {
    pub fn new() -> Self {
        let gate = Arc::new(Semaphore::new(0));
        let entered = Arc::new(AtomicUsize::new(0));
        let (g, e) = (gate.clone(), entered.clone());
        let svc = ServiceFunc::new(move |(a, b): (i64, i64)| {
            let gate = g.clone();
            let entered = e.clone();
            async move {
                entered.fetch_add(1, Ordering::SeqCst);
                gate.acquire().await?.forget();
                Ok::<_, BoxError>(a + b)
            }
        });
        Self { svc, gate, entered }
    }

    /// Let exactly `n` parked calls finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

/// Sets its flag when dropped. Held across an await to observe cancellation.
pub struct DropFlag(pub Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Fallback answering `value` and remembering every reason it was given.
pub fn recording_fallback(
    value: i64,
) -> (Fallback<(i64, i64), i64>, Arc<Mutex<Vec<DecoratorError>>>) {
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let seen = reasons.clone();
    let fallback = Fallback::new(move |_req: (i64, i64), reason: DecoratorError| {
        seen.lock().unwrap().push(reason);
        async move { Ok::<_, BoxError>(value) }
    });
    (fallback, reasons)
}

/// Poll `cond` until it holds, panicking after a second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 1s"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

pub fn decorator_error(err: &BoxError) -> DecoratorError {
    DecoratorError::from_boxed(err)
        .cloned()
        .unwrap_or_else(|| panic!("expected a decorator error, got: {err}"))
}
