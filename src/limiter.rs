//! Bounded-concurrency admission for remote calls.
//!
//! Every logical work item is submitted up front; a semaphore admits at most
//! `max` of them at a time and a slot is released when the item finishes,
//! whether it succeeded or failed. Results come back in submission order.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

/// Shared flag that stops new work from being admitted.
///
/// Work that already holds a slot runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The item was never started because the run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled before start")]
pub struct Cancelled;

#[derive(Debug)]
struct Inner {
    semaphore: Semaphore,
    max: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    cancel: CancelHandle,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<Inner>,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        Self::with_cancel(max, CancelHandle::new())
    }

    pub fn with_cancel(max: usize, cancel: CancelHandle) -> Self {
        let max = max.max(1);
        Self {
            inner: Arc::new(Inner {
                semaphore: Semaphore::new(max),
                max,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                cancel,
            }),
        }
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously admitted items seen so far.
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.inner.cancel.clone()
    }

    /// Wait for a slot, then run `fut` while holding it.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Cancelled>
    where
        F: Future<Output = T>,
    {
        let _permit = self.inner.semaphore.acquire().await.map_err(|_| Cancelled)?;
        if self.inner.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.inner.in_flight);
        Ok(fut.await)
    }

    /// Run every future under the limiter. The output vector lines up with
    /// the input order; a failing item does not affect its siblings.
    pub async fn run_all<I, F, T>(&self, futs: I) -> Vec<Result<T, Cancelled>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T>,
    {
        join_all(futs.into_iter().map(|f| self.run(f))).await
    }
}
