use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// What to do with a request that arrives while every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Refuse immediately.
    Reject,
    /// Wait for a slot, up to `max_waiting` waiters, each for at most `timeout`.
    Queue { max_waiting: usize, timeout: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("too many executions in progress, try again later")]
    Saturated,
    #[error("too many executions waiting, try again later")]
    QueueFull,
    #[error("timed out waiting for an execution slot")]
    QueueTimeout,
    #[error("execution service is shutting down")]
    Closed,
}

/// Counting semaphore capping concurrently admitted executions.
///
/// The only state shared between requests. Permits are RAII guards, so an
/// early return can never leak or double-count a slot.
#[derive(Clone)]
pub struct AdmissionLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    policy: AdmissionPolicy,
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
}

/// Held for the lifetime of one admitted execution.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    inner: Arc<Inner>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements the waiter count however the wait ends.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionLimiter {
    pub fn new(capacity: usize, policy: AdmissionPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                policy,
                in_flight: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    pub async fn acquire(&self) -> Result<AdmissionPermit, AdmissionError> {
        let semaphore = Arc::clone(&self.inner.semaphore);
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(AdmissionError::Closed),
            Err(TryAcquireError::NoPermits) => match self.inner.policy {
                AdmissionPolicy::Reject => return Err(AdmissionError::Saturated),
                AdmissionPolicy::Queue {
                    max_waiting,
                    timeout,
                } => {
                    self.inner
                        .waiting
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                            (n < max_waiting).then_some(n + 1)
                        })
                        .map_err(|_| AdmissionError::QueueFull)?;
                    let _guard = WaitingGuard(&self.inner.waiting);
                    debug!(waiting = self.waiting(), "queued for an execution slot");
                    match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => return Err(AdmissionError::Closed),
                        Err(_) => return Err(AdmissionError::QueueTimeout),
                    }
                }
            },
        };
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(AdmissionPermit {
            _permit: permit,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Stop admitting; queued waiters fail with [`AdmissionError::Closed`].
    pub fn close(&self) {
        self.inner.semaphore.close();
    }
}
