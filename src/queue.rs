use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Semaphore, watch};

use crate::error::GobbleError;

/// Global FIFO scheduler that runs at most one unit of work at a time.
///
/// Every transformation in a session is funnelled through the same queue.
/// Units acquire the single slot in submission order and hold it until the
/// future they produced settles. [`ExecutionQueue::abort`] rejects every unit
/// that is still waiting; the running unit is left alone, and units
/// submitted afterwards are accepted again.
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

struct Inner {
    slot: Semaphore,
    /// Bumped on every abort; waiters compare against the value they saw at
    /// submission.
    epoch: watch::Sender<u64>,
    waiting: AtomicUsize,
}

struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExecutionQueue {
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                slot: Semaphore::new(1),
                epoch,
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    /// Submits a unit of work. The closure is only called once the unit owns
    /// the slot, and the returned future is driven to completion before the
    /// next unit may start.
    pub async fn add<F, Fut, T>(&self, unit: F) -> Result<T, GobbleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GobbleError>>,
    {
        let mut epoch = self.inner.epoch.subscribe();
        let submitted = *epoch.borrow_and_update();

        let permit = {
            let _waiting = Waiting::enter(&self.inner.waiting);

            tokio::select! {
                biased;
                _ = epoch.changed() => return Err(GobbleError::aborted()),
                permit = self.inner.slot.acquire() => {
                    permit.map_err(|_| GobbleError::aborted())?
                }
            }
        };

        // An abort may land between the permit being handed over and this
        // task being polled again.
        if *self.inner.epoch.borrow() != submitted {
            return Err(GobbleError::aborted());
        }

        let result = unit().await;
        drop(permit);
        result
    }

    /// Rejects all pending units.
    pub fn abort(&self) {
        let waiting = self.waiting();
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
        tracing::debug!(waiting, "execution queue aborted");
    }

    /// Number of units waiting for the slot.
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.slot.available_permits() == 0
    }
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("busy", &self.is_busy())
            .field("waiting", &self.waiting())
            .finish()
    }
}
