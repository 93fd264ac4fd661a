//! Task submission, joining, cancellation, and the blocking worker pool.
//!
//! Two tiers execute op work. Cooperative (`async_mode=true`) ops run as
//! tasks on the async runtime and are grouped per op invocation in a
//! [`TaskGroup`]. Blocking (`async_mode=false`) ops, and any synchronous
//! function an async op needs, go through the single process-wide
//! [`WorkerPool`], whose semaphore bound is the backpressure mechanism:
//! when the pool is saturated, `submit` blocks the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flowllm_core::{FlowError, FlowResult};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

/// Cooperative cancellation token owned by a [`crate::context::Context`].
///
/// Fired on deadline expiry, client disconnect, sibling failure under a
/// parallel combinator, or an explicit cancel request. Suspended ops observe
/// it at await points; blocking ops poll [`CancelToken::is_cancelled`] at
/// their I/O boundaries.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token fires. Returns immediately if already fired.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// `Cancelled` error if fired, for use with `?`.
    pub fn check(&self) -> FlowResult<()> {
        if self.is_cancelled() {
            Err(FlowError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Cooperative tasks submitted by one op invocation.
///
/// `join` only waits for tasks submitted to *this* group, never a parent's
/// or a sibling's.
pub struct TaskGroup<T> {
    handles: Vec<JoinHandle<FlowResult<T>>>,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        TaskGroup {
            handles: Vec::new(),
        }
    }

    /// Spawn a task into this group.
    pub fn submit<F>(&mut self, fut: F)
    where
        F: Future<Output = FlowResult<T>> + Send + 'static,
    {
        self.handles.push(tokio::spawn(fut));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every submitted task.
    ///
    /// Results come back in submission order regardless of completion order.
    ///
    /// - `timeout` elapsing cancels all still-running tasks, waits for their
    ///   cancellation to settle, then yields [`FlowError::Timeout`].
    ///   `Some(Duration::ZERO)` acts as an immediate poll.
    /// - With `return_exceptions=false`, the first failure cancels the
    ///   remaining siblings, waits for settlement, and surfaces that error.
    /// - With `return_exceptions=true`, every task is awaited and failures
    ///   are embedded at their position.
    pub async fn join(
        &mut self,
        timeout: Option<Duration>,
        return_exceptions: bool,
    ) -> FlowResult<Vec<FlowResult<T>>> {
        let handles = std::mem::take(&mut self.handles);
        if handles.is_empty() {
            return Ok(Vec::new());
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let mut pending: FuturesUnordered<_> = handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| async move { (index, handle.await) })
            .collect();

        let mut slots: Vec<Option<FlowResult<T>>> = Vec::new();
        slots.resize_with(aborts.len(), || None);

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        for abort in &aborts {
                            abort.abort();
                        }
                        // Settle: aborted handles resolve promptly.
                        while pending.next().await.is_some() {}
                        return Err(FlowError::Timeout {
                            waited: timeout.unwrap_or_default(),
                        });
                    }
                },
                None => pending.next().await,
            };

            let Some((index, joined)) = next else {
                break;
            };
            let result = flatten_join(joined);

            if result.is_err() && !return_exceptions {
                for abort in &aborts {
                    abort.abort();
                }
                while pending.next().await.is_some() {}
                return Err(result.err().unwrap_or(FlowError::Cancelled));
            }
            slots[index] = Some(result);
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(FlowError::Cancelled)))
            .collect())
    }
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn flatten_join<T>(
    joined: Result<FlowResult<T>, tokio::task::JoinError>,
) -> FlowResult<T> {
    match joined {
        Ok(result) => result,
        Err(error) if error.is_cancelled() => Err(FlowError::Cancelled),
        Err(error) => Err(FlowError::execution("task", error.to_string())),
    }
}

/// Bounded pool for blocking work.
///
/// A semaphore with `max_workers` permits fronts `spawn_blocking`: at
/// saturation, `submit` waits for a permit, which is exactly the
/// backpressure contract for sync submissions from async ops. `close`
/// unblocks every waiter with `Cancelled`.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        WorkerPool {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Run `f` on a blocking thread, waiting for pool capacity first.
    pub async fn submit<T, F>(&self, f: F) -> FlowResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| FlowError::Cancelled)?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });
        handle
            .await
            .map_err(|e| FlowError::execution("worker_pool", e.to_string()))
    }

    /// Stop accepting work; blocked submitters observe `Cancelled`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}
