//! Priority-ordered async lock guarding one shared resource.
//!
//! Waiters are served by ascending priority value, then by arrival order.
//! A bus has exactly one [`PriorityMutex`] and every request to it goes
//! through [`PriorityMutex::run_exclusive`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

/// Priority used by background polling.
pub const POLL_PRIORITY: u32 = 10;

/// Priority used by commands coming from the bus.
pub const COMMAND_PRIORITY: u32 = 0;

/// Returned to every queued waiter by [`PriorityMutex::cancel_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Request for lock canceled")]
pub struct LockCanceled;

type Grant = Result<Permit, LockCanceled>;

struct Waiter {
    priority: u32,
    seq: u64,
    tx: oneshot::Sender<Grant>,
}

// `BinaryHeap` pops the greatest element: the lowest (priority, seq) must compare greatest.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

struct State {
    free: usize,
    queue: BinaryHeap<Waiter>,
    next_seq: u64,
}

struct Inner {
    limit: usize,
    state: Mutex<State>,
}

impl Inner {
    fn dispatch(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.free == 0 {
                    return;
                }
                match state.queue.pop() {
                    Some(waiter) => {
                        state.free -= 1;
                        waiter
                    }
                    None => return,
                }
            };

            let permit = Permit {
                inner: Some(Arc::clone(self)),
            };
            match waiter.tx.send(Ok(permit)) {
                Ok(()) => return,
                // The waiter went away: take the slot back without re-entering dispatch.
                Err(grant) => {
                    if let Ok(mut permit) = grant {
                        permit.inner = None;
                    }
                    self.state.lock().free += 1;
                }
            }
        }
    }
}

/// Slot held in a [`PriorityMutex`]. Released when dropped.
pub struct Permit {
    inner: Option<Arc<Inner>>,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("armed", &self.inner.is_some())
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.state.lock().free += 1;
            inner.dispatch();
        }
    }
}

/// Async semaphore whose waiters are dispatched by priority.
///
/// Lower priority values are served first. Equal priorities are served in
/// the order [`acquire`](Self::acquire) was called.
#[derive(Clone)]
pub struct PriorityMutex {
    inner: Arc<Inner>,
}

impl Default for PriorityMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PriorityMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PriorityMutex")
            .field("limit", &self.inner.limit)
            .field("free", &state.free)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl PriorityMutex {
    /// A mutex: one holder at a time.
    pub fn new() -> Self {
        Self::with_limit(1)
    }

    /// Allow up to `limit` concurrent holders. A zero limit is treated as one.
    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner: Arc::new(Inner {
                limit,
                state: Mutex::new(State {
                    free: limit,
                    queue: BinaryHeap::new(),
                    next_seq: 0,
                }),
            }),
        }
    }

    /// Queue for a slot at `priority`.
    ///
    /// The waiter is enqueued when this is called, not when the returned
    /// future is first polled, so call order is arrival order.
    pub fn acquire(
        &self,
        priority: u32,
    ) -> impl Future<Output = Result<Permit, LockCanceled>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Waiter { priority, seq, tx });
        }
        self.inner.dispatch();

        async move { rx.await.unwrap_or(Err(LockCanceled)) }
    }

    /// Reject every queued waiter with [`LockCanceled`]. Current holders keep their slot.
    pub fn cancel_all(&self) {
        let waiters: Vec<Waiter> = {
            let mut state = self.inner.state.lock();
            state.queue.drain().collect()
        };
        if !waiters.is_empty() {
            trace!(canceled = waiters.len(), "Canceled queued lock requests");
        }
        for waiter in waiters {
            let _ = waiter.tx.send(Err(LockCanceled));
        }
    }

    /// Whether every slot is taken.
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().free == 0
    }

    /// Number of waiters not yet dispatched.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Run `op` while holding a slot, retrying any failure up to `ttl` times.
    pub async fn run_exclusive<F, Fut, T, E>(&self, op: F, priority: u32, ttl: u32) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockCanceled>,
    {
        self.run_exclusive_if(op, priority, ttl, |_| true).await
    }

    /// Run `op` while holding a slot.
    ///
    /// A failure accepted by `should_retry` releases the slot and queues the
    /// operation again at the same priority, behind waiters already queued,
    /// until `ttl` retries are spent. The slot is released on every exit path.
    pub async fn run_exclusive_if<F, Fut, T, E, R>(
        &self,
        mut op: F,
        priority: u32,
        mut ttl: u32,
        should_retry: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockCanceled>,
        R: Fn(&E) -> bool,
    {
        loop {
            let permit = self.acquire(priority).await?;
            let result = op().await;
            drop(permit);

            match result {
                Ok(value) => return Ok(value),
                Err(err) if ttl > 0 && should_retry(&err) => {
                    ttl -= 1;
                    trace!(priority, remaining = ttl, "Retrying exclusive operation");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[tokio::test]
    async fn test_dispatch_by_priority_then_arrival() {
        let mutex = PriorityMutex::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let holder = mutex.acquire(0).await.unwrap();
        assert!(mutex.is_locked());

        let mut tasks = Vec::new();
        for (label, priority) in [("5", 5), ("1a", 1), ("1b", 1)] {
            let waiting = mutex.acquire(priority);
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = waiting.await.unwrap();
                log.lock().push(label);
            }));
        }
        assert_eq!(mutex.queue_len(), 3);

        drop(holder);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*log.lock(), vec!["1a", "1b", "5"]);
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_cancel_all_rejects_only_queued() {
        let mutex = PriorityMutex::new();
        let holder = mutex.acquire(3).await.unwrap();

        let first = mutex.acquire(1);
        let second = mutex.acquire(7);
        mutex.cancel_all();

        assert_eq!(first.await.unwrap_err(), LockCanceled);
        assert_eq!(second.await.unwrap_err(), LockCanceled);
        assert_eq!(mutex.queue_len(), 0);
        assert!(mutex.is_locked());

        drop(holder);
        assert!(!mutex.is_locked());
        let _again = mutex.acquire(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak_slot() {
        let mutex = PriorityMutex::new();
        let holder = mutex.acquire(0).await.unwrap();

        let abandoned = mutex.acquire(0);
        drop(abandoned);
        drop(holder);

        assert!(!mutex.is_locked());
        let _next = mutex.acquire(0).await.unwrap();
        assert!(mutex.is_locked());
    }

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed,
        Canceled,
    }

    impl From<LockCanceled> for TestError {
        fn from(_: LockCanceled) -> Self {
            TestError::Canceled
        }
    }

    #[tokio::test]
    async fn test_run_exclusive_retries_within_ttl() {
        let mutex = PriorityMutex::new();
        let attempts = AtomicU32::new(0);

        let result: Result<u32, TestError> = mutex
            .run_exclusive(
                || {
                    let attempt = attempts.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    async move {
                        if attempt < 3 {
                            Err(TestError::Failed)
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                POLL_PRIORITY,
                3,
            )
            .await;

        assert_eq!(result, Ok(3));
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_run_exclusive_gives_up_when_ttl_spent() {
        let mutex = PriorityMutex::new();
        let attempts = AtomicU32::new(0);

        let result: Result<(), TestError> = mutex
            .run_exclusive(
                || {
                    attempts.fetch_add(1, AtomicOrdering::SeqCst);
                    async { Err(TestError::Failed) }
                },
                0,
                1,
            )
            .await;

        assert_eq!(result, Err(TestError::Failed));
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 2);
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_run_exclusive_if_skips_unretryable() {
        let mutex = PriorityMutex::new();
        let attempts = AtomicU32::new(0);

        let result: Result<(), TestError> = mutex
            .run_exclusive_if(
                || {
                    attempts.fetch_add(1, AtomicOrdering::SeqCst);
                    async { Err(TestError::Failed) }
                },
                0,
                5,
                |_| false,
            )
            .await;

        assert_eq!(result, Err(TestError::Failed));
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_queues_behind_same_priority_peer() {
        let mutex = PriorityMutex::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let holder = mutex.acquire(0).await.unwrap();

        let retrying = {
            let mutex = mutex.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let attempts = AtomicU32::new(0);
                let result: Result<(), TestError> = mutex
                    .run_exclusive(
                        || {
                            let attempt = attempts.fetch_add(1, AtomicOrdering::SeqCst);
                            let log = log.clone();
                            async move {
                                log.lock().push(format!("retrying#{}", attempt));
                                if attempt == 0 {
                                    Err(TestError::Failed)
                                } else {
                                    Ok(())
                                }
                            }
                        },
                        1,
                        1,
                    )
                    .await;
                result
            })
        };
        // Let the spawned operation enqueue itself.
        tokio::task::yield_now().await;
        assert_eq!(mutex.queue_len(), 1);

        let peer = mutex.acquire(1);
        let peer_task = {
            let log = log.clone();
            tokio::spawn(async move {
                let _permit = peer.await.unwrap();
                log.lock().push("peer".to_string());
            })
        };

        drop(holder);
        retrying.await.unwrap().unwrap();
        peer_task.await.unwrap();

        assert_eq!(*log.lock(), vec!["retrying#0", "peer", "retrying#1"]);
    }

    #[tokio::test]
    async fn test_canceled_waiter_surfaces_through_run_exclusive() {
        let mutex = PriorityMutex::new();
        let holder = mutex.acquire(0).await.unwrap();

        let queued = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                mutex
                    .run_exclusive(|| async { Ok::<(), TestError>(()) }, 0, 0)
                    .await
            })
        };
        tokio::task::yield_now().await;
        mutex.cancel_all();

        assert_eq!(queued.await.unwrap(), Err(TestError::Canceled));
        drop(holder);
    }
}
