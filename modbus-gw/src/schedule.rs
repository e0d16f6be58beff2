//! Periodic jobs that never overlap.
//!
//! A [`ScheduledTask`] waits its interval, runs the action to completion and
//! only then arms the next wait, so a slow action throttles itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Job run on every tick.
pub type Action = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Running {
    stop: watch::Sender<bool>,
}

/// Self-rescheduling periodic runner with a mutable interval.
pub struct ScheduledTask {
    name: String,
    interval_ms: Arc<AtomicU64>,
    action: Action,
    running: Mutex<Option<Running>>,
    // Held for the duration of each invocation; shared by successive loops.
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("interval", &self.interval())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ScheduledTask {
    /// Create a stopped task.
    pub fn new(name: impl Into<String>, interval: Duration, action: Action) -> Self {
        Self {
            name: name.into(),
            interval_ms: Arc::new(AtomicU64::new(interval.as_millis() as u64)),
            action,
            running: Mutex::new(None),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Current interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    /// Change the interval. A wait already in progress keeps its old length.
    pub fn set_interval(&self, interval: Duration) {
        let ms = interval.as_millis() as u64;
        if self.interval_ms.swap(ms, Ordering::SeqCst) != ms {
            trace!(task = %self.name, interval_ms = ms, "Interval changed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start ticking. The first invocation happens one interval from now.
    ///
    /// Does nothing if already running or if the interval is zero.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        if self.interval_ms.load(Ordering::SeqCst) == 0 {
            debug!(task = %self.name, "Zero interval, not scheduling");
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let name = self.name.clone();
        let interval_ms = Arc::clone(&self.interval_ms);
        let action = Arc::clone(&self.action);
        let gate = Arc::clone(&self.gate);

        tokio::spawn(async move {
            loop {
                let wait = Duration::from_millis(interval_ms.load(Ordering::SeqCst).max(1));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = stopped.changed() => break,
                }

                let _gate = gate.lock().await;
                if *stopped.borrow() {
                    break;
                }
                trace!(task = %name, "Tick");
                (action)().await;
            }
            trace!(task = %name, "Stopped");
        });

        *running = Some(Running { stop });
    }

    /// Cancel the pending invocation. An invocation already running completes.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            let _ = running.stop.send(true);
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::time::{Instant, sleep};

    fn counting(counter: Arc<AtomicUsize>) -> Action {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_after_one_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = ScheduledTask::new("count", Duration::from_millis(1000), counting(counter.clone()));
        task.start();

        sleep(Duration::from_millis(900)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_action_never_overlaps() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let starts = Arc::new(Mutex::new(Vec::new()));
        let origin = Instant::now();

        let action: Action = {
            let active = active.clone();
            let overlapped = overlapped.clone();
            let starts = starts.clone();
            Arc::new(move || {
                let active = active.clone();
                let overlapped = overlapped.clone();
                let starts = starts.clone();
                async move {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    starts.lock().push(origin.elapsed());
                    sleep(Duration::from_millis(300)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
                .boxed()
            })
        };

        let task = ScheduledTask::new("slow", Duration::from_millis(100), action);
        task.start();
        sleep(Duration::from_millis(2050)).await;
        task.stop();

        assert!(!overlapped.load(Ordering::SeqCst));
        let starts = starts.lock().clone();
        assert!(starts.len() >= 4);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(400));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_applies_to_next_wait() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = ScheduledTask::new("dilate", Duration::from_millis(100), counting(counter.clone()));
        task.start();

        sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // The wait armed at 100 ms still ends at 200 ms.
        task.set_interval(Duration::from_millis(1000));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        sleep(Duration::from_millis(800)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(task.interval(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_running_action_finish() {
        let finished = Arc::new(AtomicUsize::new(0));
        let action: Action = {
            let finished = finished.clone();
            Arc::new(move || {
                let finished = finished.clone();
                async move {
                    sleep(Duration::from_millis(500)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            })
        };

        let task = ScheduledTask::new("long", Duration::from_millis(100), action);
        task.start();
        assert!(task.is_running());

        sleep(Duration::from_millis(200)).await;
        task.stop();
        assert!(!task.is_running());

        sleep(Duration::from_millis(2000)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_disabled() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = ScheduledTask::new("off", Duration::ZERO, counting(counter.clone()));
        task.start();
        assert!(!task.is_running());

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
