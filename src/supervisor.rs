//! Tracking of detached background tasks
//!
//! Request handlers hand work off to the supervisor and return immediately.
//! The work is not awaited by anyone, but it is counted, so that shutdown can
//! wait for it (up to a deadline) instead of dropping it on the floor.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Interval for polling the in-flight counter while draining
const DRAIN_POLL_INTERVAL_MS: u64 = 25;

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    spawned: AtomicU64,
}

/// Spawns and counts detached tasks
#[derive(Debug, Clone, Default)]
pub struct TaskSupervisor {
    counters: Arc<Counters>,
}

/// Decrements the in-flight counter when the task ends, including on panic
struct InFlightGuard(Arc<Counters>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` in the background. The caller never observes its result.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard(Arc::clone(&self.counters));

        tokio::spawn(async move {
            let _guard = guard;
            debug!(task = name, "Background task started");
            task.await;
            debug!(task = name, "Background task finished");
        });
    }

    /// Tasks currently running
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Tasks spawned since creation
    pub fn spawned(&self) -> u64 {
        self.counters.spawned.load(Ordering::Relaxed)
    }

    /// Wait until no task is running or `deadline` elapses.
    /// Returns `true` if everything finished in time.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        while self.in_flight() > 0 {
            if start.elapsed() >= deadline {
                warn!(
                    remaining = self.in_flight(),
                    deadline_secs = deadline.as_secs(),
                    "Drain deadline exceeded, abandoning background tasks"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }

        let drained_in = start.elapsed();
        if drained_in > Duration::from_millis(100) {
            info!(drained_in_ms = drained_in.as_millis(), "Drained background tasks");
        }
        true
    }
}
