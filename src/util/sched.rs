//! Deferred callback scheduling on the runtime
//!
//! The scheduler runs a callback once, asynchronously, off the calling stack.
//! There is no cancellation: a callback may fire after the zone/match it was
//! scheduled against is gone, so every callback must re-validate what it
//! captured (a token check) before touching shared state.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::util::time::{server_now, ServerTime};

/// Handle to the process-wide timer facility
#[derive(Clone, Copy, Debug, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Current monotonic server time
    pub fn now(&self) -> ServerTime {
        server_now()
    }

    /// Run `task` once after `delay_secs` seconds
    pub fn schedule_in<F, Fut>(&self, delay_secs: f64, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = Duration::from_secs_f64(delay_secs.max(0.0));
        tokio::spawn(async move {
            sleep(delay).await;
            task().await;
        });
    }

    /// Run `task` once at absolute server time `at` (immediately if already past)
    pub fn schedule_at<F, Fut>(&self, at: ServerTime, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = server_now();
        let delay = Duration::from_micros(at.as_micros().saturating_sub(now.as_micros()));
        tokio::spawn(async move {
            sleep(delay).await;
            task().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn schedule_in_fires_once_after_delay() {
        let sched = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = fired.clone();
        sched.schedule_in(5.0, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs_f64(4.9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs_f64(0.2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_at_in_the_past_fires_immediately() {
        let sched = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = fired.clone();
        sched.schedule_at(ServerTime::ZERO, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
