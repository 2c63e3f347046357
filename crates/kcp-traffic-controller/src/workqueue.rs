//! A rate-limited delaying work queue and the bounded-retry controller loop driving it.
//!
//! Keys are plain strings. The queue guarantees that a key is handed to at most one worker at a
//! time: a key added while it is being processed is parked and re-queued once the worker calls
//! [`WorkQueue::done`]. Adding a key that is already waiting is a no-op.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use kcp_traffic_controller::workqueue::{Controller, Process, RateLimiter, WorkQueue};
//! # async fn run<P: Process + 'static>(processor: Arc<P>) {
//! let queue = WorkQueue::new(RateLimiter::default());
//! queue.add("root:org|default/web");
//!
//! let controller = Controller::new("traffic", queue, processor, 5);
//! controller.run(2).await;
//! # }
//! ```

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    logging::controller::{ReconcilerError, report_controller_error, report_controller_reconciled},
    metrics::{MetricsSink, ReconcileOutcome, TracingMetricsSink},
};

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiter {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

impl RateLimiter {
    /// Delay before the next attempt after `failures` previous failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Keys ready to be handed out, in order.
    queue: VecDeque<String>,

    /// Keys that need processing, whether queued or parked behind an in-flight run.
    dirty: HashSet<String>,

    /// Keys currently held by a worker.
    processing: HashSet<String>,

    /// Number of consecutive rate-limited re-adds per key.
    failures: HashMap<String, u32>,
}

/// A deduplicating, rate-limited, delaying work queue.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: RateLimiter,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(limiter: RateLimiter) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::default(),
            notify: Notify::new(),
            limiter,
            shutdown: CancellationToken::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // The state stays consistent even if a holder panicked, every mutation is a single step
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Marks `key` for processing.
    pub fn add(&self, key: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut state = self.state();
        if !state.dirty.insert(key.to_owned()) {
            return;
        }
        if state.processing.contains(key) {
            // Re-queued by `done`
            return;
        }
        state.queue.push_back(key.to_owned());
        drop(state);
        self.notify.notify_one();
    }

    /// Marks `key` for processing once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::clone(self);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                () = queue.shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => queue.add(&key),
            }
        });
    }

    /// Marks `key` for processing after its backoff delay and bumps its failure count.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(key.to_owned()).or_default();
            let delay = self.limiter.delay(*failures);
            *failures += 1;
            delay
        };
        self.add_after(key, delay);
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// Number of rate-limited re-adds of `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or_default()
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the next key. Returns [`None`] once the queue is shut down.
    ///
    /// Every returned key must be passed to [`WorkQueue::done`] after processing.
    pub async fn get(&self) -> Option<String> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }

            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            tokio::select! {
                () = self.shutdown.cancelled() => return None,
                () = self.notify.notified() => {}
            }
        }
    }

    /// Releases `key` after processing, re-queueing it if it was added in the meantime.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stops handing out keys. Workers blocked in [`WorkQueue::get`] return [`None`].
    pub fn shut_down(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// The work a [`Controller`] performs for a single key.
#[async_trait]
pub trait Process: Send + Sync {
    type Error: ReconcilerError + Send + Sync + 'static;

    async fn process(&self, key: &str) -> Result<(), Self::Error>;
}

/// Runs workers popping keys off a [`WorkQueue`] and handing them to a [`Process`].
///
/// Failing keys are retried with the queue's rate limiter up to `max_retries` times, after which
/// they are dropped and reported through [`report_controller_error`].
pub struct Controller<P> {
    name: String,
    queue: Arc<WorkQueue>,
    processor: Arc<P>,
    max_retries: u32,
    metrics: Arc<dyn MetricsSink>,
}

impl<P> Controller<P>
where
    P: Process + 'static,
{
    pub fn new(
        name: impl Into<String>,
        queue: Arc<WorkQueue>,
        processor: Arc<P>,
        max_retries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            processor,
            max_retries,
            metrics: Arc::new(TracingMetricsSink),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Enqueues `key` for processing.
    pub fn enqueue(&self, key: &str) {
        self.queue.add(key);
    }

    /// Runs `workers` workers until the queue is shut down.
    pub async fn run(self, workers: usize) {
        tracing::info!(controller.name = %self.name, workers, "starting controller");

        let this = Arc::new(self);
        let handles = (0..workers.max(1)).map(|worker| {
            let this = Arc::clone(&this);
            tokio::spawn(async move { this.worker(worker).await })
        });
        for result in join_all(handles).await {
            if let Err(err) = result {
                tracing::error!(
                    controller.name = %this.name,
                    error = &err as &dyn std::error::Error,
                    "worker terminated abnormally"
                );
            }
        }

        tracing::info!(controller.name = %this.name, "controller stopped");
    }

    async fn worker(&self, worker: usize) {
        while let Some(key) = self.queue.get().await {
            let span = tracing::info_span!("process", controller.name = %self.name, worker, %key);
            let started = Instant::now();
            let result = self.processor.process(&key).instrument(span).await;
            let outcome = self.handle_result(&key, result);
            self.metrics
                .observe_reconcile(&self.name, outcome, started.elapsed());
            self.queue.done(&key);
        }
    }

    fn handle_result(&self, key: &str, result: Result<(), P::Error>) -> ReconcileOutcome {
        match result {
            Ok(()) => {
                self.queue.forget(key);
                report_controller_reconciled(&self.name, key);
                ReconcileOutcome::Success
            }
            Err(err) => {
                let retries = self.queue.num_requeues(key);
                if retries < self.max_retries {
                    tracing::info!(
                        controller.name = %self.name,
                        key,
                        retries,
                        error = &err as &dyn std::error::Error,
                        "error processing key, requeueing"
                    );
                    self.queue.add_rate_limited(key);
                    ReconcileOutcome::Retry
                } else {
                    self.queue.forget(key);
                    report_controller_error(&self.name, key, retries, &err);
                    ReconcileOutcome::Dropped
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;
    use snafu::Snafu;

    use super::*;

    #[derive(Debug, Snafu)]
    #[snafu(display("always fails"))]
    struct AlwaysFails;

    impl ReconcilerError for AlwaysFails {
        fn category(&self) -> &'static str {
            "AlwaysFails"
        }
    }

    /// Counts calls per key, fails until `fail_times` calls have been made.
    #[derive(Default)]
    struct Counting {
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_times: usize,
    }

    impl Counting {
        fn calls(&self, key: &str) -> usize {
            self.calls
                .lock()
                .expect("lock")
                .get(key)
                .copied()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Process for Counting {
        type Error = AlwaysFails;

        async fn process(&self, key: &str) -> Result<(), Self::Error> {
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut calls = self.calls.lock().expect("lock");
            let count = calls.entry(key.to_owned()).or_default();
            *count += 1;
            if *count <= self.fail_times {
                Err(AlwaysFails)
            } else {
                Ok(())
            }
        }
    }

    #[rstest]
    #[case::first_attempt(0, Duration::from_millis(5))]
    #[case::second_attempt(1, Duration::from_millis(10))]
    #[case::fifth_attempt(4, Duration::from_millis(80))]
    #[case::capped(30, Duration::from_secs(1000))]
    #[case::overflow(u32::MAX, Duration::from_secs(1000))]
    fn rate_limiter_backs_off_exponentially(#[case] failures: u32, #[case] expected: Duration) {
        assert_eq!(RateLimiter::default().delay(failures), expected);
    }

    #[tokio::test]
    async fn add_deduplicates_waiting_keys() {
        let queue = WorkQueue::new(RateLimiter::default());
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn key_added_while_processing_is_parked_until_done() {
        let queue = WorkQueue::new(RateLimiter::default());
        queue.add("a");
        let key = queue.get().await.expect("key");

        queue.add("a");
        assert!(queue.is_empty(), "in-flight key must not be handed out twice");

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_the_key() {
        let queue = WorkQueue::new(RateLimiter::default());
        queue.add_after("a", Duration::from_secs(30));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_count_failures_until_forgotten() {
        let queue = WorkQueue::new(RateLimiter::default());
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues("a"), 2);

        queue.forget("a");
        assert_eq!(queue.num_requeues("a"), 0);
    }

    #[tokio::test]
    async fn shut_down_releases_waiting_workers() {
        let queue = WorkQueue::new(RateLimiter::default());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.expect("join"), None);

        queue.add("late");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn controller_drops_key_after_max_retries() {
        let queue = WorkQueue::new(RateLimiter::default());
        let processor = Arc::new(Counting {
            fail_times: usize::MAX,
            ..Counting::default()
        });
        let controller = Controller::new("test", Arc::clone(&queue), Arc::clone(&processor), 5);
        controller.enqueue("broken");

        let run = tokio::spawn(controller.run(2));
        tokio::time::sleep(Duration::from_secs(60)).await;
        queue.shut_down();
        run.await.expect("join");

        // One initial attempt plus five retries
        assert_eq!(processor.calls("broken"), 6);
        assert_eq!(queue.num_requeues("broken"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn controller_retries_until_success() {
        let queue = WorkQueue::new(RateLimiter::default());
        let processor = Arc::new(Counting {
            fail_times: 2,
            ..Counting::default()
        });
        let controller = Controller::new("test", Arc::clone(&queue), Arc::clone(&processor), 5);
        controller.enqueue("flaky");

        let run = tokio::spawn(controller.run(1));
        tokio::time::sleep(Duration::from_secs(10)).await;
        queue.shut_down();
        run.await.expect("join");

        assert_eq!(processor.calls("flaky"), 3);
        assert_eq!(queue.num_requeues("flaky"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn controller_never_processes_a_key_concurrently() {
        let queue = WorkQueue::new(RateLimiter::default());
        let processor = Arc::new(Counting::default());
        let controller = Controller::new("test", Arc::clone(&queue), Arc::clone(&processor), 5);

        let run = tokio::spawn(controller.run(4));
        for _ in 0..20 {
            queue.add("same");
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.shut_down();
        run.await.expect("join");

        assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(processor.calls("same") >= 2);
    }
}
