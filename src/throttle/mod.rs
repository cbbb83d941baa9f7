//! Adaptive admission control for capability calls.
//!
//! One [`RequestThrottler`] is shared by every caller in the process. It is a
//! handle onto a single actor task that owns all queue and pacing state, so no
//! two dispatch decisions can interleave:
//!
//! - requests sharing a batch key or payload hash merge onto one upstream call
//! - keyed requests wait up to `batch_wait_time` for companions
//! - dispatches are spaced by an adaptive delay and capped by `max_concurrent`
//! - repeated overload failures open a cooldown during which non-critical
//!   submissions fail fast

mod stats;

pub use stats::{adapt_delay, AdaptSignal, RollingStats, ThrottleStats};

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ThrottleConfig;
use crate::llm::LlmError;

/// Priority for calls that must not be shed (lower is more urgent).
pub const PRIORITY_CRITICAL: u8 = 0;
/// Priority for ordinary verification and planning calls.
pub const PRIORITY_NORMAL: u8 = 5;
/// Priority for speculative work.
pub const PRIORITY_BACKGROUND: u8 = 9;

type ThrottledCall<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, LlmError>> + Send>;
type Waiter<T> = oneshot::Sender<Result<T, LlmError>>;

/// A unit of upstream work offered to the throttler.
pub struct ThrottleRequest<T> {
    pub id: Uuid,
    pub priority: u8,
    pub batch_key: Option<String>,
    pub payload_hash: String,
    pub timeout: Option<Duration>,
    call: ThrottledCall<T>,
}

impl<T: Send + 'static> ThrottleRequest<T> {
    /// Wrap an upstream call. The closure runs at most once, and not at all
    /// if the request merges onto an existing entry.
    pub fn new<F, Fut>(payload_hash: impl Into<String>, call: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, LlmError>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            priority: PRIORITY_NORMAL,
            batch_key: None,
            payload_hash: payload_hash.into(),
            timeout: None,
            call: Box::new(move || Box::pin(call())),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_key(mut self, key: impl Into<String>) -> Self {
        self.batch_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

enum Command<T> {
    Submit {
        request: ThrottleRequest<T>,
        respond: Waiter<T>,
    },
    Stats {
        respond: oneshot::Sender<ThrottleStats>,
    },
}

struct Completion<T> {
    seq: u64,
    result: Result<T, LlmError>,
    elapsed: Duration,
}

/// Handle to the throttler actor. Cheap to clone.
pub struct RequestThrottler<T> {
    cmd_tx: mpsc::Sender<Command<T>>,
}

impl<T> Clone for RequestThrottler<T> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> RequestThrottler<T> {
    /// Start the actor on the current tokio runtime.
    ///
    /// The actor stops once every handle is dropped and its queue has drained.
    pub fn spawn(config: ThrottleConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        tokio::spawn(admission_loop(config.normalized(), cmd_rx));
        Self { cmd_tx }
    }

    /// Submit a request and wait for its (possibly shared) result.
    pub async fn submit(&self, request: ThrottleRequest<T>) -> Result<T, LlmError> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit { request, respond })
            .await
            .map_err(|_| LlmError::infra(503, "throttler stopped".to_string()))?;
        rx.await
            .map_err(|_| LlmError::infra(503, "throttler dropped the request".to_string()))?
    }

    /// Snapshot of current pacing and queue state.
    pub async fn stats(&self) -> Option<ThrottleStats> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Stats { respond }).await.ok()?;
        rx.await.ok()
    }
}

struct Entry<T> {
    seq: u64,
    request_id: Uuid,
    priority: u8,
    batch_key: Option<String>,
    payload_hash: String,
    first_enqueued: Instant,
    deadline: Instant,
    timeout: Duration,
    call: Option<ThrottledCall<T>>,
    waiters: Vec<Waiter<T>>,
}

impl<T> Entry<T> {
    fn merges_with(&self, request: &ThrottleRequest<T>) -> bool {
        let same_key = matches!(
            (&self.batch_key, &request.batch_key),
            (Some(a), Some(b)) if a == b
        );
        same_key || self.payload_hash == request.payload_hash
    }

    fn is_full(&self, batch_size: usize) -> bool {
        self.batch_key.is_none() || self.waiters.len() >= batch_size
    }
}

struct Admission<T> {
    config: ThrottleConfig,
    queue: Vec<Entry<T>>,
    in_flight: HashMap<u64, Entry<T>>,
    next_seq: u64,
    current_delay: Duration,
    last_dispatch: Option<Instant>,
    stats: RollingStats,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    arrivals: u32,
    drained: u32,
    total_submitted: u64,
    total_dispatched: u64,
    total_merged: u64,
    total_rejected: u64,
    total_timeouts: u64,
}

impl<T: Clone + Send + 'static> Admission<T> {
    fn new(config: ThrottleConfig) -> Self {
        Self {
            current_delay: config.base_delay,
            stats: RollingStats::new(config.stats_window),
            config,
            queue: Vec::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
            last_dispatch: None,
            consecutive_failures: 0,
            cooldown_until: None,
            arrivals: 0,
            drained: 0,
            total_submitted: 0,
            total_dispatched: 0,
            total_merged: 0,
            total_rejected: 0,
            total_timeouts: 0,
        }
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    fn admit(&mut self, request: ThrottleRequest<T>, respond: Waiter<T>, now: Instant) {
        self.total_submitted += 1;

        if let Some(entry) = self
            .queue
            .iter_mut()
            .chain(self.in_flight.values_mut())
            .find(|e| e.merges_with(&request))
        {
            tracing::trace!(
                request_id = %request.id,
                merged_into = %entry.request_id,
                "Merged request onto existing entry"
            );
            entry.waiters.push(respond);
            entry.priority = entry.priority.min(request.priority);
            self.total_merged += 1;
            return;
        }

        if self.cooling_down(now) && request.priority > self.config.cooldown_bypass_priority {
            self.total_rejected += 1;
            let _ = respond.send(Err(LlmError::infra(
                503,
                "capability provider cooling down".to_string(),
            )));
            return;
        }

        if self.queue.len() >= self.config.max_queue_size {
            self.total_rejected += 1;
            tracing::warn!(queue_len = self.queue.len(), "Throttler queue full, rejecting request");
            let _ = respond.send(Err(LlmError::queue_overflow(self.queue.len())));
            return;
        }

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.arrivals += 1;
        self.queue.push(Entry {
            seq,
            request_id: request.id,
            priority: request.priority,
            batch_key: request.batch_key,
            payload_hash: request.payload_hash,
            first_enqueued: now,
            deadline: now + timeout,
            timeout,
            call: Some(request.call),
            waiters: vec![respond],
        });
    }

    fn ready_at(&self, entry: &Entry<T>) -> Instant {
        if entry.is_full(self.config.batch_size) {
            entry.first_enqueued
        } else {
            entry.first_enqueued + self.config.batch_wait_time
        }
    }

    fn dispatch_gate(&self, now: Instant) -> Instant {
        self.last_dispatch
            .map(|last| last + self.current_delay)
            .unwrap_or(now)
    }

    /// Reject queued entries whose deadline passed before dispatch.
    fn expire(&mut self, now: Instant) {
        let (expired, kept): (Vec<_>, Vec<_>) =
            self.queue.drain(..).partition(|e| e.deadline <= now);
        self.queue = kept;
        for entry in expired {
            self.total_timeouts += 1;
            tracing::debug!(request_id = %entry.request_id, "Queued request timed out");
            let err = LlmError::timeout(entry.timeout);
            for waiter in entry.waiters {
                let _ = waiter.send(Err(err.clone()));
            }
        }
    }

    fn dispatch_due(&mut self, now: Instant, done_tx: &mpsc::UnboundedSender<Completion<T>>) {
        if now < self.dispatch_gate(now) {
            return;
        }
        let slots = self
            .config
            .max_concurrent
            .saturating_sub(self.in_flight.len());
        if slots == 0 {
            return;
        }

        let batch_size = self.config.batch_size;
        let mut ready: Vec<(u8, bool, u64)> = self
            .queue
            .iter()
            .filter(|e| self.ready_at(e) <= now)
            .map(|e| (e.priority, !e.is_full(batch_size), e.seq))
            .collect();
        if ready.is_empty() {
            return;
        }
        ready.sort();

        for (_, _, seq) in ready.into_iter().take(slots) {
            let Some(pos) = self.queue.iter().position(|e| e.seq == seq) else {
                continue;
            };
            let mut entry = self.queue.remove(pos);
            let Some(call) = entry.call.take() else {
                continue;
            };

            tracing::debug!(
                request_id = %entry.request_id,
                priority = entry.priority,
                waiters = entry.waiters.len(),
                delay_ms = self.current_delay.as_millis() as u64,
                "Dispatching capability call"
            );

            let timeout = entry.timeout;
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                // A panicking call must still complete its entry and free the slot
                let guarded = AssertUnwindSafe(async move { call().await }).catch_unwind();
                let result = match tokio::time::timeout(timeout, guarded).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => {
                        tracing::error!(seq, "Capability call panicked");
                        Err(LlmError::infra(500, "capability call panicked".to_string()))
                    }
                    Err(_) => Err(LlmError::timeout(timeout)),
                };
                let _ = done_tx.send(Completion {
                    seq,
                    result,
                    elapsed: started.elapsed(),
                });
            });

            self.in_flight.insert(seq, entry);
            self.total_dispatched += 1;
            self.drained += 1;
            self.last_dispatch = Some(now);
        }
    }

    fn complete(&mut self, done: Completion<T>, now: Instant) {
        let Some(entry) = self.in_flight.remove(&done.seq) else {
            return;
        };

        let overload = matches!(&done.result, Err(e) if e.is_overload());
        self.stats.record(overload, done.elapsed);

        if overload {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.config.failure_threshold && !self.cooling_down(now)
            {
                self.cooldown_until = Some(now + self.config.cooldown);
                tracing::warn!(
                    consecutive_failures = self.consecutive_failures,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Capability provider overloaded, entering cooldown"
                );
                // After the cooldown a full run of failures is needed to trip it again
                self.consecutive_failures = 0;
            }
        } else {
            self.consecutive_failures = 0;
        }

        let signal = AdaptSignal {
            overload_failure: overload,
            mean_response: self.stats.mean_response(),
            window_failures: self.stats.failures(),
            queue_pressure: self.arrivals > self.drained,
        };
        let previous = self.current_delay;
        self.current_delay = adapt_delay(previous, signal, &self.config);
        self.arrivals = 0;
        self.drained = 0;
        if previous != self.current_delay {
            tracing::trace!(
                from_ms = previous.as_millis() as u64,
                to_ms = self.current_delay.as_millis() as u64,
                "Adjusted dispatch delay"
            );
        }

        for waiter in entry.waiters {
            let _ = waiter.send(done.result.clone());
        }
    }

    /// Earliest instant at which `expire` or `dispatch_due` could act.
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        let deadline = self.queue.iter().map(|e| e.deadline).min()?;
        if self.in_flight.len() >= self.config.max_concurrent {
            return Some(deadline);
        }
        let ready = self.queue.iter().map(|e| self.ready_at(e)).min()?;
        let dispatch = ready.max(self.dispatch_gate(now));
        Some(deadline.min(dispatch))
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    fn snapshot(&self, now: Instant) -> ThrottleStats {
        let remaining = self
            .cooldown_until
            .filter(|until| now < *until)
            .map(|until| until.duration_since(now).as_millis() as u64);
        ThrottleStats {
            current_delay_ms: self.current_delay.as_millis() as u64,
            queue_len: self.queue.len(),
            in_flight: self.in_flight.len(),
            total_submitted: self.total_submitted,
            total_dispatched: self.total_dispatched,
            total_merged: self.total_merged,
            total_rejected: self.total_rejected,
            total_timeouts: self.total_timeouts,
            consecutive_failures: self.consecutive_failures,
            cooling_down: remaining.is_some(),
            cooldown_remaining_ms: remaining,
            avg_response_ms: self.stats.mean_response().map(|d| d.as_millis() as u64),
            success_rate: self.stats.success_rate(),
        }
    }
}

async fn admission_loop<T: Clone + Send + 'static>(
    config: ThrottleConfig,
    mut cmd_rx: mpsc::Receiver<Command<T>>,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut state = Admission::new(config);
    let mut accepting = true;

    loop {
        let now = Instant::now();
        state.expire(now);
        state.dispatch_due(now, &done_tx);

        if !accepting && state.is_idle() {
            break;
        }

        let wake = state.next_wake(Instant::now());
        let sleep = async move {
            match wake {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            cmd = cmd_rx.recv(), if accepting => match cmd {
                Some(Command::Submit { request, respond }) => {
                    state.admit(request, respond, Instant::now());
                }
                Some(Command::Stats { respond }) => {
                    let _ = respond.send(state.snapshot(Instant::now()));
                }
                None => accepting = false,
            },
            Some(done) = done_rx.recv() => state.complete(done, Instant::now()),
            _ = sleep => {}
        }
    }

    tracing::debug!("Throttler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn fast_config() -> ThrottleConfig {
        ThrottleConfig {
            base_delay: Duration::from_millis(1),
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            max_concurrent: 4,
            batch_wait_time: Duration::from_millis(150),
            ..ThrottleConfig::default()
        }
    }

    fn counting_request(
        hash: &str,
        counter: Arc<AtomicUsize>,
        result: Result<u32, LlmError>,
        work: Duration,
    ) -> ThrottleRequest<u32> {
        ThrottleRequest::new(hash, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(work).await;
            result
        })
    }

    #[tokio::test]
    async fn test_same_batch_key_shares_one_upstream_call() {
        let throttler = RequestThrottler::spawn(ThrottleConfig {
            batch_size: 10,
            ..fast_config()
        });
        let counter = Arc::new(AtomicUsize::new(0));

        let submits = (0..10).map(|i| {
            let request = counting_request(
                &format!("payload-{}", i),
                counter.clone(),
                Ok(42),
                Duration::from_millis(5),
            )
            .with_batch_key("verify:item-1");
            let throttler = throttler.clone();
            async move { throttler.submit(request).await }
        });
        let results = futures::future::join_all(submits).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| matches!(r, Ok(42))));

        let stats = throttler.stats().await.unwrap();
        assert_eq!(stats.total_submitted, 10);
        assert_eq!(stats.total_merged, 9);
        assert_eq!(stats.total_dispatched, 1);
    }

    #[tokio::test]
    async fn test_identical_payload_merges_onto_in_flight_call() {
        let throttler = RequestThrottler::spawn(fast_config());
        let counter = Arc::new(AtomicUsize::new(0));

        let first = {
            let throttler = throttler.clone();
            let request =
                counting_request("same", counter.clone(), Ok(7), Duration::from_millis(100));
            tokio::spawn(async move { throttler.submit(request).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = throttler
            .submit(counting_request(
                "same",
                counter.clone(),
                Ok(8),
                Duration::from_millis(1),
            ))
            .await;

        assert_eq!(first.await.unwrap().unwrap(), 7);
        assert_eq!(second.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keyed_batch_waits_for_window_when_not_full() {
        let throttler = RequestThrottler::spawn(fast_config());
        let counter = Arc::new(AtomicUsize::new(0));

        let started = Instant::now();
        let result = throttler
            .submit(
                counting_request("lonely", counter.clone(), Ok(1), Duration::ZERO)
                    .with_batch_key("k"),
            )
            .await;

        assert_eq!(result.unwrap(), 1);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_consecutive_overload_opens_cooldown() {
        let throttler = RequestThrottler::spawn(ThrottleConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(10),
            ..fast_config()
        });
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let result = throttler
                .submit(counting_request(
                    &format!("fail-{}", i),
                    counter.clone(),
                    Err(LlmError::infra(503, "overloaded".to_string())),
                    Duration::ZERO,
                ))
                .await;
            assert_eq!(result.unwrap_err().kind, LlmErrorKind::Infra);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        // Sixth non-critical request fails fast without reaching upstream
        let started = Instant::now();
        let err = throttler
            .submit(counting_request(
                "sixth",
                counter.clone(),
                Ok(1),
                Duration::ZERO,
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Infra);
        assert_eq!(err.status_code, Some(503));
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        // Critical requests still go through
        let ok = throttler
            .submit(
                counting_request("critical", counter.clone(), Ok(9), Duration::ZERO)
                    .with_priority(PRIORITY_CRITICAL),
            )
            .await;
        assert_eq!(ok.unwrap(), 9);
        assert_eq!(counter.load(Ordering::SeqCst), 6);

        let stats = throttler.stats().await.unwrap();
        assert!(stats.cooling_down);
        assert_eq!(stats.total_rejected, 1);
    }

    #[tokio::test]
    async fn test_overload_raises_current_delay() {
        let throttler = RequestThrottler::spawn(fast_config());
        let counter = Arc::new(AtomicUsize::new(0));

        let before = throttler.stats().await.unwrap().current_delay_ms;
        let _ = throttler
            .submit(counting_request(
                "slow",
                counter,
                Err(LlmError::timeout(Duration::from_secs(1))),
                Duration::ZERO,
            ))
            .await;
        let after = throttler.stats().await.unwrap().current_delay_ms;

        assert!(after > before);
        assert!(after <= 20);
    }

    #[tokio::test]
    async fn test_queue_overflow_rejects_new_entries() {
        let throttler = RequestThrottler::spawn(ThrottleConfig {
            max_concurrent: 1,
            max_queue_size: 2,
            ..fast_config()
        });
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let throttler = throttler.clone();
            let request =
                counting_request(name, counter.clone(), Ok(1), Duration::from_millis(200));
            handles.push(tokio::spawn(async move { throttler.submit(request).await }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let err = throttler
            .submit(counting_request(
                "d",
                counter.clone(),
                Ok(1),
                Duration::ZERO,
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::QueueOverflow);

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_higher_priority_dispatches_first() {
        let throttler = RequestThrottler::spawn(ThrottleConfig {
            max_concurrent: 1,
            ..fast_config()
        });
        let order = Arc::new(Mutex::new(Vec::new()));

        let tracked = |name: &'static str, priority: u8| {
            let order = order.clone();
            ThrottleRequest::new(name, move || async move {
                order.lock().unwrap().push(name);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<u32, LlmError>(0)
            })
            .with_priority(priority)
        };

        let blocker = {
            let throttler = throttler.clone();
            let request = tracked("blocker", PRIORITY_NORMAL);
            tokio::spawn(async move { throttler.submit(request).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let low = {
            let throttler = throttler.clone();
            let request = tracked("low", PRIORITY_BACKGROUND);
            tokio::spawn(async move { throttler.submit(request).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let high = {
            let throttler = throttler.clone();
            let request = tracked("high", 1);
            tokio::spawn(async move { throttler.submit(request).await })
        };

        for handle in [blocker, low, high] {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["blocker", "high", "low"]);
    }

    #[tokio::test]
    async fn test_panicking_call_releases_its_slot() {
        let throttler = RequestThrottler::spawn(ThrottleConfig {
            max_concurrent: 1,
            ..fast_config()
        });
        let counter = Arc::new(AtomicUsize::new(0));

        let exploding = ThrottleRequest::new("explode", || async {
            if true {
                panic!("provider client blew up");
            }
            Ok::<u32, LlmError>(0)
        });
        let err = tokio::time::timeout(Duration::from_secs(2), throttler.submit(exploding))
            .await
            .expect("panicking call must still resolve")
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Infra);

        let ok = tokio::time::timeout(
            Duration::from_secs(2),
            throttler.submit(counting_request("healthy", counter.clone(), Ok(3), Duration::ZERO)),
        )
        .await
        .expect("slot must be free again");
        assert_eq!(ok.unwrap(), 3);

        let stats = throttler.stats().await.unwrap();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.queue_len, 0);
    }

    #[tokio::test]
    async fn test_critical_merge_raises_queued_priority() {
        let throttler = RequestThrottler::spawn(ThrottleConfig {
            max_concurrent: 1,
            ..fast_config()
        });
        let order = Arc::new(Mutex::new(Vec::new()));

        let tracked = |name: &'static str, priority: u8| {
            let order = order.clone();
            ThrottleRequest::new(name, move || async move {
                order.lock().unwrap().push(name);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<u32, LlmError>(0)
            })
            .with_priority(priority)
        };

        let mut handles = Vec::new();
        for (name, priority) in [
            ("blocker", PRIORITY_NORMAL),
            ("shared", PRIORITY_BACKGROUND),
            ("normal", PRIORITY_NORMAL),
            ("shared", PRIORITY_CRITICAL),
        ] {
            let throttler = throttler.clone();
            let request = tracked(name, priority);
            handles.push(tokio::spawn(async move { throttler.submit(request).await }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["blocker", "shared", "normal"]);
    }

    #[tokio::test]
    async fn test_cooldown_needs_fresh_failure_run_to_reopen() {
        let throttler = RequestThrottler::spawn(ThrottleConfig {
            failure_threshold: 2,
            cooldown: Duration::from_millis(100),
            ..fast_config()
        });
        let counter = Arc::new(AtomicUsize::new(0));
        let failing = |name: &str| {
            counting_request(
                name,
                counter.clone(),
                Err(LlmError::infra(503, "overloaded".to_string())),
                Duration::ZERO,
            )
        };

        for name in ["f1", "f2"] {
            assert!(throttler.submit(failing(name)).await.is_err());
        }
        let stats = throttler.stats().await.unwrap();
        assert!(stats.cooling_down);
        assert_eq!(stats.consecutive_failures, 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(throttler.submit(failing("f3")).await.is_err());

        let stats = throttler.stats().await.unwrap();
        assert!(!stats.cooling_down);
        assert_eq!(stats.consecutive_failures, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_call_timeout_is_reported_as_timeout() {
        let throttler = RequestThrottler::spawn(fast_config());
        let counter = Arc::new(AtomicUsize::new(0));

        let err = throttler
            .submit(
                counting_request("hang", counter, Ok(1), Duration::from_secs(5))
                    .with_timeout(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Timeout);
    }
}
