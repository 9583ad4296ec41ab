//! CircuitBreaker - 失敗しうる依存先の前に置くブレーカー
//!
//! # 学習ポイント
//! - 状態とカウンタを 1 つの Mutex にまとめる（スナップショットが常に一貫）
//! - epoch で reset / trip より前に始まった呼び出しの結果を捨てる
//! - drop guard（`CallPermit`）で途中キャンセルを失敗として数える
//!
//! ## States
//!
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected with `CircuitOpen` without touching the
//!   dependency, until `reset_timeout` has passed since the circuit opened
//! - **HalfOpen**: one trial call at a time; `success_threshold` consecutive
//!   successes close the circuit, any failure reopens it
//!
//! State and counters live under one mutex. The Open -> HalfOpen check and
//! transition happen in the same critical section, so when many callers
//! arrive after the timeout exactly one of them runs the probe.
//!
//! Every transition is logged, sent to the configured `EventSink`s and to
//! `subscribe()`rs.

mod window;

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::BreakerConfig;
use crate::domain::{CircuitState, Event, StateTransition};
use crate::error::{BreakerError, CircuitOpen, ConfigError};
use crate::impls::SinkSet;
use crate::ports::EventSink;

use self::window::OutcomeWindow;

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Point-in-time view of a breaker. Read under the breaker lock, so state and
/// counters are always consistent with each other.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub total_timeouts: u64,
    /// Failure ratio over the configured window, if a failure-rate rule is set.
    pub failure_rate: Option<f64>,
    /// Time left before the next probe is admitted (Open only).
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    successes: u64,
    failures: u64,
    rejections: u64,
    timeouts: u64,
}

struct Inner {
    state: CircuitState,
    /// Bumped on every transition; outcomes from an older epoch are counted
    /// in totals but do not drive transitions.
    epoch: u64,
    consecutive_failures: u32,
    half_open_successes: u32,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
    window: Option<OutcomeWindow>,
    totals: Totals,
}

impl Inner {
    fn transition(&mut self, name: &str, to: CircuitState) -> StateTransition {
        let from = self.state;
        self.state = to;
        self.epoch += 1;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.probe_in_flight = false;
        if let Some(window) = self.window.as_mut() {
            window.clear();
        }
        self.opened_at = match to {
            CircuitState::Open => Some(Instant::now()),
            CircuitState::HalfOpen => self.opened_at,
            CircuitState::Closed => None,
        };
        StateTransition::new(name, from, to)
    }

    fn retry_in(&self, reset_timeout: Duration) -> Duration {
        self.opened_at
            .map(|at| reset_timeout.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    sinks: SinkSet,
    transitions: broadcast::Sender<StateTransition>,
}

impl CircuitBreaker {
    /// Create a breaker in the Closed state.
    ///
    /// # Arguments
    ///
    /// * `name` - Dependency name used in logs and transition events
    /// * `config` - Validated before use
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();

        info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            reset_timeout = ?config.reset_timeout,
            "Initialized circuit breaker"
        );

        let (transitions, _rx) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                epoch: 0,
                consecutive_failures: 0,
                half_open_successes: 0,
                probe_in_flight: false,
                opened_at: None,
                window: config.failure_rate.clone().map(OutcomeWindow::new),
                totals: Totals::default(),
            }),
            name,
            config,
            sinks: SinkSet::new(),
            transitions,
        })
    }

    /// Add a sink that receives every transition.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            total_successes: inner.totals.successes,
            total_failures: inner.totals.failures,
            total_rejections: inner.totals.rejections,
            total_timeouts: inner.totals.timeouts,
            failure_rate: inner.window.as_ref().and_then(|w| w.failure_rate()),
            retry_in: (inner.state == CircuitState::Open)
                .then(|| inner.retry_in(self.config.reset_timeout)),
        }
    }

    /// Stream of transitions. Lagging receivers lose the oldest entries.
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Run `op` under breaker protection.
    ///
    /// Returns `BreakerError::Open` without calling `op` when the circuit is
    /// open (or a half-open trial is already running).
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let permit = self.admit().map_err(BreakerError::Open)?;
        self.run(permit, op).await
    }

    /// Like `execute`, but runs `fallback` instead of failing when the
    /// circuit rejects the call. The fallback is not a dependency call and
    /// does not affect the breaker's counters.
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        op: F,
        fallback: G,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(CircuitOpen) -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: Display,
    {
        match self.admit() {
            Ok(permit) => self.run(permit, op).await,
            Err(open) => {
                debug!(breaker = %self.name, "Circuit open, serving fallback");
                fallback(open).await.map_err(BreakerError::Failure)
            }
        }
    }

    /// Force the circuit closed and clear counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            (inner.state != CircuitState::Closed)
                .then(|| inner.transition(&self.name, CircuitState::Closed))
        };
        if let Some(t) = transition {
            self.publish(t);
        }
    }

    /// Force the circuit open; the reset timeout starts now.
    pub fn trip(&self) {
        let transition = {
            let mut inner = self.lock();
            (inner.state != CircuitState::Open)
                .then(|| inner.transition(&self.name, CircuitState::Open))
        };
        if let Some(t) = transition {
            self.publish(t);
        }
    }

    async fn run<F, Fut, T, E>(&self, permit: CallPermit<'_>, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let outcome = match self.config.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result.map_err(BreakerError::Failure),
                Err(_elapsed) => Err(BreakerError::Timeout(limit)),
            },
            None => op().await.map_err(BreakerError::Failure),
        };

        match &outcome {
            Ok(_) => permit.finish(Verdict::Success),
            Err(BreakerError::Timeout(limit)) => {
                warn!(breaker = %self.name, limit = ?limit, "Call timed out");
                permit.finish(Verdict::TimedOut)
            }
            Err(err) => {
                debug!(breaker = %self.name, error = %err, "Call failed");
                permit.finish(Verdict::Failure)
            }
        }
        outcome
    }

    /// Decide whether a call may proceed. Holds the lock for the whole
    /// check-and-transition.
    fn admit(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        let mut transition = None;
        let admitted = {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                CircuitState::Closed => Ok((inner.epoch, false)),
                CircuitState::Open => {
                    let retry_in = inner.retry_in(self.config.reset_timeout);
                    if retry_in.is_zero() {
                        transition = Some(inner.transition(&self.name, CircuitState::HalfOpen));
                        inner.probe_in_flight = true;
                        Ok((inner.epoch, true))
                    } else {
                        inner.totals.rejections += 1;
                        Err(retry_in)
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        inner.totals.rejections += 1;
                        Err(Duration::ZERO)
                    } else {
                        inner.probe_in_flight = true;
                        Ok((inner.epoch, true))
                    }
                }
            }
        };

        if let Some(t) = transition {
            self.publish(t);
        }

        match admitted {
            Ok((epoch, probe)) => Ok(CallPermit {
                breaker: self,
                epoch,
                probe,
                finished: false,
            }),
            Err(retry_in) => {
                debug!(breaker = %self.name, retry_in = ?retry_in, "Circuit open, rejecting call");
                Err(CircuitOpen {
                    breaker: self.name.clone(),
                    retry_in,
                })
            }
        }
    }

    fn record(&self, epoch: u64, probe: bool, verdict: Verdict) {
        let transition = {
            let mut inner = self.lock();
            let failed = !matches!(verdict, Verdict::Success);
            match verdict {
                Verdict::Success => inner.totals.successes += 1,
                Verdict::Failure | Verdict::Abandoned => inner.totals.failures += 1,
                Verdict::TimedOut => {
                    inner.totals.failures += 1;
                    inner.totals.timeouts += 1;
                }
            }

            if inner.epoch != epoch {
                None
            } else {
                if probe {
                    inner.probe_in_flight = false;
                }
                let state = inner.state;
                match state {
                    CircuitState::Closed => self.on_closed_outcome(&mut inner, failed),
                    CircuitState::HalfOpen if failed => {
                        Some(inner.transition(&self.name, CircuitState::Open))
                    }
                    CircuitState::HalfOpen => {
                        inner.half_open_successes += 1;
                        (inner.half_open_successes >= self.config.success_threshold)
                            .then(|| inner.transition(&self.name, CircuitState::Closed))
                    }
                    // Nothing is admitted in Open within the same epoch.
                    CircuitState::Open => None,
                }
            }
        };

        if let Some(t) = transition {
            self.publish(t);
        }
    }

    fn on_closed_outcome(&self, inner: &mut Inner, failed: bool) -> Option<StateTransition> {
        if let Some(window) = inner.window.as_mut() {
            window.record(failed);
        }
        if !failed {
            inner.consecutive_failures = 0;
            return None;
        }

        inner.consecutive_failures += 1;
        let by_count = inner.consecutive_failures >= self.config.failure_threshold;
        let by_rate = inner.window.as_ref().is_some_and(|w| w.tripped());
        if !(by_count || by_rate) {
            return None;
        }

        error!(
            breaker = %self.name,
            consecutive_failures = inner.consecutive_failures,
            threshold = self.config.failure_threshold,
            failure_rate = ?inner.window.as_ref().and_then(|w| w.failure_rate()),
            "Failure threshold reached"
        );
        Some(inner.transition(&self.name, CircuitState::Open))
    }

    fn publish(&self, transition: StateTransition) {
        match transition.to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = %transition.from,
                "Circuit breaker transition: {} → open",
                transition.from
            ),
            to => info!(
                breaker = %self.name,
                from = %transition.from,
                "Circuit breaker transition: {} → {}",
                transition.from,
                to
            ),
        }

        self.sinks.emit(&Event::Transition(transition.clone()));
        // No subscribers is fine.
        let _ = self.transitions.send(transition);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
enum Verdict {
    Success,
    Failure,
    TimedOut,
    /// The call's future was dropped before it finished.
    Abandoned,
}

/// An admitted call. Dropping it without `finish` counts as a failure, so a
/// caller that is cancelled mid-call cannot leave a half-open trial stuck.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    probe: bool,
    finished: bool,
}

impl CallPermit<'_> {
    fn finish(mut self, verdict: Verdict) {
        self.finished = true;
        self.breaker.record(self.epoch, self.probe, verdict);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(breaker = %self.breaker.name, "Call abandoned before completion");
            self.breaker.record(self.epoch, self.probe, Verdict::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("dependency down")]
    struct Down;

    fn breaker(failure: u32, success: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig::new(failure, success, Duration::from_millis(reset_ms)),
        )
        .unwrap()
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<Down>> {
        b.execute(|| async { Err::<(), _>(Down) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), BreakerError<Down>> {
        b.execute(|| async { Ok::<_, Down>(()) }).await
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = CircuitBreaker::new("bad", BreakerConfig::new(0, 1, Duration::from_secs(1)));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let b = breaker(3, 1, 1_000);

        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        succeed(&b).await.unwrap();
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();

        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 2);
        assert_eq!(snap.total_failures, 4);
        assert_eq!(snap.total_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_opens_then_probe_recovers() {
        let b = breaker(3, 2, 1_000);
        for _ in 0..3 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Failure(Down))));
        }
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result = b
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Down>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1_001)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_reschedules() {
        let b = breaker(1, 3, 100);
        fail(&b).await.unwrap_err();

        tokio::time::sleep(Duration::from_millis(150)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        // Timeout restarts from the new Open transition.
        let retry_in = b.snapshot().retry_in.unwrap();
        assert_eq!(retry_in, Duration::from_millis(100));
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_probe_is_admitted() {
        let b = Arc::new(breaker(1, 1, 100));
        fail(&b).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let invoked = Arc::new(AtomicUsize::new(0));
        let mut calls = Vec::new();
        for _ in 0..10 {
            let b = Arc::clone(&b);
            let invoked = Arc::clone(&invoked);
            calls.push(tokio::spawn(async move {
                b.execute(|| async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, Down>(())
                })
                .await
            }));
        }

        let mut rejected = 0;
        for call in calls {
            if matches!(call.await.unwrap(), Err(BreakerError::Open(_))) {
                rejected += 1;
            }
        }

        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(rejected, 9);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_runs_when_open_and_is_not_counted() {
        let b = breaker(1, 1, 1_000);
        fail(&b).await.unwrap_err();
        let before = b.snapshot();

        let value = b
            .execute_with_fallback(
                || async { Ok::<_, Down>("live") },
                |open| async move {
                    assert_eq!(open.breaker, "test");
                    Ok("cached")
                },
            )
            .await
            .unwrap();

        assert_eq!(value, "cached");
        let after = b.snapshot();
        assert_eq!(after.total_failures, before.total_failures);
        assert_eq!(after.total_successes, before.total_successes);
        assert_eq!(after.total_rejections, before.total_rejections + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_and_counts_as_failure() {
        let config = BreakerConfig::new(1, 1, Duration::from_secs(5))
            .with_operation_timeout(Duration::from_millis(100));
        let b = CircuitBreaker::new("slow", config).unwrap();

        let result = b
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, Down>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout(_))));
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.snapshot().total_timeouts, 1);
    }

    #[tokio::test]
    async fn failure_rate_trips_before_consecutive_threshold() {
        let config =
            BreakerConfig::new(100, 1, Duration::from_secs(5)).with_failure_rate(0.5, 4, 4);
        let b = CircuitBreaker::new("rate", config).unwrap();

        succeed(&b).await.unwrap();
        fail(&b).await.unwrap_err();
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_reach_sinks_and_subscribers() {
        let sink = Arc::new(MemorySink::new());
        let b = breaker(1, 1, 100).with_sink(sink.clone());
        let mut rx = b.subscribe();

        fail(&b).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(100)).await;
        succeed(&b).await.unwrap();

        let seen: Vec<_> = sink.transitions().iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.breaker, "test");
        assert_eq!(first.to, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_counts_as_failure() {
        let b = breaker(1, 1, 1_000);

        let call = b.execute(|| async {
            std::future::pending::<()>().await;
            Ok::<_, Down>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), call).await;

        assert!(timed_out.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn outcome_from_previous_epoch_is_ignored() {
        let b = Arc::new(breaker(5, 1, 60_000));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();

        let call = tokio::spawn({
            let b = Arc::clone(&b);
            async move {
                b.execute(|| async {
                    started_tx.send(()).ok();
                    go_rx.await.ok();
                    Ok::<_, Down>(())
                })
                .await
            }
        });

        started_rx.await.unwrap();
        b.trip();
        go_tx.send(()).unwrap();
        call.await.unwrap().unwrap();

        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.snapshot().total_successes, 1);
    }

    #[tokio::test]
    async fn reset_closes_and_emits() {
        let b = breaker(1, 1, 60_000);
        let mut rx = b.subscribe();
        fail(&b).await.unwrap_err();

        b.reset();
        b.reset();

        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(rx.recv().await.unwrap().to, CircuitState::Open);
        assert_eq!(rx.recv().await.unwrap().to, CircuitState::Closed);
        assert!(rx.try_recv().is_err());
    }
}
