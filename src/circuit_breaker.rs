//! Circuit breaker guarding calls to the distributed backend.

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    TokengateError,
    clock::{Clock, SystemClock},
};

/// Number of slots the sampling window is split into.
const SAMPLING_SLOTS: u64 = 10;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; outcomes are sampled.
    Closed,
    /// Calls are rejected until the break duration elapses.
    Open,
    /// A single trial call decides whether to close or reopen.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A state transition, passed to [`CircuitBreaker::on_state_change`] callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition.
    pub from: CircuitState,
    /// State after the transition.
    pub to: CircuitState,
}

/// Validated configuration for [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    failure_ratio: f64,
    minimum_throughput: usize,
    sampling_duration: Duration,
    break_duration: Duration,
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    ///
    /// - `failure_ratio`: share of failed calls in the sampling window that opens
    ///   the circuit, in `(0, 1]`
    /// - `minimum_throughput`: calls the window must contain before it can trip, `> 0`
    /// - `sampling_duration`: length of the rolling window, `> 0`
    /// - `break_duration`: time spent open before a trial call, `> 0`
    pub fn new(
        failure_ratio: f64,
        minimum_throughput: usize,
        sampling_duration: Duration,
        break_duration: Duration,
    ) -> Result<Self, TokengateError> {
        if !(failure_ratio > 0.0 && failure_ratio <= 1.0) {
            return Err(TokengateError::InvalidCircuitBreakerConfig(format!(
                "failure_ratio must be in (0, 1] (got {failure_ratio})"
            )));
        }
        if minimum_throughput == 0 {
            return Err(TokengateError::InvalidCircuitBreakerConfig(
                "minimum_throughput must be > 0".to_string(),
            ));
        }
        if sampling_duration.is_zero() {
            return Err(TokengateError::InvalidCircuitBreakerConfig(
                "sampling_duration must be > 0".to_string(),
            ));
        }
        if break_duration.is_zero() {
            return Err(TokengateError::InvalidCircuitBreakerConfig(
                "break_duration must be > 0".to_string(),
            ));
        }

        Ok(Self {
            failure_ratio,
            minimum_throughput,
            sampling_duration,
            break_duration,
        })
    }

    /// Failure ratio that opens the circuit.
    pub fn failure_ratio(&self) -> f64 {
        self.failure_ratio
    }

    /// Calls required in the window before the ratio is considered.
    pub fn minimum_throughput(&self) -> usize {
        self.minimum_throughput
    }

    /// Length of the rolling sampling window.
    pub fn sampling_duration(&self) -> Duration {
        self.sampling_duration
    }

    /// Time spent open before the trial call.
    pub fn break_duration(&self) -> Duration {
        self.break_duration
    }
}

impl Default for CircuitBreakerConfig {
    /// Ratio 1.0, minimum throughput 5, 30s sampling window, 15s break.
    fn default() -> Self {
        Self {
            failure_ratio: 1.0,
            minimum_throughput: 5,
            sampling_duration: Duration::from_secs(30),
            break_duration: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    started_ms: u64,
    successes: usize,
    failures: usize,
}

/// Outcome counts over the last `duration_ms`, kept in fixed-width slots.
#[derive(Debug)]
struct SamplingWindow {
    duration_ms: u64,
    slot_ms: u64,
    slots: VecDeque<Slot>,
}

impl SamplingWindow {
    fn new(duration: Duration) -> Self {
        let duration_ms = u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);

        Self {
            duration_ms,
            slot_ms: (duration_ms / SAMPLING_SLOTS).max(1),
            slots: VecDeque::new(),
        }
    }

    fn record(&mut self, now_ms: u64, success: bool) {
        while self
            .slots
            .front()
            .is_some_and(|slot| now_ms.saturating_sub(slot.started_ms) >= self.duration_ms)
        {
            self.slots.pop_front();
        }

        let needs_slot = match self.slots.back() {
            Some(slot) => now_ms.saturating_sub(slot.started_ms) >= self.slot_ms,
            None => true,
        };

        if needs_slot {
            self.slots.push_back(Slot {
                started_ms: now_ms,
                successes: 0,
                failures: 0,
            });
        }

        if let Some(slot) = self.slots.back_mut() {
            if success {
                slot.successes += 1;
            } else {
                slot.failures += 1;
            }
        }
    }

    /// `(total, failures)` across live slots.
    fn totals(&self) -> (usize, usize) {
        self.slots.iter().fold((0, 0), |(total, failures), slot| {
            (total + slot.successes + slot.failures, failures + slot.failures)
        })
    }
}

#[derive(Debug)]
enum State {
    Closed(SamplingWindow),
    Open { until_ms: u64 },
    HalfOpen,
}

impl State {
    fn kind(&self) -> CircuitState {
        match self {
            State::Closed(_) => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    /// Bumped on every transition; outcomes of calls admitted under an older
    /// generation are ignored.
    generation: u64,
}

type StateChangeCallback = Arc<dyn Fn(StateChange) + Send + Sync>;

/// Three-state circuit breaker.
///
/// Clones share the same state, so every handle observes and affects one circuit.
///
/// # Behavior
///
/// - **Closed:** calls run; outcomes are counted over a rolling window of
///   `sampling_duration`. Once the window holds at least `minimum_throughput`
///   calls and the failure share reaches `failure_ratio`, the circuit opens.
/// - **Open:** calls fail immediately with [`TokengateError::CircuitOpen`] until
///   `break_duration` has passed.
/// - **Half-open:** the first caller after the break runs as the trial; others are
///   rejected meanwhile. Success closes the circuit, failure reopens it.
///
/// A call whose future is dropped before it finishes counts as a failure.
///
/// # Examples
///
/// ```
/// use tokengate::{CircuitBreaker, CircuitBreakerConfig, TokengateError};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())
///     .on_state_change(|change| println!("{} -> {}", change.from, change.to));
///
/// let value = breaker.call(|| async { Ok::<_, TokengateError>(42) }).await.unwrap();
/// assert_eq!(value, 42);
/// # });
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<Inner>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    callbacks: Vec<StateChangeCallback>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed circuit breaker using the system clock.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let window = SamplingWindow::new(config.sampling_duration);

        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Closed(window),
                generation: 0,
            })),
            config,
            clock: Arc::new(SystemClock),
            callbacks: Vec::new(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a callback invoked after every state transition.
    ///
    /// Callbacks run on the thread that caused the transition, after the internal
    /// lock has been released.
    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(StateChange) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open circuit whose break has elapsed still reports
    /// [`CircuitState::Open`] until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state.kind()
    }

    /// Run `operation` under circuit breaker protection.
    ///
    /// # Errors
    ///
    /// Returns [`TokengateError::CircuitOpen`] without running `operation` when
    /// the circuit is open or a trial call is already in flight. Otherwise returns
    /// whatever `operation` returns; any `Err` counts as a failure.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, TokengateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TokengateError>>,
    {
        let permit = self.acquire()?;
        let result = operation().await;

        match &result {
            Ok(_) => permit.succeed(),
            Err(err) => {
                tracing::debug!(error = %err, "Circuit breaker recorded failure");
                permit.fail();
            }
        }

        result
    } // end method call

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Result<Permit<'_>, TokengateError> {
        let now_ms = self.clock.now_millis();

        let (admitted, change) = {
            let mut inner = self.lock();

            let probe = match inner.state {
                State::Closed(_) => Ok(false),
                State::Open { until_ms } if now_ms >= until_ms => Ok(true),
                State::Open { until_ms } => Err(TokengateError::CircuitOpen {
                    retry_in: Duration::from_millis(until_ms - now_ms),
                }),
                State::HalfOpen => Err(TokengateError::CircuitOpen {
                    retry_in: Duration::ZERO,
                }),
            };

            let change = match probe {
                Ok(true) => Some(self.transition(&mut inner, State::HalfOpen)),
                _ => None,
            };

            (probe.map(|_| inner.generation), change)
        };

        self.notify(change);

        admitted.map(|generation| Permit {
            breaker: self,
            generation,
            settled: false,
        })
    }

    fn record(&self, generation: u64, success: bool) {
        let now_ms = self.clock.now_millis();

        let change = {
            let mut inner = self.lock();

            if inner.generation != generation {
                return;
            }

            let next = match &mut inner.state {
                State::Closed(window) => {
                    window.record(now_ms, success);

                    let (total, failures) = window.totals();
                    let tripped = !success
                        && total >= self.config.minimum_throughput
                        && failures as f64 / total as f64 >= self.config.failure_ratio;

                    tripped.then(|| State::Open {
                        until_ms: now_ms.saturating_add(self.break_ms()),
                    })
                }
                State::HalfOpen if success => Some(State::Closed(SamplingWindow::new(
                    self.config.sampling_duration,
                ))),
                State::HalfOpen => Some(State::Open {
                    until_ms: now_ms.saturating_add(self.break_ms()),
                }),
                State::Open { .. } => None,
            };

            next.map(|next| self.transition(&mut inner, next))
        };

        self.notify(change);
    } // end method record

    fn break_ms(&self) -> u64 {
        u64::try_from(self.config.break_duration.as_millis()).unwrap_or(u64::MAX)
    }

    fn transition(&self, inner: &mut Inner, to: State) -> StateChange {
        let change = StateChange {
            from: inner.state.kind(),
            to: to.kind(),
        };

        inner.state = to;
        inner.generation = inner.generation.wrapping_add(1);

        match change.to {
            CircuitState::Open => tracing::warn!(
                break_duration_secs = self.config.break_duration.as_secs_f64(),
                "Circuit breaker opened; backend calls are short-circuited until it resets"
            ),
            CircuitState::Closed => tracing::info!("Circuit breaker closed; resuming backend calls"),
            CircuitState::HalfOpen => {
                tracing::debug!("Circuit breaker half-opened; probing backend")
            }
        }

        change
    }

    fn notify(&self, change: Option<StateChange>) {
        let Some(change) = change else {
            return;
        };

        for callback in &self.callbacks {
            callback(change);
        }
    }
} // end of impl

/// Admission ticket for one call. Dropping it unsettled records a failure.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, true);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, false);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!("Circuit breaker call cancelled before completion");
            self.breaker.record(self.generation, false);
        }
    }
}
