//! Circuit breaker for calls to the identity provider.
//!
//! The breaker tracks the outcome of recent calls in a count-based rolling
//! window and stops calling the IdP while it looks unhealthy.
//!
//! # States
//!
//! - **Closed**: Normal operation. Calls pass through and outcomes are recorded.
//! - **Open**: The failure rate reached the threshold. Calls are rejected
//!   immediately, without touching the network.
//! - **Half-Open**: The wait elapsed. Exactly one trial call is admitted; its
//!   outcome closes the circuit or opens it again.
//!
//! # Usage
//!
//! ```rust,ignore
//! let breaker = CircuitBreaker::new("idp_metadata", &config, clock);
//!
//! breaker.check()?;
//! match fetch().await {
//!     Ok(_) => breaker.record_success(),
//!     Err(_) => breaker.record_failure(),
//! }
//! ```

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{clock::SharedClock, config::CircuitBreakerConfig};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through.
    Closed,
    /// Circuit tripped - calls are rejected.
    Open,
    /// Testing recovery - a single trial call is allowed.
    HalfOpen,
}

/// Error returned when the circuit breaker rejects a call.
#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker is open for '{name}' - rejecting call (retry in {retry_after_ms}ms)")]
    Open { name: Arc<str>, retry_after_ms: u64 },
}

// State encoding: upper 2 bits = state, lower 30 bits = counter
const STATE_CLOSED: u32 = 0;
const STATE_OPEN: u32 = 1;
const STATE_HALF_OPEN: u32 = 2;
const STATE_SHIFT: u32 = 30;
const COUNTER_MASK: u32 = (1 << STATE_SHIFT) - 1;

/// Trial calls admitted per half-open period.
const HALF_OPEN_PERMITS: u32 = 1;

/// Thread-safe circuit breaker.
///
/// `check()` only reads atomics, so a caller that finds the circuit open
/// never blocks. Outcome recording serializes on the window lock, which also
/// guards the Closed to Open and Half-Open to Closed/Open transitions.
pub struct CircuitBreaker {
    /// Name for logging.
    name: Arc<str>,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    /// Packed state: upper 2 bits = state, lower 30 bits = counter.
    /// Closed: failures in the window. Half-open: trial calls admitted.
    state_and_counter: AtomicU32,
    /// When the circuit was opened, or when the current trial was admitted
    /// (millis since UNIX epoch).
    opened_at: AtomicU64,
    /// Current open duration in milliseconds (adaptive backoff).
    current_wait_millis: AtomicU64,
    /// Number of consecutive opens without a successful recovery.
    consecutive_opens: AtomicU32,
    window: Mutex<OutcomeWindow>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<Arc<str>>, config: &CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config: config.clone(),
            clock,
            state_and_counter: AtomicU32::new(pack_state(STATE_CLOSED, 0)),
            opened_at: AtomicU64::new(0),
            current_wait_millis: AtomicU64::new(config.wait_duration_ms),
            consecutive_opens: AtomicU32::new(0),
            window: Mutex::new(OutcomeWindow::new(config.sliding_window_size.max(1) as usize)),
        }
    }

    /// Check if a call is allowed through the circuit breaker.
    ///
    /// Returns `Ok(())` if the call can proceed, or `Err` if the circuit is
    /// open or the single half-open trial is already in flight.
    pub fn check(&self) -> Result<(), CircuitBreakerError> {
        if !self.config.enabled {
            return Ok(());
        }

        let packed = self.state_and_counter.load(Ordering::Acquire);
        let (state, counter) = unpack_state(packed);

        match state {
            STATE_CLOSED => Ok(()),
            STATE_OPEN => {
                let opened_at = self.opened_at.load(Ordering::Acquire);
                let now = self.clock.now_millis();
                let wait_millis = self.current_wait_millis.load(Ordering::Acquire);
                let ready_at = opened_at.saturating_add(wait_millis);

                if now < ready_at {
                    return Err(self.open_error(ready_at - now));
                }

                // Only the caller that wins the swap becomes the trial call
                if self
                    .state_and_counter
                    .compare_exchange(
                        packed,
                        pack_state(STATE_HALF_OPEN, HALF_OPEN_PERMITS),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.opened_at.store(now, Ordering::Release);
                    info!(
                        breaker = %self.name,
                        "Circuit breaker HALF-OPEN - admitting trial call"
                    );
                    Ok(())
                } else {
                    Err(self.open_error(0))
                }
            }
            STATE_HALF_OPEN => {
                // A trial whose outcome was never recorded (dropped future)
                // gives up its permit after another full wait
                let admitted_at = self.opened_at.load(Ordering::Acquire);
                let now = self.clock.now_millis();
                let wait_millis = self.current_wait_millis.load(Ordering::Acquire);
                let ready_at = admitted_at.saturating_add(wait_millis);

                if counter < HALF_OPEN_PERMITS || now >= ready_at {
                    if self
                        .state_and_counter
                        .compare_exchange(
                            packed,
                            pack_state(STATE_HALF_OPEN, HALF_OPEN_PERMITS),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.opened_at.store(now, Ordering::Release);
                        debug!(breaker = %self.name, "Circuit breaker: trial permit re-issued");
                        return Ok(());
                    }
                    return Err(self.open_error(0));
                }

                Err(self.open_error(ready_at.saturating_sub(now)))
            }
            _ => Ok(()), // Unknown state, allow through
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }

        let mut window = self.window.lock();
        let packed = self.state_and_counter.load(Ordering::Acquire);
        let (state, _) = unpack_state(packed);

        match state {
            STATE_CLOSED => {
                window.record(false);
                self.state_and_counter.store(
                    pack_state(STATE_CLOSED, window.failures() as u32),
                    Ordering::Release,
                );
            }
            STATE_HALF_OPEN => self.transition_to_closed(&mut window),
            // Late result of a call admitted before the circuit opened
            _ => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }

        let mut window = self.window.lock();
        let packed = self.state_and_counter.load(Ordering::Acquire);
        let (state, _) = unpack_state(packed);

        match state {
            STATE_CLOSED => {
                window.record(true);
                let failures = window.failures();
                let total = window.len();
                let failure_rate = window.failure_rate();

                if total >= self.config.effective_minimum_calls()
                    && failure_rate >= self.config.failure_rate_threshold
                {
                    warn!(
                        breaker = %self.name,
                        failures,
                        calls = total,
                        failure_rate,
                        threshold = self.config.failure_rate_threshold,
                        "Failure rate threshold reached"
                    );
                    self.transition_to_open(&mut window);
                    return;
                }

                self.state_and_counter
                    .store(pack_state(STATE_CLOSED, failures as u32), Ordering::Release);
                debug!(
                    breaker = %self.name,
                    failures,
                    calls = total,
                    failure_rate,
                    threshold = self.config.failure_rate_threshold,
                    "Circuit breaker: failure recorded"
                );
            }
            STATE_HALF_OPEN => {
                // A failed trial reopens the circuit
                self.transition_to_open(&mut window);
            }
            _ => {}
        }
    }

    /// Get the current state of the circuit breaker.
    pub fn state(&self) -> CircuitState {
        if !self.config.enabled {
            return CircuitState::Closed;
        }

        let packed = self.state_and_counter.load(Ordering::Acquire);
        let (state, _) = unpack_state(packed);

        // An open circuit whose wait has elapsed admits a trial on the next check
        if state == STATE_OPEN {
            let opened_at = self.opened_at.load(Ordering::Acquire);
            let wait_millis = self.current_wait_millis.load(Ordering::Acquire);
            if self.clock.now_millis() >= opened_at.saturating_add(wait_millis) {
                return CircuitState::HalfOpen;
            }
        }

        match state {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Get the number of consecutive opens (for debugging).
    pub fn consecutive_opens(&self) -> u32 {
        self.consecutive_opens.load(Ordering::Acquire)
    }

    /// Get the current open duration in milliseconds (for debugging).
    pub fn current_wait_millis(&self) -> u64 {
        self.current_wait_millis.load(Ordering::Acquire)
    }

    /// Get the failure count in the current window (for debugging).
    pub fn failure_count(&self) -> u32 {
        let packed = self.state_and_counter.load(Ordering::Acquire);
        let (state, counter) = unpack_state(packed);
        if state == STATE_CLOSED { counter } else { 0 }
    }

    fn open_error(&self, retry_after_ms: u64) -> CircuitBreakerError {
        CircuitBreakerError::Open {
            name: self.name.clone(),
            retry_after_ms,
        }
    }

    fn transition_to_open(&self, window: &mut OutcomeWindow) {
        let consecutive = self.consecutive_opens.fetch_add(1, Ordering::AcqRel);

        let wait_millis = self.config.calculate_wait_millis(consecutive);
        self.current_wait_millis
            .store(wait_millis, Ordering::Release);
        self.opened_at
            .store(self.clock.now_millis(), Ordering::Release);
        window.clear();
        self.state_and_counter
            .store(pack_state(STATE_OPEN, 0), Ordering::Release);

        warn!(
            breaker = %self.name,
            wait_ms = wait_millis,
            consecutive_opens = consecutive + 1,
            base_wait_ms = self.config.wait_duration_ms,
            "Circuit breaker OPENED - identity provider marked unavailable"
        );
    }

    fn transition_to_closed(&self, window: &mut OutcomeWindow) {
        let previous_consecutive = self.consecutive_opens.swap(0, Ordering::AcqRel);
        self.current_wait_millis
            .store(self.config.wait_duration_ms, Ordering::Release);
        window.clear();
        self.state_and_counter
            .store(pack_state(STATE_CLOSED, 0), Ordering::Release);

        info!(
            breaker = %self.name,
            previous_consecutive_opens = previous_consecutive,
            "Circuit breaker CLOSED - identity provider recovered"
        );
    }
}

/// Most recent call outcomes, oldest first.
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    failures: usize,
    capacity: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            failures: 0,
            capacity,
        }
    }

    fn record(&mut self, failed: bool) {
        if self.outcomes.len() == self.capacity
            && let Some(evicted) = self.outcomes.pop_front()
            && evicted
        {
            self.failures -= 1;
        }
        self.outcomes.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }

    fn failures(&self) -> usize {
        self.failures
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        (self.failures as f64) * 100.0 / (self.outcomes.len() as f64)
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

fn pack_state(state: u32, counter: u32) -> u32 {
    (state << STATE_SHIFT) | (counter & COUNTER_MASK)
}

fn unpack_state(packed: u32) -> (u32, u32) {
    let state = packed >> STATE_SHIFT;
    let counter = packed & COUNTER_MASK;
    (state, counter)
}
