use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use strum::Display;
use uuid::Uuid;

use crate::services::generation::FailureKind;
use crate::services::stats::RollingStats;

/// Breaker states for the upstream generation API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation, all traffic admitted.
    Closed,
    /// Upstream considered down, all traffic rejected.
    Open,
    /// Testing recovery, a sampled fraction of traffic admitted.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure tokens that open the breaker.
    pub open_token_threshold: u32,
    /// One token decays per this much elapsed wall time.
    pub refill_interval: Duration,
    /// How long the breaker stays open; half-open begins at the midpoint.
    pub open_duration: Duration,
    /// Sliding window capacity (most recent outcomes).
    pub window_size: usize,
    /// The window failure-rate rule stays dormant below this many samples.
    pub window_min_samples: usize,
    /// Failure rate at or above which the window rule opens the breaker.
    pub window_failure_rate: f64,
    /// Consecutive half-open successes needed to fully close.
    pub recovery_success_count: u32,
    /// Probability of admitting a call while half-open.
    pub half_open_sample_rate: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    /// Added on top of the observed P95 latency.
    pub timeout_buffer: Duration,
    /// Latency window backing the adaptive timeout.
    pub latency_window: Duration,
    pub max_recovery_batch: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            open_token_threshold: 5,
            refill_interval: Duration::from_secs(60),
            open_duration: Duration::from_secs(300),
            window_size: 25,
            window_min_samples: 10,
            window_failure_rate: 0.5,
            recovery_success_count: 3,
            half_open_sample_rate: 0.10,
            min_timeout: Duration::from_secs(45),
            max_timeout: Duration::from_secs(90),
            timeout_buffer: Duration::from_secs(10),
            latency_window: Duration::from_secs(3600),
            max_recovery_batch: 5,
        }
    }
}

impl BreakerConfig {
    pub fn with_open_token_threshold(mut self, threshold: u32) -> Self {
        self.open_token_threshold = threshold;
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    pub fn with_refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval;
        self
    }

    pub fn with_window_min_samples(mut self, min: usize) -> Self {
        self.window_min_samples = min;
        self
    }

    pub fn with_half_open_sample_rate(mut self, rate: f64) -> Self {
        self.half_open_sample_rate = rate;
        self
    }

    pub fn with_recovery_success_count(mut self, count: u32) -> Self {
        self.recovery_success_count = count;
        self
    }

    pub fn with_timeout_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout = min;
        self.max_timeout = max;
        self
    }

    pub fn with_timeout_buffer(mut self, buffer: Duration) -> Self {
        self.timeout_buffer = buffer;
        self
    }
}

/// Serializable view of the breaker for the ops endpoint and logs.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub tokens: u32,
    pub window_samples: usize,
    pub window_failure_rate: f64,
    pub consecutive_recovery_successes: u32,
    pub recovery_batch_size: u32,
    pub adaptive_timeout_ms: u64,
    /// Remaining fully-or-half open time in ms, if an episode is active.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct JobEntry {
    deadline: Instant,
    is_probe: bool,
}

struct State {
    tokens: u32,
    last_refill: Instant,
    /// Start of the current open episode, if any.
    opened_at: Option<Instant>,
    /// Most recent outcomes, `true` = failure.
    window: VecDeque<bool>,
    consecutive_recovery_successes: u32,
    recovery_batch_size: u32,
    jobs: HashMap<Uuid, JobEntry>,
}

/// Adaptive circuit breaker guarding the external generation API.
///
/// All health state lives behind a single mutex; every operation is one lock
/// acquisition, so readers never observe a half-applied update. Token refill
/// and open-episode expiry are pure functions of elapsed time, computed
/// lazily on access.
pub struct HealthTracker {
    config: BreakerConfig,
    latencies: RollingStats,
    state: Mutex<State>,
}

impl HealthTracker {
    pub fn new(config: BreakerConfig) -> Self {
        let latencies = RollingStats::new(config.latency_window);
        let max_batch = config.max_recovery_batch;
        Self {
            config,
            latencies,
            state: Mutex::new(State {
                tokens: 0,
                last_refill: Instant::now(),
                opened_at: None,
                window: VecDeque::new(),
                consecutive_recovery_successes: 0,
                recovery_batch_size: max_batch,
                jobs: HashMap::new(),
            }),
        }
    }

    /// Current breaker state, derived from the open episode timestamps.
    pub fn state(&self) -> BreakerState {
        let now = Instant::now();
        let mut st = self.lock();
        self.refill(&mut st, now);
        self.derive_state(&st, now)
    }

    /// Admission decision for one generation attempt.
    ///
    /// Closed admits unconditionally, open rejects unconditionally, and
    /// half-open runs an independent Bernoulli trial per call.
    pub fn should_attempt_generation(&self) -> bool {
        let now = Instant::now();
        let mut st = self.lock();
        self.refill(&mut st, now);
        match self.derive_state(&st, now) {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                rand::thread_rng().gen::<f64>() < self.config.half_open_sample_rate
            }
        }
    }

    /// Adaptive per-call timeout: observed P95 plus a buffer, clamped.
    pub fn timeout(&self) -> Duration {
        let p95 = self.latencies.percentile(95.0).max(0.0);
        let candidate = Duration::from_millis(p95 as u64) + self.config.timeout_buffer;
        candidate.clamp(self.config.min_timeout, self.config.max_timeout)
    }

    /// Recovery batch size hint for admission control (1..=max while the
    /// breaker is not fully closed).
    pub fn recovery_batch_size(&self) -> u32 {
        self.lock().recovery_batch_size
    }

    /// Register an in-flight generation attempt so late results can be told
    /// apart from live ones. The deadline is the adaptive timeout plus the
    /// buffer once more; results arriving after it are discarded.
    pub fn register_job(&self, id: Uuid, is_probe: bool) {
        let now = Instant::now();
        let deadline = now + self.timeout() + self.config.timeout_buffer;
        let mut st = self.lock();
        st.jobs.retain(|_, entry| entry.deadline > now);
        st.jobs.insert(id, JobEntry { deadline, is_probe });
    }

    /// Whether a result for this job should still be honored.
    pub fn is_job_valid(&self, id: Uuid) -> bool {
        let now = Instant::now();
        let st = self.lock();
        st.jobs
            .get(&id)
            .map(|entry| now <= entry.deadline)
            .unwrap_or(false)
    }

    /// Record a successful generation. No-op when the job was already
    /// invalidated or never registered.
    pub fn record_success(&self, latency: Duration, id: Uuid) {
        let now = Instant::now();
        let mut st = self.lock();
        let Some(entry) = Self::consume_job(&mut st, id, now) else {
            return;
        };
        self.refill(&mut st, now);
        self.latencies.add_sample(latency.as_secs_f64() * 1000.0);

        st.tokens = st.tokens.saturating_sub(1);
        self.push_outcome(&mut st, false);

        match self.derive_state(&st, now) {
            BreakerState::Closed => {
                // A lapsed open episode ends quietly on the next outcome.
                if st.opened_at.is_some() {
                    st.opened_at = None;
                    st.consecutive_recovery_successes = 0;
                }
            }
            BreakerState::HalfOpen => {
                st.consecutive_recovery_successes += 1;
                if entry.is_probe {
                    st.recovery_batch_size =
                        (st.recovery_batch_size * 2).min(self.config.max_recovery_batch);
                }
                if st.consecutive_recovery_successes >= self.config.recovery_success_count {
                    self.close(&mut st);
                }
            }
            BreakerState::Open => {}
        }
        metrics::counter!("generation_outcomes_total", "outcome" => "success").increment(1);
    }

    /// Record a failed generation. All failure kinds move the breaker
    /// identically; the kind only labels telemetry. No-op for invalidated
    /// or unregistered jobs.
    pub fn record_failure(&self, kind: FailureKind, id: Uuid) {
        let now = Instant::now();
        let mut st = self.lock();
        if Self::consume_job(&mut st, id, now).is_none() {
            return;
        }
        self.refill(&mut st, now);

        st.tokens = st.tokens.saturating_add(1);
        self.push_outcome(&mut st, true);

        match self.derive_state(&st, now) {
            BreakerState::Closed => {
                if st.opened_at.is_some() {
                    st.opened_at = None;
                }
                let rate = Self::failure_rate(&st.window);
                let window_trip = st.window.len() >= self.config.window_min_samples
                    && rate >= self.config.window_failure_rate;
                if st.tokens >= self.config.open_token_threshold || window_trip {
                    st.opened_at = Some(now);
                    st.consecutive_recovery_successes = 0;
                    st.recovery_batch_size = 1;
                    tracing::warn!(
                        kind = %kind,
                        tokens = st.tokens,
                        window_failure_rate = rate,
                        open_secs = self.config.open_duration.as_secs(),
                        "generation circuit opened"
                    );
                    metrics::counter!("generation_breaker_transitions_total", "to" => "open")
                        .increment(1);
                }
            }
            BreakerState::HalfOpen => {
                // Stays open for the remainder of the existing episode.
                st.consecutive_recovery_successes = 0;
                st.recovery_batch_size = 1;
                tracing::warn!(kind = %kind, "failure while half-open, recovery reset");
            }
            BreakerState::Open => {}
        }
        metrics::counter!("generation_outcomes_total", "outcome" => "failure", "kind" => kind.to_string())
            .increment(1);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut st = self.lock();
        self.refill(&mut st, now);
        let state = self.derive_state(&st, now);
        let open_remaining_ms = st.opened_at.and_then(|at| {
            let until = at + self.config.open_duration;
            (until > now).then(|| (until - now).as_millis() as u64)
        });
        BreakerSnapshot {
            state,
            tokens: st.tokens,
            window_samples: st.window.len(),
            window_failure_rate: Self::failure_rate(&st.window),
            consecutive_recovery_successes: st.consecutive_recovery_successes,
            recovery_batch_size: st.recovery_batch_size,
            adaptive_timeout_ms: self.timeout().as_millis() as u64,
            open_remaining_ms,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn derive_state(&self, st: &State, now: Instant) -> BreakerState {
        match st.opened_at {
            None => BreakerState::Closed,
            Some(at) if now >= at + self.config.open_duration => BreakerState::Closed,
            Some(at) if now >= at + self.config.open_duration / 2 => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    /// Lazy token decay: one token per elapsed refill interval.
    fn refill(&self, st: &mut State, now: Instant) {
        if st.tokens == 0 {
            st.last_refill = now;
            return;
        }
        let interval_ms = self.config.refill_interval.as_millis().max(1);
        let steps = (now.duration_since(st.last_refill).as_millis() / interval_ms) as u32;
        if steps == 0 {
            return;
        }
        if steps >= st.tokens {
            st.tokens = 0;
            st.last_refill = now;
        } else {
            st.tokens -= steps;
            st.last_refill += self.config.refill_interval * steps;
        }
    }

    fn push_outcome(&self, st: &mut State, failed: bool) {
        st.window.push_back(failed);
        while st.window.len() > self.config.window_size {
            st.window.pop_front();
        }
    }

    fn failure_rate(window: &VecDeque<bool>) -> f64 {
        if window.is_empty() {
            return 0.0;
        }
        let failures = window.iter().filter(|failed| **failed).count();
        failures as f64 / window.len() as f64
    }

    /// Remove the registration for a finished job. Returns `None` when the
    /// job is unknown or its deadline has passed, in which case the caller
    /// must not apply the outcome.
    fn consume_job(st: &mut State, id: Uuid, now: Instant) -> Option<JobEntry> {
        let entry = st.jobs.remove(&id)?;
        (now <= entry.deadline).then_some(entry)
    }

    fn close(&self, st: &mut State) {
        st.opened_at = None;
        st.tokens = 0;
        st.consecutive_recovery_successes = 0;
        st.recovery_batch_size = self.config.max_recovery_batch;
        st.window.clear();
        tracing::info!("generation circuit closed (recovered)");
        metrics::counter!("generation_breaker_transitions_total", "to" => "closed").increment(1);
    }
}
