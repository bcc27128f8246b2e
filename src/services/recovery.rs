use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use uuid::Uuid;

use crate::services::breaker::{BreakerState, HealthTracker};
use crate::services::generation::{FailureKind, GenerateOptions, GenerationClient};
use crate::services::telemetry::{Severity, TelemetryEvent, TelemetrySink};

/// Minimal, content-neutral prompts for recovery probes. Never user data.
const PROBE_PROMPTS: &[&str] = &[
    "a small blue circle on a plain white background",
    "a simple gray square, flat color",
    "a single green triangle, minimal",
];

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Base delay between probes; each wait is jittered around this.
    pub probe_interval: Duration,
    /// Jitter half-width: waits are drawn from [1-j, 1+j] x interval.
    pub jitter: f64,
    /// Dollar cap on probe spend over the trailing budget window.
    pub hourly_budget: f64,
    /// Estimated cost of one probe.
    pub probe_cost: f64,
    pub budget_window: Duration,
    /// How often to re-check the breaker while it is closed.
    pub idle_poll: Duration,
    /// Wait applied when the budget is exhausted.
    pub budget_backoff: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(120),
            jitter: 0.2,
            hourly_budget: 1.00,
            probe_cost: 0.04,
            budget_window: Duration::from_secs(3600),
            idle_poll: Duration::from_secs(5),
            budget_backoff: Duration::from_secs(3600),
        }
    }
}

/// Rolling dollar ledger capping recovery spend over a trailing window.
pub struct ProbeBudget {
    limit: f64,
    window: Duration,
    entries: Mutex<Vec<(Instant, f64)>>,
}

impl ProbeBudget {
    pub fn new(limit: f64, window: Duration) -> Self {
        Self {
            limit,
            window,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Record the cost if the trailing-window spend stays within the limit.
    /// Returns false (and records nothing) when the probe must be skipped.
    pub fn try_spend(&self, cost: f64) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|(at, _)| now.duration_since(*at) <= self.window);
        let spent: f64 = entries.iter().map(|(_, c)| *c).sum();
        if spent + cost > self.limit + 1e-9 {
            return false;
        }
        entries.push((now, cost));
        true
    }

    /// Spend inside the trailing window.
    pub fn current_spend(&self) -> f64 {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|(at, _)| now.duration_since(*at) <= self.window);
        entries.iter().map(|(_, c)| *c).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Instant, f64)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Issues jittered, budget-capped recovery probes against the generation API
/// while the breaker is not closed, feeding outcomes back through the
/// tracker's normal record paths.
pub struct RecoveryOrchestrator {
    tracker: Arc<HealthTracker>,
    client: Arc<dyn GenerationClient>,
    budget: Arc<ProbeBudget>,
    telemetry: Arc<dyn TelemetrySink>,
    config: RecoveryConfig,
}

impl RecoveryOrchestrator {
    pub fn new(
        tracker: Arc<HealthTracker>,
        client: Arc<dyn GenerationClient>,
        budget: Arc<ProbeBudget>,
        telemetry: Arc<dyn TelemetrySink>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            tracker,
            client,
            budget,
            telemetry,
            config,
        }
    }

    /// Probe loop. Idles while the breaker is closed, probes on a jittered
    /// cadence otherwise, and exits when the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: usize = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.tracker.state() == BreakerState::Closed {
                if Self::sleep_or_shutdown(&mut shutdown, self.config.idle_poll).await {
                    break;
                }
                continue;
            }

            let delay = self.jittered(self.config.probe_interval);
            tracing::debug!(delay_ms = delay.as_millis() as u64, "next recovery probe scheduled");
            if Self::sleep_or_shutdown(&mut shutdown, delay).await {
                break;
            }

            // Recovered (or lapsed closed) while we were waiting.
            if self.tracker.state() == BreakerState::Closed {
                continue;
            }

            if !self.budget.try_spend(self.config.probe_cost) {
                tracing::warn!(
                    spend = self.budget.current_spend(),
                    budget = self.config.hourly_budget,
                    "probe budget exhausted, deferring recovery probes"
                );
                self.telemetry.record_event(TelemetryEvent::new(
                    "probe_budget_exhausted",
                    "recovery",
                    Severity::Warning,
                ));
                let backoff = self.jittered(self.config.budget_backoff);
                if Self::sleep_or_shutdown(&mut shutdown, backoff).await {
                    break;
                }
                continue;
            }

            attempt += 1;
            self.run_probe(attempt).await;
        }
        tracing::info!("recovery orchestrator stopped");
    }

    async fn run_probe(&self, attempt: usize) {
        let prompt = PROBE_PROMPTS[attempt % PROBE_PROMPTS.len()];
        let id = Uuid::new_v4();
        self.tracker.register_job(id, true);
        let timeout = self.tracker.timeout();
        let started = Instant::now();

        metrics::counter!("generation_probe_attempts_total").increment(1);
        metrics::gauge!("generation_probe_spend_dollars").set(self.budget.current_spend());

        let opts = GenerateOptions {
            is_probe: true,
            timeout,
        };
        let outcome = tokio::time::timeout(timeout, self.client.generate(prompt, &opts)).await;

        match outcome {
            Ok(Ok(_image)) => {
                let latency = started.elapsed();
                self.tracker.record_success(latency, id);
                tracing::info!(
                    attempt,
                    latency_ms = latency.as_millis() as u64,
                    batch_size = self.tracker.recovery_batch_size(),
                    "recovery probe succeeded"
                );
                if self.tracker.state() == BreakerState::Closed {
                    tracing::info!("upstream recovered, pausing probes");
                }
            }
            Ok(Err(err)) => {
                self.tracker.record_failure(err.kind, id);
                tracing::warn!(attempt, kind = %err.kind, error = %err, "recovery probe failed");
            }
            Err(_elapsed) => {
                self.tracker.record_failure(FailureKind::Timeout, id);
                tracing::warn!(
                    attempt,
                    timeout_ms = timeout.as_millis() as u64,
                    "recovery probe timed out"
                );
            }
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(1.0 - self.config.jitter..=1.0 + self.config.jitter);
        base.mul_f64(factor)
    }

    async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown.changed() => true,
        }
    }
}
