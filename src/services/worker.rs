use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use tokio::sync::{watch, Semaphore};

use crate::db::JobStore;
use crate::models::job::{GenerationJob, JobStatus};
use crate::services::breaker::{BreakerState, HealthTracker};
use crate::services::credits::{CreditError, CreditLedger};
use crate::services::dead_letter::DeadLetterStore;
use crate::services::generation::{FailureKind, GenerateOptions, GenerationClient};
use crate::services::notifier::{JobEvent, JobNotifier};
use crate::services::storage::ArtworkStore;
use crate::services::telemetry::{Severity, TelemetryEvent, TelemetrySink};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Poll cadence when there is nothing to claim.
    pub poll_interval: Duration,
    /// Cap on the loop's own backoff while the breaker is fully open.
    pub open_backoff_cap: Duration,
    /// In-flight jobs across all users.
    pub global_concurrency: usize,
    /// In-flight jobs for any single user.
    pub per_user_concurrency: usize,
    /// First per-job retry delay; doubles per retry.
    pub initial_retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    /// Credits charged per generation attempt.
    pub credit_cost: i64,
    /// Processing rows older than this at startup belong to a dead worker.
    pub stale_claim_cutoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            open_backoff_cap: Duration::from_secs(32),
            global_concurrency: 4,
            per_user_concurrency: 2,
            initial_retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(32),
            credit_cost: 1,
            stale_claim_cutoff: Duration::from_secs(150),
        }
    }
}

impl WorkerConfig {
    /// Exponential per-job retry delay: initial * 2^(retry-1), capped.
    pub fn retry_backoff(&self, retry_count: i32) -> Duration {
        let exp = retry_count.saturating_sub(1).clamp(0, 16) as u32;
        let delay = self.initial_retry_backoff * (1u32 << exp);
        delay.min(self.max_retry_backoff)
    }
}

/// Polling worker that claims pending jobs, executes them under the circuit
/// breaker, and routes failures to retry or quarantine.
///
/// Multiple workers may run against the same store; the version
/// compare-and-swap in [`JobStore::claim_job`] is the only coordination.
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    tracker: Arc<HealthTracker>,
    dead_letters: Arc<DeadLetterStore>,
    client: Arc<dyn GenerationClient>,
    credits: Arc<dyn CreditLedger>,
    storage: Arc<dyn ArtworkStore>,
    telemetry: Arc<dyn TelemetrySink>,
    notifier: Arc<dyn JobNotifier>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    users: Mutex<HashMap<String, usize>>,
}

impl JobWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        tracker: Arc<HealthTracker>,
        dead_letters: Arc<DeadLetterStore>,
        client: Arc<dyn GenerationClient>,
        credits: Arc<dyn CreditLedger>,
        storage: Arc<dyn ArtworkStore>,
        telemetry: Arc<dyn TelemetrySink>,
        notifier: Arc<dyn JobNotifier>,
        config: WorkerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.global_concurrency));
        Self {
            store,
            tracker,
            dead_letters,
            client,
            credits,
            storage,
            telemetry,
            notifier,
            config,
            semaphore,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Main processing loop. Exits once the shutdown signal flips and all
    /// in-flight jobs have reached a terminal outcome for this attempt.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.recover_interrupted().await;

        let mut open_backoff = self.config.poll_interval;
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Admission gate: skip the whole poll cycle rather than claiming
            // jobs that would fail immediately. A fully-open breaker also
            // backs the loop off to relieve the job table.
            if !self.tracker.should_attempt_generation() {
                let delay = if self.tracker.state() == BreakerState::Open {
                    open_backoff = (open_backoff * 2).min(self.config.open_backoff_cap);
                    tracing::debug!(
                        backoff_ms = open_backoff.as_millis() as u64,
                        "breaker open, backing off poll loop"
                    );
                    open_backoff
                } else {
                    self.config.poll_interval
                };
                if Self::wait(&mut shutdown, delay).await {
                    break;
                }
                continue;
            }
            open_backoff = self.config.poll_interval;
            self.dead_letters.cleanup_expired();

            let claimed = Self::poll_once(&self).await;
            if claimed == 0 && Self::wait(&mut shutdown, self.config.poll_interval).await {
                break;
            }
        }

        tracing::info!("worker stopping, draining in-flight jobs");
        let _ = self
            .semaphore
            .clone()
            .acquire_many_owned(self.config.global_concurrency as u32)
            .await;
        tracing::info!("worker drained");
    }

    /// Claim and dispatch up to one batch of pending jobs. Returns how many
    /// were claimed.
    async fn poll_once(this: &Arc<Self>) -> usize {
        let available = this.semaphore.available_permits();
        let cap = if this.tracker.state() == BreakerState::Closed {
            available
        } else {
            // Ramp organic traffic back up gradually while recovering.
            available.min(this.tracker.recovery_batch_size() as usize)
        };
        if cap == 0 {
            return 0;
        }

        // Over-fetch: some candidates lose the claim race or hit user caps.
        let candidates = match this.store.fetch_pending((cap * 2) as i64).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch pending jobs");
                return 0;
            }
        };

        let mut claimed = 0;
        for job in candidates {
            if claimed >= cap {
                break;
            }
            if !this.try_reserve_user(&job.user_id) {
                tracing::debug!(job_id = %job.id, user_id = %job.user_id, "user at concurrency cap");
                continue;
            }
            let Ok(permit) = this.semaphore.clone().try_acquire_owned() else {
                this.release_user(&job.user_id);
                break;
            };

            match this.store.claim_job(job.id, job.version).await {
                Ok(Some(job)) => {
                    claimed += 1;
                    let worker = Arc::clone(this);
                    tokio::spawn(async move {
                        let user_id = job.user_id.clone();
                        worker.execute_job(job).await;
                        worker.release_user(&user_id);
                        drop(permit);
                    });
                }
                Ok(None) => {
                    // Another worker claimed it first.
                    this.release_user(&job.user_id);
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "claim failed");
                    this.release_user(&job.user_id);
                }
            }
        }
        claimed
    }

    /// Run one claimed job to an outcome: completed, retry-scheduled, failed
    /// or dead-lettered. Never propagates an error into the poll loop.
    async fn execute_job(&self, job: GenerationJob) {
        let attempt = job.retry_count + 1;
        metrics::counter!("generation_jobs_started").increment(1);
        tracing::info!(
            job_id = %job.id,
            user_id = %job.user_id,
            attempt,
            priority = job.priority,
            "processing generation job"
        );

        match self
            .credits
            .deduct(&job.user_id, self.config.credit_cost, &deduct_key(&job, attempt))
            .await
        {
            Ok(()) => {}
            Err(CreditError::InsufficientCredit { .. }) => {
                tracing::warn!(job_id = %job.id, user_id = %job.user_id, "insufficient credit");
                if let Err(e) = self
                    .store
                    .mark_failed(job.id, job.version, "insufficient credit")
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %e, "failed to park job");
                }
                self.notifier.notify(JobEvent {
                    job_id: job.id,
                    user_id: job.user_id.clone(),
                    status: JobStatus::Failed,
                    detail: Some("insufficient credit".into()),
                });
                return;
            }
            Err(e) => {
                // Billing backend hiccup: hand the attempt back without
                // burning retry budget or touching the breaker.
                tracing::error!(job_id = %job.id, error = %e, "credit deduction unavailable");
                let not_before = Utc::now() + TimeDelta::seconds(5);
                let _ = self
                    .store
                    .schedule_retry(
                        job.id,
                        job.version,
                        job.retry_count,
                        not_before,
                        "credit deduction unavailable",
                    )
                    .await;
                return;
            }
        }

        self.tracker.register_job(job.id, false);
        let timeout = self.tracker.timeout();
        let started = Instant::now();
        let opts = GenerateOptions {
            is_probe: false,
            timeout,
        };

        // The timeout wrapper drops the in-flight future, aborting the
        // underlying HTTP request rather than abandoning it.
        let outcome = tokio::time::timeout(timeout, self.client.generate(&job.prompt, &opts)).await;

        match outcome {
            Ok(Ok(image)) => {
                let latency = started.elapsed();
                if !self.tracker.is_job_valid(job.id) {
                    tracing::warn!(job_id = %job.id, "discarding stale generation result");
                    self.telemetry.record_event(TelemetryEvent::new(
                        "stale_result_discarded",
                        "generation",
                        Severity::Warning,
                    ));
                    self.refund(&job, attempt, "stale result discarded").await;
                    return;
                }
                self.tracker.record_success(latency, job.id);
                metrics::histogram!("generation_latency_seconds").record(latency.as_secs_f64());
                self.finish_success(&job, attempt, image.bytes, &image.format).await;
            }
            Ok(Err(err)) => {
                self.tracker.record_failure(err.kind, job.id);
                self.refund(&job, attempt, "generation failed").await;
                self.retry_or_dead_letter(&job, err.kind, &err.detail).await;
            }
            Err(_elapsed) => {
                self.tracker.record_failure(FailureKind::Timeout, job.id);
                self.refund(&job, attempt, "generation timed out").await;
                let detail = format!("generation timed out after {}ms", timeout.as_millis());
                self.retry_or_dead_letter(&job, FailureKind::Timeout, &detail).await;
            }
        }
    }

    async fn finish_success(&self, job: &GenerationJob, attempt: i32, bytes: Vec<u8>, format: &str) {
        let key = match self.storage.store(&job.user_id, job.id, &bytes, format).await {
            Ok(key) => key,
            Err(e) => {
                // Upstream delivered; persisting the artwork is our fault.
                // Retry the job without recording an upstream failure.
                tracing::error!(job_id = %job.id, error = %e, "artwork storage failed");
                self.refund(job, attempt, "artwork storage failed").await;
                self.retry_or_dead_letter(
                    job,
                    FailureKind::Unknown,
                    &format!("artwork storage failed: {e}"),
                )
                .await;
                return;
            }
        };

        match self.store.complete_job(job.id, job.version, &key).await {
            Ok(true) => {
                metrics::counter!("generation_jobs_completed").increment(1);
                tracing::info!(job_id = %job.id, result_key = %key, "generation job completed");
                self.notifier.notify(JobEvent {
                    job_id: job.id,
                    user_id: job.user_id.clone(),
                    status: JobStatus::Completed,
                    detail: Some(key),
                });
                self.telemetry.record_event(
                    TelemetryEvent::new("job_completed", "generation", Severity::Info)
                        .with_fields(serde_json::json!({ "job_id": job.id })),
                );
            }
            Ok(false) => {
                // The row moved on without us (timed out and re-claimed).
                tracing::warn!(job_id = %job.id, "completion lost the version race, result dropped");
                self.refund(job, attempt, "completion superseded").await;
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to persist completion");
                self.refund(job, attempt, "completion write failed").await;
            }
        }
    }

    /// Schedule a retry with exponential backoff, or quarantine the job once
    /// its retries are exhausted.
    async fn retry_or_dead_letter(&self, job: &GenerationJob, kind: FailureKind, detail: &str) {
        let next_retry = job.retry_count + 1;
        let retryable =
            next_retry <= job.max_retries && self.dead_letters.should_retry_job(job.id);

        if retryable {
            let delay = self.config.retry_backoff(next_retry);
            let not_before =
                Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::seconds(32));
            match self
                .store
                .schedule_retry(job.id, job.version, next_retry, not_before, detail)
                .await
            {
                Ok(true) => {
                    metrics::counter!("generation_jobs_retried").increment(1);
                    tracing::info!(
                        job_id = %job.id,
                        retry_count = next_retry,
                        delay_ms = delay.as_millis() as u64,
                        kind = %kind,
                        "job scheduled for retry"
                    );
                }
                Ok(false) => {
                    tracing::warn!(job_id = %job.id, "retry scheduling lost the version race");
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "failed to schedule retry");
                }
            }
            return;
        }

        match self.store.mark_dead_letter(job.id, job.version, detail).await {
            Ok(true) => {
                metrics::counter!("generation_jobs_dead_lettered").increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    attempts = next_retry,
                    kind = %kind,
                    "job dead-lettered after exhausting retries"
                );
            }
            Ok(false) => {
                tracing::warn!(job_id = %job.id, "dead-letter write lost the version race");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to dead-letter job");
            }
        }

        self.dead_letters.add_failed_job(
            job.id,
            &job.prompt,
            &job.user_id,
            job.session_id.as_deref(),
            kind,
            detail,
            next_retry.max(0) as u32,
        );
        self.notifier.notify(JobEvent {
            job_id: job.id,
            user_id: job.user_id.clone(),
            status: JobStatus::DeadLetter,
            detail: Some("generation unavailable, please retry later".into()),
        });
    }

    /// Sweep processing rows left behind by a dead worker incarnation and
    /// push each through the normal retry-or-quarantine path.
    async fn recover_interrupted(&self) {
        let cutoff = Utc::now()
            - TimeDelta::from_std(self.config.stale_claim_cutoff)
                .unwrap_or(TimeDelta::seconds(150));
        let stale = match self.store.fetch_stale_processing(cutoff).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "failed to sweep interrupted jobs");
                return;
            }
        };
        if stale.is_empty() {
            return;
        }

        tracing::warn!(count = stale.len(), "recovering jobs interrupted by a previous worker");
        for job in stale {
            // Same refund key the dead incarnation would have used, so this
            // is a no-op when it already refunded.
            let attempt = job.retry_count + 1;
            self.refund(&job, attempt, "interrupted by worker restart").await;
            self.retry_or_dead_letter(&job, FailureKind::Unknown, "interrupted by worker restart")
                .await;
        }
    }

    async fn refund(&self, job: &GenerationJob, attempt: i32, reason: &str) {
        if let Err(e) = self
            .credits
            .refund(
                &job.user_id,
                self.config.credit_cost,
                reason,
                &refund_key(job, attempt),
            )
            .await
        {
            // The job transition still proceeds; flag for reconciliation.
            tracing::error!(job_id = %job.id, error = %e, "credit refund failed");
            self.telemetry.record_event(
                TelemetryEvent::new("credit_refund_failed", "billing", Severity::Critical)
                    .with_fields(serde_json::json!({
                        "job_id": job.id,
                        "user_id": job.user_id,
                        "attempt": attempt,
                    })),
            );
        }
    }

    fn try_reserve_user(&self, user_id: &str) -> bool {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        let count = users.entry(user_id.to_string()).or_insert(0);
        if *count >= self.config.per_user_concurrency {
            false
        } else {
            *count += 1;
            true
        }
    }

    fn release_user(&self, user_id: &str) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = users.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                users.remove(user_id);
            }
        }
    }

    /// Sleep that returns early (true) when shutdown is signalled.
    async fn wait(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown.changed() => true,
        }
    }
}

fn deduct_key(job: &GenerationJob, attempt: i32) -> String {
    format!("{}:{}", job.id, attempt)
}

fn refund_key(job: &GenerationJob, attempt: i32) -> String {
    format!("{}:{}:refund", job.id, attempt)
}
