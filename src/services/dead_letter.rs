use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::services::generation::FailureKind;
use crate::services::telemetry::{Severity, TelemetryEvent, TelemetrySink};

/// Per-entry error history is capped to the most recent failures.
const MAX_ERRORS_PER_ENTRY: usize = 10;

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    /// Entries beyond this evict the oldest entry on insert.
    pub max_size: usize,
    /// Attempt count at which an entry is surfaced to operators.
    pub max_attempts: u32,
    /// Entries idle longer than this are dropped by `cleanup_expired`.
    pub job_expiry: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_attempts: 3,
            job_expiry: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub kind: FailureKind,
    pub detail: String,
}

/// A quarantined job that exhausted its retries.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub job_id: Uuid,
    pub prompt: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub first_failure: DateTime<Utc>,
    pub last_failure: DateTime<Utc>,
    pub errors: Vec<FailureRecord>,
    /// Set once the entry has been surfaced to operators, so repeat failures
    /// of the same job do not re-alert.
    pub surfaced: bool,
}

/// Bounded, TTL-evicting quarantine for jobs that exhausted retries.
///
/// The store is an operator-facing view; the `dead_letter` status on the job
/// row remains the durable truth.
pub struct DeadLetterStore {
    config: DeadLetterConfig,
    telemetry: Arc<dyn TelemetrySink>,
    entries: Mutex<HashMap<Uuid, DeadLetterEntry>>,
}

impl DeadLetterStore {
    pub fn new(config: DeadLetterConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            config,
            telemetry,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Upsert a failed job. Repeat failures of the same job append to its
    /// error history; a new job at capacity evicts the entry with the oldest
    /// first failure.
    #[allow(clippy::too_many_arguments)]
    pub fn add_failed_job(
        &self,
        job_id: Uuid,
        prompt: &str,
        user_id: &str,
        session_id: Option<&str>,
        kind: FailureKind,
        detail: &str,
        attempt_count: u32,
    ) {
        self.add_failed_job_at(
            job_id,
            prompt,
            user_id,
            session_id,
            kind,
            detail,
            attempt_count,
            Utc::now(),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn add_failed_job_at(
        &self,
        job_id: Uuid,
        prompt: &str,
        user_id: &str,
        session_id: Option<&str>,
        kind: FailureKind,
        detail: &str,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) {
        let mut entries = self.lock();

        let record = FailureRecord {
            at: now,
            kind,
            detail: detail.to_string(),
        };

        let (attempts, newly_surfaced) = {
            let entry = match entries.get_mut(&job_id) {
                Some(existing) => {
                    existing.attempt_count = attempt_count.max(existing.attempt_count);
                    existing.last_failure = now;
                    existing.errors.push(record);
                    if existing.errors.len() > MAX_ERRORS_PER_ENTRY {
                        existing.errors.remove(0);
                    }
                    existing
                }
                None => {
                    if entries.len() >= self.config.max_size {
                        Self::evict_oldest(&mut entries);
                    }
                    entries.entry(job_id).or_insert(DeadLetterEntry {
                        job_id,
                        prompt: prompt.to_string(),
                        user_id: user_id.to_string(),
                        session_id: session_id.map(str::to_string),
                        attempt_count,
                        max_attempts: self.config.max_attempts,
                        first_failure: now,
                        last_failure: now,
                        errors: vec![record],
                        surfaced: false,
                    })
                }
            };

            let newly_surfaced =
                entry.attempt_count >= self.config.max_attempts && !entry.surfaced;
            if newly_surfaced {
                entry.surfaced = true;
            }
            (entry.attempt_count, newly_surfaced)
        };

        metrics::gauge!("generation_dead_letter_size").set(entries.len() as f64);
        drop(entries);

        if newly_surfaced {
            tracing::warn!(
                job_id = %job_id,
                user_id = user_id,
                attempt_count = attempts,
                "job quarantined after exhausting retries"
            );
            self.telemetry.record_event(
                TelemetryEvent::new("job_dead_lettered", "generation", Severity::Critical)
                    .with_fields(serde_json::json!({
                        "job_id": job_id,
                        "user_id": user_id,
                        "attempts": attempts,
                    })),
            );
        }
    }

    /// False once the job has exhausted its attempts; jobs absent from the
    /// store may always be retried.
    pub fn should_retry_job(&self, job_id: Uuid) -> bool {
        let entries = self.lock();
        match entries.get(&job_id) {
            Some(entry) => entry.attempt_count < self.config.max_attempts,
            None => true,
        }
    }

    /// Drop entries whose last failure is older than the expiry.
    pub fn cleanup_expired(&self) {
        self.cleanup_expired_at(Utc::now());
    }

    fn cleanup_expired_at(&self, now: DateTime<Utc>) {
        let expiry = chrono::TimeDelta::from_std(self.config.job_expiry)
            .unwrap_or(chrono::TimeDelta::MAX);
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now - entry.last_failure <= expiry);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "expired dead-letter entries cleaned up");
        }
        metrics::gauge!("generation_dead_letter_size").set(entries.len() as f64);
    }

    /// Snapshot of all quarantined jobs for operator inspection.
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        let entries = self.lock();
        let mut all: Vec<DeadLetterEntry> = entries.values().cloned().collect();
        all.sort_by_key(|e| e.first_failure);
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_oldest(entries: &mut HashMap<Uuid, DeadLetterEntry>) {
        let oldest = entries
            .values()
            .min_by_key(|e| e.first_failure)
            .map(|e| e.job_id);
        if let Some(id) = oldest {
            entries.remove(&id);
            tracing::debug!(job_id = %id, "evicted oldest dead-letter entry at capacity");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, DeadLetterEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
