//! Worker behavior tests against in-memory ports: retry walk, claim races,
//! priority ordering and credit accounting, with no external services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use artgen_gateway::db::JobStore;
use artgen_gateway::models::job::{GenerationJob, JobStatus, NewJob};
use artgen_gateway::services::breaker::{BreakerConfig, HealthTracker};
use artgen_gateway::services::credits::{CreditError, CreditLedger};
use artgen_gateway::services::dead_letter::{DeadLetterConfig, DeadLetterStore};
use artgen_gateway::services::generation::{
    FailureKind, GenerateOptions, GeneratedImage, GenerationClient, GenerationError,
};
use artgen_gateway::services::notifier::{JobEvent, JobNotifier};
use artgen_gateway::services::storage::{ArtworkStore, StorageError};
use artgen_gateway::services::telemetry::NoopTelemetry;
use artgen_gateway::services::worker::{JobWorker, WorkerConfig};

/// In-memory job store with the same conditional-update semantics as the
/// Postgres store: every mutation checks the caller's version.
#[derive(Default)]
struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, GenerationJob>>,
    /// Status transition log per job, in order.
    transitions: Mutex<Vec<(Uuid, JobStatus)>>,
}

impl MemoryJobStore {
    fn job(&self, id: Uuid) -> Option<GenerationJob> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    fn transitions_for(&self, id: Uuid) -> Vec<JobStatus> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .filter(|(job_id, _)| *job_id == id)
            .map(|(_, status)| *status)
            .collect()
    }

    fn seed(&self, job: GenerationJob) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    fn transition(&self, job: &mut GenerationJob, status: JobStatus) {
        job.status = status;
        job.version += 1;
        self.transitions.lock().unwrap().push((job.id, status));
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, new: NewJob) -> Result<GenerationJob, sqlx::Error> {
        let job = GenerationJob {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            session_id: new.session_id,
            prompt: new.prompt,
            style_params: new.style_params,
            status: JobStatus::Pending,
            priority: new.priority,
            retry_count: 0,
            max_retries: new.max_retries,
            version: 0,
            not_before: Utc::now(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result_key: None,
            error: None,
        };
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>, sqlx::Error> {
        Ok(self.job(id))
    }

    async fn fetch_pending(&self, limit: i64) -> Result<Vec<GenerationJob>, sqlx::Error> {
        let now = Utc::now();
        let mut pending: Vec<GenerationJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.not_before <= now)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn claim_job(
        &self,
        id: Uuid,
        version: i64,
    ) -> Result<Option<GenerationJob>, sqlx::Error> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.version != version || job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.started_at = Some(Utc::now());
        self.transition(job, JobStatus::Processing);
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        id: Uuid,
        version: i64,
        result_key: &str,
    ) -> Result<bool, sqlx::Error> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.version != version || job.status != JobStatus::Processing {
            return Ok(false);
        }
        job.result_key = Some(result_key.to_string());
        job.completed_at = Some(Utc::now());
        self.transition(job, JobStatus::Completed);
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        version: i64,
        retry_count: i32,
        not_before: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.version != version || job.status != JobStatus::Processing {
            return Ok(false);
        }
        job.retry_count = retry_count;
        job.not_before = not_before;
        job.error = Some(error.to_string());
        job.started_at = None;
        self.transition(job, JobStatus::Pending);
        Ok(true)
    }

    async fn mark_dead_letter(
        &self,
        id: Uuid,
        version: i64,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.version != version {
            return Ok(false);
        }
        job.error = Some(error.to_string());
        job.completed_at = Some(Utc::now());
        self.transition(job, JobStatus::DeadLetter);
        Ok(true)
    }

    async fn mark_failed(&self, id: Uuid, version: i64, error: &str) -> Result<bool, sqlx::Error> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.version != version {
            return Ok(false);
        }
        job.error = Some(error.to_string());
        self.transition(job, JobStatus::Failed);
        Ok(true)
    }

    async fn fetch_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, sqlx::Error> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.started_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

/// Credit ledger recording every applied idempotency key.
#[derive(Default)]
struct MemoryCredits {
    deducts: Mutex<Vec<String>>,
    refunds: Mutex<Vec<String>>,
}

#[async_trait]
impl CreditLedger for MemoryCredits {
    async fn deduct(
        &self,
        _user_id: &str,
        _amount: i64,
        idempotency_key: &str,
    ) -> Result<(), CreditError> {
        let mut deducts = self.deducts.lock().unwrap();
        if !deducts.iter().any(|k| k == idempotency_key) {
            deducts.push(idempotency_key.to_string());
        }
        Ok(())
    }

    async fn refund(
        &self,
        _user_id: &str,
        _amount: i64,
        _reason: &str,
        idempotency_key: &str,
    ) -> Result<(), CreditError> {
        let mut refunds = self.refunds.lock().unwrap();
        if !refunds.iter().any(|k| k == idempotency_key) {
            refunds.push(idempotency_key.to_string());
        }
        Ok(())
    }
}

struct FailingClient {
    calls: AtomicUsize,
}

#[async_trait]
impl GenerationClient for FailingClient {
    async fn generate(
        &self,
        _prompt: &str,
        _opts: &GenerateOptions,
    ) -> Result<GeneratedImage, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(GenerationError::new(FailureKind::Server, "upstream exploded"))
    }
}

struct SuccessClient {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl GenerationClient for SuccessClient {
    async fn generate(
        &self,
        prompt: &str,
        _opts: &GenerateOptions,
    ) -> Result<GeneratedImage, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(GeneratedImage {
            bytes: vec![1, 2, 3, 4],
            format: "png".into(),
        })
    }
}

#[derive(Default)]
struct MemoryStorage;

#[async_trait]
impl ArtworkStore for MemoryStorage {
    async fn store(
        &self,
        user_id: &str,
        job_id: Uuid,
        _bytes: &[u8],
        format: &str,
    ) -> Result<String, StorageError> {
        Ok(format!("artwork/{user_id}/{job_id}.{format}"))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<JobEvent>>,
}

impl JobNotifier for RecordingNotifier {
    fn notify(&self, event: JobEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct Harness {
    store: Arc<MemoryJobStore>,
    credits: Arc<MemoryCredits>,
    dead_letters: Arc<DeadLetterStore>,
    notifier: Arc<RecordingNotifier>,
    worker: Arc<JobWorker>,
}

fn harness(client: Arc<dyn GenerationClient>, config: WorkerConfig) -> Harness {
    let store = Arc::new(MemoryJobStore::default());
    let credits = Arc::new(MemoryCredits::default());
    let dead_letters = Arc::new(DeadLetterStore::new(
        DeadLetterConfig::default(),
        Arc::new(NoopTelemetry),
    ));
    let notifier = Arc::new(RecordingNotifier::default());
    // Thresholds high enough that the breaker never interferes with the
    // scenarios below.
    let tracker = Arc::new(HealthTracker::new(
        BreakerConfig::default()
            .with_open_token_threshold(1000)
            .with_window_min_samples(100_000),
    ));
    let worker = Arc::new(JobWorker::new(
        store.clone(),
        tracker,
        dead_letters.clone(),
        client,
        credits.clone(),
        Arc::new(MemoryStorage),
        Arc::new(NoopTelemetry),
        notifier.clone(),
        config,
    ));
    Harness {
        store,
        credits,
        dead_letters,
        notifier,
        worker,
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(10),
        initial_retry_backoff: Duration::from_millis(1),
        max_retry_backoff: Duration::from_millis(8),
        ..WorkerConfig::default()
    }
}

async fn run_worker_for(harness: &Harness, duration: Duration) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(harness.worker.clone().run(rx));
    tokio::time::sleep(duration).await;
    let _ = tx.send(true);
    let _ = handle.await;
}

fn enqueue(store: &MemoryJobStore, prompt: &str, priority: i32, max_retries: i32) -> Uuid {
    let job = GenerationJob {
        id: Uuid::new_v4(),
        user_id: "user-1".into(),
        session_id: Some("session-1".into()),
        prompt: prompt.into(),
        style_params: serde_json::json!({}),
        status: JobStatus::Pending,
        priority,
        retry_count: 0,
        max_retries,
        version: 0,
        not_before: Utc::now(),
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        result_key: None,
        error: None,
    };
    let id = job.id;
    store.seed(job);
    id
}

#[tokio::test]
async fn always_failing_job_retries_three_times_then_dead_letters() {
    let client = Arc::new(FailingClient {
        calls: AtomicUsize::new(0),
    });
    let h = harness(client.clone(), fast_config());
    let job_id = enqueue(&h.store, "doomed artwork", 0, 3);

    run_worker_for(&h, Duration::from_millis(800)).await;

    let job = h.store.job(job_id).expect("job exists");
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.retry_count, 3);

    // Four attempts total: the initial one plus three retries, never five.
    assert_eq!(client.calls.load(Ordering::SeqCst), 4);

    // pending -> processing cycles three times, then the quarantine.
    let transitions = h.store.transitions_for(job_id);
    assert_eq!(
        transitions,
        vec![
            JobStatus::Processing,
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::DeadLetter,
        ]
    );

    // Quarantine entry is present and blocks further retries.
    assert_eq!(h.dead_letters.len(), 1);
    assert!(!h.dead_letters.should_retry_job(job_id));

    // Caller-facing signal is the terminal unavailable message.
    let last = h.notifier.events.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.status, JobStatus::DeadLetter);
    assert_eq!(
        last.detail.as_deref(),
        Some("generation unavailable, please retry later")
    );
}

#[tokio::test]
async fn every_failed_attempt_deducts_and_refunds_exactly_once() {
    let client = Arc::new(FailingClient {
        calls: AtomicUsize::new(0),
    });
    let h = harness(client, fast_config());
    let job_id = enqueue(&h.store, "doomed artwork", 0, 3);

    run_worker_for(&h, Duration::from_millis(800)).await;
    assert_eq!(h.store.job(job_id).unwrap().status, JobStatus::DeadLetter);

    let deducts = h.credits.deducts.lock().unwrap().clone();
    let refunds = h.credits.refunds.lock().unwrap().clone();
    assert_eq!(deducts.len(), 4);
    assert_eq!(refunds.len(), 4);

    // Keys are unique per attempt, so a replay could never double-apply.
    for attempt in 1..=4 {
        assert!(deducts.contains(&format!("{job_id}:{attempt}")));
        assert!(refunds.contains(&format!("{job_id}:{attempt}:refund")));
    }
}

#[tokio::test]
async fn successful_job_completes_with_stored_artwork() {
    let client = Arc::new(SuccessClient {
        prompts: Mutex::new(Vec::new()),
    });
    let h = harness(client, fast_config());
    let job_id = enqueue(&h.store, "a calm lake at dusk", 10, 3);

    run_worker_for(&h, Duration::from_millis(200)).await;

    let job = h.store.job(job_id).expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.result_key.as_deref(),
        Some(format!("artwork/user-1/{job_id}.png").as_str())
    );

    // One deduct, no refunds on the happy path.
    assert_eq!(h.credits.deducts.lock().unwrap().len(), 1);
    assert!(h.credits.refunds.lock().unwrap().is_empty());

    let events = h.notifier.events.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| e.job_id == job_id && e.status == JobStatus::Completed));
}

#[tokio::test]
async fn concurrent_claims_yield_exactly_one_winner() {
    let store = MemoryJobStore::default();
    let job_id = enqueue(&store, "contested", 0, 3);

    let (a, b) = futures::join!(store.claim_job(job_id, 0), store.claim_job(job_id, 0));
    let a = a.unwrap();
    let b = b.unwrap();

    assert!(a.is_some() != b.is_some(), "exactly one claim must win");
    assert_eq!(store.job(job_id).unwrap().status, JobStatus::Processing);
}

#[tokio::test]
async fn higher_priority_jobs_are_claimed_first() {
    let client = Arc::new(SuccessClient {
        prompts: Mutex::new(Vec::new()),
    });
    let h = harness(
        client.clone(),
        WorkerConfig {
            global_concurrency: 1,
            ..fast_config()
        },
    );

    let _low = enqueue(&h.store, "low priority artwork", 50, 3);
    let _high = enqueue(&h.store, "high priority artwork", 100, 3);

    // The high-priority job was enqueued later but must be served first.
    let pending = h.store.fetch_pending(10).await.unwrap();
    assert_eq!(pending[0].prompt, "high priority artwork");

    run_worker_for(&h, Duration::from_millis(300)).await;

    let prompts = client.prompts.lock().unwrap().clone();
    assert_eq!(prompts.first().map(String::as_str), Some("high priority artwork"));
}

#[tokio::test]
async fn interrupted_processing_jobs_are_swept_on_startup() {
    let client = Arc::new(FailingClient {
        calls: AtomicUsize::new(0),
    });
    let h = harness(client.clone(), fast_config());

    // A job stuck in processing by a dead incarnation, retries exhausted.
    let job_id = {
        let id = enqueue(&h.store, "orphaned", 0, 3);
        let mut jobs = h.store.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).unwrap();
        job.status = JobStatus::Processing;
        job.retry_count = 3;
        job.started_at = Some(Utc::now() - TimeDelta::seconds(600));
        id
    };

    run_worker_for(&h, Duration::from_millis(100)).await;

    // Swept straight to quarantine without another upstream call.
    let job = h.store.job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);

    // The dead incarnation's attempt is refunded idempotently.
    let refunds = h.credits.refunds.lock().unwrap().clone();
    assert_eq!(refunds, vec![format!("{job_id}:4:refund")]);
}
