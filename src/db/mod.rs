use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{GenerationJob, NewJob};

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Port to the durable job store.
///
/// Every mutating operation that follows a read carries the `version` the
/// caller read; the store applies it as a conditional update. A `false` /
/// `None` result means another worker got there first and the caller must
/// abandon the job silently.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, new: NewJob) -> Result<GenerationJob, sqlx::Error>;

    async fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>, sqlx::Error>;

    /// Pending jobs eligible to run now, highest priority first, ties broken
    /// by earliest creation.
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<GenerationJob>, sqlx::Error>;

    /// Atomically claim a pending job (status -> processing). Returns the
    /// updated row, or `None` when the compare-and-swap lost.
    async fn claim_job(&self, id: Uuid, version: i64)
        -> Result<Option<GenerationJob>, sqlx::Error>;

    async fn complete_job(
        &self,
        id: Uuid,
        version: i64,
        result_key: &str,
    ) -> Result<bool, sqlx::Error>;

    /// Return a failed job to pending with its new retry count and the
    /// backoff-derived `not_before` eligibility time.
    async fn schedule_retry(
        &self,
        id: Uuid,
        version: i64,
        retry_count: i32,
        not_before: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, sqlx::Error>;

    async fn mark_dead_letter(&self, id: Uuid, version: i64, error: &str)
        -> Result<bool, sqlx::Error>;

    /// Park a job as failed without quarantining it (e.g. the user ran out
    /// of credit). Operators can re-enqueue parked jobs.
    async fn mark_failed(&self, id: Uuid, version: i64, error: &str) -> Result<bool, sqlx::Error>;

    /// Jobs stuck in processing since before the cutoff, left behind by a
    /// dead worker incarnation.
    async fn fetch_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, sqlx::Error>;
}

pub mod queries;
