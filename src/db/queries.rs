use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::JobStore;
use crate::models::job::{GenerationJob, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, user_id, session_id, prompt, style_params, status, priority, \
                           retry_count, max_retries, version, not_before, created_at, \
                           started_at, completed_at, result_key, error";

/// Job store backed by the `generation_jobs` table.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_job_row(row: &PgRow) -> Result<GenerationJob, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = status_str.parse().unwrap_or(JobStatus::Pending);

    Ok(GenerationJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        prompt: row.try_get("prompt")?,
        style_params: row.try_get("style_params")?,
        status,
        priority: row.try_get("priority")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        version: row.try_get("version")?,
        not_before: row.try_get("not_before")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        result_key: row.try_get("result_key")?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, new: NewJob) -> Result<GenerationJob, sqlx::Error> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO generation_jobs (user_id, session_id, prompt, style_params, priority, max_retries)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&new.user_id)
        .bind(&new.session_id)
        .bind(&new.prompt)
        .bind(&new.style_params)
        .bind(new.priority)
        .bind(new.max_retries)
        .fetch_one(&self.pool)
        .await?;

        map_job_row(&row)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>, sqlx::Error> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE id = $1
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_job_row).transpose()
    }

    async fn fetch_pending(&self, limit: i64) -> Result<Vec<GenerationJob>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE status = 'pending' AND not_before <= NOW()
            ORDER BY priority DESC, created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_job_row).collect()
    }

    async fn claim_job(
        &self,
        id: Uuid,
        version: i64,
    ) -> Result<Option<GenerationJob>, sqlx::Error> {
        // The single conditional statement is the whole claim protocol: a
        // concurrent claimer bumps the version first and this update matches
        // zero rows.
        let row = sqlx::query(&format!(
            r#"
            UPDATE generation_jobs
            SET status = 'processing', version = version + 1, started_at = NOW()
            WHERE id = $1 AND version = $2 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_job_row).transpose()
    }

    async fn complete_job(
        &self,
        id: Uuid,
        version: i64,
        result_key: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'completed', version = version + 1,
                completed_at = NOW(), result_key = $3, error = NULL
            WHERE id = $1 AND version = $2 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(version)
        .bind(result_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        version: i64,
        retry_count: i32,
        not_before: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'pending', version = version + 1, retry_count = $3,
                not_before = $4, error = $5, started_at = NULL
            WHERE id = $1 AND version = $2 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(version)
        .bind(retry_count)
        .bind(not_before)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_dead_letter(
        &self,
        id: Uuid,
        version: i64,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'dead_letter', version = version + 1,
                completed_at = NOW(), error = $3
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(version)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: Uuid, version: i64, error: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'failed', version = version + 1,
                completed_at = NOW(), error = $3
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(version)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fetch_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE status = 'processing' AND started_at IS NOT NULL AND started_at < $1
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_job_row).collect()
    }
}
