use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::generation::{GenerateRequest, GenerateResponse, JobStatusResponse};
use crate::models::job::{JobStatus, NewJob};
use crate::services::notifier::{JobEvent, JobNotifier};

/// POST /api/v1/generate — enqueue an artwork generation job.
pub async fn submit_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<GenerateResponse>), StatusCode> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_string();

    req.validate().map_err(|_| StatusCode::BAD_REQUEST)?;

    let job = state
        .store
        .insert_job(NewJob {
            user_id: user_id.clone(),
            session_id: req.session_id,
            prompt: req.prompt,
            style_params: req.style_params.unwrap_or_else(|| serde_json::json!({})),
            priority: req.priority,
            max_retries: state.job_max_retries,
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to enqueue generation job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    metrics::counter!("generation_jobs_total").increment(1);
    tracing::info!(job_id = %job.id, user_id = %user_id, priority = job.priority, "job enqueued");

    state.notifier.notify(JobEvent {
        job_id: job.id,
        user_id,
        status: JobStatus::Pending,
        detail: None,
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse {
            job_id: job.id,
            status: job.status.to_string(),
            message: "artwork generation queued".to_string(),
        }),
    ))
}

/// GET /api/v1/generate/{job_id} — check generation job status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = state
        .store
        .get_job(job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    // Quarantined jobs report a clear terminal error instead of their raw
    // failure history.
    let error = match job.status {
        JobStatus::DeadLetter => Some("generation unavailable, please retry later".to_string()),
        _ => job.error,
    };

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        status: job.status.to_string(),
        result_key: job.result_key,
        error,
        retry_count: job.retry_count,
    }))
}
