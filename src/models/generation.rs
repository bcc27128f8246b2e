use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to enqueue an artwork generation job.
#[derive(Debug, Deserialize, Validate)]
pub struct GenerateRequest {
    #[garde(length(min = 1, max = 2000))]
    pub prompt: String,

    /// Higher priority jobs are claimed first.
    #[garde(range(min = 0, max = 1000))]
    #[serde(default)]
    pub priority: i32,

    /// Optional client session the artwork belongs to.
    #[garde(length(min = 1, max = 100))]
    pub session_id: Option<String>,

    /// Opaque style parameters forwarded to the generation API.
    #[garde(skip)]
    pub style_params: Option<serde_json::Value>,
}

/// Response after enqueueing a generation job.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub job_id: Uuid,
    pub status: String,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub result_key: Option<String>,
    pub error: Option<String>,
    pub retry_count: i32,
}
