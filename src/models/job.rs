use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of an artwork generation job in the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl JobStatus {
    /// Terminal states are never claimed or retried again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLetter)
    }
}

/// An artwork generation job.
///
/// The row in `generation_jobs` is the source of truth; `version` backs the
/// optimistic claim protocol, so every mutation goes through a conditional
/// update carrying the version the caller last read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: Option<String>,
    pub prompt: String,
    pub style_params: serde_json::Value,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub version: i64,
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_key: Option<String>,
    pub error: Option<String>,
}

/// Fields needed to insert a fresh pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub session_id: Option<String>,
    pub prompt: String,
    pub style_params: serde_json::Value,
    pub priority: i32,
    pub max_retries: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_strings() {
        assert_eq!(JobStatus::DeadLetter.to_string(), "dead_letter");
        assert_eq!("processing".parse::<JobStatus>().ok(), Some(JobStatus::Processing));
        assert_eq!("dead_letter".parse::<JobStatus>().ok(), Some(JobStatus::DeadLetter));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
