use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::breaker::BreakerSnapshot;
use crate::services::dead_letter::DeadLetterEntry;

#[derive(Serialize)]
pub struct BreakerOpsResponse {
    pub breaker: BreakerSnapshot,
    pub probe_spend_last_hour: f64,
}

/// GET /api/v1/ops/breaker — breaker state and probe spend for operators.
pub async fn breaker_state(State(state): State<AppState>) -> Json<BreakerOpsResponse> {
    Json(BreakerOpsResponse {
        breaker: state.tracker.snapshot(),
        probe_spend_last_hour: state.budget.current_spend(),
    })
}

#[derive(Serialize)]
pub struct DeadLetterListResponse {
    pub count: usize,
    pub entries: Vec<DeadLetterEntry>,
}

/// GET /api/v1/ops/dead-letters — quarantined jobs needing attention.
pub async fn dead_letters(State(state): State<AppState>) -> Json<DeadLetterListResponse> {
    state.dead_letters.cleanup_expired();
    let entries = state.dead_letters.entries();
    Json(DeadLetterListResponse {
        count: entries.len(),
        entries,
    })
}
