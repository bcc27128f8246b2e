use sqlx::PgPool;
use std::sync::Arc;

use crate::db::JobStore;
use crate::services::breaker::HealthTracker;
use crate::services::dead_letter::DeadLetterStore;
use crate::services::notifier::BroadcastNotifier;
use crate::services::recovery::ProbeBudget;

/// Shared application state passed to all route handlers.
///
/// Everything is constructed once at the composition root and injected; no
/// component reaches for ambient singletons.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<dyn JobStore>,
    pub tracker: Arc<HealthTracker>,
    pub dead_letters: Arc<DeadLetterStore>,
    pub budget: Arc<ProbeBudget>,
    pub notifier: Arc<BroadcastNotifier>,
    pub job_max_retries: i32,
}

impl AppState {
    pub fn new(
        db: PgPool,
        store: Arc<dyn JobStore>,
        tracker: Arc<HealthTracker>,
        dead_letters: Arc<DeadLetterStore>,
        budget: Arc<ProbeBudget>,
        notifier: Arc<BroadcastNotifier>,
        job_max_retries: i32,
    ) -> Self {
        Self {
            db,
            store,
            tracker,
            dead_letters,
            budget,
            notifier,
            job_max_retries,
        }
    }
}
