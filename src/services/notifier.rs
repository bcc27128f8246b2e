use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::job::JobStatus;

/// A job lifecycle transition broadcast to connected clients.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub user_id: String,
    pub status: JobStatus,
    pub detail: Option<String>,
}

/// Port for best-effort job lifecycle notifications. Delivery is not
/// required for correctness; implementations must never fail the caller.
pub trait JobNotifier: Send + Sync {
    fn notify(&self, event: JobEvent);
}

/// In-process fan-out over a tokio broadcast channel. Slow or absent
/// subscribers drop events rather than backpressuring the worker.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl JobNotifier for BroadcastNotifier {
    fn notify(&self, event: JobEvent) {
        // Err here only means no live subscribers.
        let _ = self.tx.send(event);
    }
}
