use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use artgen_gateway::config::AppConfig;
use artgen_gateway::db::{self, queries::PgJobStore, JobStore};
use artgen_gateway::services::breaker::{BreakerConfig, HealthTracker};
use artgen_gateway::services::credits::{CreditLedger, PgCreditLedger};
use artgen_gateway::services::dead_letter::{DeadLetterConfig, DeadLetterStore};
use artgen_gateway::services::generation::{GenerationClient, HttpGenerationClient};
use artgen_gateway::services::notifier::BroadcastNotifier;
use artgen_gateway::services::recovery::{ProbeBudget, RecoveryConfig, RecoveryOrchestrator};
use artgen_gateway::services::storage::{ArtworkStore, R2ArtworkStore};
use artgen_gateway::services::telemetry::{LogTelemetry, TelemetrySink};
use artgen_gateway::services::worker::{JobWorker, WorkerConfig};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting artwork generation worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let storage: Arc<dyn ArtworkStore> = Arc::new(
        R2ArtworkStore::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
        )
        .expect("Failed to initialize R2 storage"),
    );

    let client: Arc<dyn GenerationClient> = Arc::new(
        HttpGenerationClient::new(&config.generation_api_url, &config.generation_api_token)
            .expect("Failed to initialize generation client"),
    );

    // Each worker process carries its own breaker view; the job table is the
    // only shared truth between processes.
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(LogTelemetry);
    let tracker = Arc::new(HealthTracker::new(BreakerConfig::default()));
    let dead_letters = Arc::new(DeadLetterStore::new(
        DeadLetterConfig::default(),
        telemetry.clone(),
    ));
    let recovery_config = RecoveryConfig::default();
    let budget = Arc::new(ProbeBudget::new(
        recovery_config.hourly_budget,
        recovery_config.budget_window,
    ));
    let notifier = Arc::new(BroadcastNotifier::new(256));
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool.clone()));
    let credits: Arc<dyn CreditLedger> = Arc::new(PgCreditLedger::new(db_pool));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let orchestrator = RecoveryOrchestrator::new(
        tracker.clone(),
        client.clone(),
        budget,
        telemetry.clone(),
        recovery_config,
    );
    let recovery_handle = tokio::spawn(orchestrator.run(shutdown_rx.clone()));

    let worker = Arc::new(JobWorker::new(
        store,
        tracker,
        dead_letters,
        client,
        credits,
        storage,
        telemetry,
        notifier,
        WorkerConfig::default(),
    ));

    tracing::info!("Worker ready, starting job processing loop");
    worker.run(shutdown_rx).await;

    let _ = recovery_handle.await;
    tracing::info!("Worker stopped");
}
