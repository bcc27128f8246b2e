use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use artgen_gateway::app_state::AppState;
use artgen_gateway::config::AppConfig;
use artgen_gateway::db::{self, queries::PgJobStore, JobStore};
use artgen_gateway::routes;
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

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing artgen-gateway server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("generation_jobs_total", "Total generation jobs enqueued");
    metrics::describe_counter!("generation_jobs_started", "Generation attempts started");
    metrics::describe_counter!("generation_jobs_completed", "Generation jobs completed");
    metrics::describe_counter!("generation_jobs_retried", "Generation attempts scheduled for retry");
    metrics::describe_counter!(
        "generation_jobs_dead_lettered",
        "Jobs quarantined after exhausting retries"
    );
    metrics::describe_histogram!(
        "generation_latency_seconds",
        "Latency of successful generation calls"
    );
    metrics::describe_counter!(
        "generation_outcomes_total",
        "Generation outcomes recorded by the circuit breaker"
    );
    metrics::describe_counter!(
        "generation_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    metrics::describe_counter!("generation_probe_attempts_total", "Recovery probes issued");
    metrics::describe_gauge!(
        "generation_probe_spend_dollars",
        "Probe spend over the trailing budget window"
    );
    metrics::describe_gauge!("generation_dead_letter_size", "Entries in the dead-letter store");
    metrics::describe_counter!("gateway_events_total", "Telemetry events by kind and severity");

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize R2 artwork storage
    tracing::info!("Initializing R2 artwork storage");
    let storage: Arc<dyn ArtworkStore> = Arc::new(
        R2ArtworkStore::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
        )
        .expect("Failed to initialize R2 storage"),
    );

    // Initialize generation API client
    tracing::info!("Initializing generation API client");
    let client: Arc<dyn GenerationClient> = Arc::new(
        HttpGenerationClient::new(&config.generation_api_url, &config.generation_api_token)
            .expect("Failed to initialize generation client"),
    );

    // Compose the resilience core
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
    let credits: Arc<dyn CreditLedger> = Arc::new(PgCreditLedger::new(db_pool.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Worker loop and recovery prober run alongside the HTTP server
    let worker = Arc::new(JobWorker::new(
        store.clone(),
        tracker.clone(),
        dead_letters.clone(),
        client.clone(),
        credits,
        storage,
        telemetry.clone(),
        notifier.clone(),
        WorkerConfig::default(),
    ));
    let worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));

    let orchestrator = RecoveryOrchestrator::new(
        tracker.clone(),
        client,
        budget.clone(),
        telemetry,
        recovery_config,
    );
    let recovery_handle = tokio::spawn(orchestrator.run(shutdown_rx.clone()));

    // Create shared application state
    let state = AppState::new(
        db_pool,
        store,
        tracker,
        dead_letters,
        budget,
        notifier,
        config.job_max_retries,
    );

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/generate", post(routes::generate::submit_generation))
        .route(
            "/api/v1/generate/{job_id}",
            get(routes::generate::get_job_status),
        )
        .route("/api/v1/ops/breaker", get(routes::ops::breaker_state))
        .route("/api/v1/ops/dead-letters", get(routes::ops::dead_letters))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(256 * 1024)); // 256 KB JSON bodies

    tracing::info!("Starting artgen-gateway on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    // Flip the shutdown signal on ctrl-c so the worker can drain in-flight
    // jobs before the process exits.
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await
        .expect("Server error");

    let _ = worker_handle.await;
    let _ = recovery_handle.await;
    tracing::info!("artgen-gateway stopped");
}
