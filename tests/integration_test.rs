use artgen_gateway::{
    config::AppConfig,
    db::{self, queries::PgJobStore, JobStore},
    models::job::{JobStatus, NewJob},
    services::credits::{CreditLedger, PgCreditLedger},
};
use chrono::Utc;

/// Integration test: durable queue round trip against live PostgreSQL.
///
/// Covers:
/// 1. Database connection and migrations
/// 2. Job insert/get
/// 3. Optimistic claim (and the losing side of the version race)
/// 4. Retry scheduling with not_before
/// 5. Completion and terminal status
/// 6. Credit deduct/refund idempotency
///
/// Note: This requires a running PostgreSQL instance configured via
/// environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_durable_queue_round_trip() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let store = PgJobStore::new(db_pool.clone());

    // 1. Insert a job
    let job = store
        .insert_job(NewJob {
            user_id: "test-user".into(),
            session_id: Some("test-session".into()),
            prompt: "integration test artwork".into(),
            style_params: serde_json::json!({ "palette": "warm" }),
            priority: 100,
            max_retries: 3,
        })
        .await
        .expect("Failed to insert job");

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.version, 0);

    // 2. Retrieve it
    let fetched = store
        .get_job(job.id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.prompt, "integration test artwork");

    // 3. Pending poll sees it ahead of a lower-priority sibling
    let low = store
        .insert_job(NewJob {
            user_id: "test-user".into(),
            session_id: None,
            prompt: "low priority".into(),
            style_params: serde_json::json!({}),
            priority: 50,
            max_retries: 3,
        })
        .await
        .expect("Failed to insert low-priority job");

    let pending = store.fetch_pending(10).await.expect("Failed to poll");
    let high_pos = pending.iter().position(|j| j.id == job.id);
    let low_pos = pending.iter().position(|j| j.id == low.id);
    assert!(high_pos.expect("high job visible") < low_pos.expect("low job visible"));

    // 4. Claim it; a second claim with the stale version must lose
    let claimed = store
        .claim_job(job.id, job.version)
        .await
        .expect("Claim failed")
        .expect("Claim lost unexpectedly");
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.version, job.version + 1);

    let loser = store
        .claim_job(job.id, job.version)
        .await
        .expect("Second claim errored");
    assert!(loser.is_none(), "stale-version claim must be a no-op");

    // 5. Schedule a retry and verify eligibility gating
    let not_before = Utc::now() + chrono::TimeDelta::seconds(30);
    let retried = store
        .schedule_retry(claimed.id, claimed.version, 1, not_before, "transient failure")
        .await
        .expect("Retry scheduling failed");
    assert!(retried);

    let after_retry = store
        .get_job(job.id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(after_retry.status, JobStatus::Pending);
    assert_eq!(after_retry.retry_count, 1);

    // not_before in the future keeps it out of the poll
    let pending = store.fetch_pending(10).await.expect("Failed to poll");
    assert!(!pending.iter().any(|j| j.id == job.id));

    // 6. Claim again and complete
    let reclaimed = store
        .claim_job(job.id, after_retry.version)
        .await
        .expect("Claim failed")
        .expect("Reclaim lost");
    let completed = store
        .complete_job(reclaimed.id, reclaimed.version, "artwork/test-user/result.png")
        .await
        .expect("Completion failed");
    assert!(completed);

    let final_job = store
        .get_job(job.id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(final_job.status, JobStatus::Completed);
    assert_eq!(
        final_job.result_key.as_deref(),
        Some("artwork/test-user/result.png")
    );

    // 7. Credit ledger idempotency
    let credits = PgCreditLedger::new(db_pool.clone());
    let user = format!("credit-user-{}", uuid::Uuid::new_v4());
    sqlx::query("INSERT INTO user_credits (user_id, balance) VALUES ($1, 10)")
        .bind(&user)
        .execute(&db_pool)
        .await
        .expect("Failed to seed credits");

    let key = format!("{}:1", job.id);
    credits.deduct(&user, 1, &key).await.expect("Deduct failed");
    // Replaying the same key must not charge twice.
    credits.deduct(&user, 1, &key).await.expect("Replay failed");

    let refund_key = format!("{}:1:refund", job.id);
    credits
        .refund(&user, 1, "test", &refund_key)
        .await
        .expect("Refund failed");
    credits
        .refund(&user, 1, "test", &refund_key)
        .await
        .expect("Refund replay failed");

    let balance: i64 = sqlx::query_scalar("SELECT balance FROM user_credits WHERE user_id = $1")
        .bind(&user)
        .fetch_one(&db_pool)
        .await
        .expect("Failed to read balance");
    assert_eq!(balance, 10, "one deduct and one refund must net to zero");

    // Cleanup
    sqlx::query("DELETE FROM generation_jobs WHERE id = $1 OR id = $2")
        .bind(job.id)
        .bind(low.id)
        .execute(&db_pool)
        .await
        .expect("Cleanup failed");
    sqlx::query("DELETE FROM credit_entries WHERE user_id = $1")
        .bind(&user)
        .execute(&db_pool)
        .await
        .expect("Cleanup failed");
    sqlx::query("DELETE FROM user_credits WHERE user_id = $1")
        .bind(&user)
        .execute(&db_pool)
        .await
        .expect("Cleanup failed");
}
