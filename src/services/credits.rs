use async_trait::async_trait;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    #[error("insufficient credit for user {user_id}")]
    InsufficientCredit { user_id: String },

    #[error("credit store error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Port to the credit/billing controller.
///
/// Both operations are idempotent on the key: replaying a deduct or refund
/// with a key that was already applied is a no-op, never a double charge.
/// The worker derives keys from job id and attempt number so each attempt
/// charges and refunds at most once.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn deduct(
        &self,
        user_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<(), CreditError>;

    async fn refund(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<(), CreditError>;
}

/// Credit ledger backed by the `user_credits` balance table and an
/// append-only `credit_entries` journal with a unique idempotency key.
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn deduct(
        &self,
        user_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<(), CreditError> {
        let mut tx = self.pool.begin().await?;

        let journaled = sqlx::query(
            r#"
            INSERT INTO credit_entries (user_id, amount, reason, idempotency_key)
            VALUES ($1, $2, 'generation', $3)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(-amount)
        .bind(idempotency_key)
        .execute(&mut *tx)
        .await?;

        if journaled.rows_affected() == 0 {
            // Replay of an already-applied deduction.
            tx.rollback().await?;
            return Ok(());
        }

        let updated = sqlx::query(
            r#"
            UPDATE user_credits
            SET balance = balance - $2
            WHERE user_id = $1 AND balance >= $2
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(CreditError::InsufficientCredit {
                user_id: user_id.to_string(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    async fn refund(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<(), CreditError> {
        let mut tx = self.pool.begin().await?;

        let journaled = sqlx::query(
            r#"
            INSERT INTO credit_entries (user_id, amount, reason, idempotency_key)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(reason)
        .bind(idempotency_key)
        .execute(&mut *tx)
        .await?;

        if journaled.rows_affected() == 0 {
            // Refund already applied for this key.
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE user_credits
            SET balance = balance + $2
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
