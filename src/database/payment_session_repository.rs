use bigdecimal::BigDecimal;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};

use crate::database::error::DatabaseError;
use crate::payments::types::{PaymentSession, SessionData};

const COLUMNS: &str =
    "id, cart_id, amount, currency_code, data, version, created_at, completed_at";

/// Row shape of `payment_sessions`
#[derive(Debug, Clone, FromRow)]
pub struct PaymentSessionRow {
    pub id: String,
    pub cart_id: String,
    pub amount: BigDecimal,
    pub currency_code: String,
    pub data: JsonValue,
    pub version: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<PaymentSessionRow> for PaymentSession {
    fn from(row: PaymentSessionRow) -> Self {
        let data = match row.data {
            JsonValue::Object(map) => map,
            _ => SessionData::new(),
        };
        PaymentSession {
            id: row.id,
            cart_id: row.cart_id,
            amount: row.amount,
            currency_code: row.currency_code,
            data,
            version: row.version,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

/// Outcome of a versioned merge write
#[derive(Debug)]
pub enum MergeOutcome {
    Updated(PaymentSession),
    Conflict,
    Missing,
}

/// Repository for payment sessions
#[derive(Clone)]
pub struct PaymentSessionRepository {
    pool: PgPool,
}

impl PaymentSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<PaymentSession>, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentSessionRow>(&format!(
            "SELECT {} FROM payment_sessions WHERE id = $1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(Into::into))
    }

    pub async fn find_by_cart_id(
        &self,
        cart_id: &str,
    ) -> Result<Option<PaymentSession>, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentSessionRow>(&format!(
            "SELECT {} FROM payment_sessions WHERE cart_id = $1
             ORDER BY created_at DESC LIMIT 1",
            COLUMNS
        ))
        .bind(cart_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(Into::into))
    }

    /// Served by the expression index on `data->>'payme_transaction_id'`.
    pub async fn find_by_payme_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PaymentSession>, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentSessionRow>(&format!(
            "SELECT {} FROM payment_sessions WHERE data->>'payme_transaction_id' = $1
             ORDER BY created_at DESC LIMIT 1",
            COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(Into::into))
    }

    /// `data = data || patch` when the version still matches.
    pub async fn merge_data(
        &self,
        id: &str,
        expected_version: i64,
        patch: &SessionData,
    ) -> Result<MergeOutcome, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentSessionRow>(&format!(
            "UPDATE payment_sessions
             SET data = data || $3::jsonb, version = version + 1
             WHERE id = $1 AND version = $2
             RETURNING {}",
            COLUMNS
        ))
        .bind(id)
        .bind(expected_version)
        .bind(JsonValue::Object(patch.clone()))
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(row) = row {
            return Ok(MergeOutcome::Updated(row.into()));
        }

        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM payment_sessions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;
        Ok(match exists {
            Some(_) => MergeOutcome::Conflict,
            None => MergeOutcome::Missing,
        })
    }

    pub async fn list_payme_between(
        &self,
        from: i64,
        to: i64,
    ) -> Result<Vec<PaymentSession>, DatabaseError> {
        let rows = sqlx::query_as::<_, PaymentSessionRow>(&format!(
            "SELECT {} FROM payment_sessions
             WHERE data ? 'payme_transaction_id'
               AND (data->>'payme_create_time')::bigint BETWEEN $1 AND $2
             ORDER BY (data->>'payme_create_time')::bigint ASC",
            COLUMNS
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn list_pending_completion(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> Result<Vec<PaymentSession>, DatabaseError> {
        let rows = sqlx::query_as::<_, PaymentSessionRow>(&format!(
            "SELECT {} FROM payment_sessions
             WHERE completed_at IS NULL
               AND (data->>'payme_state' = '2'
                    OR (data->>'click_state' = 'completed'
                        AND COALESCE(data->>'click_error', '0') = '0'))
               AND COALESCE((data->>'completion_attempts')::bigint, 0) < $2
             ORDER BY COALESCE((data->>'completion_attempts')::bigint, 0) ASC,
                      (data->>'completion_last_attempt_at')::bigint ASC NULLS FIRST,
                      created_at ASC
             LIMIT $1",
            COLUMNS
        ))
        .bind(i64::from(limit))
        .bind(i64::from(max_attempts))
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn mark_completed_by_cart(&self, cart_id: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE payment_sessions
             SET completed_at = NOW(), version = version + 1
             WHERE cart_id = $1 AND completed_at IS NULL",
        )
        .bind(cart_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected())
    }
}
