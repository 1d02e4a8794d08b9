use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use crate::store::{OutboxCounts, OutboxStore, StoreError, StoreResult};

const OUTBOX_COLUMNS: &str = r#"
    id, event_id, aggregate_type, aggregate_id, event_type, payload, status,
    retry_count, last_error, next_attempt_at, created_at, published_at
"#;

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    event_id: String,
    aggregate_type: String,
    aggregate_id: Option<i64>,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status: OutboxStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("event_outbox {}: {}", row.id, e)))?;

        Ok(OutboxEvent {
            id: row.id,
            event_id: row.event_id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status,
            retry_count: row.retry_count,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            published_at: row.published_at,
        })
    }
}

/// Insert an outbox event within the caller's transaction
///
/// Errors propagate so the surrounding business transaction aborts: a
/// domain change must never commit without its notification intent. Call
/// [`crate::outbox::CommitHook::committed`] with the returned id once the
/// transaction has committed.
pub async fn append_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewOutboxEvent,
) -> Result<OutboxEvent, StoreError> {
    let row = sqlx::query_as::<_, OutboxRow>(&format!(
        r#"
        INSERT INTO event_outbox (event_id, aggregate_type, aggregate_id, event_type, payload, status)
        VALUES ($1, $2, $3, $4, $5, 'PENDING')
        RETURNING {OUTBOX_COLUMNS}
        "#
    ))
    .bind(&event.event_id)
    .bind(&event.aggregate_type)
    .bind(event.aggregate_id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .fetch_one(&mut **tx)
    .await?;

    row.try_into()
}

/// Postgres-backed outbox
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn append(&self, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
        let mut tx = self.pool.begin().await?;
        let row = append_in_tx(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<OutboxEvent>> {
        sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM event_outbox WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(OutboxEvent::try_from)
        .transpose()
    }

    async fn fetch_publishable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        max_attempts: i32,
    ) -> StoreResult<Vec<OutboxEvent>> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM event_outbox
            WHERE status = 'PENDING'
               OR (status = 'FAILED'
                   AND next_attempt_at IS NOT NULL
                   AND next_attempt_at <= $1
                   AND retry_count < $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(now)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutboxEvent::try_from).collect()
    }

    async fn mark_processed(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'PROCESSED', published_at = $2, next_attempt_at = NULL, last_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<i32> {
        let retry_count = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE event_outbox
            SET status = 'FAILED', retry_count = retry_count + 1,
                last_error = $2, next_attempt_at = $3
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::Corrupt(format!("outbox row {} vanished", id)))?;

        Ok(retry_count)
    }

    async fn park(&self, id: i64, error: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'FAILED', last_error = $2, next_attempt_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM event_outbox WHERE status = 'PROCESSED' AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn counts(&self, max_attempts: i32) -> StoreResult<OutboxCounts> {
        let (pending, failed_retryable, dead) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING'),
                COUNT(*) FILTER (WHERE status = 'FAILED'
                                   AND next_attempt_at IS NOT NULL
                                   AND retry_count < $1),
                COUNT(*) FILTER (WHERE status = 'FAILED'
                                   AND (next_attempt_at IS NULL OR retry_count >= $1))
            FROM event_outbox
            "#,
        )
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxCounts {
            pending,
            failed_retryable,
            dead,
        })
    }
}
