use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::{Audience, ProcessedStatus};
use crate::store::{BeginOutcome, ProcessedEventStore, StoreError, StoreResult};

/// Postgres-backed idempotency ledger
#[derive(Clone)]
pub struct PgProcessedEvents {
    pool: PgPool,
}

impl PgProcessedEvents {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventStore for PgProcessedEvents {
    async fn status(
        &self,
        audience: Audience,
        event_id: &str,
    ) -> StoreResult<Option<ProcessedStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM processed_events WHERE audience = $1 AND event_id = $2",
        )
        .bind(audience.as_str())
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        status
            .map(|s| {
                s.parse()
                    .map_err(|e| StoreError::Corrupt(format!("processed_events {}: {}", event_id, e)))
            })
            .transpose()
    }

    async fn begin(
        &self,
        audience: Audience,
        event_id: &str,
        event_type: &str,
    ) -> StoreResult<BeginOutcome> {
        // No row back means the conflicting row is already SUCCESS
        let started = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO processed_events (audience, event_id, event_type, status)
            VALUES ($1, $2, $3, 'PROCESSING')
            ON CONFLICT (audience, event_id) DO UPDATE
                SET status = 'PROCESSING',
                    attempts = processed_events.attempts + 1,
                    updated_at = NOW()
                WHERE processed_events.status <> 'SUCCESS'
            RETURNING status
            "#,
        )
        .bind(audience.as_str())
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match started {
            Some(_) => BeginOutcome::Started,
            None => BeginOutcome::AlreadyProcessed,
        })
    }

    async fn complete(&self, audience: Audience, event_id: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET status = 'SUCCESS', last_error = NULL, updated_at = NOW()
            WHERE audience = $1 AND event_id = $2
            "#,
        )
        .bind(audience.as_str())
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail(&self, audience: Audience, event_id: &str, error: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET status = 'FAILED', last_error = $3, updated_at = NOW()
            WHERE audience = $1 AND event_id = $2 AND status <> 'SUCCESS'
            "#,
        )
        .bind(audience.as_str())
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
