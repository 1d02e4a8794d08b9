use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::BTreeMap;

use crate::models::{Audience, Channel, NewNotification, Notification};
use crate::store::{InsertOutcome, NotificationStore, ReadFilter, StoreError, StoreResult};

const NOTIFICATION_COLUMNS: &str = r#"
    id, audience, event_id, event_type, recipient_id, channel, title, body, metadata,
    restaurant_id, hub_id, agency_id, shared_read, read, read_by, read_at, delivered_at, created_at
"#;

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: i64,
    audience: String,
    event_id: String,
    event_type: String,
    recipient_id: i64,
    channel: String,
    title: String,
    body: String,
    metadata: serde_json::Value,
    restaurant_id: Option<i64>,
    hub_id: Option<i64>,
    agency_id: Option<i64>,
    shared_read: bool,
    read: bool,
    read_by: Option<i64>,
    read_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let corrupt = |e: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("notifications {}: {}", row.id, e))
        };

        let audience: Audience = row.audience.parse().map_err(|e| corrupt(&e))?;
        let channel: Channel = row.channel.parse().map_err(|e| corrupt(&e))?;
        let metadata: BTreeMap<String, String> =
            serde_json::from_value(row.metadata).map_err(|e| corrupt(&e))?;

        Ok(Notification {
            id: row.id,
            audience,
            event_id: row.event_id,
            event_type: row.event_type,
            recipient_id: row.recipient_id,
            channel,
            title: row.title,
            body: row.body,
            metadata,
            restaurant_id: row.restaurant_id,
            hub_id: row.hub_id,
            agency_id: row.agency_id,
            shared_read: row.shared_read,
            read: row.read,
            read_by: row.read_by,
            read_at: row.read_at,
            delivered_at: row.delivered_at,
            created_at: row.created_at,
        })
    }
}

/// Postgres-backed notification rows
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, new: NewNotification) -> StoreResult<InsertOutcome> {
        let metadata = serde_json::to_value(&new.metadata)?;

        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            INSERT INTO notifications
                (audience, event_id, event_type, recipient_id, channel, title, body, metadata,
                 restaurant_id, hub_id, agency_id, shared_read)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (audience, event_id, recipient_id, channel) DO NOTHING
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(new.audience.as_str())
        .bind(&new.event_id)
        .bind(&new.event_type)
        .bind(new.recipient_id)
        .bind(new.channel.as_str())
        .bind(&new.title)
        .bind(&new.body)
        .bind(metadata)
        .bind(new.restaurant_id)
        .bind(new.hub_id)
        .bind(new.agency_id)
        .bind(new.shared_read)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(InsertOutcome::Inserted(row.try_into()?)),
            None => Ok(InsertOutcome::Duplicate),
        }
    }

    async fn get(&self, id: i64) -> StoreResult<Option<Notification>> {
        sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Notification::try_from)
        .transpose()
    }

    async fn mark_delivered(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE notifications SET delivered_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_read(
        &self,
        filter: &ReadFilter,
        reader_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        // (audience, key column, shared rows only, key)
        let (audience, column, shared_only, key) = match *filter {
            ReadFilter::Notification(id) => (None, "id", false, id),
            ReadFilter::Restaurant(id) => (Some(Audience::Restaurant), "restaurant_id", true, id),
            ReadFilter::RestaurantHub(id) => (Some(Audience::Restaurant), "hub_id", true, id),
            ReadFilter::RestaurantHubAll(id) => (Some(Audience::Restaurant), "hub_id", false, id),
            ReadFilter::Agency(id) => (Some(Audience::Agency), "agency_id", true, id),
            ReadFilter::AgencyHub(id) => (Some(Audience::Agency), "hub_id", true, id),
            ReadFilter::AgencyHubAll(id) => (Some(Audience::Agency), "hub_id", false, id),
        };

        let mut scope = format!("{column} = $3");
        if let Some(audience) = audience {
            scope.push_str(&format!(" AND audience = '{}'", audience.as_str()));
        }
        if shared_only {
            scope.push_str(" AND shared_read");
        }

        let sql = format!(
            "UPDATE notifications SET read = TRUE, read_by = $1, read_at = $2 \
             WHERE read = FALSE AND {scope}"
        );
        let query = sqlx::query(&sql).bind(reader_id).bind(at).bind(key);

        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn count_for_event(&self, audience: Audience, event_id: &str) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM notifications WHERE audience = $1 AND event_id = $2",
        )
        .bind(audience.as_str())
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
