use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::{Channel, ChannelSet};
use crate::store::{Recipient, RecipientDirectory, RecipientGroup, StoreResult};

#[derive(sqlx::FromRow)]
struct RecipientRow {
    recipient_id: i64,
    hub_id: Option<i64>,
    enabled: bool,
    channels: Vec<String>,
}

/// Reads the host-maintained `notification_recipients` read model
#[derive(Clone)]
pub struct PgRecipientDirectory {
    pool: PgPool,
}

impl PgRecipientDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientDirectory for PgRecipientDirectory {
    async fn resolve(&self, group: &RecipientGroup) -> StoreResult<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, RecipientRow>(
            r#"
            SELECT recipient_id, hub_id, enabled, channels
            FROM notification_recipients
            WHERE audience = $1
              AND ($2::BIGINT IS NULL OR group_id = $2)
              AND ($3::BIGINT IS NULL OR recipient_id = $3)
            ORDER BY recipient_id
            "#,
        )
        .bind(group.audience().as_str())
        .bind(group.group_id())
        .bind(group.recipient_id())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                // Unknown channel names in the read model are ignored
                let channels: ChannelSet = row
                    .channels
                    .iter()
                    .filter_map(|c| c.parse::<Channel>().ok())
                    .collect();

                Recipient {
                    id: row.recipient_id,
                    enabled: row.enabled,
                    hub_id: row.hub_id,
                    channels,
                }
            })
            .collect())
    }
}
