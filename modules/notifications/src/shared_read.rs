//! Shared read
//!
//! Marking one notification as read can mark every unread notification that
//! shares its group key. Group scopes only touch rows flagged `shared_read`;
//! personal rows (direct messages, assignments) stay unread for their owner
//! unless a `*_HUB_ALL` read sweeps the hub.
//!
//! | Scope                | Group key       | Rows updated                               |
//! |----------------------|-----------------|--------------------------------------------|
//! | `SINGLE`             | notification id | that row                                   |
//! | `RESTAURANT`         | restaurant id   | the restaurant's shared rows               |
//! | `RESTAURANT_HUB`     | hub id          | shared rows of every restaurant in the hub |
//! | `RESTAURANT_HUB_ALL` | hub id          | every restaurant row in the hub            |
//! | `AGENCY`             | agency id       | the agency's shared rows                   |
//! | `AGENCY_HUB`         | hub id          | shared rows of every agency in the hub     |
//! | `AGENCY_HUB_ALL`     | hub id          | every agency row in the hub                |

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::models::{Audience, Notification};
use crate::store::{NotificationStore, ReadFilter, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedReadScope {
    Single,
    Restaurant,
    RestaurantHub,
    RestaurantHubAll,
    Agency,
    AgencyHub,
    AgencyHubAll,
}

impl SharedReadScope {
    pub const ALL: [SharedReadScope; 7] = [
        SharedReadScope::Single,
        SharedReadScope::Restaurant,
        SharedReadScope::RestaurantHub,
        SharedReadScope::RestaurantHubAll,
        SharedReadScope::Agency,
        SharedReadScope::AgencyHub,
        SharedReadScope::AgencyHubAll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SharedReadScope::Single => "SINGLE",
            SharedReadScope::Restaurant => "RESTAURANT",
            SharedReadScope::RestaurantHub => "RESTAURANT_HUB",
            SharedReadScope::RestaurantHubAll => "RESTAURANT_HUB_ALL",
            SharedReadScope::Agency => "AGENCY",
            SharedReadScope::AgencyHub => "AGENCY_HUB",
            SharedReadScope::AgencyHubAll => "AGENCY_HUB_ALL",
        }
    }

    /// Audience the scope is bounded to; `None` for `SINGLE`
    pub fn audience(&self) -> Option<Audience> {
        match self {
            SharedReadScope::Single => None,
            SharedReadScope::Restaurant
            | SharedReadScope::RestaurantHub
            | SharedReadScope::RestaurantHubAll => Some(Audience::Restaurant),
            SharedReadScope::Agency | SharedReadScope::AgencyHub | SharedReadScope::AgencyHubAll => {
                Some(Audience::Agency)
            }
        }
    }

    /// The group key this scope uses, read off a notification row
    pub fn group_key_of(&self, notification: &Notification) -> Option<i64> {
        match self {
            SharedReadScope::Single => Some(notification.id),
            SharedReadScope::Restaurant => notification.restaurant_id,
            SharedReadScope::Agency => notification.agency_id,
            SharedReadScope::RestaurantHub
            | SharedReadScope::RestaurantHubAll
            | SharedReadScope::AgencyHub
            | SharedReadScope::AgencyHubAll => notification.hub_id,
        }
    }

    fn filter(&self, group_key: Option<i64>) -> Result<ReadFilter, SharedReadError> {
        let key = group_key.ok_or(SharedReadError::MissingGroupKey(*self))?;

        Ok(match self {
            SharedReadScope::Single => ReadFilter::Notification(key),
            SharedReadScope::Restaurant => ReadFilter::Restaurant(key),
            SharedReadScope::RestaurantHub => ReadFilter::RestaurantHub(key),
            SharedReadScope::RestaurantHubAll => ReadFilter::RestaurantHubAll(key),
            SharedReadScope::Agency => ReadFilter::Agency(key),
            SharedReadScope::AgencyHub => ReadFilter::AgencyHub(key),
            SharedReadScope::AgencyHubAll => ReadFilter::AgencyHubAll(key),
        })
    }
}

impl fmt::Display for SharedReadScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SharedReadScope {
    type Err = SharedReadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        SharedReadScope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == upper)
            .ok_or_else(|| SharedReadError::UnsupportedScope(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SharedReadError {
    #[error("unsupported shared-read scope '{0}'")]
    UnsupportedScope(String),

    #[error("scope {0} requires a group key")]
    MissingGroupKey(SharedReadScope),

    #[error("notification {0} not found")]
    NotFound(i64),

    #[error("notification {notification_id} belongs to {audience}, not scope {scope}")]
    ScopeMismatch {
        notification_id: i64,
        audience: Audience,
        scope: SharedReadScope,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One entry of a bulk read request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReadItem {
    pub notification_id: i64,
    pub scope: String,
}

#[derive(Debug, Default)]
pub struct BulkReadReport {
    pub updated: u64,
    pub failures: Vec<(i64, SharedReadError)>,
}

#[derive(Clone)]
pub struct SharedReadService {
    store: Arc<dyn NotificationStore>,
}

impl SharedReadService {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// One bulk update for the scope; returns rows updated
    pub async fn mark_as_read(
        &self,
        scope: SharedReadScope,
        group_key: Option<i64>,
        reader_id: i64,
        at: DateTime<Utc>,
    ) -> Result<u64, SharedReadError> {
        let filter = scope.filter(group_key)?;
        let updated = self.store.mark_read(&filter, reader_id, at).await?;

        tracing::debug!(
            scope = %scope,
            group_key = ?group_key,
            reader_id,
            updated,
            "Shared read applied"
        );
        Ok(updated)
    }

    /// Apply each item independently; one failure does not undo the others
    pub async fn mark_bulk_as_read(
        &self,
        items: &[BulkReadItem],
        reader_id: i64,
        at: DateTime<Utc>,
    ) -> BulkReadReport {
        let mut report = BulkReadReport::default();

        for item in items {
            match self.mark_item(item, reader_id, at).await {
                Ok(updated) => report.updated += updated,
                Err(e) => {
                    tracing::warn!(
                        notification_id = item.notification_id,
                        scope = %item.scope,
                        error = %e,
                        "Bulk read item failed"
                    );
                    report.failures.push((item.notification_id, e));
                }
            }
        }

        report
    }

    async fn mark_item(
        &self,
        item: &BulkReadItem,
        reader_id: i64,
        at: DateTime<Utc>,
    ) -> Result<u64, SharedReadError> {
        let scope: SharedReadScope = item.scope.parse()?;
        let notification = self
            .store
            .get(item.notification_id)
            .await?
            .ok_or(SharedReadError::NotFound(item.notification_id))?;

        if let Some(audience) = scope.audience() {
            if audience != notification.audience {
                return Err(SharedReadError::ScopeMismatch {
                    notification_id: notification.id,
                    audience: notification.audience,
                    scope,
                });
            }
        }

        let group_key = scope.group_key_of(&notification);
        self.mark_as_read(scope, group_key, reader_id, at).await
    }
}
