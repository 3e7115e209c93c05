use crate::engagement::{EngagementLevel, SubscriberAnalytics, SubscriptionStatus};
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::FromRow;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

// ===== Response Wrappers =====

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DataResponse<T> {
    pub data: T,
}

// ===== Subscriber Models =====

/// Columns selected whenever a full subscriber is loaded.
pub const SUBSCRIBER_COLUMNS: &str = "id, email, status, subscribed_at, unsubscribed_at, \
     engagement_score, engagement_level, analytics";

#[derive(Debug, Clone, FromRow)]
pub struct SubscriberRow {
    pub id: Uuid,
    pub email: String,
    pub status: SubscriptionStatus,
    pub subscribed_at: DateTime<Utc>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub engagement_score: i32,
    pub engagement_level: EngagementLevel,
    pub analytics: Option<Json<SubscriberAnalytics>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub id: Uuid,
    pub email: String,
    pub status: SubscriptionStatus,
    pub subscribed_at: DateTime<Utc>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub engagement_score: i32,
    pub engagement_level: EngagementLevel,
    pub analytics: Option<SubscriberAnalytics>,
}

impl From<SubscriberRow> for Subscriber {
    fn from(row: SubscriberRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            status: row.status,
            subscribed_at: row.subscribed_at,
            unsubscribed_at: row.unsubscribed_at,
            engagement_score: row.engagement_score,
            engagement_level: row.engagement_level,
            analytics: row.analytics.map(|Json(analytics)| analytics),
        }
    }
}

// ===== Failed Delivery Models =====

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailedEmail {
    pub id: Uuid,
    pub recipient: String,
    pub subject: Option<String>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
