//! Subscriber store contract and its PostgreSQL implementation.
//!
//! The pipeline only ever reads subscribers and submits groups of typed writes;
//! each group passed to [`SubscriberStore::commit`] is one transaction.

use super::aggregate::RecipientStats;
use super::score::EngagementScore;
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, PgPool, Postgres, Transaction};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record {0} does not exist")]
    Missing(Uuid),
    #[error("transaction of {size} operations exceeds the store limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("store rejected the request: {0}")]
    Rejected(String),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, sqlx::Type,
)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Subscribed => "subscribed",
            SubscriptionStatus::Unsubscribed => "unsubscribed",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "subscribed" => Ok(SubscriptionStatus::Subscribed),
            "unsubscribed" => Ok(SubscriptionStatus::Unsubscribed),
            other => Err(format!("unknown subscription status '{other}'")),
        }
    }
}

/// The slice of a subscriber the pipeline reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SubscriberRecord {
    pub id: Uuid,
    pub email: String,
    pub status: SubscriptionStatus,
    pub subscribed_at: DateTime<Utc>,
}

/// Engagement analytics persisted on each synced subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberAnalytics {
    pub emails_sent: u32,
    pub emails_opened: u32,
    pub emails_clicked: u32,
    pub last_email_sent: Option<DateTime<Utc>>,
    pub last_email_opened: Option<DateTime<Utc>>,
    pub last_email_clicked: Option<DateTime<Utc>>,
    pub bounced: bool,
    /// Percent of sent mail opened, two decimals.
    pub open_rate: f64,
    /// Percent of sent mail clicked, two decimals.
    pub click_rate: f64,
    pub synced_at: DateTime<Utc>,
}

impl SubscriberAnalytics {
    pub fn from_stats(stats: &RecipientStats, synced_at: DateTime<Utc>) -> Self {
        Self {
            emails_sent: stats.emails_sent,
            emails_opened: stats.emails_opened,
            emails_clicked: stats.emails_clicked,
            last_email_sent: stats.last_email_sent,
            last_email_opened: stats.last_email_opened,
            last_email_clicked: stats.last_email_clicked,
            bounced: stats.bounced,
            open_rate: round2(stats.open_rate()),
            click_rate: round2(stats.click_rate()),
            synced_at,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A single write inside a store transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    ApplyEngagement {
        id: Uuid,
        analytics: SubscriberAnalytics,
        score: EngagementScore,
    },
    ResetEngagement {
        id: Uuid,
    },
    SetStatus {
        id: Uuid,
        status: SubscriptionStatus,
    },
    DeleteSubscriber {
        id: Uuid,
    },
    DeleteFailedEmail {
        id: Uuid,
    },
}

impl StoreWrite {
    /// Identifier of the record this write touches.
    pub fn target(&self) -> Uuid {
        match self {
            StoreWrite::ApplyEngagement { id, .. }
            | StoreWrite::ResetEngagement { id }
            | StoreWrite::SetStatus { id, .. }
            | StoreWrite::DeleteSubscriber { id }
            | StoreWrite::DeleteFailedEmail { id } => *id,
        }
    }

    /// Patches require their target to exist; deletes of absent rows are no-ops.
    pub fn requires_existing(&self) -> bool {
        !matches!(
            self,
            StoreWrite::DeleteSubscriber { .. } | StoreWrite::DeleteFailedEmail { .. }
        )
    }
}

#[rocket::async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Maximum number of writes accepted in one transaction.
    fn max_operations(&self) -> usize;

    async fn load_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<SubscriberRecord>, StoreError>;

    /// Apply every write or none of them.
    async fn commit(&self, writes: &[StoreWrite]) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgSubscriberStore {
    pool: PgPool,
    max_operations: usize,
}

impl PgSubscriberStore {
    pub fn new(pool: PgPool, max_operations: usize) -> Self {
        Self {
            pool,
            max_operations: max_operations.max(1),
        }
    }
}

#[rocket::async_trait]
impl SubscriberStore for PgSubscriberStore {
    fn max_operations(&self) -> usize {
        self.max_operations
    }

    async fn load_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<SubscriberRecord>, StoreError> {
        let records = sqlx::query_as::<_, SubscriberRecord>(
            r#"SELECT id, email, status, subscribed_at
               FROM subscribers
               WHERE status = $1
               ORDER BY subscribed_at ASC, id ASC"#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn commit(&self, writes: &[StoreWrite]) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        if writes.len() > self.max_operations {
            return Err(StoreError::TooLarge {
                size: writes.len(),
                limit: self.max_operations,
            });
        }

        let mut transaction = self.pool.begin().await?;
        for write in writes {
            apply_write(&mut transaction, write).await?;
        }
        transaction.commit().await?;

        log::trace!("committed transaction of {} writes", writes.len());
        Ok(())
    }
}

async fn apply_write(
    transaction: &mut Transaction<'_, Postgres>,
    write: &StoreWrite,
) -> Result<(), StoreError> {
    let result = match write {
        StoreWrite::ApplyEngagement {
            id,
            analytics,
            score,
        } => {
            sqlx::query(
                r#"UPDATE subscribers
                   SET analytics = $2,
                       engagement_score = $3,
                       engagement_level = $4,
                       updated_at = NOW()
                   WHERE id = $1"#,
            )
            .bind(id)
            .bind(Json(analytics))
            .bind(i32::from(score.score))
            .bind(score.level)
            .execute(&mut **transaction)
            .await?
        }
        StoreWrite::ResetEngagement { id } => {
            sqlx::query(
                r#"UPDATE subscribers
                   SET engagement_score = 0,
                       engagement_level = 'new',
                       analytics = NULL,
                       updated_at = NOW()
                   WHERE id = $1"#,
            )
            .bind(id)
            .execute(&mut **transaction)
            .await?
        }
        StoreWrite::SetStatus { id, status } => {
            sqlx::query(
                r#"UPDATE subscribers
                   SET status = $2,
                       unsubscribed_at = CASE WHEN $2 = 'unsubscribed'::subscription_status
                                              THEN COALESCE(unsubscribed_at, NOW())
                                              ELSE NULL END,
                       updated_at = NOW()
                   WHERE id = $1"#,
            )
            .bind(id)
            .bind(status)
            .execute(&mut **transaction)
            .await?
        }
        StoreWrite::DeleteSubscriber { id } => {
            sqlx::query("DELETE FROM subscribers WHERE id = $1")
                .bind(id)
                .execute(&mut **transaction)
                .await?
        }
        StoreWrite::DeleteFailedEmail { id } => {
            sqlx::query("DELETE FROM failed_emails WHERE id = $1")
                .bind(id)
                .execute(&mut **transaction)
                .await?
        }
    };

    if write.requires_existing() && result.rows_affected() == 0 {
        return Err(StoreError::Missing(write.target()));
    }

    Ok(())
}
