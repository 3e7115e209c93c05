//! Public signup and admin subscriber lookup.

use crate::auth::AdminToken;
use crate::engagement::{EngagementLevel, SubscriptionStatus, normalize_address};
use crate::error::ApiError;
use crate::models::{DataResponse, SUBSCRIBER_COLUMNS, Subscriber, SubscriberRow};
use regex::Regex;
use rocket::State;
use rocket::serde::json::Json;
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::Deserialize;
use std::sync::OnceLock;
use uuid::Uuid;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_email_regex() -> &'static Regex {
    EMAIL_REGEX.get_or_init(|| {
        Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid")
    })
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SubscribeRequest {
    pub email: String,
}

/// Normalize `raw` and check it looks like a mailbox address.
pub fn validate_email(raw: &str) -> Result<String, ApiError> {
    let email = normalize_address(raw);
    if email.len() > 254 || !get_email_regex().is_match(&email) {
        return Err(ApiError::BadRequest(format!("invalid email address '{}'", raw.trim())));
    }
    Ok(email)
}

/// Subscribe an address, or re-subscribe it if it already exists.
#[openapi(tag = "Subscribers")]
#[post("/subscribers", data = "<request>")]
pub async fn subscribe(
    pool: &State<PgPool>,
    request: Json<SubscribeRequest>,
) -> Result<Json<DataResponse<Subscriber>>, ApiError> {
    let email = validate_email(&request.email)?;

    let query = format!(
        r#"INSERT INTO subscribers (id, email)
           VALUES ($1, $2)
           ON CONFLICT (email) DO UPDATE
           SET status = 'subscribed',
               unsubscribed_at = NULL,
               updated_at = NOW()
           RETURNING {SUBSCRIBER_COLUMNS}"#
    );
    let row = sqlx::query_as::<_, SubscriberRow>(&query)
        .bind(Uuid::new_v4())
        .bind(&email)
        .fetch_one(pool.inner())
        .await?;

    log::info!("subscribed {}", row.id);
    Ok(Json(DataResponse { data: row.into() }))
}

fn parse_filter<T>(value: Option<&str>, name: &str) -> Result<Option<T>, ApiError>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| raw.parse::<T>())
        .transpose()
        .map_err(|err| ApiError::BadRequest(format!("invalid {name}: {err}")))
}

/// List subscribers, optionally filtered by status and engagement level.
#[openapi(tag = "Subscribers")]
#[get("/admin/subscribers?<status>&<level>&<limit>&<offset>")]
pub async fn list_subscribers(
    _admin: AdminToken,
    pool: &State<PgPool>,
    status: Option<String>,
    level: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Json<DataResponse<Vec<Subscriber>>>, ApiError> {
    let status = parse_filter::<SubscriptionStatus>(status.as_deref(), "status")?;
    let level = parse_filter::<EngagementLevel>(level.as_deref(), "level")?;
    let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = offset.unwrap_or(0).max(0);

    let query = format!(
        r#"SELECT {SUBSCRIBER_COLUMNS}
           FROM subscribers
           WHERE ($1::subscription_status IS NULL OR status = $1)
             AND ($2::engagement_level IS NULL OR engagement_level = $2)
           ORDER BY subscribed_at DESC, id
           LIMIT $3 OFFSET $4"#
    );
    let rows = sqlx::query_as::<_, SubscriberRow>(&query)
        .bind(status)
        .bind(level)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool.inner())
        .await?;

    Ok(Json(DataResponse {
        data: rows.into_iter().map(Subscriber::from).collect(),
    }))
}

#[openapi(tag = "Subscribers")]
#[get("/admin/subscribers/<id>")]
pub async fn get_subscriber(
    _admin: AdminToken,
    pool: &State<PgPool>,
    id: Uuid,
) -> Result<Json<DataResponse<Subscriber>>, ApiError> {
    let query = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE id = $1");
    let row = sqlx::query_as::<_, SubscriberRow>(&query)
        .bind(id)
        .fetch_optional(pool.inner())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("subscriber {id} not found")))?;

    Ok(Json(DataResponse { data: row.into() }))
}
