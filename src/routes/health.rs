//! Liveness and readiness endpoints.

use crate::error::ApiError;
use rocket::serde::json::Json;
use rocket::State;
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

/// Basic response payload describing API health.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    /// `ok` when the check passed.
    pub status: String,
}

/// Liveness check; never touches dependencies.
#[openapi(tag = "Health")]
#[get("/health")]
pub fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check; verifies the database answers.
#[openapi(tag = "Health")]
#[get("/health/ready")]
pub async fn readiness_check(pool: &State<PgPool>) -> Result<Json<HealthResponse>, ApiError> {
    sqlx::query("SELECT 1").execute(pool.inner()).await?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
    }))
}
