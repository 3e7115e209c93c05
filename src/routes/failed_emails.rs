use crate::auth::AdminToken;
use crate::engagement::{BatchCommitter, BatchReport, StoreWrite};
use crate::error::ApiError;
use crate::models::{DataResponse, FailedEmail};
use rocket::State;
use rocket::serde::json::Json;
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::Deserialize;
use std::collections::HashSet;
use uuid::Uuid;

/// Most recent failed sends first.
#[openapi(tag = "Failed Emails")]
#[get("/admin/failed-emails?<limit>")]
pub async fn list_failed_emails(
    _admin: AdminToken,
    pool: &State<PgPool>,
    limit: Option<i64>,
) -> Result<Json<DataResponse<Vec<FailedEmail>>>, ApiError> {
    let limit = limit.unwrap_or(100).clamp(1, 1_000);

    let failed = sqlx::query_as::<_, FailedEmail>(
        r#"SELECT id, recipient, subject, error, failed_at
           FROM failed_emails
           ORDER BY failed_at DESC, id
           LIMIT $1"#,
    )
    .bind(limit)
    .fetch_all(pool.inner())
    .await?;

    Ok(Json(DataResponse { data: failed }))
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct DeleteFailedEmailsRequest {
    /// Records to delete; omit to clear every record.
    #[serde(default)]
    pub ids: Option<Vec<Uuid>>,
}

/// Delete failed-send records in bounded transactions.
#[openapi(tag = "Failed Emails")]
#[post("/admin/failed-emails/delete", data = "<request>")]
pub async fn delete_failed_emails(
    _admin: AdminToken,
    pool: &State<PgPool>,
    committer: &State<BatchCommitter>,
    request: Json<DeleteFailedEmailsRequest>,
) -> Result<Json<BatchReport>, ApiError> {
    let ids = match request.into_inner().ids {
        Some(ids) => {
            let mut seen = HashSet::with_capacity(ids.len());
            ids.into_iter().filter(|id| seen.insert(*id)).collect()
        }
        None => {
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM failed_emails ORDER BY failed_at")
                .fetch_all(pool.inner())
                .await?
        }
    };

    let writes = ids
        .into_iter()
        .map(|id| StoreWrite::DeleteFailedEmail { id })
        .collect::<Vec<_>>();
    let report = committer.commit(writes).await;

    log::info!(
        "deleted {} failed email records ({} failed)",
        report.committed,
        report.failed
    );
    Ok(Json(report))
}
