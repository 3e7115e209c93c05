//! Administrative endpoints for engagement syncs and bulk subscriber changes.

use crate::auth::AdminToken;
use crate::engagement::{
    BatchCommitter, BatchReport, StoreWrite, SubscriptionStatus, SyncOrchestrator, SyncResult,
    SyncTracker, run_tracked,
};
use crate::error::ApiError;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Run an engagement sync now and return its result.
///
/// Responds with 409 when a run (manual or scheduled) is already in progress.
#[openapi(tag = "Admin")]
#[post("/admin/engagement/sync")]
pub async fn trigger_sync(
    _admin: AdminToken,
    orchestrator: &State<Arc<SyncOrchestrator>>,
    tracker: &State<Arc<SyncTracker>>,
) -> Result<Json<SyncResult>, ApiError> {
    log::info!("manual engagement sync requested");

    match run_tracked(orchestrator.inner(), tracker.inner()).await {
        Some(result) => Ok(Json(result)),
        None => Err(ApiError::Conflict(
            "an engagement sync is already running".to_string(),
        )),
    }
}

/// Response describing the sync tracker.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    /// Indicates whether a sync is currently running.
    pub is_running: bool,
    /// Result of the most recent finished run in this process.
    pub last_result: Option<SyncResult>,
}

#[openapi(tag = "Admin")]
#[get("/admin/engagement/sync/status")]
pub fn sync_status(_admin: AdminToken, tracker: &State<Arc<SyncTracker>>) -> Json<SyncStatusResponse> {
    Json(SyncStatusResponse {
        is_running: tracker.is_running(),
        last_result: tracker.last_result(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Unsubscribe,
    Resubscribe,
    Delete,
}

impl BulkAction {
    fn write_for(self, id: Uuid) -> StoreWrite {
        match self {
            BulkAction::Unsubscribe => StoreWrite::SetStatus {
                id,
                status: SubscriptionStatus::Unsubscribed,
            },
            BulkAction::Resubscribe => StoreWrite::SetStatus {
                id,
                status: SubscriptionStatus::Subscribed,
            },
            BulkAction::Delete => StoreWrite::DeleteSubscriber { id },
        }
    }
}

/// Request body for bulk subscriber actions.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct BulkActionRequest {
    pub action: BulkAction,
    /// Subscriber ids; duplicates are applied once.
    pub ids: Vec<Uuid>,
}

/// Build one write per distinct id, keeping first-seen order.
pub fn bulk_writes(action: BulkAction, ids: &[Uuid]) -> Vec<StoreWrite> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .filter(|id| seen.insert(**id))
        .map(|id| action.write_for(*id))
        .collect()
}

/// Apply one action to many subscribers through the batched store writer.
#[openapi(tag = "Admin")]
#[post("/admin/subscribers/bulk", data = "<request>")]
pub async fn bulk_subscriber_action(
    _admin: AdminToken,
    committer: &State<BatchCommitter>,
    request: Json<BulkActionRequest>,
) -> Result<Json<BatchReport>, ApiError> {
    if request.ids.is_empty() {
        return Err(ApiError::BadRequest("ids must not be empty".to_string()));
    }

    let writes = bulk_writes(request.action, &request.ids);
    let report = committer.commit(writes).await;

    if report.is_complete() {
        log::info!("bulk {:?} applied to {} subscribers", request.action, report.committed);
    } else {
        log::warn!(
            "bulk {:?} partially failed: {} committed, {} failed",
            request.action,
            report.committed,
            report.failed
        );
    }

    Ok(Json(report))
}
