use audience_server::engagement::{
    BatchCommitter, BatchReport, SubscriptionStatus, SyncConfig, SyncOrchestrator, SyncTracker,
};
use audience_server::routes::admin::{
    SyncStatusResponse, bulk_subscriber_action, sync_status, trigger_sync,
};
use audience_server::routes::failed_emails::delete_failed_emails;
use audience_server::test_support::TestRocketBuilder;
use audience_server::test_support::fakes::{MemoryStore, ScriptedSource, event};
use chrono::{Duration, Utc};
use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;
use rocket::routes;
use rocket::serde::json::json;
use serde_json::Value;
use std::sync::Arc;

const TEST_ADMIN_TOKEN: &str = "test-admin-token";

struct Harness {
    client: Client,
    store: Arc<MemoryStore>,
    tracker: Arc<SyncTracker>,
}

fn harness(store: Arc<MemoryStore>, source: ScriptedSource) -> Harness {
    let config = SyncConfig {
        page_size: 100,
        max_pages: 20,
        batch_size: 500,
        interval: std::time::Duration::ZERO,
    };
    let orchestrator = Arc::new(SyncOrchestrator::new(
        Arc::new(source),
        store.clone(),
        config,
    ));
    let tracker = Arc::new(SyncTracker::new());
    let committer = BatchCommitter::new(store.clone(), 500);

    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![trigger_sync, sync_status, bulk_subscriber_action])
        .with_admin_token(TEST_ADMIN_TOKEN)
        .manage(orchestrator)
        .manage(tracker.clone())
        .manage(committer)
        .blocking_client();

    Harness {
        client,
        store,
        tracker,
    }
}

fn bearer() -> Header<'static> {
    Header::new("Authorization", format!("Bearer {TEST_ADMIN_TOKEN}"))
}

#[test]
fn admin_routes_require_the_bearer_token() {
    let h = harness(Arc::new(MemoryStore::new(10)), ScriptedSource::new());

    let missing = h.client.post("/api/v1/admin/engagement/sync").dispatch();
    assert_eq!(missing.status(), Status::Unauthorized);

    let wrong = h
        .client
        .get("/api/v1/admin/engagement/sync/status")
        .header(Header::new("Authorization", "Bearer nope"))
        .dispatch();
    assert_eq!(wrong.status(), Status::Unauthorized);
}

#[test]
fn manual_sync_returns_result_and_updates_status() {
    let store = Arc::new(MemoryStore::new(500));
    let reader = store.add_subscriber("reader@example.com");
    store.add_subscriber("quiet@example.com");
    let at = Utc::now() - Duration::hours(2);
    let source = ScriptedSource::new().page(
        None,
        vec![
            event("m1", &["Reader@Example.com"], "opened", at),
            event("m2", &["reader@example.com"], "clicked", at),
            event("m3", &["stranger@example.com"], "delivered", at),
        ],
        None,
    );
    let h = harness(store, source);

    let response = h
        .client
        .post("/api/v1/admin/engagement/sync")
        .header(bearer())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let body: Value = response.into_json().expect("valid JSON payload");
    assert_eq!(body["totalEventsFetched"], 3);
    assert_eq!(body["uniqueRecipients"], 2);
    assert_eq!(body["updated"], 1);
    assert_eq!(body["skippedNoMatch"], 1);
    assert_eq!(body["markedNew"], 1);
    assert_eq!(body["stopReason"], "exhausted");
    assert_eq!(body["issues"], json!([]));

    let state = h.store.subscriber(reader).expect("reader exists");
    assert!(state.score > 0);
    assert_eq!(state.analytics.expect("analytics").emails_clicked, 1);

    let status: SyncStatusResponse = h
        .client
        .get("/api/v1/admin/engagement/sync/status")
        .header(bearer())
        .dispatch()
        .into_json()
        .expect("valid JSON payload");
    assert!(!status.is_running);
    assert_eq!(status.last_result.expect("last result").updated, 1);
}

#[test]
fn overlapping_sync_is_rejected() {
    let source = ScriptedSource::new();
    let h = harness(Arc::new(MemoryStore::new(10)), source);
    let _running = h.tracker.try_start().expect("claim tracker");

    let response = h
        .client
        .post("/api/v1/admin/engagement/sync")
        .header(bearer())
        .dispatch();
    assert_eq!(response.status(), Status::Conflict);

    let body: Value = response.into_json().expect("valid JSON payload");
    assert_eq!(body["error"], "Conflict");
}

#[test]
fn bulk_unsubscribe_commits_through_batches() {
    let store = Arc::new(MemoryStore::new(2));
    let ids: Vec<_> = (0..5)
        .map(|i| store.add_subscriber(&format!("user{i}@example.com")))
        .collect();
    let h = harness(store, ScriptedSource::new());

    let response = h
        .client
        .post("/api/v1/admin/subscribers/bulk")
        .header(bearer())
        .header(ContentType::JSON)
        .body(json!({ "action": "unsubscribe", "ids": ids }).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let report: BatchReport = response.into_json().expect("valid JSON payload");
    assert_eq!(report.committed, 5);
    assert_eq!(report.batches, 3);
    assert!(report.is_complete());
    for id in ids {
        let state = h.store.subscriber(id).expect("subscriber exists");
        assert_eq!(state.status, SubscriptionStatus::Unsubscribed);
        assert!(state.unsubscribed_at.is_some());
    }
}

#[test]
fn bulk_delete_reports_failed_groups() {
    let store = Arc::new(MemoryStore::new(2));
    let ids: Vec<_> = (0..4)
        .map(|i| store.add_subscriber(&format!("user{i}@example.com")))
        .collect();
    store.fail_transactions_touching(ids[3]);
    let h = harness(store, ScriptedSource::new());

    let report: BatchReport = h
        .client
        .post("/api/v1/admin/subscribers/bulk")
        .header(bearer())
        .header(ContentType::JSON)
        .body(json!({ "action": "delete", "ids": ids }).to_string())
        .dispatch()
        .into_json()
        .expect("valid JSON payload");

    assert_eq!(report.committed, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(report.failed_batches[0].index, 1);
    assert!(h.store.subscriber(ids[0]).is_none());
    assert!(h.store.subscriber(ids[3]).is_some());
}

#[test]
fn bulk_action_requires_ids() {
    let h = harness(Arc::new(MemoryStore::new(10)), ScriptedSource::new());

    let response = h
        .client
        .post("/api/v1/admin/subscribers/bulk")
        .header(bearer())
        .header(ContentType::JSON)
        .body(json!({ "action": "delete", "ids": [] }).to_string())
        .dispatch();

    assert_eq!(response.status(), Status::BadRequest);
}

#[tokio::test]
async fn delete_failed_emails_by_id_applies_each_id_once() {
    let store = Arc::new(MemoryStore::new(10));
    let first = store.add_failed_email();
    let second = store.add_failed_email();
    let kept = store.add_failed_email();

    // Explicit ids never reach the database, so an unconnected pool is enough.
    let pool = sqlx::PgPool::connect_lazy("postgres://postgres@127.0.0.1:1/unused")
        .expect("lazy pool");
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![delete_failed_emails])
        .with_admin_token(TEST_ADMIN_TOKEN)
        .manage_pg_pool(pool)
        .manage(BatchCommitter::new(store.clone(), 10))
        .async_client()
        .await;

    let unauthorized = client
        .post("/api/v1/admin/failed-emails/delete")
        .header(ContentType::JSON)
        .body(json!({ "ids": [first] }).to_string())
        .dispatch()
        .await;
    assert_eq!(unauthorized.status(), Status::Unauthorized);

    let response = client
        .post("/api/v1/admin/failed-emails/delete")
        .header(bearer())
        .header(ContentType::JSON)
        .body(json!({ "ids": [first, first, second] }).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let report: BatchReport = response.into_json().await.expect("valid JSON payload");
    assert_eq!(report.committed, 2);
    assert_eq!(report.batches, 1);
    assert!(report.is_complete());
    assert_eq!(store.transaction_sizes(), vec![2]);
    assert_eq!(store.failed_email_ids(), vec![kept]);
}
