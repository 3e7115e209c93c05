use audience_server::engagement::{
    BatchCommitter, BatchReport, EngagementLevel, EngagementScore, PgSubscriberStore,
    RecipientStats, StoreError, StoreWrite, SubscriberAnalytics, SubscriberStore,
    SubscriptionStatus,
};
use audience_server::models::{DataResponse, FailedEmail, Subscriber};
use audience_server::routes::failed_emails::{delete_failed_emails, list_failed_emails};
use audience_server::routes::subscribers::{get_subscriber, list_subscribers, subscribe};
use audience_server::test_support::{TestDatabase, TestDatabaseError, TestRocketBuilder};
use chrono::{Duration, Utc};
use rocket::http::{ContentType, Header, Status};
use rocket::routes;
use rocket::serde::json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

const TEST_ADMIN_TOKEN: &str = "test-admin-token";

async fn provision(test_name: &str) -> Option<TestDatabase> {
    match TestDatabase::new().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::Container(err)) => {
            eprintln!("skipping {test_name}: no container runtime ({err})");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

async fn insert_subscriber(pool: &PgPool, email: &str, status: SubscriptionStatus) -> Uuid {
    sqlx::query_scalar("INSERT INTO subscribers (id, email, status) VALUES ($1, $2, $3) RETURNING id")
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(status)
        .fetch_one(pool)
        .await
        .expect("insert subscriber")
}

fn engagement_write(id: Uuid) -> StoreWrite {
    let stats = RecipientStats {
        emails_sent: 4,
        emails_opened: 2,
        emails_clicked: 1,
        ..Default::default()
    };
    StoreWrite::ApplyEngagement {
        id,
        analytics: SubscriberAnalytics::from_stats(&stats, Utc::now()),
        score: EngagementScore {
            score: 62,
            level: EngagementLevel::Medium,
        },
    }
}

#[tokio::test]
async fn loads_only_requested_status() {
    let Some(test_db) = provision("loads_only_requested_status").await else {
        return;
    };
    let pool = test_db.pool_clone();
    let active = insert_subscriber(&pool, "active@example.com", SubscriptionStatus::Subscribed).await;
    insert_subscriber(&pool, "gone@example.com", SubscriptionStatus::Unsubscribed).await;

    let store = PgSubscriberStore::new(pool.clone(), 10);
    let records = store
        .load_by_status(SubscriptionStatus::Subscribed)
        .await
        .expect("load subscribers");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, active);
    assert_eq!(records[0].email, "active@example.com");

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn commit_applies_all_writes_or_none() {
    let Some(test_db) = provision("commit_applies_all_writes_or_none").await else {
        return;
    };
    let pool = test_db.pool_clone();
    let id = insert_subscriber(&pool, "reader@example.com", SubscriptionStatus::Subscribed).await;
    let store = PgSubscriberStore::new(pool.clone(), 10);

    let err = store
        .commit(&[engagement_write(id), StoreWrite::ResetEngagement { id: Uuid::new_v4() }])
        .await
        .expect_err("missing target must abort the transaction");
    assert!(matches!(err, StoreError::Missing(_)));

    let (score, level): (i32, EngagementLevel) =
        sqlx::query_as("SELECT engagement_score, engagement_level FROM subscribers WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .expect("read back");
    assert_eq!((score, level), (0, EngagementLevel::New));

    store
        .commit(&[engagement_write(id)])
        .await
        .expect("commit engagement");

    let (score, level): (i32, EngagementLevel) =
        sqlx::query_as("SELECT engagement_score, engagement_level FROM subscribers WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .expect("read back");
    assert_eq!((score, level), (62, EngagementLevel::Medium));

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn reset_clears_score_and_analytics() {
    let Some(test_db) = provision("reset_clears_score_and_analytics").await else {
        return;
    };
    let pool = test_db.pool_clone();
    let id = insert_subscriber(&pool, "lapsed@example.com", SubscriptionStatus::Subscribed).await;
    let store = PgSubscriberStore::new(pool.clone(), 10);

    store
        .commit(&[engagement_write(id)])
        .await
        .expect("commit engagement");
    store
        .commit(&[StoreWrite::ResetEngagement { id }])
        .await
        .expect("commit reset");

    let (score, level, has_analytics): (i32, EngagementLevel, bool) = sqlx::query_as(
        "SELECT engagement_score, engagement_level, analytics IS NOT NULL FROM subscribers WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await
    .expect("read back");
    assert_eq!((score, level, has_analytics), (0, EngagementLevel::New, false));

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn commit_rejects_oversized_transactions() {
    let Some(test_db) = provision("commit_rejects_oversized_transactions").await else {
        return;
    };
    let store = PgSubscriberStore::new(test_db.pool_clone(), 2);
    let writes: Vec<_> = (0..3)
        .map(|_| StoreWrite::DeleteFailedEmail { id: Uuid::new_v4() })
        .collect();

    let err = store.commit(&writes).await.expect_err("over the limit");
    assert!(matches!(err, StoreError::TooLarge { size: 3, limit: 2 }));

    store
        .commit(&writes[..2])
        .await
        .expect("deleting absent rows is a no-op");

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn signup_normalizes_and_resubscribes() {
    let Some(test_db) = provision("signup_normalizes_and_resubscribes").await else {
        return;
    };
    let pool = test_db.pool_clone();
    let client = TestRocketBuilder::new()
        .manage_pg_pool(pool.clone())
        .with_admin_token(TEST_ADMIN_TOKEN)
        .mount_api_routes(routes![subscribe, list_subscribers, get_subscriber])
        .async_client()
        .await;

    let response = client
        .post("/api/v1/subscribers")
        .header(ContentType::JSON)
        .body(json!({ "email": "  New.Reader@Example.com " }).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let created: DataResponse<Subscriber> = response.into_json().await.expect("valid JSON");
    assert_eq!(created.data.email, "new.reader@example.com");
    assert_eq!(created.data.engagement_level, EngagementLevel::New);

    sqlx::query("UPDATE subscribers SET status = 'unsubscribed', unsubscribed_at = NOW() WHERE id = $1")
        .bind(created.data.id)
        .execute(&pool)
        .await
        .expect("unsubscribe");

    let again: DataResponse<Subscriber> = client
        .post("/api/v1/subscribers")
        .header(ContentType::JSON)
        .body(json!({ "email": "new.reader@example.com" }).to_string())
        .dispatch()
        .await
        .into_json()
        .await
        .expect("valid JSON");
    assert_eq!(again.data.id, created.data.id);
    assert_eq!(again.data.status, SubscriptionStatus::Subscribed);
    assert!(again.data.unsubscribed_at.is_none());

    let invalid = client
        .post("/api/v1/subscribers")
        .header(ContentType::JSON)
        .body(json!({ "email": "not-an-address" }).to_string())
        .dispatch()
        .await;
    assert_eq!(invalid.status(), Status::BadRequest);

    let auth = Header::new("Authorization", format!("Bearer {TEST_ADMIN_TOKEN}"));
    let listed: DataResponse<Vec<Subscriber>> = client
        .get("/api/v1/admin/subscribers?status=subscribed&level=new")
        .header(auth.clone())
        .dispatch()
        .await
        .into_json()
        .await
        .expect("valid JSON");
    assert_eq!(listed.data.len(), 1);

    let missing = client
        .get(format!("/api/v1/admin/subscribers/{}", Uuid::new_v4()))
        .header(auth)
        .dispatch()
        .await;
    assert_eq!(missing.status(), Status::NotFound);

    drop(invalid);
    drop(missing);
    drop(client);
    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn failed_emails_list_newest_first_and_delete_all() {
    let Some(test_db) = provision("failed_emails_list_newest_first_and_delete_all").await else {
        return;
    };
    let pool = test_db.pool_clone();
    let now = Utc::now();
    let mut inserted = Vec::new();
    for (hours_ago, recipient) in [(3, "old@example.com"), (2, "mid@example.com"), (1, "new@example.com")] {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO failed_emails (id, recipient, subject, error, failed_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(recipient)
        .bind("Weekly digest")
        .bind("mailbox unavailable")
        .bind(now - Duration::hours(hours_ago))
        .execute(&pool)
        .await
        .expect("insert failed email");
        inserted.push(id);
    }

    let store = Arc::new(PgSubscriberStore::new(pool.clone(), 10));
    let client = TestRocketBuilder::new()
        .manage_pg_pool(pool.clone())
        .with_admin_token(TEST_ADMIN_TOKEN)
        .manage(BatchCommitter::new(store, 2))
        .mount_api_routes(routes![list_failed_emails, delete_failed_emails])
        .async_client()
        .await;
    let auth = Header::new("Authorization", format!("Bearer {TEST_ADMIN_TOKEN}"));

    let listed: DataResponse<Vec<FailedEmail>> = client
        .get("/api/v1/admin/failed-emails")
        .header(auth.clone())
        .dispatch()
        .await
        .into_json()
        .await
        .expect("valid JSON");
    let order: Vec<Uuid> = listed.data.iter().map(|failed| failed.id).collect();
    assert_eq!(order, vec![inserted[2], inserted[1], inserted[0]]);
    assert_eq!(listed.data[0].recipient, "new@example.com");

    let limited: DataResponse<Vec<FailedEmail>> = client
        .get("/api/v1/admin/failed-emails?limit=1")
        .header(auth.clone())
        .dispatch()
        .await
        .into_json()
        .await
        .expect("valid JSON");
    assert_eq!(limited.data.len(), 1);

    let report: BatchReport = client
        .post("/api/v1/admin/failed-emails/delete")
        .header(auth)
        .header(ContentType::JSON)
        .body(json!({}).to_string())
        .dispatch()
        .await
        .into_json()
        .await
        .expect("valid JSON");
    assert_eq!(report.committed, 3);
    assert_eq!(report.batches, 2);
    assert!(report.is_complete());

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failed_emails")
        .fetch_one(&pool)
        .await
        .expect("count failed emails");
    assert_eq!(remaining, 0);

    drop(client);
    test_db.close().await.expect("failed to drop test database");
}
