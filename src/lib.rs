#[macro_use]
extern crate rocket;

pub mod auth;
pub mod db;
pub mod engagement;
pub mod error;
pub mod models;
pub mod request_logger;
pub mod routes;

use crate::auth::AdminConfig;
use crate::db::AudienceDb;
use crate::engagement::config::store_max_transaction_ops;
use crate::engagement::{
    BatchCommitter, PgSubscriberStore, ResendClient, ResendConfig, SubscriberStore, SyncConfig,
    SyncOrchestrator, SyncTracker, run_scheduler,
};
use crate::request_logger::RequestLogger;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

pub fn rocket() -> Rocket<Build> {
    init_logger();
    log::info!("starting audience server");

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post, Method::Delete]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger::from_env())
        .attach(AudienceDb::init())
        .attach(cors)
        .attach(AdHoc::try_on_ignite("Run Migrations", |rocket| async move {
            match AudienceDb::fetch(&rocket) {
                Some(db) => {
                    let pool = (**db).clone();
                    match db::run_migrations(&pool).await {
                        Ok(()) => Ok(rocket),
                        Err(e) => {
                            log::error!("database migrations failed: {}", e);
                            Err(rocket)
                        }
                    }
                }
                None => {
                    log::error!("database pool not available for migrations");
                    Err(rocket)
                }
            }
        }))
        .attach(AdHoc::try_on_ignite(
            "Engagement Pipeline",
            |rocket| async move {
                let pool = match AudienceDb::fetch(&rocket) {
                    Some(db) => (**db).clone(),
                    None => {
                        log::error!("database pool not available for engagement pipeline");
                        return Err(rocket);
                    }
                };

                let sync_config = SyncConfig::from_env();
                let resend_config = ResendConfig::from_env();
                if resend_config.api_key.is_none() {
                    log::warn!("RESEND_API_KEY is not set; engagement syncs will fail to fetch events");
                }

                let source = match ResendClient::new(resend_config, sync_config.page_size) {
                    Ok(client) => client,
                    Err(err) => {
                        log::error!("failed to initialize event source client: {}", err);
                        return Err(rocket);
                    }
                };

                let store: Arc<dyn SubscriberStore> = Arc::new(PgSubscriberStore::new(
                    pool.clone(),
                    store_max_transaction_ops(),
                ));
                let committer = BatchCommitter::new(store.clone(), sync_config.batch_size);
                let orchestrator = Arc::new(SyncOrchestrator::new(
                    Arc::new(source),
                    store,
                    sync_config,
                ));

                let config = orchestrator.config();
                log::info!(
                    "engagement pipeline ready: page_size={} max_pages={} batch_size={}",
                    config.page_size,
                    config.max_pages,
                    committer.batch_size()
                );

                Ok(rocket
                    .manage(pool)
                    .manage(committer)
                    .manage(orchestrator)
                    .manage(Arc::new(SyncTracker::new()))
                    .manage(AdminConfig::from_env()))
            },
        ))
        .attach(AdHoc::on_liftoff("Spawn Engagement Scheduler", |rocket| {
            Box::pin(async move {
                let orchestrator = rocket.state::<Arc<SyncOrchestrator>>().cloned();
                let tracker = rocket.state::<Arc<SyncTracker>>().cloned();
                match (orchestrator, tracker) {
                    (Some(orchestrator), Some(tracker)) => {
                        let interval = orchestrator.config().interval;
                        if orchestrator.config().scheduler_enabled() {
                            tokio::spawn(run_scheduler(orchestrator, tracker, interval));
                        } else {
                            log::info!("engagement scheduler disabled");
                        }
                    }
                    _ => log::error!("failed to spawn engagement scheduler: pipeline state not found"),
                }
            })
        }))
        .mount(
            "/api/v1",
            openapi_get_routes![
                // Health routes
                routes::health::health_check,
                routes::health::readiness_check,
                // Subscriber routes
                routes::subscribers::subscribe,
                routes::subscribers::list_subscribers,
                routes::subscribers::get_subscriber,
                // Engagement admin routes
                routes::admin::trigger_sync,
                routes::admin::sync_status,
                routes::admin::bulk_subscriber_action,
                // Failed delivery routes
                routes::failed_emails::list_failed_emails,
                routes::failed_emails::delete_failed_emails,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Audience API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::auth::AdminConfig;
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use rocket_db_pools::sqlx::PgPool;

    pub use database::{TestDatabase, TestDatabaseError};

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::ImageExt;
        use testcontainers_modules::postgres::Postgres;
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database backed by a disposable Postgres container.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            /// Launch a container, create a uniquely named database and migrate it.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().with_tag("16-alpine").start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let base_options: PgConnectOptions = admin_url.parse()?;
                let admin_options = base_options.log_statements(LevelFilter::Off);

                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await?;

                let database_name = format!("audience_{}", Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", database_name);
                sqlx::query(&create_sql).execute(&admin_pool).await?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(admin_options.clone().database(&database_name))
                    .await?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name,
                    container: Some(container),
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database(self.admin_options.clone(), &self.database_name).await?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", database_name);
            sqlx::query(&drop_sql).execute(&admin_pool).await?;
            Ok(())
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database(admin_options, &db_name).await;
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    /// In-memory collaborators for exercising the pipeline without a network or database.
    pub mod fakes {
        use crate::engagement::{
            Cursor, EngagementLevel, EventPage, EventSource, RawDeliveryEvent, SourceError,
            StoreError, StoreWrite, SubscriberAnalytics, SubscriberRecord, SubscriberStore,
            SubscriptionStatus,
        };
        use chrono::{DateTime, Utc};
        use parking_lot::Mutex;
        use reqwest::StatusCode;
        use std::collections::{HashMap, HashSet};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use uuid::Uuid;

        /// Build a well-formed provider event.
        pub fn event(id: &str, to: &[&str], kind: &str, at: DateTime<Utc>) -> RawDeliveryEvent {
            RawDeliveryEvent {
                id: Some(id.to_string()),
                to: Some(to.iter().map(|address| address.to_string()).collect()),
                last_event: Some(kind.to_string()),
                created_at: Some(at.to_rfc3339()),
            }
        }

        enum Scripted {
            Page {
                events: Vec<RawDeliveryEvent>,
                next: Option<String>,
            },
            Failure(StatusCode),
        }

        /// Event source answering from a fixed cursor -> page table.
        ///
        /// Unscripted cursors return an empty final page.
        #[derive(Default)]
        pub struct ScriptedSource {
            pages: HashMap<Option<String>, Scripted>,
            calls: AtomicUsize,
        }

        impl ScriptedSource {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn page(
                mut self,
                cursor: Option<&str>,
                events: Vec<RawDeliveryEvent>,
                next: Option<&str>,
            ) -> Self {
                self.pages.insert(
                    cursor.map(str::to_string),
                    Scripted::Page {
                        events,
                        next: next.map(str::to_string),
                    },
                );
                self
            }

            pub fn failure(mut self, cursor: Option<&str>, status: StatusCode) -> Self {
                self.pages
                    .insert(cursor.map(str::to_string), Scripted::Failure(status));
                self
            }

            /// Number of pages requested so far.
            pub fn calls(&self) -> usize {
                self.calls.load(Ordering::SeqCst)
            }
        }

        #[rocket::async_trait]
        impl EventSource for ScriptedSource {
            async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<EventPage, SourceError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let key = cursor.map(|cursor| cursor.as_str().to_string());
                match self.pages.get(&key) {
                    Some(Scripted::Page { events, next }) => Ok(EventPage {
                        events: events.clone(),
                        next_cursor: next.as_deref().map(Cursor::new),
                    }),
                    Some(Scripted::Failure(status)) => Err(SourceError::Status {
                        status: *status,
                        body: "scripted failure".to_string(),
                    }),
                    None => Ok(EventPage::default()),
                }
            }
        }

        /// Snapshot of one subscriber held by [`MemoryStore`].
        #[derive(Debug, Clone, PartialEq)]
        pub struct MemorySubscriber {
            pub id: Uuid,
            pub email: String,
            pub status: SubscriptionStatus,
            pub subscribed_at: DateTime<Utc>,
            pub unsubscribed_at: Option<DateTime<Utc>>,
            pub score: i32,
            pub level: EngagementLevel,
            pub analytics: Option<SubscriberAnalytics>,
        }

        #[derive(Default)]
        struct MemoryState {
            subscribers: Vec<MemorySubscriber>,
            failed_emails: Vec<Uuid>,
            poisoned: HashSet<Uuid>,
            fail_loads: bool,
            submitted: Vec<usize>,
            committed: Vec<usize>,
        }

        /// Transactional in-memory store with injectable failures.
        pub struct MemoryStore {
            max_operations: usize,
            state: Mutex<MemoryState>,
        }

        impl MemoryStore {
            pub fn new(max_operations: usize) -> Self {
                Self {
                    max_operations: max_operations.max(1),
                    state: Mutex::new(MemoryState::default()),
                }
            }

            /// Insert a subscribed, never-scored subscriber.
            pub fn add_subscriber(&self, email: &str) -> Uuid {
                let id = Uuid::new_v4();
                self.state.lock().subscribers.push(MemorySubscriber {
                    id,
                    email: email.to_string(),
                    status: SubscriptionStatus::Subscribed,
                    subscribed_at: Utc::now(),
                    unsubscribed_at: None,
                    score: 0,
                    level: EngagementLevel::New,
                    analytics: None,
                });
                id
            }

            pub fn add_failed_email(&self) -> Uuid {
                let id = Uuid::new_v4();
                self.state.lock().failed_emails.push(id);
                id
            }

            pub fn subscriber(&self, id: Uuid) -> Option<MemorySubscriber> {
                self.state
                    .lock()
                    .subscribers
                    .iter()
                    .find(|subscriber| subscriber.id == id)
                    .cloned()
            }

            pub fn failed_email_ids(&self) -> Vec<Uuid> {
                self.state.lock().failed_emails.clone()
            }

            /// Reject every future transaction containing a write for `id`.
            pub fn fail_transactions_touching(&self, id: Uuid) {
                self.state.lock().poisoned.insert(id);
            }

            pub fn fail_loads(&self) {
                self.state.lock().fail_loads = true;
            }

            /// Sizes of transactions that committed.
            pub fn transaction_sizes(&self) -> Vec<usize> {
                self.state.lock().committed.clone()
            }

            /// Sizes of every non-empty transaction submitted, committed or not.
            pub fn submitted_sizes(&self) -> Vec<usize> {
                self.state.lock().submitted.clone()
            }
        }

        #[rocket::async_trait]
        impl SubscriberStore for MemoryStore {
            fn max_operations(&self) -> usize {
                self.max_operations
            }

            async fn load_by_status(
                &self,
                status: SubscriptionStatus,
            ) -> Result<Vec<SubscriberRecord>, StoreError> {
                let state = self.state.lock();
                if state.fail_loads {
                    return Err(StoreError::Rejected("scripted load failure".to_string()));
                }

                Ok(state
                    .subscribers
                    .iter()
                    .filter(|subscriber| subscriber.status == status)
                    .map(|subscriber| SubscriberRecord {
                        id: subscriber.id,
                        email: subscriber.email.clone(),
                        status: subscriber.status,
                        subscribed_at: subscriber.subscribed_at,
                    })
                    .collect())
            }

            async fn commit(&self, writes: &[StoreWrite]) -> Result<(), StoreError> {
                if writes.is_empty() {
                    return Ok(());
                }

                let mut state = self.state.lock();
                state.submitted.push(writes.len());

                if writes.len() > self.max_operations {
                    return Err(StoreError::TooLarge {
                        size: writes.len(),
                        limit: self.max_operations,
                    });
                }
                if let Some(write) = writes
                    .iter()
                    .find(|write| state.poisoned.contains(&write.target()))
                {
                    return Err(StoreError::Rejected(format!(
                        "transaction touching {} rejected",
                        write.target()
                    )));
                }

                let mut subscribers = state.subscribers.clone();
                let mut failed_emails = state.failed_emails.clone();
                for write in writes {
                    apply(&mut subscribers, &mut failed_emails, write)?;
                }

                state.subscribers = subscribers;
                state.failed_emails = failed_emails;
                state.committed.push(writes.len());
                Ok(())
            }
        }

        fn apply(
            subscribers: &mut Vec<MemorySubscriber>,
            failed_emails: &mut Vec<Uuid>,
            write: &StoreWrite,
        ) -> Result<(), StoreError> {
            match write {
                StoreWrite::DeleteSubscriber { id } => {
                    subscribers.retain(|subscriber| subscriber.id != *id);
                    return Ok(());
                }
                StoreWrite::DeleteFailedEmail { id } => {
                    failed_emails.retain(|failed| failed != id);
                    return Ok(());
                }
                _ => {}
            }

            let target = write.target();
            let subscriber = subscribers
                .iter_mut()
                .find(|subscriber| subscriber.id == target)
                .ok_or(StoreError::Missing(target))?;

            match write {
                StoreWrite::ApplyEngagement {
                    analytics, score, ..
                } => {
                    subscriber.analytics = Some(analytics.clone());
                    subscriber.score = i32::from(score.score);
                    subscriber.level = score.level;
                }
                StoreWrite::ResetEngagement { .. } => {
                    subscriber.score = 0;
                    subscriber.level = EngagementLevel::New;
                    subscriber.analytics = None;
                }
                StoreWrite::SetStatus { status, .. } => {
                    subscriber.status = *status;
                    subscriber.unsubscribed_at = match status {
                        SubscriptionStatus::Unsubscribed => {
                            subscriber.unsubscribed_at.or_else(|| Some(Utc::now()))
                        }
                        SubscriptionStatus::Subscribed => None,
                    };
                }
                StoreWrite::DeleteSubscriber { .. } | StoreWrite::DeleteFailedEmail { .. } => {}
            }

            Ok(())
        }
    }

    type StateHook = Box<dyn FnOnce(Rocket<Build>) -> Rocket<Build> + Send>;

    /// Builder for constructing Rocket instances tailored for integration tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        states: Vec<StateHook>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                states: Vec::new(),
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        /// Manage a `PgPool` instance for tests that exercise database-backed routes.
        pub fn manage_pg_pool(self, pool: PgPool) -> Self {
            self.manage(pool)
        }

        /// Accept `token` as the admin bearer token.
        pub fn with_admin_token(self, token: &str) -> Self {
            self.manage(AdminConfig::with_token(Some(token)))
        }

        /// Add arbitrary managed state.
        pub fn manage<T: Send + Sync + 'static>(mut self, state: T) -> Self {
            self.states
                .push(Box::new(move |rocket: Rocket<Build>| rocket.manage(state)));
            self
        }

        /// Finish building the Rocket instance.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            for hook in self.states {
                rocket = hook(rocket);
            }

            rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
