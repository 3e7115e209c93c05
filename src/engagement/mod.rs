//! Subscriber engagement synchronization.
//!
//! Pulls delivery history from the transactional-email provider, scores every
//! subscriber and writes the results back to the registry in bounded batches.
//!
//! # Pipeline
//!
//! 1. **Fetch** (`source`): page through the provider's event listing, bounded
//!    by a per-run page limit. A failing page ends pagination but keeps what
//!    was already fetched.
//! 2. **Aggregate** (`aggregate`): validate events (`events`), collapse
//!    duplicate message ids and fold them into per-recipient statistics.
//! 3. **Reconcile** (`reconcile`): match recipients to subscribed registry
//!    entries by normalized address.
//! 4. **Score** (`score`): map statistics to a 0-100 score and a level.
//! 5. **Commit** (`batch`): write scores, then reset subscribers without event
//!    data, in atomic groups capped by the store's transaction limit.
//!
//! `orchestrator` sequences the phases and folds every recovered failure into
//! the returned [`SyncResult`]; `scheduler` runs it periodically and keeps
//! runs from overlapping within the process.

pub mod aggregate;
pub mod batch;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;
pub mod score;
pub mod source;
pub mod store;

pub use aggregate::{Aggregation, RecipientStats, aggregate, normalize_address};
pub use batch::{BatchCommitter, BatchReport, FailedBatch};
pub use config::{ResendConfig, SyncConfig};
pub use events::{DeliveryEvent, EventKind, MalformedEvent, RawDeliveryEvent};
pub use orchestrator::{CommitPass, StopReason, SyncIssue, SyncOrchestrator, SyncResult};
pub use reconcile::{Reconciliation, reconcile};
pub use scheduler::{SyncTracker, run_scheduler, run_tracked};
pub use score::{EngagementLevel, EngagementScore, score, score_at};
pub use source::{Cursor, EventPage, EventSource, ResendClient, SourceError};
pub use store::{
    PgSubscriberStore, StoreError, StoreWrite, SubscriberAnalytics, SubscriberRecord,
    SubscriberStore, SubscriptionStatus,
};
