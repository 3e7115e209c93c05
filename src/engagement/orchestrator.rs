use super::aggregate::aggregate;
use super::batch::{BatchCommitter, BatchReport};
use super::config::SyncConfig;
use super::events::RawDeliveryEvent;
use super::reconcile::reconcile;
use super::score::score_at;
use super::source::{Cursor, EventSource};
use super::store::{StoreWrite, SubscriberAnalytics, SubscriberStore, SubscriptionStatus};
use chrono::{DateTime, Utc};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Phases of a run, in order. None is re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Fetching,
    Aggregating,
    Reconciling,
    CommittingScored,
    CommittingReset,
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Fetching => "fetching",
            SyncPhase::Aggregating => "aggregating",
            SyncPhase::Reconciling => "reconciling",
            SyncPhase::CommittingScored => "committing scored",
            SyncPhase::CommittingReset => "committing reset",
            SyncPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Why pagination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    PageLimit,
    CursorRepeated,
    SourceError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommitPass {
    Scored,
    Reset,
}

/// A recovered failure, reported alongside the counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncIssue {
    SourceUnavailable {
        page: usize,
        message: String,
    },
    RegistryUnavailable {
        message: String,
    },
    BatchFailed {
        pass: CommitPass,
        batch: usize,
        size: usize,
        message: String,
    },
}

/// Summary of one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub total_events_fetched: usize,
    pub unique_recipients: usize,
    pub updated: usize,
    pub skipped_no_match: usize,
    pub marked_new: usize,
    pub pages_fetched: usize,
    pub stop_reason: StopReason,
    pub skipped_malformed: usize,
    pub duplicate_events: usize,
    pub failed_updates: usize,
    pub failed_resets: usize,
    pub issues: Vec<SyncIssue>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    /// True when nothing was skipped because of a failure.
    pub fn is_complete(&self) -> bool {
        self.issues.is_empty()
    }
}

struct FetchOutcome {
    events: Vec<RawDeliveryEvent>,
    pages: usize,
    stop_reason: StopReason,
}

/// Runs the engagement pipeline against injected collaborators.
pub struct SyncOrchestrator {
    source: Arc<dyn EventSource>,
    store: Arc<dyn SubscriberStore>,
    committer: BatchCommitter,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn EventSource>,
        store: Arc<dyn SubscriberStore>,
        config: SyncConfig,
    ) -> Self {
        let config = config.normalized();
        let committer = BatchCommitter::new(store.clone(), config.batch_size);
        Self {
            source,
            store,
            committer,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run the whole pipeline. Failures are folded into the returned result.
    pub async fn run_sync(&self) -> SyncResult {
        let started_at = Utc::now();
        let mut issues = Vec::new();

        enter(SyncPhase::Fetching);
        let fetched = self.fetch_all(&mut issues).await;
        log::info!(
            "engagement sync: fetched {} events over {} pages ({:?})",
            fetched.events.len(),
            fetched.pages,
            fetched.stop_reason
        );

        enter(SyncPhase::Aggregating);
        let aggregation = aggregate(&fetched.events);

        let mut result = SyncResult {
            total_events_fetched: fetched.events.len(),
            unique_recipients: aggregation.stats.len(),
            updated: 0,
            skipped_no_match: 0,
            marked_new: 0,
            pages_fetched: fetched.pages,
            stop_reason: fetched.stop_reason,
            skipped_malformed: aggregation.skipped_malformed,
            duplicate_events: aggregation.duplicate_events,
            failed_updates: 0,
            failed_resets: 0,
            issues: Vec::new(),
            started_at,
            finished_at: started_at,
        };

        enter(SyncPhase::Reconciling);
        let subscribers = match self.store.load_by_status(SubscriptionStatus::Subscribed).await {
            Ok(subscribers) => subscribers,
            Err(err) => {
                log::error!("engagement sync: failed to load subscribers: {}", err);
                issues.push(SyncIssue::RegistryUnavailable {
                    message: err.to_string(),
                });
                return finish(result, issues);
            }
        };
        let reconciliation = reconcile(&aggregation.stats, subscribers);
        result.skipped_no_match = reconciliation.unmatched_addresses.len();
        log::info!(
            "engagement sync: {} matched, {} without events, {} unknown recipients",
            reconciliation.matched.len(),
            reconciliation.unseen.len(),
            result.skipped_no_match
        );

        enter(SyncPhase::CommittingScored);
        let now = Utc::now();
        let scored: Vec<StoreWrite> = reconciliation
            .matched
            .iter()
            .map(|(subscriber, stats)| StoreWrite::ApplyEngagement {
                id: subscriber.id,
                analytics: SubscriberAnalytics::from_stats(stats, now),
                score: score_at(stats, subscriber.subscribed_at, now),
            })
            .collect();
        let report = self.committer.commit(scored).await;
        result.updated = report.committed;
        result.failed_updates = report.failed;
        record_failures(&mut issues, CommitPass::Scored, &report);

        enter(SyncPhase::CommittingReset);
        let resets: Vec<StoreWrite> = reconciliation
            .unseen
            .iter()
            .map(|subscriber| StoreWrite::ResetEngagement { id: subscriber.id })
            .collect();
        let report = self.committer.commit(resets).await;
        result.marked_new = report.committed;
        result.failed_resets = report.failed;
        record_failures(&mut issues, CommitPass::Reset, &report);

        finish(result, issues)
    }

    async fn fetch_all(&self, issues: &mut Vec<SyncIssue>) -> FetchOutcome {
        let mut events = Vec::new();
        let mut pages = 0;
        let mut cursor: Option<Cursor> = None;
        let mut seen_cursors: HashSet<Cursor> = HashSet::new();

        let stop_reason = loop {
            let page = match self.source.fetch_page(cursor.as_ref()).await {
                Ok(page) => page,
                Err(err) => {
                    log::warn!(
                        "engagement sync: event source failed on page {}, keeping {} events: {}",
                        pages + 1,
                        events.len(),
                        err
                    );
                    issues.push(SyncIssue::SourceUnavailable {
                        page: pages + 1,
                        message: err.to_string(),
                    });
                    break StopReason::SourceError;
                }
            };

            pages += 1;
            events.extend(page.events);

            let Some(next) = page.next_cursor else {
                break StopReason::Exhausted;
            };
            if !seen_cursors.insert(next.clone()) {
                log::warn!("engagement sync: cursor {} repeated, stopping", next);
                break StopReason::CursorRepeated;
            }
            if pages >= self.config.max_pages {
                log::info!(
                    "engagement sync: reached page limit of {}",
                    self.config.max_pages
                );
                break StopReason::PageLimit;
            }
            cursor = Some(next);
        };

        FetchOutcome {
            events,
            pages,
            stop_reason,
        }
    }
}

fn enter(phase: SyncPhase) {
    log::debug!("engagement sync: {}", phase);
}

fn record_failures(issues: &mut Vec<SyncIssue>, pass: CommitPass, report: &BatchReport) {
    issues.extend(report.failed_batches.iter().map(|failed| SyncIssue::BatchFailed {
        pass,
        batch: failed.index,
        size: failed.ids.len(),
        message: failed.error.clone(),
    }));
}

fn finish(mut result: SyncResult, issues: Vec<SyncIssue>) -> SyncResult {
    enter(SyncPhase::Done);
    result.issues = issues;
    result.finished_at = Utc::now();
    log::info!(
        "engagement sync finished: {} events, {} recipients, {} updated, {} no match, {} marked new, {} issues",
        result.total_events_fetched,
        result.unique_recipients,
        result.updated,
        result.skipped_no_match,
        result.marked_new,
        result.issues.len()
    );
    result
}
