//! Bounded, failure-isolated batch commits.
//!
//! Writes are split into consecutive groups no larger than the store's
//! transaction ceiling. Each group is committed atomically; a failed group is
//! recorded and the remaining groups still run.

use super::store::{StoreWrite, SubscriberStore};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// A group that could not be committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailedBatch {
    /// Zero-based position of the group within the commit call.
    pub index: usize,
    pub ids: Vec<Uuid>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub committed: usize,
    pub failed: usize,
    pub batches: usize,
    pub failed_batches: Vec<FailedBatch>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Clone)]
pub struct BatchCommitter {
    store: Arc<dyn SubscriberStore>,
    batch_size: usize,
}

impl BatchCommitter {
    /// `batch_size` is clamped to `1..=store.max_operations()`.
    pub fn new(store: Arc<dyn SubscriberStore>, batch_size: usize) -> Self {
        let ceiling = store.max_operations().max(1);
        if batch_size > ceiling {
            log::warn!(
                "batch size {} exceeds store limit {}, using {}",
                batch_size,
                ceiling,
                ceiling
            );
        }

        Self {
            store,
            batch_size: batch_size.clamp(1, ceiling),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn commit(&self, writes: Vec<StoreWrite>) -> BatchReport {
        let mut report = BatchReport::default();

        for (index, group) in writes.chunks(self.batch_size).enumerate() {
            report.batches += 1;

            match self.store.commit(group).await {
                Ok(()) => {
                    report.committed += group.len();
                    log::debug!("batch {}: committed {} writes", index, group.len());
                }
                Err(err) => {
                    log::warn!("batch {}: {} writes failed: {}", index, group.len(), err);
                    report.failed += group.len();
                    report.failed_batches.push(FailedBatch {
                        index,
                        ids: group.iter().map(StoreWrite::target).collect(),
                        error: err.to_string(),
                    });
                }
            }
        }

        report
    }
}
