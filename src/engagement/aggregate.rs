//! Fold delivery events into per-recipient engagement statistics.

use super::events::{DeliveryEvent, EventKind, RawDeliveryEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

/// Canonical form used to key recipients and subscribers alike.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Counters for one recipient. `emails_clicked <= emails_opened <= emails_sent`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecipientStats {
    pub emails_sent: u32,
    pub emails_opened: u32,
    pub emails_clicked: u32,
    pub last_email_sent: Option<DateTime<Utc>>,
    pub last_email_opened: Option<DateTime<Utc>>,
    pub last_email_clicked: Option<DateTime<Utc>>,
    pub bounced: bool,
}

impl RecipientStats {
    fn record(&mut self, kind: EventKind, at: DateTime<Utc>) {
        self.emails_sent += 1;
        keep_latest(&mut self.last_email_sent, at);

        if kind.counts_as_open() {
            self.emails_opened += 1;
            keep_latest(&mut self.last_email_opened, at);
        }

        if kind == EventKind::Clicked {
            self.emails_clicked += 1;
            keep_latest(&mut self.last_email_clicked, at);
        }

        if kind == EventKind::Bounced {
            self.bounced = true;
        }
    }

    /// Percentage of sent mail that was opened; zero when nothing was sent.
    pub fn open_rate(&self) -> f64 {
        percentage(self.emails_opened, self.emails_sent)
    }

    /// Percentage of sent mail that was clicked; zero when nothing was sent.
    pub fn click_rate(&self) -> f64 {
        percentage(self.emails_clicked, self.emails_sent)
    }
}

fn keep_latest(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) {
    if slot.is_none_or(|current| at > current) {
        *slot = Some(at);
    }
}

fn percentage(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        f64::from(part) / f64::from(whole) * 100.0
    }
}

/// Result of folding one run's events.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub stats: HashMap<String, RecipientStats>,
    /// Events dropped because they could not be validated.
    pub skipped_malformed: usize,
    /// Extra copies of a message id that were collapsed.
    pub duplicate_events: usize,
}

/// One message after duplicate copies are collapsed.
///
/// Field order is the precedence order: most advanced state, then latest
/// timestamp, then the recipient set, so any two copies compare totally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Collapsed {
    kind: EventKind,
    at: DateTime<Utc>,
    recipients: BTreeSet<String>,
}

impl From<DeliveryEvent> for Collapsed {
    fn from(event: DeliveryEvent) -> Self {
        Self {
            kind: event.last_event,
            at: event.created_at,
            recipients: event
                .recipients
                .iter()
                .map(|address| normalize_address(address))
                .filter(|address| !address.is_empty())
                .collect(),
        }
    }
}

/// Aggregate raw events into statistics keyed by normalized address.
///
/// Pages may overlap, so copies of the same message id are collapsed first,
/// keeping the greatest copy by [`Collapsed`] precedence. The outcome does
/// not depend on the order events arrive in.
pub fn aggregate(events: &[RawDeliveryEvent]) -> Aggregation {
    let mut skipped_malformed = 0;
    let mut duplicate_events = 0;
    let mut by_message: HashMap<String, Collapsed> = HashMap::with_capacity(events.len());

    for raw in events {
        let event = match DeliveryEvent::try_from(raw) {
            Ok(event) => event,
            Err(err) => {
                skipped_malformed += 1;
                log::warn!("skipping malformed delivery event: {}", err);
                continue;
            }
        };

        let message_id = event.message_id.clone();
        let candidate = Collapsed::from(event);
        match by_message.entry(message_id) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
            }
            Entry::Occupied(mut slot) => {
                duplicate_events += 1;
                if candidate > *slot.get() {
                    slot.insert(candidate);
                }
            }
        }
    }

    let mut stats: HashMap<String, RecipientStats> = HashMap::new();
    for message in by_message.values() {
        for address in &message.recipients {
            stats
                .entry(address.clone())
                .or_default()
                .record(message.kind, message.at);
        }
    }

    log::debug!(
        "aggregated {} events into {} recipients ({} malformed, {} duplicates)",
        by_message.len(),
        stats.len(),
        skipped_malformed,
        duplicate_events
    );

    Aggregation {
        stats,
        skipped_malformed,
        duplicate_events,
    }
}
