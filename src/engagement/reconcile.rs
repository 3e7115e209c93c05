use super::aggregate::{RecipientStats, normalize_address};
use super::store::SubscriberRecord;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Outcome of matching aggregated recipients against the registry.
///
/// Every subscriber passed in ends up in exactly one of `matched` or `unseen`.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub matched: Vec<(SubscriberRecord, RecipientStats)>,
    /// Subscribers with no event data this run.
    pub unseen: Vec<SubscriberRecord>,
    /// Recipient addresses that belong to no subscriber.
    pub unmatched_addresses: BTreeSet<String>,
}

pub fn reconcile(
    stats: &HashMap<String, RecipientStats>,
    subscribers: Vec<SubscriberRecord>,
) -> Reconciliation {
    let mut matched = Vec::new();
    let mut unseen = Vec::new();
    let mut claimed: HashSet<String> = HashSet::new();

    for subscriber in subscribers {
        let key = normalize_address(&subscriber.email);
        match stats.get(&key) {
            Some(recipient) => {
                matched.push((subscriber, recipient.clone()));
                claimed.insert(key);
            }
            None => unseen.push(subscriber),
        }
    }

    let unmatched_addresses = stats
        .keys()
        .filter(|address| !claimed.contains(*address))
        .cloned()
        .collect();

    Reconciliation {
        matched,
        unseen,
        unmatched_addresses,
    }
}
