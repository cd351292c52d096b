use std::collections::{HashMap, HashSet};

use crate::model::NotificationRecord;

/// Merges device and server records on top of the previous merged view.
///
/// A read mark from `previous` survives for any id that shows up again; an
/// unread baseline never clears a read flag reported by a source. Local
/// records come first, so they win an id collision. The result is sorted newest
/// first, with ties kept in input order.
pub fn reconcile(
    local: &[NotificationRecord],
    server: &[NotificationRecord],
    previous: &[NotificationRecord],
) -> Vec<NotificationRecord> {
    let baseline: HashMap<&str, &NotificationRecord> = previous
        .iter()
        .map(|record| (record.id.as_str(), record))
        .collect();

    let mut seen = HashSet::with_capacity(local.len() + server.len());
    let mut merged: Vec<NotificationRecord> = local
        .iter()
        .chain(server.iter())
        .filter(|record| seen.insert(record.id.as_str()))
        .map(|record| carry_read_state(record, &baseline))
        .collect();

    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    merged
}

fn carry_read_state(
    incoming: &NotificationRecord,
    baseline: &HashMap<&str, &NotificationRecord>,
) -> NotificationRecord {
    let mut record = incoming.clone();
    if let Some(known) = baseline.get(record.id.as_str()) {
        if known.is_read {
            record.is_read = true;
            record.read_at = known.read_at.or(record.read_at);
        }
    }
    record
}

/// Records of `merged` whose id was not part of `previous`.
pub fn newly_observed(
    previous: &[NotificationRecord],
    merged: &[NotificationRecord],
) -> Vec<NotificationRecord> {
    let known: HashSet<&str> = previous.iter().map(|record| record.id.as_str()).collect();
    merged
        .iter()
        .filter(|record| !known.contains(record.id.as_str()))
        .cloned()
        .collect()
}
