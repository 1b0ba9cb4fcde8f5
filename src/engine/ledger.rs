use dashmap::DashMap;
use ulid::Ulid;

use crate::model::OverrideEntry;

/// Append-only record of who displaced whom, keyed by the superseded
/// reservation's owner — the key the notification surface reads by.
/// Entries are written exclusively through event application, so a live
/// commit and a WAL replay produce identical ledgers.
pub struct OverrideLedger {
    by_owner: DashMap<Ulid, Vec<OverrideEntry>>,
}

impl Default for OverrideLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl OverrideLedger {
    pub fn new() -> Self {
        Self {
            by_owner: DashMap::new(),
        }
    }

    pub fn record(&self, entry: OverrideEntry) {
        self.by_owner.entry(entry.owner).or_default().push(entry);
    }

    /// Entries where `owner`'s own reservation was superseded, oldest first.
    pub fn list_for(&self, owner: Ulid) -> Vec<OverrideEntry> {
        self.by_owner
            .get(&owner)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Every entry, for compaction. Order follows (owner, append order).
    pub fn all(&self) -> Vec<OverrideEntry> {
        let mut all: Vec<OverrideEntry> = self
            .by_owner
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        all.sort_by_key(|e| (e.at, e.reservation_id));
        all
    }

    pub fn len(&self) -> usize {
        self.by_owner.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
