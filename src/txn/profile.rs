//! Transaction profiles: shape summaries for optimization studies
//!
//! Diagnostic only. Nothing here is consulted for correctness; the
//! aggregator exists so repeated transaction shapes can be spotted and
//! studied offline.

use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use crate::core::Pos;

use super::constraint::CheckUpdate;
use super::physical::Change;

/// Row-change counts for one table within a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub inserts: u32,
    pub updates: u32,
    pub deletes: u32,
}

/// The shape of one transaction: what it wrote and how it read
#[derive(Debug, Clone, Default)]
pub struct TxnProfile {
    pub tables: FxHashMap<Pos, TableCounts>,
    /// Schema changes (alter/drop) issued
    pub schema_changes: u32,
    /// Whether any whole-object block was recorded
    pub blocked: bool,
    /// Whether any specific-rows constraint was recorded
    pub specific: bool,
    /// Whether any column-level read set was recorded
    pub columns_tracked: bool,
    /// Total singleton keys tracked across constraints
    pub singleton_keys: u32,
    /// How many transactions this profile stands for (1 until merged)
    pub occurrences: u32,
}

impl TxnProfile {
    pub fn new() -> Self {
        Self {
            occurrences: 1,
            ..Self::default()
        }
    }

    pub(crate) fn note_change(&mut self, change: &Change) {
        let counts = self.tables.entry(change.table()).or_default();
        match change {
            Change::Record(_) => counts.inserts += 1,
            Change::Update { .. } => counts.updates += 1,
            Change::Delete { .. } => counts.deletes += 1,
            _ => self.schema_changes += 1,
        }
    }

    pub(crate) fn note_constraint(&mut self, check: &CheckUpdate) {
        match check {
            CheckUpdate::Unset => {}
            CheckUpdate::Columns(_) => self.columns_tracked = true,
            CheckUpdate::SpecificRows { keys, cols, .. } => {
                self.specific = true;
                self.columns_tracked |= !cols.is_empty();
                self.singleton_keys += keys.len() as u32;
            }
            CheckUpdate::Block { cols } => {
                self.blocked = true;
                self.columns_tracked |= cols.is_some();
            }
        }
    }

    /// Shape key: two transactions share a shape when they touch the same
    /// tables with the same kinds of change and read the same way. Counts
    /// and key values do not participate.
    pub fn shape(&self) -> u64 {
        let mut tables: Vec<(Pos, bool, bool, bool)> = self
            .tables
            .iter()
            .map(|(&t, c)| (t, c.inserts > 0, c.updates > 0, c.deletes > 0))
            .collect();
        tables.sort_unstable();

        let mut hasher = FxHasher::default();
        tables.hash(&mut hasher);
        (self.schema_changes > 0).hash(&mut hasher);
        self.blocked.hash(&mut hasher);
        self.specific.hash(&mut hasher);
        self.columns_tracked.hash(&mut hasher);
        hasher.finish()
    }

    fn merge(&mut self, other: &TxnProfile) {
        for (&table, counts) in &other.tables {
            let mine = self.tables.entry(table).or_default();
            mine.inserts += counts.inserts;
            mine.updates += counts.updates;
            mine.deletes += counts.deletes;
        }
        self.schema_changes += other.schema_changes;
        self.singleton_keys += other.singleton_keys;
        self.occurrences += other.occurrences;
    }
}

/// Merges finished transactions by shape
#[derive(Debug, Default)]
pub struct ProfileAggregator {
    profiles: Mutex<FxHashMap<u64, TxnProfile>>,
}

impl ProfileAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a finished transaction's profile into its shape bucket
    pub fn record(&self, profile: &TxnProfile) {
        let mut profiles = self.profiles.lock();
        match profiles.entry(profile.shape()) {
            std::collections::hash_map::Entry::Occupied(mut e) => e.get_mut().merge(profile),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(profile.clone());
            }
        }
    }

    /// Number of distinct shapes seen
    pub fn len(&self) -> usize {
        self.profiles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.lock().is_empty()
    }

    /// Snapshot of the aggregated profiles
    pub fn profiles(&self) -> Vec<TxnProfile> {
        self.profiles.lock().values().cloned().collect()
    }
}
