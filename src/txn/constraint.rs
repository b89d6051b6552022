//! Read-constraint tracking: what a transaction observed, at three
//! granularities
//!
//! A transaction that read one row by key should not conflict with
//! unrelated writes to the same table. Each object a transaction reads gets
//! a [`ReadConstraint`] whose [`CheckUpdate`] state widens monotonically:
//! column set, then specific rows under one index, then a whole-object
//! block. There is no transition back to a weaker state within a
//! transaction's lifetime.

use rustc_hash::FxHashSet;

use crate::catalog::Snapshot;
use crate::core::{Error, IndexKey, Pos};

use super::physical::Change;

/// The observation state, as a tagged variant
///
/// Transitions and checks are pure functions, so the monotonic-widening
/// invariant is a matter of case analysis rather than runtime dispatch.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CheckUpdate {
    /// Nothing recorded yet
    #[default]
    Unset,

    /// Column-level read set: conflict if any tracked column is written
    Columns(FxHashSet<Pos>),

    /// Specific rows read through one fixed index
    ///
    /// `cols` carries the accumulated column reads; it does not narrow the
    /// key check but survives an escalation to Block.
    SpecificRows {
        index: Pos,
        cols: FxHashSet<Pos>,
        keys: Vec<IndexKey>,
    },

    /// Whole-object block, optionally still narrowed by tracked columns
    Block { cols: Option<FxHashSet<Pos>> },
}

impl CheckUpdate {
    /// Records a column read. Legal in every state; never weakens.
    pub fn add_select(self, column: Pos) -> Self {
        match self {
            CheckUpdate::Unset => {
                let mut cols = FxHashSet::default();
                cols.insert(column);
                CheckUpdate::Columns(cols)
            }
            CheckUpdate::Columns(mut cols) => {
                cols.insert(column);
                CheckUpdate::Columns(cols)
            }
            CheckUpdate::SpecificRows {
                index,
                mut cols,
                keys,
            } => {
                cols.insert(column);
                CheckUpdate::SpecificRows { index, cols, keys }
            }
            CheckUpdate::Block { cols: Some(mut s) } => {
                s.insert(column);
                CheckUpdate::Block { cols: Some(s) }
            }
            // An unnarrowed block already matches every write
            block @ CheckUpdate::Block { cols: None } => block,
        }
    }

    /// Records a single row read through `index` by `key`
    ///
    /// A second singleton through a *different* index escalates to Block:
    /// the tracked set is no longer representable as one index plus keys.
    pub fn singleton(self, index: Pos, key: IndexKey) -> Self {
        match self {
            CheckUpdate::Unset => CheckUpdate::SpecificRows {
                index,
                cols: FxHashSet::default(),
                keys: vec![key],
            },
            CheckUpdate::Columns(cols) => CheckUpdate::SpecificRows {
                index,
                cols,
                keys: vec![key],
            },
            CheckUpdate::SpecificRows {
                index: fixed,
                cols,
                mut keys,
            } => {
                if fixed == index {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                    CheckUpdate::SpecificRows {
                        index: fixed,
                        cols,
                        keys,
                    }
                } else {
                    CheckUpdate::Block {
                        cols: if cols.is_empty() { None } else { Some(cols) },
                    }
                }
            }
            // Already maximal
            block @ CheckUpdate::Block { .. } => block,
        }
    }

    /// Forces a whole-object block from any state
    pub fn block(self) -> Self {
        let cols = match self {
            CheckUpdate::Columns(cols) if !cols.is_empty() => Some(cols),
            CheckUpdate::SpecificRows { cols, .. } if !cols.is_empty() => Some(cols),
            CheckUpdate::Block { cols } => cols,
            _ => None,
        };
        CheckUpdate::Block { cols }
    }
}

/// Per-transaction, per-object record of what was read
#[derive(Debug, Clone)]
pub struct ReadConstraint {
    /// The guarded object (table) id
    pub object: Pos,
    pub check: CheckUpdate,
}

impl ReadConstraint {
    pub fn new(object: Pos) -> Self {
        Self {
            object,
            check: CheckUpdate::Unset,
        }
    }

    pub fn add_select(&mut self, column: Pos) {
        self.check = std::mem::take(&mut self.check).add_select(column);
    }

    pub fn singleton(&mut self, index: Pos, key: IndexKey) {
        self.check = std::mem::take(&mut self.check).singleton(index, key);
    }

    pub fn block(&mut self) {
        self.check = std::mem::take(&mut self.check).block();
    }

    /// Conflict verdict for one incoming committed change
    ///
    /// None means no conflict. A verdict is the first failure found for
    /// this constraint; the caller short-circuits across constraints.
    pub fn check(&self, change: &Change, db: &Snapshot) -> Option<Error> {
        if change.table() != self.object {
            return None;
        }
        match &self.check {
            CheckUpdate::Unset => None,
            CheckUpdate::Columns(cols) => Self::check_columns(self.object, cols, change),
            CheckUpdate::SpecificRows { index, keys, .. } => {
                self.check_specific(*index, keys, change, db)
            }
            CheckUpdate::Block { cols: Some(cols) } => {
                Self::check_columns(self.object, cols, change)
            }
            CheckUpdate::Block { cols: None } => Some(Error::ObjectWriteConflict {
                table: self.object,
            }),
        }
    }

    fn check_columns(object: Pos, cols: &FxHashSet<Pos>, change: &Change) -> Option<Error> {
        // A delete removes every column of its row, so its written set for
        // conflict purposes is the old row's field set
        let fields = match change {
            Change::Delete { old, .. } => &*old.fields,
            _ => change.fields()?,
        };
        for &col in cols {
            if fields.contains_key(&col) {
                return Some(Error::ReadWriteConflict {
                    table: object,
                    column: col,
                });
            }
        }
        None
    }

    fn check_specific(
        &self,
        index: Pos,
        keys: &[IndexKey],
        change: &Change,
        db: &Snapshot,
    ) -> Option<Error> {
        let Ok(idx) = db.index(index) else {
            // The index this constraint was tracked through is gone
            return Some(Error::SchemaInvalidated { object: index });
        };

        let conflict = Some(Error::ConcurrentKeyConflict {
            table: self.object,
            index,
        });

        // An update or delete of a row we read conflicts even when the key
        // columns themselves were not touched: check the old row's key
        match change {
            Change::Update { old, .. } | Change::Delete { old, .. } => {
                if keys.contains(&idx.make_key(old)) {
                    return conflict;
                }
            }
            _ => {}
        }

        // A new or updated row landing on a read key is a collision
        if let Some(row) = change.new_row() {
            if keys.contains(&idx.make_key(&row)) {
                return conflict;
            }
        }

        None
    }
}
