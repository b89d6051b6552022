//! Physical change events and the symmetric write-write conflict matrix
//!
//! A [`Change`] is one durable mutation as proposed by a transaction or
//! replayed from the log. Commit validation checks a transaction's pending
//! changes against everything committed after its snapshot with
//! [`Change::conflicts`]; the relation is symmetric, so either side of a
//! colliding pair reports the same verdict.

use rustc_hash::FxHashMap;

use crate::catalog::Snapshot;
use crate::core::{Error, Level, Pos, TableRow, Value, NO_POS};

/// The row payload of a Record or Update event
#[derive(Debug, Clone)]
pub struct RowChange {
    /// Defining position of the affected row
    pub pos: Pos,
    pub table: Pos,
    /// Subtype id for typed-table hierarchies (NO_POS when untyped)
    pub subtype: Pos,
    /// Security label
    pub classification: Level,
    /// Written columns only; an Update leaves untouched columns out
    pub fields: FxHashMap<Pos, Value>,
}

impl RowChange {
    pub fn new(pos: Pos, table: Pos, fields: FxHashMap<Pos, Value>) -> Self {
        Self {
            pos,
            table,
            subtype: NO_POS,
            classification: Level::default(),
            fields,
        }
    }

    /// Record variant for a typed table
    pub fn with_subtype(mut self, subtype: Pos) -> Self {
        self.subtype = subtype;
        self
    }

    /// Record variant carrying a security classification
    pub fn with_classification(mut self, level: Level) -> Self {
        self.classification = level;
        self
    }

    /// Materializes the change as a full row snapshot
    pub fn to_row(&self) -> TableRow {
        TableRow::new(self.pos, self.table, self.fields.clone())
            .with_subtype(self.subtype)
            .with_classification(self.classification)
    }
}

/// One physical change, as parsed from the log or proposed by a transaction
#[derive(Debug, Clone)]
pub enum Change {
    /// New row
    Record(RowChange),
    /// Changed columns layered on a prior row state
    Update { new: RowChange, old: TableRow },
    /// Row removal; `old` is the prior row state
    Delete { pos: Pos, table: Pos, old: TableRow },
    /// Column definition change
    AlterColumn { pos: Pos, table: Pos, column: Pos },
    /// Column removal
    DropColumn { pos: Pos, table: Pos, column: Pos },
    /// Table removal
    DropTable { pos: Pos, table: Pos },
    /// Index removal
    DropIndex { pos: Pos, table: Pos, index: Pos },
}

impl Change {
    /// The table this change touches
    pub fn table(&self) -> Pos {
        match self {
            Change::Record(rc) => rc.table,
            Change::Update { new, .. } => new.table,
            Change::Delete { table, .. }
            | Change::AlterColumn { table, .. }
            | Change::DropColumn { table, .. }
            | Change::DropTable { table, .. }
            | Change::DropIndex { table, .. } => *table,
        }
    }

    /// The written column set, for row-level changes
    pub fn fields(&self) -> Option<&FxHashMap<Pos, Value>> {
        match self {
            Change::Record(rc) => Some(&rc.fields),
            Change::Update { new, .. } => Some(&new.fields),
            _ => None,
        }
    }

    /// Defining position of the prior row state, for Update and Delete
    pub fn old_defpos(&self) -> Option<Pos> {
        match self {
            Change::Update { old, .. } | Change::Delete { old, .. } => Some(old.defpos),
            _ => None,
        }
    }

    /// The full row this change produces, for Record and Update
    ///
    /// An Update's result is the old row with the changed columns layered
    /// on, so key computation sees untouched key columns too.
    pub fn new_row(&self) -> Option<TableRow> {
        match self {
            Change::Record(rc) => Some(rc.to_row()),
            Change::Update { new, old } => Some(old.with_update(&new.fields)),
            _ => None,
        }
    }

    /// Symmetric write-write collision check
    ///
    /// Covers dropped-table and dropped/altered-column collisions, key
    /// collisions on every uniqueness-bearing index of the table, and
    /// delete/update-of-deleted-row collisions. Returns the first conflict
    /// found, or None.
    pub fn conflicts(&self, other: &Change, db: &Snapshot) -> Option<Error> {
        Self::oriented(self, other, db).or_else(|| Self::oriented(other, self, db))
    }

    fn oriented(a: &Change, b: &Change, db: &Snapshot) -> Option<Error> {
        if a.table() != b.table() {
            return None;
        }
        let table = a.table();

        match a {
            Change::DropTable { .. } => {
                // Any concurrent touch of a dropped table invalidates it
                return Some(Error::SchemaInvalidated { object: table });
            }
            Change::DropColumn { column, .. } => {
                if Self::touches_column(b, *column) {
                    return Some(Error::SchemaInvalidated { object: *column });
                }
            }
            Change::AlterColumn { column, .. } => {
                if Self::touches_column(b, *column) {
                    return Some(Error::SchemaInvalidated { object: *column });
                }
            }
            Change::DropIndex { index, .. } => {
                if let Change::DropIndex { index: other_ix, .. } = b {
                    if index == other_ix {
                        return Some(Error::SchemaInvalidated { object: *index });
                    }
                }
            }
            _ => {}
        }

        // Row-level collisions: same prior row written twice
        if let (Some(mine), Some(theirs)) = (a.old_defpos(), b.old_defpos()) {
            if mine == theirs {
                return Some(Error::WriteWriteConflict {
                    table,
                    defpos: mine,
                });
            }
        }

        // Key collisions on every uniqueness-bearing index, not just the
        // primary key
        if let (Some(row_a), Some(row_b)) = (a.new_row(), b.new_row()) {
            if row_a.defpos != row_b.defpos {
                for idx in db.unique_indexes_for(table) {
                    let key_a = idx.make_key(&row_a);
                    if key_a.is_complete() && key_a == idx.make_key(&row_b) {
                        return Some(Error::ConcurrentKeyConflict {
                            table,
                            index: idx.defpos,
                        });
                    }
                }
            }
        }

        None
    }

    fn touches_column(change: &Change, column: Pos) -> bool {
        match change {
            Change::AlterColumn { column: c, .. } | Change::DropColumn { column: c, .. } => {
                *c == column
            }
            _ => change
                .fields()
                .is_some_and(|fields| fields.contains_key(&column)),
        }
    }
}
