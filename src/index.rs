//! Index: constraint metadata around one MTree
//!
//! An index's identity (durable id, constraint kind, key columns) is stable
//! across schema evolution; its tree value is not. Every row insert or
//! removal produces a new `Index` value referencing an updated tree, so
//! snapshots taken before the change keep reading the old tree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::catalog::{Snapshot, Table};
use crate::core::{
    ConstraintKind, DataType, Dependence, Error, IndexKey, Pos, Result, TableRow, Value, NO_POS,
};
use crate::mtree::{DuplicatePolicy, MTree};

/// In-memory disambiguator for diagnostics. Durable identity is `defpos`;
/// this only tells two rebuilds of the same index apart in trace output.
static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// A named key -> row-id structure enforcing or supporting a schema
/// constraint (primary / unique / foreign / temporal)
#[derive(Debug, Clone)]
pub struct Index {
    /// Durable object id, stable across schema evolution
    pub defpos: Pos,
    /// In-memory disambiguator (diagnostics only)
    pub uid: u64,
    /// Constraint name for error reporting
    pub name: Arc<str>,
    /// Owning table id
    pub table: Pos,
    /// Exactly one constraint kind per index
    pub flags: ConstraintKind,
    /// Ordered key column ids
    pub key_cols: Vec<Pos>,
    /// Optional conversion function id for foreign keys
    pub adapter: Option<Pos>,
    /// Referenced index id (NO_POS unless foreign)
    pub ref_index: Pos,
    /// Referenced table id (NO_POS unless foreign)
    pub ref_table: Pos,
    /// The key tree. Replaced wholesale on every structural change.
    pub rows: MTree,
}

impl Index {
    /// Creates a non-foreign index
    pub fn new(
        defpos: Pos,
        name: impl Into<Arc<str>>,
        table: Pos,
        flags: ConstraintKind,
        key_cols: Vec<Pos>,
    ) -> Result<Self> {
        if flags == ConstraintKind::ForeignKey {
            return Err(Error::internal(
                "foreign-key index requires a referenced table and index",
            ));
        }
        Ok(Self {
            defpos,
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            table,
            flags,
            key_cols,
            adapter: None,
            ref_index: NO_POS,
            ref_table: NO_POS,
            rows: MTree::new(Self::policy_for(flags)),
        })
    }

    /// Creates a foreign-key index referencing another table's index
    pub fn foreign(
        defpos: Pos,
        name: impl Into<Arc<str>>,
        table: Pos,
        key_cols: Vec<Pos>,
        ref_table: Pos,
        ref_index: Pos,
        adapter: Option<Pos>,
    ) -> Result<Self> {
        if ref_table < 0 || ref_index < 0 {
            return Err(Error::internal(
                "foreign-key index requires a referenced table and index",
            ));
        }
        Ok(Self {
            defpos,
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            table,
            flags: ConstraintKind::ForeignKey,
            key_cols,
            adapter,
            ref_index,
            ref_table,
            rows: MTree::new(DuplicatePolicy::Allow),
        })
    }

    fn policy_for(flags: ConstraintKind) -> DuplicatePolicy {
        if flags.is_unique() {
            DuplicatePolicy::Disallow
        } else {
            DuplicatePolicy::Allow
        }
    }

    /// New Index value with the same identity but a replaced tree
    fn with_tree(&self, rows: MTree) -> Self {
        Self {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            rows,
            name: self.name.clone(),
            key_cols: self.key_cols.clone(),
            ..*self
        }
    }

    /// Computes a row's key from the index's key-column list
    ///
    /// Columns absent from the row map become typeless NULLs, which makes
    /// the key incomplete (`IndexKey::is_complete`).
    pub fn make_key(&self, row: &TableRow) -> IndexKey {
        IndexKey::new(
            self.key_cols
                .iter()
                .map(|&col| {
                    row.get(col)
                        .cloned()
                        .unwrap_or(Value::Null(DataType::Null))
                })
                .collect(),
        )
    }

    /// Full reconstruction of the tree from the table's row set
    ///
    /// Temporal indexes walk the row version history; an ordinary index
    /// scans the table's primary index when one exists (entries are already
    /// in hand), falling back to a full row scan otherwise. Duplicate keys
    /// under a uniqueness-bearing constraint fail the build.
    pub fn build(&self, table: &Table, db: &Snapshot) -> Result<Self> {
        let mut tree = MTree::new(self.rows.policy());

        match self.flags {
            ConstraintKind::SystemTemporal => {
                // One entry per version whose start-of-validity is non-null.
                // Entries are keyed by the version's log position, not the
                // row's defining position: updates retain the defpos, and
                // keying by it would collapse a lineage to one entry.
                for version in &table.versions {
                    let key = self.make_key(&version.row);
                    if key.0.first().is_some_and(|v| v.is_null()) {
                        continue;
                    }
                    self.load_entry(&mut tree, key, version.position, table)?;
                }
            }
            ConstraintKind::ApplicationTemporal => {
                for version in &table.versions {
                    let key = self.make_key(&version.row);
                    self.load_entry(&mut tree, key, version.position, table)?;
                }
            }
            _ => {
                if table.primary != NO_POS && table.primary != self.defpos {
                    // Fast path: the primary index already enumerates the
                    // live row set
                    let primary = db.index(table.primary)?;
                    for (_, chain) in primary.rows.iter() {
                        for &pos in chain {
                            let row = table
                                .rows
                                .get(&pos)
                                .ok_or_else(|| Error::internal("primary index names a missing row"))?;
                            let key = self.make_key(row);
                            self.load_entry(&mut tree, key, pos, table)?;
                        }
                    }
                } else {
                    for row in table.rows.values() {
                        let key = self.make_key(row);
                        self.load_entry(&mut tree, key, row.defpos, table)?;
                    }
                }
            }
        }

        Ok(self.with_tree(tree))
    }

    fn load_entry(&self, tree: &mut MTree, key: IndexKey, pos: Pos, table: &Table) -> Result<()> {
        if self.flags.is_unique() && tree.contains(&key) {
            return Err(Error::duplicate_key(
                table.name.as_ref(),
                self.name.as_ref(),
                key.to_string(),
            ));
        }
        tree.insert(key, pos);
        Ok(())
    }

    /// Rebuild after a schema alteration touching a key column
    pub fn rebuild(&self, table: &Table, db: &Snapshot) -> Result<Self> {
        self.build(table, db)
    }

    /// Inserts a row's key. No uniqueness pre-check; callers needing one
    /// call [`Index::check_unique`] first.
    pub fn insert_row(&self, row: &TableRow) -> Self {
        let key = self.make_key(row);
        let mut tree = self.rows.clone();
        tree.insert(key, row.defpos);
        self.with_tree(tree)
    }

    /// Removes a row's key entry. Absent entries are a no-op.
    pub fn remove_row(&self, row: &TableRow) -> Self {
        let key = self.make_key(row);
        let mut tree = self.rows.clone();
        tree.remove(&key, row.defpos);
        self.with_tree(tree)
    }

    /// Uniqueness pre-check, scoped to live transactions
    ///
    /// Replaying committed history never raises here: the enclosing context
    /// decides, not the data.
    pub fn check_unique(&self, db: &Snapshot, key: &IndexKey) -> Result<()> {
        if !db.live() || !self.flags.is_unique() {
            return Ok(());
        }
        if self.rows.contains(key) {
            return Err(Error::duplicate_key(
                db.table_name(self.table),
                self.name.as_ref(),
                key.to_string(),
            ));
        }
        Ok(())
    }

    /// Referential check against the referenced index, scoped to live
    /// transactions. An incomplete (NULL-bearing) key is malformed.
    pub fn check_foreign(&self, db: &Snapshot, key: &IndexKey) -> Result<()> {
        if !key.is_complete() {
            return Err(Error::MalformedKey { index: self.defpos });
        }
        if !db.live() {
            return Ok(());
        }
        let target = db.index(self.ref_index)?;
        if !target.rows.contains(key) {
            return Err(Error::missing_foreign_key(
                db.table_name(self.ref_table),
                key.to_string(),
            ));
        }
        Ok(())
    }

    /// A column's ordinal slot within the key, if it participates
    pub fn pos_for(&self, column: Pos) -> Option<usize> {
        self.key_cols.iter().position(|&c| c == column)
    }

    /// DDL drop decision: dropping `target` drops this index when it is the
    /// owning table or a key column, is restricted when it is the
    /// foreign-key target, and is otherwise unaffected
    pub fn dependent(&self, target: Pos) -> Dependence {
        if target == self.table || self.key_cols.contains(&target) {
            Dependence::Drop
        } else if self.flags == ConstraintKind::ForeignKey
            && (target == self.ref_index || target == self.ref_table)
        {
            Dependence::Restrict
        } else {
            Dependence::None
        }
    }
}
