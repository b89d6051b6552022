//! Transactions: private working snapshots, read-constraint accumulation,
//! and the optimistic commit path
//!
//! A transaction never locks anything it reads. It works against a private
//! snapshot built by structural sharing over the last committed state,
//! records what it observed in read constraints, and at commit replays
//! every change committed since its snapshot against those constraints and
//! its own pending writes. Conflicts are detected, not prevented.

pub mod constraint;
pub mod physical;
pub mod profile;
mod validate;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::catalog::{Database, LoggedChange, Snapshot};
use crate::core::{ConstraintKind, Error, IndexKey, Pos, Result, TableRow, Value};

pub use constraint::{CheckUpdate, ReadConstraint};
pub use physical::{Change, RowChange};
pub use profile::{ProfileAggregator, TableCounts, TxnProfile};

/// One client transaction
///
/// Ends exactly once, by [`Transaction::commit`] or
/// [`Transaction::rollback`]; every operation after that returns
/// [`Error::TransactionEnded`].
pub struct Transaction<'db> {
    db: &'db Database,
    pub id: u64,
    /// Private working view: the begin snapshot plus this transaction's
    /// own pending changes
    snapshot: Snapshot,
    read_constraints: FxHashMap<Pos, ReadConstraint>,
    pending: Vec<Change>,
    /// One in-flight auto-key draft per (index, prefix), so repeated
    /// `next_key` calls within the transaction never collide
    key_drafts: FxHashMap<(Pos, IndexKey), i64>,
    profile: TxnProfile,
    active: bool,
}

impl Database {
    /// Starts a transaction against the current committed state
    pub fn begin(&self) -> Transaction<'_> {
        let id = self.next_txn_id();
        let snapshot = self.live_snapshot();
        debug!(txn = id, position = snapshot.position, "transaction begun");
        Transaction {
            db: self,
            id,
            snapshot,
            read_constraints: FxHashMap::default(),
            pending: Vec::new(),
            key_drafts: FxHashMap::default(),
            profile: TxnProfile::new(),
            active: true,
        }
    }
}

impl<'db> Transaction<'db> {
    /// The transaction's working view, including its own pending changes
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(Error::TransactionEnded)
        }
    }

    fn constraint(&mut self, object: Pos) -> &mut ReadConstraint {
        self.read_constraints
            .entry(object)
            .or_insert_with(|| ReadConstraint::new(object))
    }

    // ------------------------------------------------------------------
    // Read tracking
    // ------------------------------------------------------------------

    /// Records a column read from a table
    pub fn note_select(&mut self, table: Pos, column: Pos) -> Result<()> {
        self.ensure_active()?;
        self.constraint(table).add_select(column);
        Ok(())
    }

    /// Records a single-row read through an index by key
    pub fn note_singleton(&mut self, index: Pos, key: IndexKey) -> Result<()> {
        self.ensure_active()?;
        let table = self.snapshot.index(index)?.table;
        self.constraint(table).singleton(index, key);
        Ok(())
    }

    /// Records a whole-object read (table scan without key narrowing)
    pub fn note_block(&mut self, table: Pos) -> Result<()> {
        self.ensure_active()?;
        self.constraint(table).block();
        Ok(())
    }

    /// Looks a row up by key and records the singleton read
    pub fn get_by_key(&mut self, index: Pos, key: &IndexKey) -> Result<Option<TableRow>> {
        self.ensure_active()?;
        let idx = self.snapshot.index(index)?.clone();
        let row = idx.rows.get(key).and_then(|pos| {
            self.snapshot
                .table(idx.table)
                .ok()
                .and_then(|t| t.rows.get(&pos).cloned())
        });
        self.constraint(idx.table).singleton(index, key.clone());
        Ok(row)
    }

    /// Next auto-increment value for an index's trailing key column
    ///
    /// The first call consults the tree; later calls advance a private
    /// draft, so values handed out within this transaction never repeat.
    pub fn next_key(&mut self, index: Pos, prefix: &IndexKey) -> Result<i64> {
        self.ensure_active()?;
        // Drafts are per (index, prefix): values under one prefix say
        // nothing about the occupied range under another
        if let Some(draft) = self.key_drafts.get_mut(&(index, prefix.clone())) {
            let value = *draft;
            *draft += 1;
            return Ok(value);
        }
        let idx = self.snapshot.index(index)?;
        let value = idx.rows.next_key(prefix, prefix.len());
        self.key_drafts.insert((index, prefix.clone()), value + 1);
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Inserts a new row, allocating its defining position
    pub fn insert(&mut self, table: Pos, fields: FxHashMap<Pos, Value>) -> Result<Pos> {
        let defpos = self.db.alloc_defpos();
        self.record(RowChange::new(defpos, table, fields))
    }

    /// Inserts a row from a prepared change (subtype and classification
    /// variants included)
    pub fn record(&mut self, rc: RowChange) -> Result<Pos> {
        self.ensure_active()?;
        let row = rc.to_row();
        self.snapshot.table(rc.table)?;
        self.check_constraints(rc.table, None, &row)?;

        let defpos = rc.pos;
        self.apply_pending(Change::Record(rc))?;
        Ok(defpos)
    }

    /// Updates the given columns of a row
    pub fn update(&mut self, table: Pos, defpos: Pos, changed: FxHashMap<Pos, Value>) -> Result<()> {
        self.ensure_active()?;
        let old = self
            .snapshot
            .table(table)?
            .rows
            .get(&defpos)
            .cloned()
            .ok_or_else(|| Error::internal(format!("row {defpos} not found in table {table}")))?;
        let updated = old.with_update(&changed);
        self.check_constraints(table, Some(&old), &updated)?;

        self.apply_pending(Change::Update {
            new: RowChange::new(defpos, table, changed),
            old,
        })
    }

    /// Deletes a row
    pub fn delete(&mut self, table: Pos, defpos: Pos) -> Result<()> {
        self.ensure_active()?;
        let old = self
            .snapshot
            .table(table)?
            .rows
            .get(&defpos)
            .cloned()
            .ok_or_else(|| Error::internal(format!("row {defpos} not found in table {table}")))?;
        self.apply_pending(Change::Delete {
            pos: defpos,
            table,
            old,
        })
    }

    /// Statement-time constraint checks against the private view. For an
    /// update, indexes whose key is unchanged are skipped.
    fn check_constraints(&self, table: Pos, old: Option<&TableRow>, row: &TableRow) -> Result<()> {
        for idx in self.snapshot.indexes_for(table) {
            let key = idx.make_key(row);
            if let Some(old) = old {
                if idx.make_key(old) == key {
                    continue;
                }
            }
            match idx.flags {
                ConstraintKind::ForeignKey => idx.check_foreign(&self.snapshot, &key)?,
                _ if idx.flags.is_unique() => idx.check_unique(&self.snapshot, &key)?,
                _ => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Schema changes
    // ------------------------------------------------------------------

    /// Drops a table; restricted while a foreign key elsewhere targets it
    pub fn drop_table(&mut self, table: Pos) -> Result<()> {
        self.ensure_active()?;
        self.snapshot.table(table)?;
        self.check_restrict(table)?;
        let pos = self.db.alloc_defpos();
        self.apply_pending(Change::DropTable { pos, table })
    }

    /// Drops a column; indexes keyed on it go with it
    pub fn drop_column(&mut self, table: Pos, column: Pos) -> Result<()> {
        self.ensure_active()?;
        self.snapshot.table(table)?;
        self.check_restrict(column)?;
        let pos = self.db.alloc_defpos();
        self.apply_pending(Change::DropColumn { pos, table, column })
    }

    /// Alters a column definition; indexes keyed on it are rebuilt
    pub fn alter_column(&mut self, table: Pos, column: Pos) -> Result<()> {
        self.ensure_active()?;
        self.snapshot.table(table)?;
        let pos = self.db.alloc_defpos();
        self.apply_pending(Change::AlterColumn { pos, table, column })
    }

    /// Drops an index; restricted while a foreign key targets it
    pub fn drop_index(&mut self, index: Pos) -> Result<()> {
        self.ensure_active()?;
        let table = self.snapshot.index(index)?.table;
        self.check_restrict(index)?;
        let pos = self.db.alloc_defpos();
        self.apply_pending(Change::DropIndex { pos, table, index })
    }

    /// DDL restrict rule: an object targeted by someone's foreign key
    /// cannot be dropped out from under it
    fn check_restrict(&self, target: Pos) -> Result<()> {
        for idx in self.snapshot.catalog.indexes.values() {
            if idx.dependent(target) == crate::core::Dependence::Restrict {
                return Err(Error::internal(format!(
                    "cannot drop object {}: referenced by foreign key '{}'",
                    target, idx.name
                )));
            }
        }
        Ok(())
    }

    fn apply_pending(&mut self, change: Change) -> Result<()> {
        // Provisional log position for version stamps in the private view;
        // the real positions are assigned when the commit appends
        let position = self.snapshot.position + self.pending.len() as Pos;
        self.snapshot.catalog.apply(position, &change)?;
        self.profile.note_change(&change);
        self.pending.push(change);
        Ok(())
    }

    // ------------------------------------------------------------------
    // End of life
    // ------------------------------------------------------------------

    /// Validates against everything committed since the snapshot and, on
    /// success, appends the pending changes to the shared log
    ///
    /// Returns the end-of-log position after this transaction's changes.
    /// A conflict aborts the transaction; the database is untouched.
    pub fn commit(&mut self) -> Result<Pos> {
        self.ensure_active()?;
        self.active = false;

        let _guard = self.db.commit_lock.lock();
        let mut shared = self.db.shared.write();

        let start = shared
            .log
            .partition_point(|e| e.position < self.snapshot.position);
        let current = Snapshot::new(shared.position, false, shared.catalog.clone());
        let verdict = validate::validate_commit(
            self.id,
            &self.snapshot,
            &self.read_constraints,
            &self.pending,
            &shared.log[start..],
            &current,
        );
        if let Err(err) = verdict {
            drop(shared);
            drop(_guard);
            self.finish_profile();
            return Err(err);
        }

        for change in self.pending.drain(..) {
            let position = shared.position;
            shared.catalog.apply(position, &change)?;
            shared.log.push(LoggedChange { position, change });
            shared.position += 1;
        }
        let end = shared.position;
        debug!(txn = self.id, position = end, "transaction committed");

        drop(shared);
        drop(_guard);
        self.finish_profile();
        Ok(end)
    }

    /// Discards the private state; no side effects
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.active = false;
        debug!(txn = self.id, "transaction rolled back");
        self.finish_profile();
        Ok(())
    }

    fn finish_profile(&mut self) {
        for rc in self.read_constraints.values() {
            self.profile.note_constraint(&rc.check);
        }
        self.db.profiles.record(&self.profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, Table};
    use crate::core::DataType;
    use crate::index::Index;

    fn setup() -> Database {
        let db = Database::in_memory("test");
        db.create_table(Table::new(
            10,
            "t",
            vec![
                Column::new(100, "id", DataType::Integer),
                Column::new(101, "name", DataType::Text),
            ],
        ));
        db.create_index(
            Index::new(1, "t_pk", 10, ConstraintKind::PrimaryKey, vec![100]).unwrap(),
        )
        .unwrap();
        db
    }

    fn fields(id: i64, name: &str) -> FxHashMap<Pos, Value> {
        [(100, Value::integer(id)), (101, Value::text(name))]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_insert_commit_visible() {
        let db = setup();

        let mut txn = db.begin();
        let defpos = txn.insert(10, fields(5, "ann")).unwrap();
        txn.commit().unwrap();

        let view = db.snapshot();
        let table = view.table(10).unwrap();
        assert_eq!(table.rows[&defpos].get(101), Some(&Value::text("ann")));
        assert!(view
            .index(1)
            .unwrap()
            .rows
            .contains(&IndexKey::new(vec![Value::integer(5)])));
    }

    #[test]
    fn test_own_duplicate_caught_at_statement_time() {
        let db = setup();

        let mut txn = db.begin();
        txn.insert(10, fields(5, "ann")).unwrap();
        let err = txn.insert(10, fields(5, "bob")).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[test]
    fn test_rollback_has_no_side_effects() {
        let db = setup();

        let mut txn = db.begin();
        txn.insert(10, fields(5, "ann")).unwrap();
        txn.rollback().unwrap();

        assert!(db.snapshot().table(10).unwrap().rows.is_empty());
        assert_eq!(db.position(), 0);

        // Ended transactions reject further work, read tracking included
        assert_eq!(txn.insert(10, fields(6, "bob")), Err(Error::TransactionEnded));
        assert_eq!(txn.note_select(10, 101), Err(Error::TransactionEnded));
        assert_eq!(txn.note_block(10), Err(Error::TransactionEnded));
        assert_eq!(txn.commit(), Err(Error::TransactionEnded));
    }

    #[test]
    fn test_uncommitted_invisible_to_others() {
        let db = setup();

        let mut writer = db.begin();
        writer.insert(10, fields(5, "ann")).unwrap();

        let mut reader = db.begin();
        let key = IndexKey::new(vec![Value::integer(5)]);
        assert!(reader.get_by_key(1, &key).unwrap().is_none());
    }

    #[test]
    fn test_next_key_draft_is_race_free_within_txn() {
        let db = setup();

        let mut seed = db.begin();
        seed.insert(10, fields(7, "ann")).unwrap();
        seed.commit().unwrap();

        let mut txn = db.begin();
        let prefix = IndexKey::new(vec![]);
        // First call consults the tree (max id 7), later calls advance the
        // draft without re-reading
        assert_eq!(txn.next_key(1, &prefix).unwrap(), 8);
        assert_eq!(txn.next_key(1, &prefix).unwrap(), 9);
        assert_eq!(txn.next_key(1, &prefix).unwrap(), 10);
    }

    #[test]
    fn test_next_key_drafts_are_per_prefix() {
        let db = Database::in_memory("test");
        db.create_table(Table::new(
            20,
            "seq",
            vec![
                Column::new(200, "group", DataType::Integer),
                Column::new(201, "n", DataType::Integer),
            ],
        ));
        db.create_index(
            Index::new(2, "seq_pk", 20, ConstraintKind::PrimaryKey, vec![200, 201]).unwrap(),
        )
        .unwrap();

        let mut seed = db.begin();
        for (group, n) in [(1, 5), (2, 9)] {
            seed.insert(
                20,
                [(200, Value::integer(group)), (201, Value::integer(n))]
                    .into_iter()
                    .collect(),
            )
            .unwrap();
        }
        seed.commit().unwrap();

        // Interleaved prefixes advance independent drafts; neither hands
        // out a value already present under its prefix
        let mut txn = db.begin();
        let one = IndexKey::new(vec![Value::integer(1)]);
        let two = IndexKey::new(vec![Value::integer(2)]);
        assert_eq!(txn.next_key(2, &one).unwrap(), 6);
        assert_eq!(txn.next_key(2, &two).unwrap(), 10);
        assert_eq!(txn.next_key(2, &one).unwrap(), 7);
        assert_eq!(txn.next_key(2, &two).unwrap(), 11);
    }

    #[test]
    fn test_update_and_delete() {
        let db = setup();

        let mut txn = db.begin();
        let a = txn.insert(10, fields(5, "ann")).unwrap();
        let b = txn.insert(10, fields(6, "bob")).unwrap();
        txn.commit().unwrap();

        let mut txn = db.begin();
        txn.update(10, a, [(101, Value::text("anna"))].into_iter().collect())
            .unwrap();
        txn.delete(10, b).unwrap();
        txn.commit().unwrap();

        let view = db.snapshot();
        let table = view.table(10).unwrap();
        assert_eq!(table.rows[&a].get(101), Some(&Value::text("anna")));
        // Untouched column survives the update
        assert_eq!(table.rows[&a].get(100), Some(&Value::integer(5)));
        assert!(!table.rows.contains_key(&b));
        assert!(!view
            .index(1)
            .unwrap()
            .rows
            .contains(&IndexKey::new(vec![Value::integer(6)])));
    }

    #[test]
    fn test_drop_table_restricted_by_foreign_key() {
        let db = setup();
        db.create_table(Table::new(
            20,
            "orders",
            vec![Column::new(200, "person", DataType::Integer)],
        ));
        db.create_index(Index::foreign(2, "orders_fk", 20, vec![200], 10, 1, None).unwrap())
            .unwrap();

        let mut txn = db.begin();
        assert!(txn.drop_table(10).is_err());
        // The referencing table itself can go, then the target
        txn.drop_table(20).unwrap();
        txn.drop_table(10).unwrap();
        txn.commit().unwrap();
        assert!(db.snapshot().table(10).is_err());
    }
}
