//! Commit-time conflict validation
//!
//! Enumerates every change committed after a transaction's snapshot, in log
//! order, and checks it against the transaction's read constraints and
//! pending writes. The first failure aborts validation; callers never see
//! more than one conflict (fail-fast, not diagnostic-complete).

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::catalog::{LoggedChange, Snapshot};
use crate::core::{Error, Pos, Result};

use super::constraint::{CheckUpdate, ReadConstraint};
use super::physical::Change;

/// Validates a candidate transaction against the changes committed since
/// its snapshot
///
/// `txn_view` is the transaction's begin snapshot (read constraints resolve
/// their index through it); `current` is the committed state at the commit
/// point (pending-write collisions consult its constraint indexes, so
/// uniqueness constraints added since the snapshot participate too).
pub(crate) fn validate_commit(
    txn_id: u64,
    txn_view: &Snapshot,
    read_constraints: &FxHashMap<Pos, ReadConstraint>,
    pending: &[Change],
    committed: &[LoggedChange],
    current: &Snapshot,
) -> Result<()> {
    for entry in committed {
        let change = &entry.change;

        for rc in read_constraints.values() {
            // Structural schema changes invalidate the transaction's view
            // outright, regardless of row data
            if let Some(err) = schema_invalidated(rc, change, txn_view) {
                debug!(txn = txn_id, position = entry.position, %err, "commit rejected");
                return Err(err);
            }
            if let Some(err) = rc.check(change, txn_view) {
                debug!(txn = txn_id, position = entry.position, %err, "commit rejected");
                return Err(err);
            }
        }

        for write in pending {
            if let Some(err) = write.conflicts(change, current) {
                debug!(txn = txn_id, position = entry.position, %err, "commit rejected");
                return Err(err);
            }
        }
    }

    Ok(())
}

/// Drop/Alter of an object the transaction read is a *schema-invalidated*
/// abort, distinct from row-level conflicts: the plan that produced the
/// reads may no longer be valid
fn schema_invalidated(rc: &ReadConstraint, change: &Change, view: &Snapshot) -> Option<Error> {
    if change.table() != rc.object {
        return None;
    }
    match change {
        Change::DropTable { table, .. } => Some(Error::SchemaInvalidated { object: *table }),
        Change::DropColumn { column, .. } | Change::AlterColumn { column, .. } => {
            if tracks_column(rc, *column, view) {
                Some(Error::SchemaInvalidated { object: *column })
            } else {
                None
            }
        }
        Change::DropIndex { index, .. } => match &rc.check {
            CheckUpdate::SpecificRows { index: fixed, .. } if fixed == index => {
                Some(Error::SchemaInvalidated { object: *index })
            }
            _ => None,
        },
        _ => None,
    }
}

fn tracks_column(rc: &ReadConstraint, column: Pos, view: &Snapshot) -> bool {
    match &rc.check {
        CheckUpdate::Unset => false,
        CheckUpdate::Columns(cols) => cols.contains(&column),
        CheckUpdate::SpecificRows { index, cols, .. } => {
            if cols.contains(&column) {
                return true;
            }
            // A key column of the fixed index was read implicitly; if the
            // index cannot be resolved any more, assume the worst
            view.index(*index)
                .map_or(true, |idx| idx.pos_for(column).is_some())
        }
        CheckUpdate::Block { cols: Some(cols) } => cols.contains(&column),
        CheckUpdate::Block { cols: None } => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Column, Table};
    use crate::core::{ConstraintKind, DataType, IndexKey, TableRow, Value};
    use crate::index::Index;
    use crate::txn::physical::RowChange;

    fn view() -> Snapshot {
        let mut catalog = Catalog::default();
        catalog.install_table(Table::new(
            10,
            "t",
            vec![
                Column::new(100, "id", DataType::Integer),
                Column::new(101, "name", DataType::Text),
            ],
        ));
        catalog
            .install_index(
                Index::new(1, "t_pk", 10, ConstraintKind::PrimaryKey, vec![100]).unwrap(),
            )
            .unwrap();
        Snapshot::new(0, false, catalog)
    }

    fn logged(position: Pos, change: Change) -> LoggedChange {
        LoggedChange { position, change }
    }

    fn constraint_on_key(id: i64) -> FxHashMap<Pos, ReadConstraint> {
        let mut rc = ReadConstraint::new(10);
        rc.singleton(1, IndexKey::new(vec![Value::integer(id)]));
        [(10, rc)].into_iter().collect()
    }

    #[test]
    fn test_fail_fast_first_conflict() {
        let view = view();
        let constraints = constraint_on_key(5);

        let committed = vec![
            logged(
                1,
                Change::Record(RowChange::new(
                    1000,
                    10,
                    [(100, Value::integer(5))].into_iter().collect(),
                )),
            ),
            logged(2, Change::DropTable { pos: 60, table: 10 }),
        ];

        // The key collision at position 1 is reported, not the later drop
        let err = validate_commit(1, &view, &constraints, &[], &committed, &view).unwrap_err();
        assert_eq!(err, Error::ConcurrentKeyConflict { table: 10, index: 1 });
    }

    #[test]
    fn test_drop_of_read_table_is_schema_invalidated() {
        let view = view();
        let constraints = constraint_on_key(5);

        let committed = vec![logged(1, Change::DropTable { pos: 60, table: 10 })];
        let err = validate_commit(1, &view, &constraints, &[], &committed, &view).unwrap_err();
        assert_eq!(err, Error::SchemaInvalidated { object: 10 });
    }

    #[test]
    fn test_alter_of_read_key_column() {
        let view = view();
        let constraints = constraint_on_key(5);

        // Column 100 is a key column of the fixed index: invalidated
        let committed = vec![logged(
            1,
            Change::AlterColumn {
                pos: 60,
                table: 10,
                column: 100,
            },
        )];
        let err = validate_commit(1, &view, &constraints, &[], &committed, &view).unwrap_err();
        assert_eq!(err, Error::SchemaInvalidated { object: 100 });

        // Column 101 is not tracked: no conflict
        let committed = vec![logged(
            1,
            Change::AlterColumn {
                pos: 60,
                table: 10,
                column: 101,
            },
        )];
        assert!(validate_commit(1, &view, &constraints, &[], &committed, &view).is_ok());
    }

    #[test]
    fn test_pending_write_collision() {
        let view = view();

        let pending = vec![Change::Record(RowChange::new(
            2000,
            10,
            [(100, Value::integer(5))].into_iter().collect(),
        ))];
        let committed = vec![logged(
            1,
            Change::Record(RowChange::new(
                1000,
                10,
                [(100, Value::integer(5))].into_iter().collect(),
            )),
        )];

        let err =
            validate_commit(1, &view, &FxHashMap::default(), &pending, &committed, &view)
                .unwrap_err();
        assert_eq!(err, Error::ConcurrentKeyConflict { table: 10, index: 1 });
    }

    #[test]
    fn test_unrelated_changes_pass() {
        let view = view();
        let constraints = constraint_on_key(5);

        let committed = vec![
            logged(
                1,
                Change::Record(RowChange::new(
                    1000,
                    10,
                    [(100, Value::integer(7))].into_iter().collect(),
                )),
            ),
            logged(
                2,
                Change::Delete {
                    pos: 1001,
                    table: 10,
                    old: TableRow::new(
                        1001,
                        10,
                        [(100, Value::integer(9))].into_iter().collect(),
                    ),
                },
            ),
        ];

        assert!(validate_commit(1, &view, &constraints, &[], &committed, &view).is_ok());
    }
}
