//! Table rows as immutable versioned snapshots
//!
//! A `TableRow` is the schema layer's view of one committed row version:
//! its defining position in the log, its table, and a column-id -> value
//! map. Updates never mutate; they layer a new snapshot over the old one,
//! retaining untouched columns.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::types::{Level, Pos, NO_POS};
use super::value::Value;

/// One immutable row version
///
/// The field map is behind an `Arc` so that version chains and index
/// rebuilds can hold many references to the same snapshot cheaply.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    /// Defining position: the log position of the Record that created this
    /// row lineage. Unique per table, stable across updates.
    pub defpos: Pos,

    /// Owning table id
    pub table: Pos,

    /// Subtype id for typed-table hierarchies (NO_POS when untyped)
    pub subtype: Pos,

    /// Security classification label
    pub classification: Level,

    /// Column id -> value
    pub fields: Arc<FxHashMap<Pos, Value>>,
}

impl TableRow {
    /// Creates a new row snapshot from a field map
    pub fn new(defpos: Pos, table: Pos, fields: FxHashMap<Pos, Value>) -> Self {
        Self {
            defpos,
            table,
            subtype: NO_POS,
            classification: Level::default(),
            fields: Arc::new(fields),
        }
    }

    /// Sets the subtype id (Record-with-subtype events)
    pub fn with_subtype(mut self, subtype: Pos) -> Self {
        self.subtype = subtype;
        self
    }

    /// Sets the classification level (Record-with-classification events)
    pub fn with_classification(mut self, level: Level) -> Self {
        self.classification = level;
        self
    }

    /// Layers an update over this snapshot, producing the next version
    ///
    /// Columns absent from `changed` keep their current values. The
    /// defining position is retained: updates extend a lineage, they do
    /// not start one.
    pub fn with_update(&self, changed: &FxHashMap<Pos, Value>) -> Self {
        let mut fields = (*self.fields).clone();
        for (&col, val) in changed {
            fields.insert(col, val.clone());
        }
        Self {
            defpos: self.defpos,
            table: self.table,
            subtype: self.subtype,
            classification: self.classification,
            fields: Arc::new(fields),
        }
    }

    /// Value of a column, if present
    pub fn get(&self, column: Pos) -> Option<&Value> {
        self.fields.get(&column)
    }

    /// Number of columns with values
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the row carries no column values
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DataType;

    fn fields(pairs: &[(Pos, Value)]) -> FxHashMap<Pos, Value> {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn test_row_basics() {
        let row = TableRow::new(
            100,
            10,
            fields(&[(1, Value::integer(5)), (2, Value::text("alice"))]),
        );
        assert_eq!(row.defpos, 100);
        assert_eq!(row.table, 10);
        assert_eq!(row.subtype, NO_POS);
        assert_eq!(row.get(1), Some(&Value::integer(5)));
        assert_eq!(row.get(3), None);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_update_layers_over_old_values() {
        let v1 = TableRow::new(
            100,
            10,
            fields(&[(1, Value::integer(5)), (2, Value::text("alice"))]),
        );
        let v2 = v1.with_update(&fields(&[(2, Value::text("bob"))]));

        // New version sees the change plus untouched columns
        assert_eq!(v2.defpos, 100);
        assert_eq!(v2.get(1), Some(&Value::integer(5)));
        assert_eq!(v2.get(2), Some(&Value::text("bob")));

        // Old snapshot is unchanged
        assert_eq!(v1.get(2), Some(&Value::text("alice")));
    }

    #[test]
    fn test_update_can_set_null() {
        let v1 = TableRow::new(100, 10, fields(&[(1, Value::integer(5))]));
        let v2 = v1.with_update(&fields(&[(1, Value::null(DataType::Integer))]));
        assert!(v2.get(1).unwrap().is_null());
    }

    #[test]
    fn test_builders() {
        let row = TableRow::new(100, 10, FxHashMap::default())
            .with_subtype(77)
            .with_classification(Level::B);
        assert_eq!(row.subtype, 77);
        assert_eq!(row.classification, Level::B);
        assert!(row.is_empty());
    }
}
