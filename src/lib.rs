//! # Marl - schema layer and optimistic conflict detection for an embedded SQL engine
//!
//! Marl is the object/index layer of an embedded SQL database: it sits
//! between a binary write-ahead log below and a query layer above, and
//! implements multi-version concurrency without read locks. Transactions
//! work against immutable, structurally-shared snapshots, record what they
//! observed in fine-grained read constraints, and validate at commit
//! against the changes other transactions committed in the meantime.
//!
//! ## Key pieces
//!
//! - **Copy-on-write key trees** - every constraint index is backed by a
//!   persistent ordered multimap; cloning a snapshot is O(1)
//! - **Three-tier read constraints** - column set, specific rows under one
//!   index, or whole-object block, widening monotonically
//! - **Symmetric commit validation** - a transaction aborts if someone
//!   changed what it read, or if its writes collide with what someone else
//!   committed
//! - **Replay with explicit corruption policy** - rebuilding from the log
//!   trusts committed history and never re-runs constraint checks
//!
//! ## Quick start
//!
//! ```rust
//! use marl::catalog::{Column, Database, Table};
//! use marl::core::{ConstraintKind, DataType, IndexKey, Value};
//! use marl::index::Index;
//!
//! let db = Database::in_memory("demo");
//! db.create_table(Table::new(10, "people", vec![
//!     Column::new(100, "id", DataType::Integer),
//!     Column::new(101, "name", DataType::Text),
//! ]));
//! db.create_index(
//!     Index::new(1, "people_pk", 10, ConstraintKind::PrimaryKey, vec![100]).unwrap(),
//! ).unwrap();
//!
//! let mut txn = db.begin();
//! txn.insert(10, [(100, Value::integer(5)), (101, Value::text("ann"))]
//!     .into_iter().collect()).unwrap();
//! txn.commit().unwrap();
//!
//! let mut reader = db.begin();
//! let row = reader.get_by_key(1, &IndexKey::new(vec![Value::integer(5)])).unwrap();
//! assert!(row.is_some());
//! ```
//!
//! ## Modules
//!
//! - [`core`] - values, keys, rows, errors ([`Value`], [`IndexKey`], [`Error`])
//! - [`mtree`] - the copy-on-write ordered key tree
//! - [`index`] - constraint indexes (primary/unique/foreign/temporal)
//! - [`catalog`] - id -> object mapping, snapshots, the [`Database`] handle
//! - [`txn`] - transactions, read constraints, commit validation
//! - [`replay`] - rebuilding state from a physical change stream

pub mod catalog;
pub mod core;
pub mod index;
pub mod mtree;
pub mod replay;
pub mod txn;

pub use catalog::{Catalog, Column, Database, RowVersion, Snapshot, Table};
pub use core::{
    ConstraintKind, DataType, Dependence, Error, IndexKey, Level, Pos, ReplayConfig, ReplayPolicy,
    Result, TableRow, Value, NO_POS,
};
pub use index::Index;
pub use mtree::{DuplicatePolicy, MTree};
pub use replay::{replay, ChangeSource, ReplayStats};
pub use txn::{Change, ReadConstraint, RowChange, Transaction, TxnProfile};
