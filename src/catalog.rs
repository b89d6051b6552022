//! Catalog: versioned id -> object mapping and the database handle
//!
//! All schema objects are addressed by durable id (`Pos`). A [`Snapshot`] is
//! an immutable view of the catalog as of a log position; transactions work
//! against private snapshots and never see each other's state. The
//! [`Database`] owns the committed state, the change log, and the single
//! commit mutex that serializes log appends.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::core::{ConstraintKind, DataType, Error, Pos, Result, TableRow, NO_POS};
use crate::index::Index;
use crate::txn::physical::Change;
use crate::txn::profile::ProfileAggregator;

/// Column metadata
#[derive(Debug, Clone)]
pub struct Column {
    pub defpos: Pos,
    pub name: Arc<str>,
    pub data_type: DataType,
}

impl Column {
    pub fn new(defpos: Pos, name: impl Into<Arc<str>>, data_type: DataType) -> Self {
        Self {
            defpos,
            name: name.into(),
            data_type,
        }
    }
}

/// One entry of a table's version history
///
/// `position` is the log position of the change that produced this
/// version. Updates retain the row's defining position, so the stamp is
/// what tells two versions of one lineage apart.
#[derive(Debug, Clone)]
pub struct RowVersion {
    pub position: Pos,
    pub row: TableRow,
}

/// Table metadata plus its committed row set
///
/// `versions` keeps every committed row version in log order, stamped
/// with the producing change's log position; temporal index builds walk
/// it. `rows` holds only the live versions.
#[derive(Debug, Clone)]
pub struct Table {
    pub defpos: Pos,
    pub name: Arc<str>,
    pub columns: Vec<Column>,
    /// Primary index id, NO_POS when the table has none
    pub primary: Pos,
    /// Ids of all indexes on this table
    pub indexes: Vec<Pos>,
    /// Live rows by defining position
    pub rows: FxHashMap<Pos, TableRow>,
    /// Full version history in commit order
    pub versions: Vec<RowVersion>,
}

impl Table {
    pub fn new(defpos: Pos, name: impl Into<Arc<str>>, columns: Vec<Column>) -> Self {
        Self {
            defpos,
            name: name.into(),
            columns,
            primary: NO_POS,
            indexes: Vec::new(),
            rows: FxHashMap::default(),
            versions: Vec::new(),
        }
    }

    pub fn column(&self, pos: Pos) -> Option<&Column> {
        self.columns.iter().find(|c| c.defpos == pos)
    }
}

/// The id -> object maps, cloned cheaply into snapshots (objects are
/// Arc-shared; only the maps themselves are copied)
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tables: FxHashMap<Pos, Arc<Table>>,
    pub indexes: FxHashMap<Pos, Arc<Index>>,
}

impl Catalog {
    pub fn table(&self, pos: Pos) -> Result<&Arc<Table>> {
        self.tables.get(&pos).ok_or(Error::TableNotFound(pos))
    }

    pub fn index(&self, pos: Pos) -> Result<&Arc<Index>> {
        self.indexes.get(&pos).ok_or(Error::IndexNotFound(pos))
    }

    pub fn install_table(&mut self, table: Table) {
        self.tables.insert(table.defpos, Arc::new(table));
    }

    /// Installs an index value and registers it on its owning table
    pub fn install_index(&mut self, index: Index) -> Result<()> {
        let index = Arc::new(index);
        let table = self
            .tables
            .get_mut(&index.table)
            .ok_or(Error::TableNotFound(index.table))?;
        let table = Arc::make_mut(table);
        if !table.indexes.contains(&index.defpos) {
            table.indexes.push(index.defpos);
        }
        if index.flags == ConstraintKind::PrimaryKey {
            table.primary = index.defpos;
        }
        self.indexes.insert(index.defpos, index);
        Ok(())
    }

    /// Applies one physical change mechanically
    ///
    /// `position` is the change's log position; it stamps the row versions
    /// the change produces. No constraint checking happens here:
    /// statement-time checks ran when the change was proposed, commit
    /// validation covers concurrency, and replay trusts committed history.
    pub fn apply(&mut self, position: Pos, change: &Change) -> Result<()> {
        match change {
            Change::Record(rc) => {
                let row = rc.to_row();
                let table = self
                    .tables
                    .get_mut(&rc.table)
                    .ok_or(Error::TableNotFound(rc.table))?;
                let table = Arc::make_mut(table);
                table.rows.insert(row.defpos, row.clone());
                table.versions.push(RowVersion {
                    position,
                    row: row.clone(),
                });
                let index_ids = table.indexes.clone();
                self.reindex(&index_ids, None, Some(&row));
            }
            Change::Update { new, old } => {
                let table = self
                    .tables
                    .get_mut(&new.table)
                    .ok_or(Error::TableNotFound(new.table))?;
                let table = Arc::make_mut(table);
                // Layer the changed columns on the stored version, not on
                // the caller's copy of the old row
                let prior = table
                    .rows
                    .get(&old.defpos)
                    .cloned()
                    .unwrap_or_else(|| old.clone());
                let updated = prior.with_update(&new.fields);
                table.rows.insert(updated.defpos, updated.clone());
                table.versions.push(RowVersion {
                    position,
                    row: updated.clone(),
                });
                let index_ids = table.indexes.clone();
                self.reindex(&index_ids, Some(&prior), Some(&updated));
            }
            Change::Delete { table, old, .. } => {
                let table = self
                    .tables
                    .get_mut(table)
                    .ok_or(Error::TableNotFound(*table))?;
                let table = Arc::make_mut(table);
                let prior = table.rows.remove(&old.defpos).unwrap_or_else(|| old.clone());
                let index_ids = table.indexes.clone();
                self.reindex(&index_ids, Some(&prior), None);
            }
            Change::AlterColumn { table, column, .. } => {
                // Key columns changed definition: affected indexes get a
                // full rebuild from the current row set
                let table = self.table(*table)?.clone();
                let view = Snapshot::new(NO_POS, false, self.clone());
                for &ix in &table.indexes {
                    let Some(idx) = self.indexes.get(&ix) else {
                        continue;
                    };
                    if idx.pos_for(*column).is_some() {
                        let rebuilt = idx.rebuild(&table, &view)?;
                        self.indexes.insert(ix, Arc::new(rebuilt));
                    }
                }
            }
            Change::DropColumn { table, column, .. } => {
                let table_arc = self
                    .tables
                    .get_mut(table)
                    .ok_or(Error::TableNotFound(*table))?;
                let table = Arc::make_mut(table_arc);
                table.columns.retain(|c| c.defpos != *column);
                // Indexes keyed on the column go with it
                let dropped: Vec<Pos> = table
                    .indexes
                    .iter()
                    .copied()
                    .filter(|ix| {
                        self.indexes
                            .get(ix)
                            .is_some_and(|idx| idx.pos_for(*column).is_some())
                    })
                    .collect();
                table.indexes.retain(|ix| !dropped.contains(ix));
                if dropped.contains(&table.primary) {
                    table.primary = NO_POS;
                }
                for ix in dropped {
                    self.indexes.remove(&ix);
                }
            }
            Change::DropTable { table, .. } => {
                self.tables.remove(table);
                self.indexes.retain(|_, idx| idx.table != *table);
            }
            Change::DropIndex { table, index, .. } => {
                self.indexes.remove(index);
                if let Some(t) = self.tables.get_mut(table) {
                    let t = Arc::make_mut(t);
                    t.indexes.retain(|ix| ix != index);
                    if t.primary == *index {
                        t.primary = NO_POS;
                    }
                }
            }
        }
        Ok(())
    }

    fn reindex(&mut self, index_ids: &[Pos], removed: Option<&TableRow>, added: Option<&TableRow>) {
        for &ix in index_ids {
            let Some(idx) = self.indexes.get(&ix) else {
                continue;
            };
            let mut next = (**idx).clone();
            if let Some(row) = removed {
                next = next.remove_row(row);
            }
            if let Some(row) = added {
                next = next.insert_row(row);
            }
            self.indexes.insert(ix, Arc::new(next));
        }
    }
}

/// Immutable view of all database objects as of a log position
///
/// `live` distinguishes a transaction's working view from a replay or
/// inspection view; constraint checks only fire in live context.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Log position this view was taken at
    pub position: Pos,
    live: bool,
    pub catalog: Catalog,
}

impl Snapshot {
    pub(crate) fn new(position: Pos, live: bool, catalog: Catalog) -> Self {
        Self {
            position,
            live,
            catalog,
        }
    }

    /// Whether this view belongs to a live (uncommitted) transaction
    #[inline]
    pub fn live(&self) -> bool {
        self.live
    }

    pub fn table(&self, pos: Pos) -> Result<&Arc<Table>> {
        self.catalog.table(pos)
    }

    pub fn index(&self, pos: Pos) -> Result<&Arc<Index>> {
        self.catalog.index(pos)
    }

    /// Table name for error reporting; falls back to the id
    pub fn table_name(&self, pos: Pos) -> String {
        self.catalog
            .tables
            .get(&pos)
            .map_or_else(|| pos.to_string(), |t| t.name.to_string())
    }

    /// All indexes on a table
    pub fn indexes_for(&self, table: Pos) -> impl Iterator<Item = &Arc<Index>> {
        self.catalog
            .indexes
            .values()
            .filter(move |idx| idx.table == table)
    }

    /// Uniqueness-bearing indexes on a table (primary and unique alike)
    pub fn unique_indexes_for(&self, table: Pos) -> impl Iterator<Item = &Arc<Index>> {
        self.catalog
            .indexes
            .values()
            .filter(move |idx| idx.table == table && idx.flags.is_unique())
    }
}

/// One committed change with its log position
#[derive(Debug, Clone)]
pub struct LoggedChange {
    pub position: Pos,
    pub change: Change,
}

pub(crate) struct Shared {
    /// Next log position to hand out
    pub position: Pos,
    pub catalog: Catalog,
    /// Committed changes in log order
    pub log: Vec<LoggedChange>,
}

/// The database handle: committed catalog versions, change log, commit mutex
///
/// All process-wide state lives in this value. Opening a path takes an
/// exclusive OS file lock; in-memory databases skip it.
pub struct Database {
    name: Arc<str>,
    pub(crate) shared: RwLock<Shared>,
    /// Serializes the validate-and-append critical section
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) next_txn: AtomicU64,
    /// Allocator for row defining positions. Rolled-back transactions
    /// leave gaps, which is fine; ids never repeat.
    pub(crate) next_defpos: AtomicI64,
    /// Shape summaries of finished transactions (diagnostics)
    pub profiles: ProfileAggregator,
    _lock: Option<FileLock>,
}

impl Database {
    /// Creates an in-memory database (no file lock)
    pub fn in_memory(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            shared: RwLock::new(Shared {
                position: 0,
                catalog: Catalog::default(),
                log: Vec::new(),
            }),
            commit_lock: Mutex::new(()),
            next_txn: AtomicU64::new(1),
            next_defpos: AtomicI64::new(1_000_000),
            profiles: ProfileAggregator::new(),
            _lock: None,
        }
    }

    /// Opens a database rooted at a directory, taking an exclusive file
    /// lock so no second process attaches to the same log
    pub fn open(path: impl AsRef<Path>, name: impl Into<Arc<str>>) -> Result<Self> {
        let lock = FileLock::acquire(path.as_ref())?;
        let name = name.into();
        debug!(db = %name, path = %path.as_ref().display(), "database opened");
        Ok(Self {
            name,
            shared: RwLock::new(Shared {
                position: 0,
                catalog: Catalog::default(),
                log: Vec::new(),
            }),
            commit_lock: Mutex::new(()),
            next_txn: AtomicU64::new(1),
            next_defpos: AtomicI64::new(1_000_000),
            profiles: ProfileAggregator::new(),
            _lock: Some(lock),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current end-of-log position
    pub fn position(&self) -> Pos {
        self.shared.read().position
    }

    /// Read-only view of the committed state (not transaction-scoped)
    pub fn snapshot(&self) -> Snapshot {
        let shared = self.shared.read();
        Snapshot::new(shared.position, false, shared.catalog.clone())
    }

    /// Transaction-scoped view; constraint checks fire against it
    pub(crate) fn live_snapshot(&self) -> Snapshot {
        let shared = self.shared.read();
        Snapshot::new(shared.position, true, shared.catalog.clone())
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a fresh row defining position
    pub(crate) fn alloc_defpos(&self) -> Pos {
        self.next_defpos.fetch_add(1, Ordering::Relaxed)
    }

    /// Installs a table definition (DDL outside the row-change log)
    pub fn create_table(&self, table: Table) -> Pos {
        let _guard = self.commit_lock.lock();
        let mut shared = self.shared.write();
        let pos = table.defpos;
        shared.catalog.install_table(table);
        pos
    }

    /// Builds and installs an index over the table's current rows
    ///
    /// Duplicate keys in existing data fail the build and leave the
    /// catalog untouched.
    pub fn create_index(&self, index: Index) -> Result<Pos> {
        let _guard = self.commit_lock.lock();
        let mut shared = self.shared.write();
        let view = Snapshot::new(shared.position, false, shared.catalog.clone());
        let table = view.table(index.table)?.clone();
        let built = index.build(&table, &view)?;
        let pos = built.defpos;
        shared.catalog.install_index(built)?;
        Ok(pos)
    }
}

/// Exclusive lock on a database directory, released on drop
///
/// `flock()` on Unix, `LockFileEx()` on Windows. A `db.lock` file in the
/// directory carries the holder's pid for diagnostics.
#[derive(Debug)]
struct FileLock {
    #[allow(dead_code)]
    file: File,
    #[allow(dead_code)]
    path: PathBuf,
}

impl FileLock {
    fn acquire(db_path: &Path) -> Result<Self> {
        fs::create_dir_all(db_path)
            .map_err(|e| Error::internal(format!("failed to create database directory: {}", e)))?;

        let lock_path = db_path.join("db.lock");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::internal(format!("failed to open lock file: {}", e)))?;

        lock_exclusive(&file)?;

        write!(file, "{}", std::process::id()).ok();
        file.sync_all().ok();

        Ok(Self {
            file,
            path: lock_path,
        })
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(Error::DatabaseLocked);
        }
        return Err(Error::internal(format!("failed to acquire lock: {}", errno)));
    }
    Ok(())
}

#[cfg(windows)]
fn lock_exclusive(file: &File) -> Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    let handle = file.as_raw_handle() as HANDLE;
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if rc == 0 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            return Err(Error::DatabaseLocked);
        }
        return Err(Error::internal(format!("failed to acquire lock: {}", error)));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn lock_exclusive(_file: &File) -> Result<()> {
    tracing::warn!("file locking not supported on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use tempfile::tempdir;

    fn people() -> Table {
        Table::new(
            10,
            "people",
            vec![
                Column::new(100, "id", DataType::Integer),
                Column::new(101, "name", DataType::Text),
            ],
        )
    }

    #[test]
    fn test_install_index_registers_on_table() {
        let mut catalog = Catalog::default();
        catalog.install_table(people());

        let idx = Index::new(1, "people_pk", 10, ConstraintKind::PrimaryKey, vec![100]).unwrap();
        catalog.install_index(idx).unwrap();

        let table = catalog.table(10).unwrap();
        assert_eq!(table.primary, 1);
        assert_eq!(table.indexes, vec![1]);
        assert!(catalog.index(1).is_ok());
        assert!(catalog.index(99).is_err());
    }

    #[test]
    fn test_snapshot_is_stable_across_commits() {
        let db = Database::in_memory("test");
        db.create_table(people());

        let before = db.snapshot();

        let mut shared = db.shared.write();
        let row = TableRow::new(
            1000,
            10,
            [(100, Value::integer(1)), (101, Value::text("ann"))]
                .into_iter()
                .collect(),
        );
        let table = shared.catalog.tables.get_mut(&10).unwrap();
        Arc::make_mut(table).rows.insert(1000, row);
        drop(shared);

        // The earlier snapshot still sees the empty table
        assert!(before.table(10).unwrap().rows.is_empty());
        assert_eq!(db.snapshot().table(10).unwrap().rows.len(), 1);
    }

    #[test]
    fn test_file_lock_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        let first = Database::open(&path, "locked").unwrap();
        assert!(matches!(
            Database::open(&path, "locked"),
            Err(Error::DatabaseLocked)
        ));
        drop(first);

        // Released on drop
        assert!(Database::open(&path, "locked").is_ok());
    }

    #[test]
    fn test_create_index_detects_existing_duplicates() {
        let db = Database::in_memory("test");
        db.create_table(people());

        let mut shared = db.shared.write();
        for (defpos, id) in [(1000, 5), (1001, 5)] {
            let row = TableRow::new(defpos, 10, [(100, Value::integer(id))].into_iter().collect());
            let table = shared.catalog.tables.get_mut(&10).unwrap();
            Arc::make_mut(table).rows.insert(defpos, row);
        }
        drop(shared);

        let idx = Index::new(1, "people_pk", 10, ConstraintKind::PrimaryKey, vec![100]).unwrap();
        let err = db.create_index(idx).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
        // Failed build leaves the catalog untouched
        assert!(db.snapshot().index(1).is_err());
    }
}
