//! Error types for Marl
//!
//! One crate-wide error enum covers both hard failures and the expected,
//! recoverable verdicts produced by constraint checks and commit-time
//! conflict validation. Callers branch on the conflict variants; they are
//! ordinary results, not panics.

use thiserror::Error;

use super::types::Pos;

/// Result type alias for Marl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for schema-layer and transaction operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // =========================================================================
    // Constraint violations (raised inside a live transaction)
    // =========================================================================
    /// Uniqueness constraint violated by an insert or update
    #[error("duplicate key {key} for index '{index}' on table '{table}'")]
    DuplicateKey {
        table: String,
        index: String,
        key: String,
    },

    /// Referenced key not found in the foreign-key target index
    #[error("missing foreign key {key}: no match in referenced table '{ref_table}'")]
    MissingForeignKey { ref_table: String, key: String },

    /// A foreign-key check was given a null or incomplete key tuple
    #[error("malformed key for index at {index}: null or incomplete column values")]
    MalformedKey { index: Pos },

    // =========================================================================
    // Conflict verdicts (commit-time validation)
    // =========================================================================
    /// A read-tracked column was modified by a concurrently committed change
    #[error("read-write conflict: column {column} of table {table} was modified concurrently")]
    ReadWriteConflict { table: Pos, column: Pos },

    /// A specifically-tracked row/key was touched, or an insert collides
    /// with a previously-read key
    #[error("concurrent change touched a read key of table {table} (index {index})")]
    ConcurrentKeyConflict { table: Pos, index: Pos },

    /// Any write touched a blocked (coarse-grained) object
    #[error("concurrent write to read-blocked object {table}")]
    ObjectWriteConflict { table: Pos },

    /// A table or column the transaction depends on was dropped or altered
    #[error("schema invalidated: object {object} was dropped or altered concurrently")]
    SchemaInvalidated { object: Pos },

    /// Two pending/committed physical changes collide on the same row
    #[error("write-write conflict on row {defpos} of table {table}")]
    WriteWriteConflict { table: Pos, defpos: Pos },

    // =========================================================================
    // Catalog errors
    // =========================================================================
    /// Table not found in the catalog snapshot
    #[error("table {0} not found")]
    TableNotFound(Pos),

    /// Index not found in the catalog snapshot
    #[error("index {0} not found")]
    IndexNotFound(Pos),

    /// Column not part of a row or key descriptor
    #[error("column {0} not found")]
    ColumnNotFound(Pos),

    // =========================================================================
    // Transaction errors
    // =========================================================================
    /// Transaction has already ended (committed or rolled back)
    #[error("transaction already ended")]
    TransactionEnded,

    /// Database is locked by another process
    #[error("database is locked by another process")]
    DatabaseLocked,

    // =========================================================================
    // Storage errors
    // =========================================================================
    /// Underlying physical log corruption or I/O failure
    #[error("log read error at position {pos}: {message}")]
    LogRead { pos: Pos, message: String },

    /// IO error (wrapped)
    #[error("IO error: {message}")]
    Io { message: String },

    /// Internal error for unexpected conditions
    #[error("{message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new DuplicateKey error
    pub fn duplicate_key(
        table: impl Into<String>,
        index: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Error::DuplicateKey {
            table: table.into(),
            index: index.into(),
            key: key.into(),
        }
    }

    /// Create a new MissingForeignKey error
    pub fn missing_foreign_key(ref_table: impl Into<String>, key: impl Into<String>) -> Self {
        Error::MissingForeignKey {
            ref_table: ref_table.into(),
            key: key.into(),
        }
    }

    /// Create a new LogRead error
    pub fn log_read(pos: Pos, message: impl Into<String>) -> Self {
        Error::LogRead {
            pos,
            message: message.into(),
        }
    }

    /// Create a new Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Check if this is a constraint violation (insert/update rejected)
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Error::DuplicateKey { .. }
                | Error::MissingForeignKey { .. }
                | Error::MalformedKey { .. }
        )
    }

    /// Check if this is a commit-time conflict verdict
    ///
    /// Conflict verdicts abort the transaction but leave the database
    /// untouched; clients may retry the whole transaction.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::ReadWriteConflict { .. }
                | Error::ConcurrentKeyConflict { .. }
                | Error::ObjectWriteConflict { .. }
                | Error::SchemaInvalidated { .. }
                | Error::WriteWriteConflict { .. }
        )
    }

    /// Check if this is a "not found" type error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::TableNotFound(_) | Error::IndexNotFound(_) | Error::ColumnNotFound(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
        }
    }
}
