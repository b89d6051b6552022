//! Core type definitions for Marl
//!
//! Defining positions, data types, constraint kinds, and the replay
//! configuration shared across the schema layer.

use std::fmt;

/// A position in the physical log, doubling as the durable id of every
/// database object (tables, columns, indexes, rows). Positions are assigned
/// monotonically by the log writer and never reused.
pub type Pos = i64;

/// Sentinel for "no position" (unset object references)
pub const NO_POS: Pos = -1;

/// SQL data types supported by the schema layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DataType {
    /// NULL data type, used for unknown/unspecified types
    #[default]
    Null = 0,

    /// 64-bit signed integer
    Integer = 1,

    /// 64-bit floating point number
    Float = 2,

    /// UTF-8 text string
    Text = 3,

    /// Boolean true/false
    Boolean = 4,

    /// Timestamp with timezone (stored as UTC)
    Timestamp = 5,
}

impl DataType {
    /// Returns true if this type is numeric (INTEGER or FLOAT)
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }

    /// Returns the type ID as u8 for serialization
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Create DataType from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DataType::Null),
            1 => Some(DataType::Integer),
            2 => Some(DataType::Float),
            3 => Some(DataType::Text),
            4 => Some(DataType::Boolean),
            5 => Some(DataType::Timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Null => write!(f, "NULL"),
            DataType::Integer => write!(f, "INTEGER"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::Text => write!(f, "TEXT"),
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
        }
    }
}

/// The constraint an index enforces or supports
///
/// Exactly one kind applies to any index; there is no flag combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConstraintKind {
    /// Plain secondary index, no constraint
    #[default]
    None = 0,

    /// Primary key: unique, drives row lookup and the fast build path
    PrimaryKey = 1,

    /// Unique constraint
    Unique = 2,

    /// Foreign key: entries must match the referenced index
    ForeignKey = 3,

    /// System-time temporal versioning (start-of-validity keyed)
    SystemTemporal = 4,

    /// Application-time temporal versioning
    ApplicationTemporal = 5,
}

impl ConstraintKind {
    /// Returns true if the index carries a uniqueness obligation
    pub fn is_unique(&self) -> bool {
        matches!(self, ConstraintKind::PrimaryKey | ConstraintKind::Unique)
    }

    /// Returns true for the temporal versioning kinds
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            ConstraintKind::SystemTemporal | ConstraintKind::ApplicationTemporal
        )
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::None => write!(f, "NONE"),
            ConstraintKind::PrimaryKey => write!(f, "PRIMARY KEY"),
            ConstraintKind::Unique => write!(f, "UNIQUE"),
            ConstraintKind::ForeignKey => write!(f, "FOREIGN KEY"),
            ConstraintKind::SystemTemporal => write!(f, "SYSTEM VERSIONING"),
            ConstraintKind::ApplicationTemporal => write!(f, "APPLICATION VERSIONING"),
        }
    }
}

/// Outcome of asking an index how it depends on an object being dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependence {
    /// The index must be dropped along with the object (its table or a key column)
    Drop,

    /// The drop must be refused (the object is this index's foreign-key target)
    Restrict,

    /// The index is unaffected
    None,
}

/// Security classification level carried by rows
///
/// Ordered from least to most restricted. `D` is the unclassified default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Level {
    #[default]
    D = 0,
    C = 1,
    B = 2,
    A = 3,
}

/// Policy for log entries that fail to parse during a full replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayPolicy {
    /// Stop the replay and surface a log-read error (default)
    #[default]
    Fail,

    /// Log a warning, skip the entry, and continue.
    ///
    /// This accepts losing one entry over failing the whole scan. It is an
    /// explicit opt-in, never assumed.
    SkipCorrupt,
}

/// Configuration for log replay
#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    /// How to treat entries that fail to parse
    /// Default: Fail
    pub on_corrupt_entry: ReplayPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_roundtrip() {
        for t in [
            DataType::Null,
            DataType::Integer,
            DataType::Float,
            DataType::Text,
            DataType::Boolean,
            DataType::Timestamp,
        ] {
            assert_eq!(DataType::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(DataType::from_u8(99), None);
    }

    #[test]
    fn test_constraint_kind_predicates() {
        assert!(ConstraintKind::PrimaryKey.is_unique());
        assert!(ConstraintKind::Unique.is_unique());
        assert!(!ConstraintKind::ForeignKey.is_unique());
        assert!(ConstraintKind::SystemTemporal.is_temporal());
        assert!(!ConstraintKind::None.is_temporal());
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::D < Level::C);
        assert!(Level::C < Level::B);
        assert!(Level::B < Level::A);
    }

    #[test]
    fn test_replay_policy_default() {
        assert_eq!(ReplayConfig::default().on_corrupt_entry, ReplayPolicy::Fail);
    }
}
