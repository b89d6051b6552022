//! Core types and definitions for Marl
//!
//! This module contains the fundamental types used throughout the schema
//! layer:
//!
//! - [`DataType`] - SQL data types of key and row values
//! - [`Value`] / [`IndexKey`] - runtime values and composite index keys
//! - [`TableRow`] - immutable versioned row snapshots
//! - [`ConstraintKind`] - the constraint an index enforces
//! - [`Error`] - error and conflict-verdict types

pub mod error;
pub mod row;
pub mod types;
pub mod value;

pub use error::{Error, Result};
pub use row::TableRow;
pub use types::{
    ConstraintKind, DataType, Dependence, Level, Pos, ReplayConfig, ReplayPolicy, NO_POS,
};
pub use value::{IndexKey, Value};
