//! Database module: row models and SQL repositories.
//!
//! - `model`: row shapes returned by queries and their domain conversions.
//! - `repo`: SQL-only functions over a SQLite pool.
//!
//! The repository API is re-exported at `crate::db::*`.

pub mod model;
pub mod repo;

pub use repo::*;
