//! Storage traits and implementations
//!
//! This module defines the relational sink that entity syncs write into.
//! The trait-based design allows swapping between in-memory and SQLite
//! storage implementations.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::RowSink;
