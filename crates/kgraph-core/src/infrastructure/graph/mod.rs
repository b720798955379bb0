//! Triple store infrastructure
//!
//! SQLite implementation of the `TripleStore` trait, with the programmatic
//! query plans used for recursive traversal and meta-path matching.

mod path_query;
mod repository;
mod rows;

pub use repository::{DECAY_FLOOR, SqliteTripleStore};
