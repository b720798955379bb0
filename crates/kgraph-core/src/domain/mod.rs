//! Domain layer
//!
//! Graph model, entity resolution, search and pattern discovery.

pub mod discovery;
pub mod graph;
pub mod resolution;
pub mod search;
