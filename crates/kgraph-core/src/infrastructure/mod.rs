//! Infrastructure layer
//!
//! Concrete implementations of the domain repository traits.

pub mod graph;
