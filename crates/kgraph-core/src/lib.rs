//! kgraph Core Library
//!
//! A per-agent conversational knowledge graph:
//! - Triple store (SQLite, one database per agent)
//! - Entity resolution with tiered confidence (exact, assume, ask, defer)
//! - Graph search (single-hop, multi-hop, meta-path templates)
//! - Meta-path pattern discovery and validation
//! - Maintenance scheduling, enrichment queue and last-result channel

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::application::{IngestReport, KnowledgeGraphService, MaintenanceTask};
    pub use crate::config::GraphConfig;
    pub use crate::domain::graph::{EntityType, ExchangeWrite, TripleInput, TripleStore};
    pub use crate::domain::resolution::{Resolution, ResolutionTier};
    pub use crate::domain::search::{SearchQuery, SearchResponse};
    pub use crate::error::{Error, Result};
}
