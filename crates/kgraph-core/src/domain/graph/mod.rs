//! Conversational knowledge graph model
//!
//! Per-agent entities and typed triples mined from conversation, plus the
//! co-occurrence index and meta-path patterns that drive retrieval.
//!
//! ## Data Model
//!
//! - **Entity**: a canonical node whose id is the normalized surface name
//! - **Triple**: a directed edge through one of twelve canonical predicates
//! - **CoOccurrence**: an order-normalized pair seen in the same exchange
//! - **MetaPath**: a 2-3 predicate sequence used as a traversal template
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kgraph_core::domain::graph::{EntityType, ExchangeWrite, TripleInput, TripleStore};
//!
//! let write = ExchangeWrite::new("main", "ex-42")
//!     .entity("Chris", EntityType::Person)
//!     .entity("Dan", EntityType::Person)
//!     .triple(TripleInput::new("Chris", "knows", "Dan").with_confidence(0.9))
//!     .co_occurrence("Chris", "Dan");
//!
//! let triple_ids = store.write_exchange(&write).await?;
//! ```

mod cooccurrence;
mod entity;
mod pattern;
mod repository;
mod triple;

pub use cooccurrence::{CoOccurrence, ordered_pair};
pub use entity::{Entity, EntityType, ID_SEPARATOR, MAX_ID_LEN, MIN_ID_LEN, normalize_name};
pub use pattern::{MAX_PATTERN_LEN, MIN_PATTERN_LEN, MetaPath, PathTemplate, PatternType};
pub use repository::{
    EntityInput, ExchangeWrite, GraphStats, PendingEntity, PredicateStats, TemplateMatch,
    TraversalParams, TraversalPath, TripleStore,
};
pub use triple::{
    DEFAULT_CONFIDENCE, NormalizedTriple, Predicate, Provenance, Triple, TripleInput,
    clamp_confidence,
};
