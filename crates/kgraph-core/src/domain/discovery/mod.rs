//! Meta-path discovery
//!
//! Offline mining of predicate sequences that reveal indirect structure,
//! plus periodic re-validation that retires patterns once the graph has
//! grown direct shortcuts for them.

mod candidate;
mod discoverer;

pub use candidate::{
    CandidateEvaluation, DiscoveryConfig, Verdict, generate_candidates, passes_fanout,
    qualifying_predicates,
};
pub use discoverer::{DiscoveryReport, PatternDiscoverer, ValidationReport};
