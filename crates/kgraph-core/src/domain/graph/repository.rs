//! Repository trait for triple store persistence
//!
//! This module defines the storage contract for an agent's graph: entity
//! registration, triple upserts, batched exchange writes, co-occurrence
//! bookkeeping, pattern lifecycle, and the traversal primitives that the
//! searcher and discovery pipeline build on. Every operation is scoped to an
//! agent id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::cooccurrence::CoOccurrence;
use super::entity::{Entity, EntityType};
use super::pattern::{MetaPath, PathTemplate};
use super::triple::{Predicate, Provenance, Triple, TripleInput};

/// Storage contract for a per-agent knowledge graph
#[async_trait]
pub trait TripleStore: Send + Sync {
    // ========== Entity Operations ==========

    /// Register a mention of an entity
    ///
    /// Creates the row if absent, otherwise bumps `mention_count` and
    /// `last_seen`. Returns `None` when the name is unusable.
    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        agent_id: &str,
    ) -> Result<Option<String>>;

    /// Get an entity by id
    async fn get_entity(&self, id: &str, agent_id: &str) -> Result<Option<Entity>>;

    /// Get an entity by surface name (normalized before lookup)
    async fn find_entity(&self, name: &str, agent_id: &str) -> Result<Option<Entity>>;

    /// Most recently seen entities, newest first
    async fn recent_entities(&self, agent_id: &str, limit: usize) -> Result<Vec<Entity>>;

    /// Entities whose id starts with a normalized prefix
    async fn entities_with_prefix(
        &self,
        prefix: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Entity>>;

    /// Record extra surface forms for an entity
    async fn add_aliases(&self, entity_id: &str, aliases: &[String], agent_id: &str)
    -> Result<()>;

    /// Merge `merge_id` into `keep_id`, returning the number of triples rewritten
    async fn merge_entities(&self, keep_id: &str, merge_id: &str, agent_id: &str) -> Result<u64>;

    // ========== Triple Operations ==========

    /// Insert a triple or raise the confidence of the existing one
    ///
    /// Returns the triple id, or `None` when the input is malformed.
    async fn add_triple(
        &self,
        triple: &TripleInput,
        provenance: &Provenance,
        agent_id: &str,
    ) -> Result<Option<String>>;

    /// Atomically write one exchange worth of entities, triples and co-occurrences
    async fn write_exchange(&self, exchange: &ExchangeWrite) -> Result<Vec<String>>;

    /// Triples touching an entity, most recently updated first
    async fn get_triples_for(
        &self,
        entity_name: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Triple>>;

    /// Halve the confidence of triples untouched for `half_life_days`
    async fn decay_stale_triples(&self, agent_id: &str, half_life_days: u32) -> Result<u64>;

    /// Entities referenced by triples flagged `pending_resolution`
    async fn pending_entities(&self, agent_id: &str) -> Result<Vec<PendingEntity>>;

    /// Clear the pending flag on every triple touching an entity
    async fn clear_pending(&self, entity_id: &str, agent_id: &str) -> Result<u64>;

    /// Whether any single triple connects the two entities, in either direction
    async fn has_direct_edge(&self, a: &str, b: &str, agent_id: &str) -> Result<bool>;

    // ========== Co-occurrence Operations ==========

    /// Strongest co-occurrence partners of an entity
    async fn cooccurrences_for(
        &self,
        entity_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<CoOccurrence>>;

    /// Count for a single pair (0 when never seen together)
    async fn cooccurrence_count(&self, a: &str, b: &str, agent_id: &str) -> Result<u64>;

    // ========== Pattern Operations ==========

    /// Active patterns for an agent
    async fn get_active_patterns(&self, agent_id: &str) -> Result<Vec<MetaPath>>;

    /// All patterns, optionally including retired ones
    async fn list_patterns(&self, agent_id: &str, include_inactive: bool)
    -> Result<Vec<MetaPath>>;

    /// Insert static patterns whose sequence is not yet stored; returns how many were added
    async fn seed_static_patterns(&self, patterns: &[MetaPath]) -> Result<u64>;

    /// Insert or update a pattern keyed by (agent, predicate sequence)
    async fn save_pattern(&self, pattern: &MetaPath) -> Result<()>;

    /// Retire a pattern; returns false when it was not active
    async fn deactivate_pattern(&self, template: &PathTemplate, agent_id: &str) -> Result<bool>;

    // ========== Traversal Operations ==========

    /// Recursive, cycle-free walk outward from seed entities
    async fn traverse(
        &self,
        seeds: &[String],
        agent_id: &str,
        params: &TraversalParams,
    ) -> Result<Vec<TraversalPath>>;

    /// Chained join through an exact predicate sequence
    ///
    /// When `start_ids` is given, paths must begin at one of those entities.
    async fn match_template(
        &self,
        template: &PathTemplate,
        agent_id: &str,
        start_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<TemplateMatch>>;

    // ========== Maintenance Bookkeeping ==========

    /// When a maintenance task last completed for an agent
    async fn last_maintenance(&self, agent_id: &str, task: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record completion of a maintenance task
    async fn record_maintenance(&self, agent_id: &str, task: &str, at: DateTime<Utc>)
    -> Result<()>;

    // ========== Statistics ==========

    /// Per-predicate usage statistics
    async fn get_predicate_stats(&self, agent_id: &str) -> Result<Vec<PredicateStats>>;

    /// Overall graph counts
    async fn get_stats(&self, agent_id: &str) -> Result<GraphStats>;
}

/// Entity mention as handed over by extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityInput {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: Option<String>,
}

impl EntityInput {
    /// Create an input entity
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            name: name.into(),
            entity_type: Some(entity_type.as_str().to_string()),
        }
    }

    /// Resolved entity type, `Thing` when missing or unknown
    pub fn resolved_type(&self) -> EntityType {
        self.entity_type
            .as_deref()
            .map(EntityType::parse_or_thing)
            .unwrap_or(EntityType::Thing)
    }
}

/// One exchange worth of extracted facts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeWrite {
    pub agent_id: String,
    pub source_exchange_id: String,
    #[serde(default)]
    pub source_date: Option<String>,
    #[serde(default)]
    pub entities: Vec<EntityInput>,
    #[serde(default)]
    pub triples: Vec<TripleInput>,
    #[serde(default)]
    pub co_occurrences: Vec<(String, String)>,
    /// (entity id, surface form) pairs recorded with the exchange
    #[serde(default)]
    pub aliases: Vec<(String, String)>,
}

impl ExchangeWrite {
    /// Start an empty exchange for an agent
    pub fn new(agent_id: impl Into<String>, source_exchange_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            source_exchange_id: source_exchange_id.into(),
            ..Default::default()
        }
    }

    /// Set the exchange date
    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.source_date = Some(date.into());
        self
    }

    /// Add an entity mention
    pub fn entity(mut self, name: impl Into<String>, entity_type: EntityType) -> Self {
        self.entities.push(EntityInput::new(name, entity_type));
        self
    }

    /// Add a triple
    pub fn triple(mut self, triple: TripleInput) -> Self {
        self.triples.push(triple);
        self
    }

    /// Add a co-occurrence pair
    pub fn co_occurrence(mut self, a: impl Into<String>, b: impl Into<String>) -> Self {
        self.co_occurrences.push((a.into(), b.into()));
        self
    }

    /// Record a surface form as an alias of an existing entity
    pub fn alias(mut self, entity_id: impl Into<String>, alias: impl Into<String>) -> Self {
        self.aliases.push((entity_id.into(), alias.into()));
        self
    }

    /// Provenance shared by every triple in the exchange
    pub fn provenance(&self) -> Provenance {
        Provenance::exchange(&self.source_exchange_id, self.source_date.clone())
    }
}

/// Aggregate usage of a predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateStats {
    pub predicate: Predicate,
    pub count: u64,
    pub unique_subjects: u64,
    pub unique_objects: u64,
    pub avg_confidence: f64,
}

impl PredicateStats {
    /// Average triples per distinct subject
    pub fn fanout(&self) -> f64 {
        if self.unique_subjects == 0 {
            return 0.0;
        }
        self.count as f64 / self.unique_subjects as f64
    }
}

/// Limits for a recursive walk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraversalParams {
    /// Maximum number of hops
    pub max_depth: u32,
    /// Score multiplier per hop
    pub hop_decay: f64,
    /// Minimum confidence for triples traversed beyond the first hop
    pub min_confidence: f64,
    /// Hard cap on returned rows
    pub max_rows: usize,
}

impl Default for TraversalParams {
    fn default() -> Self {
        Self {
            max_depth: 2,
            hop_decay: 0.7,
            min_confidence: 0.6,
            max_rows: 5000,
        }
    }
}

/// One step of a recursive walk, identified by the path that reached it
#[derive(Debug, Clone, PartialEq)]
pub struct TraversalPath {
    /// Entity ids from seed to the newly reached entity
    pub entities: Vec<String>,
    /// Number of hops taken
    pub depth: u32,
    /// Cumulative decayed score
    pub score: f64,
    /// Exchange of the last traversed triple
    pub exchange_id: Option<String>,
    /// Confidence of the last traversed triple
    pub confidence: f64,
}

impl TraversalPath {
    /// Entity reached by this path
    pub fn endpoint(&self) -> Option<&str> {
        self.entities.last().map(String::as_str)
    }
}

/// One chained-join result for a path template
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMatch {
    /// Entity ids visited, `len() == template.len() + 1`
    pub entities: Vec<String>,
    /// Confidence of each traversed triple
    pub confidences: Vec<f64>,
    /// Last update of each traversed triple
    pub updated_at: Vec<DateTime<Utc>>,
    /// Source exchange of each traversed triple
    pub exchange_ids: Vec<Option<String>>,
}

impl TemplateMatch {
    /// First entity of the path
    pub fn start(&self) -> &str {
        self.entities.first().map(String::as_str).unwrap_or_default()
    }

    /// Last entity of the path
    pub fn end(&self) -> &str {
        self.entities.last().map(String::as_str).unwrap_or_default()
    }

    /// Product of traversed confidences
    pub fn path_confidence(&self) -> f64 {
        self.confidences.iter().product()
    }
}

/// An entity with triples awaiting resolution
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntity {
    pub entity_id: String,
    /// Creation time of the oldest pending triple touching the entity
    pub oldest_pending: DateTime<Utc>,
    pub pending_triples: u64,
}

/// Overall counts for an agent's graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_entities: u64,
    pub total_triples: u64,
    pub pending_triples: u64,
    pub total_cooccurrences: u64,
    pub active_patterns: u64,
    pub average_confidence: f64,
}
