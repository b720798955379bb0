//! Search queries, configuration and responses

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::graph::{CoOccurrence, Entity, Triple};
use crate::error::{Error, Result};

/// Traversal and ranking settings for graph search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Maximum hops; 1 or less selects single-hop expansion
    pub max_hops: u32,
    /// Score multiplier applied per hop
    pub hop_decay: f64,
    /// Minimum triple confidence past the first hop
    pub min_traversal_confidence: f64,
    /// Default number of exchanges returned
    pub limit: usize,
    /// Single-hop: minimum distinct entities an exchange must share
    pub min_shared_entities: usize,
    /// Single-hop: co-occurrence partners expanded per query entity
    pub cooccurrence_top_n: usize,
    /// Single-hop: score added per co-occurrence count
    pub cooccurrence_boost: f64,
    /// Triples read per entity
    pub triples_per_entity: usize,
    /// Row cap for recursive traversal and template matching
    pub max_traversal_rows: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_hops: 2,
            hop_decay: 0.7,
            min_traversal_confidence: 0.6,
            limit: 20,
            min_shared_entities: 1,
            cooccurrence_top_n: 5,
            cooccurrence_boost: 0.1,
            triples_per_entity: 100,
            max_traversal_rows: 5000,
        }
    }
}

impl SearchConfig {
    /// Create a config for single-hop expansion
    pub fn single_hop() -> Self {
        Self {
            max_hops: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.hop_decay > 0.0 && self.hop_decay <= 1.0) {
            return Err(Error::ConfigError(
                "search.hop_decay must be in (0.0, 1.0]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_traversal_confidence) {
            return Err(Error::ConfigError(
                "search.min_traversal_confidence must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.limit == 0 || self.max_traversal_rows == 0 || self.triples_per_entity == 0 {
            return Err(Error::ConfigError(
                "search limits must be positive".to_string(),
            ));
        }
        if self.cooccurrence_boost < 0.0 {
            return Err(Error::ConfigError(
                "search.cooccurrence_boost must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Query over an agent's graph, seeded by entity names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub agent_id: String,
    /// Query entity names (normalized before use)
    pub entities: Vec<String>,
    /// Override for the configured result limit
    #[serde(default)]
    pub limit: Option<usize>,
    /// Override for the configured hop count
    #[serde(default)]
    pub max_hops: Option<u32>,
}

impl SearchQuery {
    /// Create a query for an agent
    pub fn new<I, S>(agent_id: impl Into<String>, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_id: agent_id.into(),
            entities: entities.into_iter().map(Into::into).collect(),
            limit: None,
            max_hops: None,
        }
    }

    /// Set the result limit
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the hop count
    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = Some(max_hops);
        self
    }
}

/// A ranked source exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeHit {
    /// Source exchange id
    pub id: String,
    /// Merged score, `max(hop_score, meta_path_score)`
    pub score: f64,
    /// Query entities (or expansion partners) linked to the exchange
    pub shared_entities: Vec<String>,
    /// Highest triple confidence seen for the exchange
    pub max_confidence: f64,
    /// Single- or multi-hop contribution
    pub hop_score: f64,
    /// Best meta-path contribution
    pub meta_path_score: f64,
}

/// Ranked exchanges plus the entities used to find them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub agent_id: String,
    /// Normalized query entities
    pub entities: Vec<String>,
    pub exchanges: Vec<ExchangeHit>,
}

impl SearchResponse {
    /// Response for a query with no usable entities
    pub fn empty(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Exchange ids in rank order
    pub fn exchange_ids(&self) -> Vec<&str> {
        self.exchanges.iter().map(|e| e.id.as_str()).collect()
    }

    /// Look up a hit by exchange id
    pub fn hit(&self, exchange_id: &str) -> Option<&ExchangeHit> {
        self.exchanges.iter().find(|e| e.id == exchange_id)
    }
}

/// Everything known about one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityContext {
    pub entity: Entity,
    /// Triples touching the entity, keyed by predicate
    pub relationships: BTreeMap<String, Vec<Triple>>,
    pub cooccurrences: Vec<CoOccurrence>,
}

impl EntityContext {
    /// Number of triples across all predicates
    pub fn triple_count(&self) -> usize {
        self.relationships.values().map(Vec::len).sum()
    }
}
