//! Graph search over an agent's triples
//!
//! Ranks source exchanges for a set of query entities. Two traversal modes
//! are selected by hop count:
//!
//! - single-hop: direct triples plus a co-occurrence expansion
//! - multi-hop: a recursive, cycle-free walk with per-hop decay
//!
//! Active meta-path patterns are matched from the same seeds. Each exchange
//! keeps the better of its hop score and its meta-path score.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::graph::{TraversalParams, TripleStore, normalize_name};
use crate::error::Result;

use super::query::{EntityContext, ExchangeHit, SearchConfig, SearchQuery, SearchResponse};

/// Co-occurrence partners listed in an entity context
const CONTEXT_COOCCURRENCES: usize = 20;

/// Recently seen entities scanned when matching free text
const TEXT_SCAN_WINDOW: usize = 500;

/// Per-exchange accumulator for one scoring mode
#[derive(Debug, Default, Clone)]
struct ExchangeScore {
    score: f64,
    shared: BTreeSet<String>,
    max_confidence: f64,
}

impl ExchangeScore {
    fn add(&mut self, score: f64, entity: &str, confidence: f64) {
        self.score += score;
        self.shared.insert(entity.to_string());
        self.max_confidence = self.max_confidence.max(confidence);
    }

    fn raise(&mut self, score: f64, entity: &str, confidence: f64) {
        self.score = self.score.max(score);
        self.shared.insert(entity.to_string());
        self.max_confidence = self.max_confidence.max(confidence);
    }
}

type ScoreMap = HashMap<String, ExchangeScore>;

/// Searcher for exchange retrieval and entity context
pub struct GraphSearcher<R: TripleStore> {
    repository: Arc<R>,
    config: SearchConfig,
}

impl<R: TripleStore> GraphSearcher<R> {
    /// Create a searcher
    pub fn new(repository: Arc<R>, config: SearchConfig) -> Self {
        Self { repository, config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Rank exchanges related to the query entities
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        let agent_id = query.agent_id.as_str();
        let mut seeds: Vec<String> = Vec::new();
        for name in &query.entities {
            match normalize_name(name) {
                Some(id) if !seeds.contains(&id) => seeds.push(id),
                Some(_) => {}
                None => debug!(name = %name, "Skipping unusable query entity"),
            }
        }
        if seeds.is_empty() {
            return Ok(SearchResponse::empty(agent_id));
        }

        let max_hops = query.max_hops.unwrap_or(self.config.max_hops);
        let limit = query.limit.unwrap_or(self.config.limit);

        let hop_scores = if max_hops <= 1 {
            self.single_hop(&seeds, agent_id).await
        } else {
            self.multi_hop(&seeds, agent_id, max_hops).await
        };
        let hop_scores = hop_scores.unwrap_or_else(|e| {
            warn!(agent_id = %agent_id, error = %e, "Hop expansion failed; continuing without it");
            ScoreMap::new()
        });

        let meta_scores = self
            .meta_paths(&seeds, agent_id)
            .await
            .unwrap_or_else(|e| {
                warn!(agent_id = %agent_id, error = %e, "Meta-path matching failed; continuing without it");
                ScoreMap::new()
            });

        let mut exchanges = merge_scores(hop_scores, meta_scores);
        exchanges.truncate(limit);

        debug!(
            agent_id = %agent_id,
            seeds = seeds.len(),
            max_hops = max_hops,
            results = exchanges.len(),
            "Search complete"
        );

        Ok(SearchResponse {
            agent_id: agent_id.to_string(),
            entities: seeds,
            exchanges,
        })
    }

    /// Direct triples plus a co-occurrence boost
    async fn single_hop(&self, seeds: &[String], agent_id: &str) -> Result<ScoreMap> {
        let mut scores = ScoreMap::new();

        for seed in seeds {
            let triples = self
                .repository
                .get_triples_for(seed, agent_id, self.config.triples_per_entity)
                .await?;
            for triple in &triples {
                if let Some(exchange) = &triple.provenance.source_exchange_id {
                    scores
                        .entry(exchange.clone())
                        .or_default()
                        .add(triple.confidence, seed, triple.confidence);
                }
            }

            let partners = self
                .repository
                .cooccurrences_for(seed, agent_id, self.config.cooccurrence_top_n)
                .await?;
            for pair in &partners {
                let Some(partner) = pair.partner_of(seed) else {
                    continue;
                };
                let boost = self.config.cooccurrence_boost * pair.count as f64;
                let triples = self
                    .repository
                    .get_triples_for(partner, agent_id, self.config.triples_per_entity)
                    .await?;
                for triple in &triples {
                    if let Some(exchange) = &triple.provenance.source_exchange_id {
                        scores
                            .entry(exchange.clone())
                            .or_default()
                            .add(boost, partner, triple.confidence);
                    }
                }
            }
        }

        scores.retain(|_, s| s.shared.len() >= self.config.min_shared_entities);
        Ok(scores)
    }

    /// Recursive walk, summing path scores per exchange
    async fn multi_hop(&self, seeds: &[String], agent_id: &str, max_hops: u32) -> Result<ScoreMap> {
        let params = TraversalParams {
            max_depth: max_hops,
            hop_decay: self.config.hop_decay,
            min_confidence: self.config.min_traversal_confidence,
            max_rows: self.config.max_traversal_rows,
        };
        let paths = self.repository.traverse(seeds, agent_id, &params).await?;

        let mut scores = ScoreMap::new();
        for path in paths.iter().filter(|p| p.depth <= max_hops) {
            let (Some(exchange), Some(seed)) = (&path.exchange_id, path.entities.first()) else {
                continue;
            };
            scores
                .entry(exchange.clone())
                .or_default()
                .add(path.score, seed, path.confidence);
        }
        Ok(scores)
    }

    /// Best weighted template match per exchange
    async fn meta_paths(&self, seeds: &[String], agent_id: &str) -> Result<ScoreMap> {
        let patterns = self.repository.get_active_patterns(agent_id).await?;
        let mut scores = ScoreMap::new();

        for pattern in &patterns {
            let matches = self
                .repository
                .match_template(
                    &pattern.template,
                    agent_id,
                    Some(seeds),
                    self.config.max_traversal_rows,
                )
                .await?;

            for m in &matches {
                let score = m.path_confidence() * pattern.weight;
                let best = m.confidences.iter().copied().fold(0.0, f64::max);
                for exchange in m.exchange_ids.iter().flatten() {
                    scores
                        .entry(exchange.clone())
                        .or_default()
                        .raise(score, m.start(), best);
                }
            }
            debug!(pattern = %pattern.template, matches = matches.len(), "Meta-path matched");
        }
        Ok(scores)
    }

    /// Entity record, triples grouped by predicate, and co-occurrences
    pub async fn get_entity_context(
        &self,
        entity_name: &str,
        agent_id: &str,
    ) -> Result<Option<EntityContext>> {
        let Some(entity) = self.repository.find_entity(entity_name, agent_id).await? else {
            return Ok(None);
        };

        let triples = self
            .repository
            .get_triples_for(&entity.id, agent_id, self.config.triples_per_entity)
            .await?;
        let mut relationships: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for triple in triples {
            relationships
                .entry(triple.predicate.as_str().to_string())
                .or_default()
                .push(triple);
        }

        let cooccurrences = self
            .repository
            .cooccurrences_for(&entity.id, agent_id, CONTEXT_COOCCURRENCES)
            .await?;

        Ok(Some(EntityContext {
            entity,
            relationships,
            cooccurrences,
        }))
    }

    /// Registered entities whose name or alias appears in free text
    pub async fn entities_in_text(&self, text: &str, agent_id: &str) -> Result<Vec<String>> {
        let haystack = token_key(text);
        if haystack.len() <= 2 {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let mut seen = HashSet::new();
        for entity in self
            .repository
            .recent_entities(agent_id, TEXT_SCAN_WINDOW)
            .await?
        {
            let mentioned = std::iter::once(entity.canonical_name.as_str())
                .chain(entity.aliases.iter().map(String::as_str))
                .map(token_key)
                .any(|needle| needle.len() > 2 && haystack.contains(&needle));
            if mentioned && seen.insert(entity.id.clone()) {
                found.push(entity.id);
            }
        }
        Ok(found)
    }

    /// Search using the entities mentioned in free text
    pub async fn search_text(
        &self,
        text: &str,
        agent_id: &str,
        limit: Option<usize>,
    ) -> Result<SearchResponse> {
        let entities = self.entities_in_text(text, agent_id).await?;
        let mut query = SearchQuery::new(agent_id, entities);
        query.limit = limit;
        self.search(&query).await
    }
}

/// Lowercased word tokens wrapped as `_a_b_` for whole-word containment
fn token_key(text: &str) -> String {
    let tokens: Vec<String> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!("_{}_", tokens.join("_"))
}

/// Combine hop and meta-path scores, keeping the larger per exchange
fn merge_scores(hop: ScoreMap, meta: ScoreMap) -> Vec<ExchangeHit> {
    let mut merged: HashMap<String, ExchangeHit> = HashMap::new();

    for (id, s) in hop {
        merged.insert(
            id.clone(),
            ExchangeHit {
                id,
                score: s.score,
                shared_entities: s.shared.into_iter().collect(),
                max_confidence: s.max_confidence,
                hop_score: s.score,
                meta_path_score: 0.0,
            },
        );
    }

    for (id, s) in meta {
        let hit = merged.entry(id.clone()).or_insert_with(|| ExchangeHit {
            id,
            score: 0.0,
            shared_entities: Vec::new(),
            max_confidence: 0.0,
            hop_score: 0.0,
            meta_path_score: 0.0,
        });
        hit.meta_path_score = s.score;
        hit.score = hit.hop_score.max(s.score);
        hit.max_confidence = hit.max_confidence.max(s.max_confidence);
        for entity in s.shared {
            if !hit.shared_entities.contains(&entity) {
                hit.shared_entities.push(entity);
            }
        }
        hit.shared_entities.sort();
    }

    let mut hits: Vec<ExchangeHit> = merged.into_values().collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits
}
