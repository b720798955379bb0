//! Conversational entity resolution
//!
//! Maps a mention onto the agent's existing entities using a tiered policy:
//! exact id match, then scored candidates from a shrunk-prefix lookup and a
//! substring scan over recently seen entities. Scores combine recency,
//! co-occurrence with the other entities of the exchange, and how well
//! established the candidate is.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::graph::{Entity, TripleStore, normalize_name};
use crate::error::{Error, Result};

use super::tier::{
    Candidate, MAX_ASK_CANDIDATES, Resolution, ResolutionTier, disambiguation_note,
};

/// Tolerance for threshold comparisons on summed scores
const SCORE_EPSILON: f64 = 1e-9;

/// Share of the mention kept for the prefix lookup
const PREFIX_RATIO: f64 = 0.6;

/// Shortest prefix used for the prefix lookup
const MIN_PREFIX_LEN: usize = 3;

/// Maximum candidates taken from the prefix lookup
const PREFIX_CANDIDATES: usize = 20;

/// Mention-count ratio at which the top candidate dominates
const DOMINANCE_RATIO: u64 = 5;

/// Confidence assigned when a dominant candidate is assumed
const DOMINANT_CONFIDENCE: f64 = 0.85;

/// Resolver thresholds and windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Single-candidate score at or above which the candidate is assumed
    pub assume_threshold: f64,
    /// Single-candidate score below which the user is asked
    pub ask_threshold: f64,
    /// Short recency window in days
    pub recency_days: u32,
    /// Longer recency window in days
    pub stale_days: u32,
    /// Co-occurrence count that earns the full bonus
    pub min_cooccurrence: u64,
    /// Recently seen entities scanned for substring matches
    pub recent_window: usize,
    /// Days a pending triple may wait before it expires
    pub max_pending_days: u32,
    /// Resolve batch entities when ingesting
    pub resolve_on_ingest: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            assume_threshold: 0.8,
            ask_threshold: 0.4,
            recency_days: 7,
            stale_days: 30,
            min_cooccurrence: 2,
            recent_window: 200,
            max_pending_days: 30,
            resolve_on_ingest: true,
        }
    }
}

impl ResolverConfig {
    /// Tier for a single candidate's score
    pub fn tier_for(&self, score: f64) -> ResolutionTier {
        if score + SCORE_EPSILON >= self.assume_threshold {
            ResolutionTier::Assume
        } else if score + SCORE_EPSILON < self.ask_threshold {
            ResolutionTier::Ask
        } else {
            ResolutionTier::Defer
        }
    }

    /// Score a candidate given its co-occurrence with the exchange's other entities
    pub fn score(&self, entity: &Entity, cooccurrence: u64, now: DateTime<Utc>) -> f64 {
        let days = entity.days_since_seen(now);
        let mut score: f64 = 0.5;

        if days <= f64::from(self.recency_days) {
            score += 0.3;
        } else if days <= f64::from(self.stale_days) {
            score += 0.1;
        }

        if cooccurrence >= self.min_cooccurrence {
            score += 0.2;
        } else if cooccurrence > 0 {
            score += 0.1;
        }

        if entity.mention_count > 10 {
            score += 0.1;
        } else if entity.mention_count > 3 {
            score += 0.05;
        }

        score.min(1.0)
    }

    /// Prefix used for candidate lookup
    pub fn shrunk_prefix(id: &str) -> &str {
        let len = id.chars().count();
        let keep = ((len as f64 * PREFIX_RATIO).ceil() as usize)
            .max(MIN_PREFIX_LEN)
            .min(len);
        match id.char_indices().nth(keep) {
            Some((idx, _)) => &id[..idx],
            None => id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.assume_threshold) || !in_unit(self.ask_threshold) {
            return Err(Error::ConfigError(
                "resolver thresholds must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.ask_threshold > self.assume_threshold {
            return Err(Error::ConfigError(
                "resolver.ask_threshold must not exceed resolver.assume_threshold".to_string(),
            ));
        }
        if self.recency_days > self.stale_days {
            return Err(Error::ConfigError(
                "resolver.recency_days must not exceed resolver.stale_days".to_string(),
            ));
        }
        if self.recent_window == 0 {
            return Err(Error::ConfigError(
                "resolver.recent_window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a pending-resolution sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReport {
    /// Entities reinforced since their triples were flagged
    pub resolved: u64,
    /// Entities whose pending window ran out
    pub expired: u64,
    /// Entities still awaiting resolution
    pub remaining: u64,
}

/// Entity resolver over a triple store
pub struct EntityResolver<R: TripleStore> {
    repository: Arc<R>,
    config: ResolverConfig,
}

impl<R: TripleStore> EntityResolver<R> {
    /// Create a resolver
    pub fn new(repository: Arc<R>, config: ResolverConfig) -> Self {
        Self { repository, config }
    }

    /// Resolver configuration
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve a mention in the context of the exchange's other entity names
    pub async fn resolve(
        &self,
        mention: &str,
        agent_id: &str,
        context: &[String],
    ) -> Result<Resolution> {
        let Some(id) = normalize_name(mention) else {
            debug!(mention = %mention, "Unusable mention");
            return Ok(Resolution::new_entity(mention, None));
        };

        if self.repository.get_entity(&id, agent_id).await?.is_some() {
            return Ok(Resolution::exact(mention, id));
        }

        let candidates = self.gather_candidates(&id, agent_id).await?;
        if candidates.is_empty() {
            return Ok(Resolution::new_entity(mention, Some(id)));
        }

        let context_ids: Vec<String> = context
            .iter()
            .filter_map(|c| normalize_name(c))
            .filter(|c| *c != id)
            .collect();

        let now = Utc::now();
        let mut scored = Vec::with_capacity(candidates.len());
        for entity in candidates {
            let mut cooccurrence = 0;
            for other in context_ids.iter().filter(|c| **c != entity.id) {
                cooccurrence += self
                    .repository
                    .cooccurrence_count(&entity.id, other, agent_id)
                    .await?;
            }
            scored.push(Candidate {
                score: self.config.score(&entity, cooccurrence, now),
                entity_id: entity.id,
                canonical_name: entity.canonical_name,
                mention_count: entity.mention_count,
                last_seen: entity.last_seen,
            });
        }
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.mention_count.cmp(&a.mention_count))
                .then(a.entity_id.cmp(&b.entity_id))
        });

        let resolution = if scored.len() == 1 {
            self.decide_single(mention, id, scored)
        } else {
            self.decide_multiple(mention, id, scored, now)
        };

        debug!(
            mention = %mention,
            tier = %resolution.tier,
            entity_id = ?resolution.entity_id,
            confidence = resolution.confidence,
            "Mention resolved"
        );
        Ok(resolution)
    }

    fn decide_single(&self, mention: &str, id: String, candidates: Vec<Candidate>) -> Resolution {
        let best = &candidates[0];
        let tier = self.config.tier_for(best.score);
        let (entity_id, note) = match tier {
            ResolutionTier::Assume => (best.entity_id.clone(), None),
            ResolutionTier::Ask => (id, Some(disambiguation_note(mention, &candidates))),
            _ => (id, None),
        };

        Resolution {
            mention: mention.to_string(),
            tier,
            entity_id: Some(entity_id),
            confidence: best.score,
            candidates,
            note,
        }
    }

    fn decide_multiple(
        &self,
        mention: &str,
        id: String,
        mut candidates: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> Resolution {
        let mut by_mentions: Vec<&Candidate> = candidates.iter().collect();
        by_mentions.sort_by(|a, b| b.mention_count.cmp(&a.mention_count));
        let (top, runner_up) = (by_mentions[0], by_mentions[1]);

        let recent = now - top.last_seen <= Duration::days(i64::from(self.config.recency_days));
        if top.mention_count > runner_up.mention_count.saturating_mul(DOMINANCE_RATIO) && recent {
            return Resolution {
                mention: mention.to_string(),
                tier: ResolutionTier::Assume,
                entity_id: Some(top.entity_id.clone()),
                confidence: DOMINANT_CONFIDENCE,
                candidates,
                note: None,
            };
        }

        candidates.truncate(MAX_ASK_CANDIDATES);
        Resolution {
            mention: mention.to_string(),
            tier: ResolutionTier::Ask,
            entity_id: Some(id),
            confidence: candidates[0].score,
            note: Some(disambiguation_note(mention, &candidates)),
            candidates,
        }
    }

    /// Shrunk-prefix matches plus substring matches among recent entities
    async fn gather_candidates(&self, id: &str, agent_id: &str) -> Result<Vec<Entity>> {
        let prefix = ResolverConfig::shrunk_prefix(id);
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for entity in self
            .repository
            .entities_with_prefix(prefix, agent_id, PREFIX_CANDIDATES)
            .await?
        {
            if entity.id != id && seen.insert(entity.id.clone()) {
                candidates.push(entity);
            }
        }

        for entity in self
            .repository
            .recent_entities(agent_id, self.config.recent_window)
            .await?
        {
            if entity.id == id || seen.contains(&entity.id) {
                continue;
            }
            let matches = entity.id.contains(id)
                || entity
                    .aliases
                    .iter()
                    .filter_map(|a| normalize_name(a))
                    .any(|a| a.contains(id));
            if matches {
                seen.insert(entity.id.clone());
                candidates.push(entity);
            }
        }

        Ok(candidates)
    }

    /// Merge `merge_id` into `keep_id`
    pub async fn merge_entities(&self, keep_id: &str, merge_id: &str, agent_id: &str) -> Result<u64> {
        self.repository.merge_entities(keep_id, merge_id, agent_id).await
    }

    /// Batch-resolve triples flagged `pending_resolution`
    pub async fn process_pending(&self, agent_id: &str) -> Result<PendingReport> {
        let now = Utc::now();
        let max_age = Duration::days(i64::from(self.config.max_pending_days));
        let mut report = PendingReport::default();

        for pending in self.repository.pending_entities(agent_id).await? {
            let entity = self.repository.get_entity(&pending.entity_id, agent_id).await?;
            let reinforced = entity
                .as_ref()
                .is_some_and(|e| e.last_seen > pending.oldest_pending);
            let expired = now - pending.oldest_pending > max_age;

            if !reinforced && !expired {
                continue;
            }

            // Already cleared through the other endpoint of a shared triple
            if self.repository.clear_pending(&pending.entity_id, agent_id).await? == 0 {
                continue;
            }
            if reinforced {
                report.resolved += 1;
            } else {
                report.expired += 1;
            }
        }

        report.remaining = self.repository.pending_entities(agent_id).await?.len() as u64;

        info!(
            agent_id = %agent_id,
            resolved = report.resolved,
            expired = report.expired,
            remaining = report.remaining,
            "Pending resolutions processed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{EntityType, ExchangeWrite, TripleInput};
    use crate::infrastructure::graph::SqliteTripleStore;
    use crate::storage::Database;

    async fn setup() -> (Arc<SqliteTripleStore>, EntityResolver<SqliteTripleStore>) {
        let db = Database::in_memory().await.expect("Failed to create database");
        let store = Arc::new(SqliteTripleStore::from_database(&db));
        let resolver = EntityResolver::new(store.clone(), ResolverConfig::default());
        (store, resolver)
    }

    async fn set_entity(store: &SqliteTripleStore, id: &str, days_ago: i64, mentions: i64) {
        let seen = (Utc::now() - Duration::days(days_ago))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        sqlx::query("UPDATE entities SET last_seen = ?, mention_count = ? WHERE id = ?")
            .bind(seen)
            .bind(mentions)
            .bind(id)
            .execute(store.pool())
            .await
            .unwrap();
    }

    fn entity(days_ago: i64, mentions: u64) -> Entity {
        let mut e = Entity::new("Bob Martinez", EntityType::Person, "main").unwrap();
        e.last_seen = Utc::now() - Duration::days(days_ago);
        e.mention_count = mentions;
        e
    }

    #[test]
    fn test_tier_boundaries() {
        let config = ResolverConfig::default();
        assert_eq!(config.tier_for(0.8), ResolutionTier::Assume);
        assert_eq!(config.tier_for(0.5 + 0.3), ResolutionTier::Assume);
        assert_eq!(config.tier_for(0.79), ResolutionTier::Defer);
        assert_eq!(config.tier_for(0.6), ResolutionTier::Defer);
        assert_eq!(config.tier_for(0.4), ResolutionTier::Defer);
        assert_eq!(config.tier_for(0.3999), ResolutionTier::Ask);
    }

    #[test]
    fn test_candidate_scoring() {
        let config = ResolverConfig::default();
        let now = Utc::now();

        assert!((config.score(&entity(1, 1), 0, now) - 0.8).abs() < 1e-9);
        assert!((config.score(&entity(20, 1), 0, now) - 0.6).abs() < 1e-9);
        assert!((config.score(&entity(90, 1), 0, now) - 0.5).abs() < 1e-9);
        assert!((config.score(&entity(90, 1), 1, now) - 0.6).abs() < 1e-9);
        assert!((config.score(&entity(90, 4), 2, now) - 0.75).abs() < 1e-9);
        assert!((config.score(&entity(90, 11), 0, now) - 0.6).abs() < 1e-9);
        assert_eq!(config.score(&entity(1, 50), 9, now), 1.0);
    }

    #[test]
    fn test_shrunk_prefix() {
        assert_eq!(ResolverConfig::shrunk_prefix("bob"), "bob");
        assert_eq!(ResolverConfig::shrunk_prefix("al"), "al");
        assert_eq!(ResolverConfig::shrunk_prefix("roberto"), "rober");
        assert_eq!(ResolverConfig::shrunk_prefix("bob_martinez"), "bob_mart");
    }

    #[test]
    fn test_config_validation() {
        assert!(ResolverConfig::default().validate().is_ok());
        let inverted = ResolverConfig {
            ask_threshold: 0.9,
            ..Default::default()
        };
        assert_eq!(inverted.validate().unwrap_err().code(), "E600");
    }

    #[tokio::test]
    async fn test_exact_and_new() {
        let (store, resolver) = setup().await;
        store.upsert_entity("Chris", EntityType::Person, "main").await.unwrap();

        let exact = resolver.resolve("CHRIS", "main", &[]).await.unwrap();
        assert_eq!(exact.tier, ResolutionTier::Exact);
        assert_eq!(exact.confidence, 1.0);
        assert_eq!(exact.entity_id.as_deref(), Some("chris"));

        let new = resolver.resolve("Zelda", "main", &[]).await.unwrap();
        assert_eq!(new.tier, ResolutionTier::New);
        assert_eq!(new.entity_id.as_deref(), Some("zelda"));

        let junk = resolver.resolve("!!", "main", &[]).await.unwrap();
        assert_eq!(junk.tier, ResolutionTier::New);
        assert!(junk.entity_id.is_none());
    }

    #[tokio::test]
    async fn test_single_recent_candidate_is_assumed() {
        let (store, resolver) = setup().await;
        store.upsert_entity("Bob Martinez", EntityType::Person, "main").await.unwrap();

        let resolution = resolver.resolve("Bob", "main", &[]).await.unwrap();
        assert_eq!(resolution.tier, ResolutionTier::Assume);
        assert_eq!(resolution.entity_id.as_deref(), Some("bob_martinez"));
        assert!(resolution.is_rewrite());
    }

    #[tokio::test]
    async fn test_single_middling_candidate_is_deferred() {
        let (store, resolver) = setup().await;
        store.upsert_entity("Bob Martinez", EntityType::Person, "main").await.unwrap();
        set_entity(&store, "bob_martinez", 20, 1).await;

        let resolution = resolver.resolve("Martinez", "main", &[]).await.unwrap();
        assert_eq!(resolution.tier, ResolutionTier::Defer);
        assert_eq!(resolution.entity_id.as_deref(), Some("martinez"));
        assert_eq!(resolution.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_cooccurrence_lifts_candidate() {
        let (store, resolver) = setup().await;
        let write = ExchangeWrite::new("main", "ex-1")
            .entity("Bob Martinez", EntityType::Person)
            .entity("Dashboard", EntityType::Thing)
            .co_occurrence("Bob Martinez", "Dashboard");
        store.write_exchange(&write).await.unwrap();
        store.write_exchange(&write).await.unwrap();
        set_entity(&store, "bob_martinez", 20, 2).await;

        let without = resolver.resolve("bob", "main", &[]).await.unwrap();
        assert_eq!(without.tier, ResolutionTier::Defer);

        let with = resolver
            .resolve("bob", "main", &["dashboard".to_string()])
            .await
            .unwrap();
        assert_eq!(with.tier, ResolutionTier::Assume);
        assert!((with.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_multiple_candidates_ask_unless_dominant() {
        let (store, resolver) = setup().await;
        store.upsert_entity("Bob Martinez", EntityType::Person, "main").await.unwrap();
        store.upsert_entity("Bob Stone", EntityType::Person, "main").await.unwrap();

        let ambiguous = resolver.resolve("bob", "main", &[]).await.unwrap();
        assert_eq!(ambiguous.tier, ResolutionTier::Ask);
        assert_eq!(ambiguous.candidates.len(), 2);
        assert!(ambiguous.note.as_deref().unwrap().contains("Which \"bob\""));

        set_entity(&store, "bob_martinez", 1, 30).await;
        set_entity(&store, "bob_stone", 1, 2).await;
        let dominant = resolver.resolve("bob", "main", &[]).await.unwrap();
        assert_eq!(dominant.tier, ResolutionTier::Assume);
        assert_eq!(dominant.confidence, DOMINANT_CONFIDENCE);
        assert_eq!(dominant.entity_id.as_deref(), Some("bob_martinez"));

        // Dominant but stale is still ambiguous
        set_entity(&store, "bob_martinez", 60, 30).await;
        let stale = resolver.resolve("bob", "main", &[]).await.unwrap();
        assert_eq!(stale.tier, ResolutionTier::Ask);
    }

    #[tokio::test]
    async fn test_substring_match_on_alias() {
        let (store, resolver) = setup().await;
        store.upsert_entity("Robert Martinez", EntityType::Person, "main").await.unwrap();
        store
            .add_aliases("robert_martinez", &["Big Bobby".to_string()], "main")
            .await
            .unwrap();

        let resolution = resolver.resolve("bobby", "main", &[]).await.unwrap();
        assert_eq!(resolution.candidates.len(), 1);
        assert_eq!(resolution.candidates[0].entity_id, "robert_martinez");
    }

    #[tokio::test]
    async fn test_process_pending() {
        let (store, resolver) = setup().await;
        let write = ExchangeWrite::new("main", "ex-1")
            .triple(TripleInput::new("chris", "knows", "dana").pending())
            .triple(TripleInput::new("eve", "uses", "vim").pending())
            .triple(TripleInput::new("zed", "uses", "emacs").pending());
        store.write_exchange(&write).await.unwrap();

        // eve/vim: flagged long ago and never reinforced
        let old = (Utc::now() - Duration::days(45)).to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        sqlx::query("UPDATE triples SET created_at = ? WHERE subject = 'eve'")
            .bind(&old)
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE entities SET last_seen = ? WHERE id IN ('eve', 'vim')")
            .bind(&old)
            .execute(store.pool())
            .await
            .unwrap();

        // dana: mentioned again after being flagged
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.upsert_entity("Dana", EntityType::Person, "main").await.unwrap();

        let report = resolver.process_pending("main").await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.expired, 1);
        // zed and emacs are neither reinforced nor expired
        assert_eq!(report.remaining, 2);

        let stats = store.get_stats("main").await.unwrap();
        assert_eq!(stats.pending_triples, 1);
    }
}
