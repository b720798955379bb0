//! Knowledge graph service
//!
//! The host-facing API for one store: ingest, query, entity context,
//! resolution and maintenance. Components share the store through an `Arc`;
//! the store itself serializes writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GraphConfig;
use crate::domain::discovery::{DiscoveryReport, PatternDiscoverer, ValidationReport};
use crate::domain::graph::{ExchangeWrite, GraphStats, MetaPath, TripleStore, normalize_name};
use crate::domain::resolution::{EntityResolver, PendingReport, Resolution, ResolutionTier};
use crate::domain::search::{EntityContext, GraphSearcher, SearchQuery, SearchResponse};
use crate::error::{Error, Result};
use crate::infrastructure::graph::SqliteTripleStore;
use crate::storage::{AgentDatabases, Database};

use super::channel::QueryResultChannel;
use super::enrichment::{Enricher, EnrichmentJob, EnrichmentQueue, EnrichmentReport};
use super::schedule::{MaintenanceReport, MaintenanceSchedule, MaintenanceTask};

/// Outcome of ingesting one exchange
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub agent_id: String,
    pub source_exchange_id: String,
    /// Ids of every triple written or reinforced
    pub triple_ids: Vec<String>,
    /// Resolution outcome per batch entity
    pub resolutions: Vec<Resolution>,
    /// Disambiguation notes for `ask` mentions
    pub hints: Vec<String>,
    /// Triples written with `pending_resolution`
    pub pending_triples: usize,
}

impl IngestReport {
    fn new(agent_id: &str, source_exchange_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            source_exchange_id: source_exchange_id.to_string(),
            ..Default::default()
        }
    }

    /// Mentions rewritten onto an existing entity
    pub fn rewritten(&self) -> usize {
        self.resolutions.iter().filter(|r| r.is_rewrite()).count()
    }
}

/// Mention rewrites decided while resolving a batch
#[derive(Default)]
struct BatchResolution {
    /// Mention id -> canonical entity id
    rewrites: HashMap<String, String>,
    /// Mention ids whose triples must be flagged pending
    pending: HashSet<String>,
    /// (canonical entity id, surface form) written with the exchange
    aliases: Vec<(String, String)>,
}

impl BatchResolution {
    fn rewrite(&self, name: &str) -> Option<&String> {
        normalize_name(name).and_then(|id| self.rewrites.get(&id))
    }

    fn is_pending(&self, name: &str) -> bool {
        normalize_name(name).is_some_and(|id| self.pending.contains(&id))
    }
}

/// Knowledge graph service for one store
pub struct KnowledgeGraphService<R: TripleStore> {
    repository: Arc<R>,
    config: GraphConfig,
    resolver: EntityResolver<R>,
    searcher: GraphSearcher<R>,
    discoverer: PatternDiscoverer<R>,
    schedule: MaintenanceSchedule<R>,
    channel: Arc<QueryResultChannel>,
    enrichment: EnrichmentQueue,
    /// Agents whose static patterns are already seeded
    seeded: Mutex<HashSet<String>>,
}

impl KnowledgeGraphService<SqliteTripleStore> {
    /// Open the service over an agent's database
    pub async fn open(
        databases: &AgentDatabases,
        agent_id: &str,
        config: GraphConfig,
    ) -> anyhow::Result<Self> {
        let db = databases.open(agent_id).await?;
        Ok(Self::new(
            Arc::new(SqliteTripleStore::from_database(&db)),
            config,
        ))
    }

    /// Service over a fresh in-memory store
    pub async fn in_memory(config: GraphConfig) -> anyhow::Result<Self> {
        let db = Database::in_memory().await?;
        Ok(Self::new(
            Arc::new(SqliteTripleStore::from_database(&db)),
            config,
        ))
    }
}

impl<R: TripleStore> KnowledgeGraphService<R> {
    /// Create a new service
    pub fn new(repository: Arc<R>, config: GraphConfig) -> Self {
        Self {
            resolver: EntityResolver::new(repository.clone(), config.resolver.clone()),
            searcher: GraphSearcher::new(repository.clone(), config.search.clone()),
            discoverer: PatternDiscoverer::new(repository.clone(), config.discovery.clone()),
            schedule: MaintenanceSchedule::new(repository.clone(), &config.maintenance),
            channel: Arc::new(QueryResultChannel::default()),
            enrichment: EnrichmentQueue::new(config.enrichment.queue_capacity),
            seeded: Mutex::new(HashSet::new()),
            repository,
            config,
        }
    }

    /// Publish search results to a shared channel
    pub fn with_channel(mut self, channel: Arc<QueryResultChannel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Channel holding the latest search response per agent
    pub fn channel(&self) -> Arc<QueryResultChannel> {
        self.channel.clone()
    }

    /// Seed the configured static patterns once per agent
    pub async fn ensure_patterns(&self, agent_id: &str) -> Result<u64> {
        let mut seeded = self.seeded.lock().await;
        if seeded.contains(agent_id) {
            return Ok(0);
        }

        let seeds = self.config.patterns.seeds(agent_id)?;
        let added = self.repository.seed_static_patterns(&seeds).await?;
        seeded.insert(agent_id.to_string());
        if added > 0 {
            debug!(agent_id = %agent_id, added = added, "Static patterns seeded");
        }
        Ok(added)
    }

    // ========== Ingest ==========

    /// Write one exchange worth of extracted facts
    ///
    /// With `resolve_on_ingest`, batch entities are resolved first: `assume`
    /// mentions are rewritten onto the matched entity and kept as aliases,
    /// `ask` and `defer` mentions have their triples flagged pending.
    pub async fn ingest(&self, mut write: ExchangeWrite) -> Result<IngestReport> {
        if write.agent_id.trim().is_empty() {
            return Err(Error::InvalidInput("agentId is required".to_string()));
        }
        if write.source_exchange_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "sourceExchangeId is required".to_string(),
            ));
        }
        self.ensure_patterns(&write.agent_id).await?;

        let mut report = IngestReport::new(&write.agent_id, &write.source_exchange_id);
        let batch = if self.config.resolver.resolve_on_ingest {
            self.resolve_batch(&mut write, &mut report).await?
        } else {
            BatchResolution::default()
        };

        for triple in write.triples.iter_mut() {
            let mut pending = false;
            for endpoint in [&mut triple.subject, &mut triple.object] {
                if let Some(target) = batch.rewrite(endpoint) {
                    *endpoint = target.clone();
                } else if batch.is_pending(endpoint) {
                    pending = true;
                }
            }
            if pending {
                triple.pending_resolution = true;
            }
            if triple.pending_resolution {
                report.pending_triples += 1;
            }
        }
        for (a, b) in write.co_occurrences.iter_mut() {
            for name in [a, b] {
                if let Some(target) = batch.rewrite(name) {
                    *name = target.clone();
                }
            }
        }

        write.aliases.extend(batch.aliases);
        report.triple_ids = self.repository.write_exchange(&write).await?;

        info!(
            agent_id = %write.agent_id,
            exchange = %write.source_exchange_id,
            triples = report.triple_ids.len(),
            rewritten = report.rewritten(),
            pending = report.pending_triples,
            "Exchange ingested"
        );
        Ok(report)
    }

    async fn resolve_batch(
        &self,
        write: &mut ExchangeWrite,
        report: &mut IngestReport,
    ) -> Result<BatchResolution> {
        let mut batch = BatchResolution::default();
        let names: Vec<String> = write.entities.iter().map(|e| e.name.clone()).collect();

        for entity in write.entities.iter_mut() {
            let context: Vec<String> = names
                .iter()
                .filter(|n| **n != entity.name)
                .cloned()
                .collect();
            let resolution = self
                .resolver
                .resolve(&entity.name, &write.agent_id, &context)
                .await?;

            if let Some(mention_id) = normalize_name(&entity.name) {
                match resolution.tier {
                    ResolutionTier::Assume => {
                        if let Some(target) = &resolution.entity_id {
                            batch.rewrites.insert(mention_id, target.clone());
                            batch
                                .aliases
                                .push((target.clone(), entity.name.clone()));
                            entity.name = target.clone();
                        }
                    }
                    ResolutionTier::Ask | ResolutionTier::Defer => {
                        batch.pending.insert(mention_id);
                        if let Some(note) = &resolution.note {
                            report.hints.push(note.clone());
                        }
                    }
                    ResolutionTier::Exact | ResolutionTier::New => {}
                }
            }
            report.resolutions.push(resolution);
        }
        Ok(batch)
    }

    // ========== Query ==========

    /// Rank exchanges for a set of seed entities and publish the result
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        self.ensure_patterns(&query.agent_id).await?;
        let response = self.searcher.search(query).await?;
        self.channel.publish(response.clone()).await;
        Ok(response)
    }

    /// Search using the registered entities mentioned in free text
    pub async fn search_text(
        &self,
        text: &str,
        agent_id: &str,
        limit: Option<usize>,
    ) -> Result<SearchResponse> {
        self.ensure_patterns(agent_id).await?;
        let response = self.searcher.search_text(text, agent_id, limit).await?;
        self.channel.publish(response.clone()).await;
        Ok(response)
    }

    /// Latest published search response for an agent
    pub async fn last_result(&self, agent_id: &str) -> Option<SearchResponse> {
        self.channel.last_result(agent_id).await
    }

    /// Entity record with grouped relationships; `None` when unknown
    pub async fn entity_context(
        &self,
        entity_name: &str,
        agent_id: &str,
    ) -> Result<Option<EntityContext>> {
        self.searcher.get_entity_context(entity_name, agent_id).await
    }

    pub async fn stats(&self, agent_id: &str) -> Result<GraphStats> {
        self.repository.get_stats(agent_id).await
    }

    pub async fn list_patterns(
        &self,
        agent_id: &str,
        include_inactive: bool,
    ) -> Result<Vec<MetaPath>> {
        self.ensure_patterns(agent_id).await?;
        self.repository.list_patterns(agent_id, include_inactive).await
    }

    // ========== Resolution ==========

    pub async fn resolve(
        &self,
        mention: &str,
        agent_id: &str,
        context: &[String],
    ) -> Result<Resolution> {
        self.resolver.resolve(mention, agent_id, context).await
    }

    /// Merge `merge_id` into `keep_id`
    pub async fn merge_entities(&self, keep_id: &str, merge_id: &str, agent_id: &str) -> Result<u64> {
        self.resolver.merge_entities(keep_id, merge_id, agent_id).await
    }

    pub async fn process_pending(&self, agent_id: &str) -> Result<PendingReport> {
        self.resolver.process_pending(agent_id).await
    }

    // ========== Maintenance ==========

    /// Halve confidence of triples untouched for the configured half-life
    pub async fn decay(&self, agent_id: &str) -> Result<u64> {
        self.repository
            .decay_stale_triples(agent_id, self.config.maintenance.half_life_days)
            .await
    }

    pub async fn discover_patterns(
        &self,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryReport> {
        self.ensure_patterns(agent_id).await?;
        self.discoverer.discover(agent_id, cancel).await
    }

    pub async fn validate_patterns(
        &self,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidationReport> {
        self.discoverer.validate_patterns(agent_id, cancel).await
    }

    /// Run every maintenance task that is due
    pub async fn run_maintenance(
        &self,
        agent_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<MaintenanceReport> {
        self.run_tasks(agent_id, MaintenanceTask::all(), force, cancel)
            .await
    }

    /// Run selected maintenance tasks, skipping those that ran too recently
    ///
    /// `force` bypasses the interval gate. A cancelled discovery or
    /// validation is not recorded as run.
    pub async fn run_tasks(
        &self,
        agent_id: &str,
        tasks: &[MaintenanceTask],
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::new(agent_id);

        for &task in tasks {
            if cancel.is_cancelled() {
                break;
            }
            if !force && !self.schedule.is_due(agent_id, task, Utc::now()).await? {
                report.skipped.push(task);
                continue;
            }

            let completed = match task {
                MaintenanceTask::Decay => {
                    report.decayed = Some(self.decay(agent_id).await?);
                    true
                }
                MaintenanceTask::Pending => {
                    report.pending = Some(self.process_pending(agent_id).await?);
                    true
                }
                MaintenanceTask::Discovery => {
                    let discovery = self.discover_patterns(agent_id, cancel).await?;
                    let completed = !discovery.cancelled;
                    report.discovery = Some(discovery);
                    completed
                }
                MaintenanceTask::Validation => {
                    let validation = self.validate_patterns(agent_id, cancel).await?;
                    let completed = !validation.cancelled;
                    report.validation = Some(validation);
                    completed
                }
            };

            if completed {
                self.schedule.mark_run(agent_id, task, Utc::now()).await?;
            }
        }

        info!(
            agent_id = %agent_id,
            decayed = ?report.decayed,
            skipped = report.skipped.len(),
            "Maintenance pass finished"
        );
        Ok(report)
    }

    // ========== Enrichment ==========

    /// Queue an exchange for deep extraction; false when the queue is full
    pub fn enqueue_enrichment(&self, job: EnrichmentJob) -> bool {
        self.enrichment.enqueue(job)
    }

    /// Jobs waiting for the next tick
    pub fn pending_enrichment(&self) -> usize {
        self.enrichment.len()
    }

    /// Drain up to `max_jobs` queued jobs through an enricher into ingest
    ///
    /// Failed jobs are logged and counted; they are not re-queued.
    pub async fn tick_enrichment(
        &self,
        enricher: &dyn Enricher,
        max_jobs: Option<usize>,
    ) -> Result<EnrichmentReport> {
        let max_jobs = max_jobs.unwrap_or(self.config.enrichment.max_jobs_per_tick);
        let mut report = EnrichmentReport::default();

        for job in self.enrichment.drain(max_jobs).await {
            report.processed += 1;

            let mut write = match enricher.enrich(&job).await {
                Ok(write) => write,
                Err(e) => {
                    warn!(exchange = %job.source_exchange_id, error = %e, "Enrichment failed");
                    report.failed += 1;
                    continue;
                }
            };
            write.agent_id = job.agent_id.clone();
            write.source_exchange_id = job.source_exchange_id.clone();
            if write.source_date.is_none() {
                write.source_date = job.source_date.clone();
            }

            match self.ingest(write).await {
                Ok(ingested) => report.triples_written += ingested.triple_ids.len(),
                Err(e) => {
                    warn!(exchange = %job.source_exchange_id, error = %e, "Enrichment ingest failed");
                    report.failed += 1;
                }
            }
        }

        report.remaining = self.enrichment.len();
        debug!(
            processed = report.processed,
            failed = report.failed,
            remaining = report.remaining,
            "Enrichment tick"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::domain::graph::{EntityType, TripleInput};

    async fn service() -> KnowledgeGraphService<SqliteTripleStore> {
        KnowledgeGraphService::in_memory(GraphConfig::default())
            .await
            .expect("Failed to create service")
    }

    fn scenario(agent: &str) -> Vec<ExchangeWrite> {
        vec![
            ExchangeWrite::new(agent, "ex-1")
                .entity("Chris", EntityType::Person)
                .entity("Dashboard", EntityType::Thing)
                .triple(TripleInput::new("Chris", "created", "Dashboard").with_confidence(0.9)),
            ExchangeWrite::new(agent, "ex-2")
                .entity("Chris", EntityType::Person)
                .entity("Dan", EntityType::Person)
                .triple(TripleInput::new("Chris", "knows", "Dan").with_confidence(0.9)),
            ExchangeWrite::new(agent, "ex-3")
                .entity("Dan", EntityType::Person)
                .entity("Dashboard", EntityType::Thing)
                .triple(TripleInput::new("Dan", "works_on", "Dashboard").with_confidence(0.8)),
        ]
    }

    #[tokio::test]
    async fn test_ingest_requires_agent_and_exchange() {
        let service = service().await;
        let err = service.ingest(ExchangeWrite::new("", "ex-1")).await.unwrap_err();
        assert_eq!(err.code(), "E100");
        let err = service.ingest(ExchangeWrite::new("main", " ")).await.unwrap_err();
        assert_eq!(err.code(), "E100");
    }

    #[tokio::test]
    async fn test_search_surfaces_two_hop_exchange_and_publishes() {
        let service = service().await;
        for write in scenario("main") {
            service.ingest(write).await.unwrap();
        }

        let mut receiver = service.channel().subscribe();
        let response = service
            .search(&SearchQuery::new("main", ["chris"]))
            .await
            .unwrap();

        let hit = response.hit("ex-3").expect("ex-3 reachable through dan");
        assert!((hit.score - 0.882).abs() < 1e-6);

        let published = receiver.recv().await.unwrap();
        assert_eq!(published.agent_id, "main");
        assert_eq!(service.last_result("main").await, Some(response));
    }

    #[tokio::test]
    async fn test_static_patterns_seeded_once() {
        let service = service().await;
        let first = service.ensure_patterns("main").await.unwrap();
        assert_eq!(first as usize, service.config().patterns.static_patterns.len());
        assert_eq!(service.ensure_patterns("main").await.unwrap(), 0);

        let patterns = service.list_patterns("main", false).await.unwrap();
        assert!(patterns.iter().all(|p| p.is_static()));
    }

    #[tokio::test]
    async fn test_ingest_rewrites_assumed_mention() {
        let service = service().await;
        for i in 0..3 {
            let write = ExchangeWrite::new("main", format!("seed-{i}"))
                .entity("Bob Martinez", EntityType::Person)
                .entity("Billing", EntityType::Thing)
                .co_occurrence("Bob Martinez", "Billing");
            service.ingest(write).await.unwrap();
        }

        let write = ExchangeWrite::new("main", "ex-bob")
            .entity("Bob", EntityType::Person)
            .entity("Billing", EntityType::Thing)
            .triple(TripleInput::new("Bob", "works_on", "Billing"));
        let report = service.ingest(write).await.unwrap();

        assert_eq!(report.rewritten(), 1);
        assert_eq!(report.pending_triples, 0);

        let context = service
            .entity_context("bob_martinez", "main")
            .await
            .unwrap()
            .unwrap();
        assert!(context.entity.aliases.iter().any(|a| a == "Bob"));
        assert_eq!(context.relationships["works_on"][0].subject, "bob_martinez");

        assert!(service.repository().get_entity("bob", "main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ingest_flags_ambiguous_mentions_pending() {
        let service = service().await;
        for name in ["Dan Smith", "Dana Lopez"] {
            let write = ExchangeWrite::new("main", format!("seed-{name}"))
                .entity(name, EntityType::Person);
            service.ingest(write).await.unwrap();
        }

        let write = ExchangeWrite::new("main", "ex-dan")
            .entity("Dan", EntityType::Person)
            .entity("Roadmap", EntityType::Thing)
            .triple(TripleInput::new("Dan", "works_on", "Roadmap"));
        let report = service.ingest(write).await.unwrap();

        assert_eq!(report.pending_triples, 1);
        assert_eq!(report.hints.len(), 1);
        assert!(report.hints[0].contains("\"Dan\""));
        assert_eq!(service.stats("main").await.unwrap().pending_triples, 1);
    }

    #[tokio::test]
    async fn test_run_maintenance_respects_gate() {
        let service = service().await;
        for write in scenario("main") {
            service.ingest(write).await.unwrap();
        }
        let cancel = CancellationToken::new();

        let first = service.run_maintenance("main", false, &cancel).await.unwrap();
        assert!(first.skipped.is_empty());
        assert_eq!(first.decayed, Some(0));
        assert!(first.discovery.is_some());

        let second = service.run_maintenance("main", false, &cancel).await.unwrap();
        assert_eq!(second.skipped.len(), MaintenanceTask::all().len());
        assert!(!second.ran_anything());

        let forced = service
            .run_tasks("main", &[MaintenanceTask::Decay], true, &cancel)
            .await
            .unwrap();
        assert_eq!(forced.decayed, Some(0));
        assert!(forced.discovery.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_maintenance_runs_nothing() {
        let service = service().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = service.run_maintenance("main", true, &cancel).await.unwrap();
        assert!(!report.ran_anything());
    }

    struct FixedEnricher;

    #[async_trait]
    impl Enricher for FixedEnricher {
        async fn enrich(&self, job: &EnrichmentJob) -> Result<ExchangeWrite> {
            if job.text.is_empty() {
                return Err(Error::Other("nothing to enrich".to_string()));
            }
            Ok(ExchangeWrite::new("ignored", "ignored")
                .entity("Chris", EntityType::Person)
                .entity("Dan", EntityType::Person)
                .triple(TripleInput::new("Chris", "knows", "Dan")))
        }
    }

    #[tokio::test]
    async fn test_tick_enrichment_feeds_ingest() {
        let service = service().await;
        assert!(service.enqueue_enrichment(EnrichmentJob::new("main", "ex-1", "Chris knows Dan")));
        assert!(service.enqueue_enrichment(EnrichmentJob::new("main", "ex-2", "")));
        assert!(service.enqueue_enrichment(EnrichmentJob::new("main", "ex-3", "again")));

        let report = service.tick_enrichment(&FixedEnricher, Some(2)).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.triples_written, 1);
        assert_eq!(report.remaining, 1);

        let triples = service
            .repository()
            .get_triples_for("chris", "main", 10)
            .await
            .unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(
            triples[0].provenance.source_exchange_id.as_deref(),
            Some("ex-1")
        );
    }
}
