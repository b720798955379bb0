//! SQLite implementation of the TripleStore
//!
//! Every write takes the store's write lock and runs inside one SQLite
//! transaction, so readers never observe a half-applied exchange. Multi-hop
//! traversal is a recursive CTE; meta-path matching is a chained join built
//! per template length.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::graph::{
    CoOccurrence, Entity, EntityType, ExchangeWrite, GraphStats, MetaPath, NormalizedTriple,
    PathTemplate, PendingEntity, PredicateStats, Provenance, TemplateMatch, TraversalParams,
    TraversalPath, Triple, TripleInput, TripleStore, normalize_name, ordered_pair,
};
use crate::error::{Error, Result};
use crate::storage::Database;

use super::path_query::{template_sql, traversal_sql};
use super::rows::{
    CoOccurrenceRow, EntityRow, MetaPathRow, PendingRow, PredicateStatsRow, TraversalRow,
    TripleRow, from_db_time, to_db_time,
};

/// Confidence floor below which decay stops halving
pub const DECAY_FLOOR: f64 = 0.1;

/// SQLite implementation of the triple store
#[derive(Clone)]
pub struct SqliteTripleStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteTripleStore {
    /// Create a store over an already-migrated pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create a store over an opened database
    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }

    /// Underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TripleStore for SqliteTripleStore {
    // ========== Entity Operations ==========

    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        agent_id: &str,
    ) -> Result<Option<String>> {
        let Some(entity) = Entity::new(name, entity_type, agent_id) else {
            debug!(name = %name, "Skipping unusable entity name");
            return Ok(None);
        };

        let _guard = self.write_lock.lock().await;
        let now = to_db_time(Utc::now());
        let mut conn = self.pool.acquire().await?;
        upsert_entity_in(&mut conn, &entity, &now).await?;

        debug!(entity_id = %entity.id, agent_id = %agent_id, "Entity upserted");
        Ok(Some(entity.id))
    }

    async fn get_entity(&self, id: &str, agent_id: &str) -> Result<Option<Entity>> {
        let row: Option<EntityRow> =
            sqlx::query_as("SELECT * FROM entities WHERE agent_id = ? AND id = ?")
                .bind(agent_id)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| r.into_entity()).transpose()
    }

    async fn find_entity(&self, name: &str, agent_id: &str) -> Result<Option<Entity>> {
        let Some(id) = normalize_name(name) else {
            return Ok(None);
        };
        if let Some(entity) = self.get_entity(&id, agent_id).await? {
            return Ok(Some(entity));
        }

        let row: Option<EntityRow> = sqlx::query_as(
            r#"
            SELECT e.* FROM entities e
            WHERE e.agent_id = ?
                AND EXISTS (
                    SELECT 1 FROM json_each(e.aliases) a WHERE lower(a.value) = lower(?)
                )
            ORDER BY e.mention_count DESC
            LIMIT 1
            "#,
        )
        .bind(agent_id)
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_entity()).transpose()
    }

    async fn recent_entities(&self, agent_id: &str, limit: usize) -> Result<Vec<Entity>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            "SELECT * FROM entities WHERE agent_id = ? ORDER BY last_seen DESC, mention_count DESC LIMIT ?",
        )
        .bind(agent_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entity()).collect()
    }

    async fn entities_with_prefix(
        &self,
        prefix: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        if prefix.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<EntityRow> = sqlx::query_as(
            r#"
            SELECT * FROM entities
            WHERE agent_id = ?1 AND substr(id, 1, length(?2)) = ?2
            ORDER BY mention_count DESC, last_seen DESC
            LIMIT ?3
            "#,
        )
        .bind(agent_id)
        .bind(prefix)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entity()).collect()
    }

    async fn add_aliases(
        &self,
        entity_id: &str,
        aliases: &[String],
        agent_id: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut entity = self
            .get_entity(entity_id, agent_id)
            .await?
            .ok_or_else(|| Error::EntityNotFound(entity_id.to_string()))?;

        let added = aliases.iter().filter(|a| entity.add_alias(a)).count();
        if added == 0 {
            return Ok(());
        }

        sqlx::query("UPDATE entities SET aliases = ? WHERE agent_id = ? AND id = ?")
            .bind(serde_json::to_string(&entity.aliases)?)
            .bind(agent_id)
            .bind(entity_id)
            .execute(&self.pool)
            .await?;

        debug!(entity_id = %entity_id, added = added, "Aliases recorded");
        Ok(())
    }

    async fn merge_entities(&self, keep_id: &str, merge_id: &str, agent_id: &str) -> Result<u64> {
        let (Some(keep_id), Some(merge_id)) = (normalize_name(keep_id), normalize_name(merge_id))
        else {
            return Err(Error::InvalidInput(format!(
                "Cannot merge '{}' into '{}'",
                merge_id, keep_id
            )));
        };
        let (keep_id, merge_id) = (keep_id.as_str(), merge_id.as_str());
        if keep_id == merge_id {
            return Err(Error::InvalidInput(format!(
                "Cannot merge entity '{}' into itself",
                keep_id
            )));
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let rewritten = merge_in(&mut tx, keep_id, merge_id, agent_id).await?;
        tx.commit().await?;

        info!(
            keep_id = %keep_id,
            merge_id = %merge_id,
            agent_id = %agent_id,
            triples_rewritten = rewritten,
            "Entities merged"
        );
        Ok(rewritten)
    }

    // ========== Triple Operations ==========

    async fn add_triple(
        &self,
        triple: &TripleInput,
        provenance: &Provenance,
        agent_id: &str,
    ) -> Result<Option<String>> {
        let Some(normalized) = triple.normalized() else {
            debug!(
                subject = %triple.subject,
                predicate = %triple.predicate,
                object = %triple.object,
                "Skipping malformed triple"
            );
            return Ok(None);
        };

        let exchange = provenance.source_exchange_id.clone().unwrap_or_default();
        let _guard = self.write_lock.lock().await;
        let now = to_db_time(Utc::now());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::write_failed(&exchange, e))?;

        let id = match add_triple_in(&mut tx, triple, &normalized, provenance, agent_id, &now).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                return Err(Error::write_failed(&exchange, e));
            }
        };
        tx.commit()
            .await
            .map_err(|e| Error::write_failed(&exchange, e))?;

        debug!(triple_id = %id, agent_id = %agent_id, "Triple written");
        Ok(Some(id))
    }

    async fn write_exchange(&self, exchange: &ExchangeWrite) -> Result<Vec<String>> {
        if exchange.agent_id.trim().is_empty() {
            return Err(Error::InvalidInput("agent id must not be empty".to_string()));
        }

        let _guard = self.write_lock.lock().await;
        let now = to_db_time(Utc::now());
        let exchange_id = exchange.source_exchange_id.as_str();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::write_failed(exchange_id, e))?;

        let ids = match write_batch_in(&mut tx, exchange, &now).await {
            Ok(ids) => ids,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                warn!(exchange_id = %exchange_id, error = %e, "Exchange write aborted");
                return Err(Error::write_failed(exchange_id, e));
            }
        };

        tx.commit()
            .await
            .map_err(|e| Error::write_failed(exchange_id, e))?;

        info!(
            exchange_id = %exchange_id,
            agent_id = %exchange.agent_id,
            triples = ids.len(),
            "Exchange written"
        );
        Ok(ids)
    }

    async fn get_triples_for(
        &self,
        entity_name: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Triple>> {
        let Some(id) = normalize_name(entity_name) else {
            return Ok(Vec::new());
        };

        let rows: Vec<TripleRow> = sqlx::query_as(
            r#"
            SELECT * FROM triples
            WHERE agent_id = ?1 AND (subject = ?2 OR object = ?2)
            ORDER BY updated_at DESC, id
            LIMIT ?3
            "#,
        )
        .bind(agent_id)
        .bind(&id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_triple()).collect()
    }

    async fn decay_stale_triples(&self, agent_id: &str, half_life_days: u32) -> Result<u64> {
        let Some(cutoff) = Utc::now().checked_sub_signed(Duration::days(i64::from(half_life_days)))
        else {
            debug!(agent_id = %agent_id, half_life_days = half_life_days, "Half-life predates every timestamp");
            return Ok(0);
        };
        let cutoff = to_db_time(cutoff);
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE triples SET confidence = confidence * 0.5
            WHERE agent_id = ? AND updated_at < ? AND confidence > ?
            "#,
        )
        .bind(agent_id)
        .bind(&cutoff)
        .bind(DECAY_FLOOR)
        .execute(&self.pool)
        .await?;

        let decayed = result.rows_affected();
        info!(agent_id = %agent_id, decayed = decayed, half_life_days = half_life_days, "Stale triples decayed");
        Ok(decayed)
    }

    async fn pending_entities(&self, agent_id: &str) -> Result<Vec<PendingEntity>> {
        let rows: Vec<PendingRow> = sqlx::query_as(
            r#"
            SELECT entity_id, MIN(created_at) AS oldest_pending, COUNT(*) AS pending_triples
            FROM (
                SELECT subject AS entity_id, created_at FROM triples
                WHERE agent_id = ?1 AND pending_resolution = 1
                UNION ALL
                SELECT object AS entity_id, created_at FROM triples
                WHERE agent_id = ?1 AND pending_resolution = 1
            )
            GROUP BY entity_id
            ORDER BY oldest_pending, entity_id
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_pending()).collect())
    }

    async fn clear_pending(&self, entity_id: &str, agent_id: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE triples SET pending_resolution = 0
            WHERE agent_id = ?1 AND pending_resolution = 1 AND (subject = ?2 OR object = ?2)
            "#,
        )
        .bind(agent_id)
        .bind(entity_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn has_direct_edge(&self, a: &str, b: &str, agent_id: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM triples
                WHERE agent_id = ?1
                    AND ((subject = ?2 AND object = ?3) OR (subject = ?3 AND object = ?2))
            )
            "#,
        )
        .bind(agent_id)
        .bind(a)
        .bind(b)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    // ========== Co-occurrence Operations ==========

    async fn cooccurrences_for(
        &self,
        entity_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<CoOccurrence>> {
        let rows: Vec<CoOccurrenceRow> = sqlx::query_as(
            r#"
            SELECT entity_a, entity_b, count, last_seen FROM cooccurrences
            WHERE agent_id = ?1 AND (entity_a = ?2 OR entity_b = ?2)
            ORDER BY count DESC, last_seen DESC
            LIMIT ?3
            "#,
        )
        .bind(agent_id)
        .bind(entity_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_cooccurrence()).collect())
    }

    async fn cooccurrence_count(&self, a: &str, b: &str, agent_id: &str) -> Result<u64> {
        let Some((a, b)) = ordered_pair(a, b) else {
            return Ok(0);
        };

        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT count FROM cooccurrences WHERE agent_id = ? AND entity_a = ? AND entity_b = ?",
        )
        .bind(agent_id)
        .bind(&a)
        .bind(&b)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(c,)| c.max(0) as u64).unwrap_or(0))
    }

    // ========== Pattern Operations ==========

    async fn get_active_patterns(&self, agent_id: &str) -> Result<Vec<MetaPath>> {
        let rows: Vec<MetaPathRow> = sqlx::query_as(
            r#"
            SELECT * FROM meta_paths
            WHERE agent_id = ? AND active = 1
            ORDER BY pattern_type DESC, weight DESC, created_at
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_meta_path()).collect()
    }

    async fn list_patterns(
        &self,
        agent_id: &str,
        include_inactive: bool,
    ) -> Result<Vec<MetaPath>> {
        let rows: Vec<MetaPathRow> = sqlx::query_as(
            r#"
            SELECT * FROM meta_paths
            WHERE agent_id = ?1 AND (active = 1 OR ?2)
            ORDER BY active DESC, pattern_type DESC, weight DESC, created_at
            "#,
        )
        .bind(agent_id)
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_meta_path()).collect()
    }

    async fn seed_static_patterns(&self, patterns: &[MetaPath]) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut seeded = 0;

        for pattern in patterns {
            let result = sqlx::query(
                r#"
                INSERT INTO meta_paths (
                    id, agent_id, predicates, pattern_type, weight,
                    yield_score, overlap_ratio, active, last_validated, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(agent_id, predicates) DO NOTHING
                "#,
            )
            .bind(&pattern.id)
            .bind(&pattern.agent_id)
            .bind(pattern.template.key())
            .bind(pattern.pattern_type.as_str())
            .bind(pattern.weight)
            .bind(pattern.yield_score as i64)
            .bind(pattern.overlap_ratio)
            .bind(pattern.active)
            .bind(pattern.last_validated.map(to_db_time))
            .bind(to_db_time(pattern.created_at))
            .execute(&mut *tx)
            .await?;
            seeded += result.rows_affected();
        }

        tx.commit().await?;
        if seeded > 0 {
            info!(seeded = seeded, "Static patterns seeded");
        }
        Ok(seeded)
    }

    async fn save_pattern(&self, pattern: &MetaPath) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO meta_paths (
                id, agent_id, predicates, pattern_type, weight,
                yield_score, overlap_ratio, active, last_validated, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(agent_id, predicates) DO UPDATE SET
                weight = excluded.weight,
                yield_score = excluded.yield_score,
                overlap_ratio = excluded.overlap_ratio,
                active = excluded.active,
                last_validated = excluded.last_validated
            "#,
        )
        .bind(&pattern.id)
        .bind(&pattern.agent_id)
        .bind(pattern.template.key())
        .bind(pattern.pattern_type.as_str())
        .bind(pattern.weight)
        .bind(pattern.yield_score as i64)
        .bind(pattern.overlap_ratio)
        .bind(pattern.active)
        .bind(pattern.last_validated.map(to_db_time))
        .bind(to_db_time(pattern.created_at))
        .execute(&self.pool)
        .await?;

        debug!(pattern = %pattern.template, agent_id = %pattern.agent_id, "Pattern saved");
        Ok(())
    }

    async fn deactivate_pattern(&self, template: &PathTemplate, agent_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE meta_paths SET active = 0, last_validated = ?
            WHERE agent_id = ? AND predicates = ? AND active = 1
            "#,
        )
        .bind(to_db_time(Utc::now()))
        .bind(agent_id)
        .bind(template.key())
        .execute(&self.pool)
        .await?;

        let deactivated = result.rows_affected() > 0;
        if deactivated {
            info!(pattern = %template, agent_id = %agent_id, "Pattern deactivated");
        }
        Ok(deactivated)
    }

    // ========== Traversal Operations ==========

    async fn traverse(
        &self,
        seeds: &[String],
        agent_id: &str,
        params: &TraversalParams,
    ) -> Result<Vec<TraversalPath>> {
        let seeds = normalized_unique(seeds);
        if seeds.is_empty() || params.max_depth == 0 {
            return Ok(Vec::new());
        }

        let sql = traversal_sql(seeds.len());
        let mut query = sqlx::query_as::<_, TraversalRow>(&sql)
            .bind(agent_id)
            .bind(params.hop_decay)
            .bind(i64::from(params.max_depth))
            .bind(params.min_confidence)
            .bind(params.max_rows as i64);
        for seed in &seeds {
            query = query.bind(seed.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        debug!(seeds = seeds.len(), paths = rows.len(), "Traversal completed");

        Ok(rows
            .into_iter()
            .map(|row| TraversalPath {
                entities: row
                    .path
                    .trim_matches(',')
                    .split(',')
                    .map(str::to_string)
                    .collect(),
                depth: row.depth.max(0) as u32,
                score: row.score,
                exchange_id: row.exchange_id,
                confidence: row.confidence,
            })
            .collect())
    }

    async fn match_template(
        &self,
        template: &PathTemplate,
        agent_id: &str,
        start_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<TemplateMatch>> {
        let starts = start_ids.map(normalized_unique).unwrap_or_default();
        if start_ids.is_some() && starts.is_empty() {
            return Ok(Vec::new());
        }

        let hops = template.len();
        let sql = template_sql(hops, starts.len());
        let mut query = sqlx::query(&sql).bind(agent_id);
        for predicate in template.predicates() {
            query = query.bind(predicate.as_str());
        }
        query = query.bind(limit as i64);
        for start in &starts {
            query = query.bind(start.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut matches = Vec::with_capacity(rows.len());

        for row in &rows {
            let mut entities = Vec::with_capacity(hops + 1);
            for i in 0..=hops {
                entities.push(row.try_get::<String, _>(format!("n{}", i).as_str())?);
            }

            let mut confidences = Vec::with_capacity(hops);
            let mut updated_at = Vec::with_capacity(hops);
            let mut exchange_ids = Vec::with_capacity(hops);
            for i in 0..hops {
                confidences.push(row.try_get::<f64, _>(format!("c{}", i).as_str())?);
                let updated: String = row.try_get(format!("u{}", i).as_str())?;
                updated_at.push(from_db_time(&updated));
                exchange_ids.push(row.try_get::<Option<String>, _>(format!("x{}", i).as_str())?);
            }

            matches.push(TemplateMatch {
                entities,
                confidences,
                updated_at,
                exchange_ids,
            });
        }

        debug!(pattern = %template, matches = matches.len(), "Template matched");
        Ok(matches)
    }

    // ========== Maintenance Bookkeeping ==========

    async fn last_maintenance(&self, agent_id: &str, task: &str) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT last_run FROM maintenance_runs WHERE agent_id = ? AND task = ?",
        )
        .bind(agent_id)
        .bind(task)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(at,)| from_db_time(&at)))
    }

    async fn record_maintenance(
        &self,
        agent_id: &str,
        task: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO maintenance_runs (agent_id, task, last_run) VALUES (?1, ?2, ?3)
            ON CONFLICT(agent_id, task) DO UPDATE SET last_run = excluded.last_run
            "#,
        )
        .bind(agent_id)
        .bind(task)
        .bind(to_db_time(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========== Statistics ==========

    async fn get_predicate_stats(&self, agent_id: &str) -> Result<Vec<PredicateStats>> {
        let rows: Vec<PredicateStatsRow> = sqlx::query_as(
            r#"
            SELECT
                predicate,
                COUNT(*) AS count,
                COUNT(DISTINCT subject) AS unique_subjects,
                COUNT(DISTINCT object) AS unique_objects,
                AVG(confidence) AS avg_confidence
            FROM triples
            WHERE agent_id = ?
            GROUP BY predicate
            ORDER BY count DESC, predicate
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(|r| r.into_stats()).collect())
    }

    async fn get_stats(&self, agent_id: &str) -> Result<GraphStats> {
        let (entities, triples, pending, cooccurrences, patterns, avg): (
            i64,
            i64,
            i64,
            i64,
            i64,
            f64,
        ) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM entities WHERE agent_id = ?1),
                (SELECT COUNT(*) FROM triples WHERE agent_id = ?1),
                (SELECT COUNT(*) FROM triples WHERE agent_id = ?1 AND pending_resolution = 1),
                (SELECT COUNT(*) FROM cooccurrences WHERE agent_id = ?1),
                (SELECT COUNT(*) FROM meta_paths WHERE agent_id = ?1 AND active = 1),
                (SELECT COALESCE(AVG(confidence), 0.0) FROM triples WHERE agent_id = ?1)
            "#,
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(GraphStats {
            total_entities: entities.max(0) as u64,
            total_triples: triples.max(0) as u64,
            pending_triples: pending.max(0) as u64,
            total_cooccurrences: cooccurrences.max(0) as u64,
            active_patterns: patterns.max(0) as u64,
            average_confidence: avg,
        })
    }
}

/// Normalize ids, dropping unusable ones and duplicates while keeping order
fn normalized_unique(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter_map(|id| normalize_name(id))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Collapse whitespace in a surface form
fn display_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ========== Transaction helpers ==========

async fn upsert_entity_in(conn: &mut SqliteConnection, entity: &Entity, now: &str) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entities (
            id, agent_id, canonical_name, entity_type, aliases, mention_count, first_seen, last_seen
        ) VALUES (?1, ?2, ?3, ?4, '[]', 1, ?5, ?5)
        ON CONFLICT(agent_id, id) DO UPDATE SET
            mention_count = entities.mention_count + 1,
            last_seen = excluded.last_seen,
            entity_type = CASE
                WHEN entities.entity_type = 'THING' THEN excluded.entity_type
                ELSE entities.entity_type
            END
        "#,
    )
    .bind(&entity.id)
    .bind(&entity.agent_id)
    .bind(&entity.canonical_name)
    .bind(entity.entity_type.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Register a triple endpoint without touching an existing row
async fn register_endpoint_in(
    conn: &mut SqliteConnection,
    id: &str,
    surface: &str,
    agent_id: &str,
    now: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entities (
            id, agent_id, canonical_name, entity_type, aliases, mention_count, first_seen, last_seen
        ) VALUES (?1, ?2, ?3, 'THING', '[]', 1, ?4, ?4)
        ON CONFLICT(agent_id, id) DO NOTHING
        "#,
    )
    .bind(id)
    .bind(agent_id)
    .bind(display_name(surface))
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert a triple or raise the confidence of the existing tuple
async fn insert_triple_in(
    conn: &mut SqliteConnection,
    triple: &NormalizedTriple,
    provenance: &Provenance,
    agent_id: &str,
    now: &str,
) -> sqlx::Result<String> {
    let (id,): (String,) = sqlx::query_as(
        r#"
        INSERT INTO triples (
            id, agent_id, subject, predicate, object, confidence,
            source_exchange_id, source_date, pending_resolution, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
        ON CONFLICT(agent_id, subject, predicate, object) DO UPDATE SET
            confidence = MAX(triples.confidence, excluded.confidence),
            pending_resolution = MIN(triples.pending_resolution, excluded.pending_resolution),
            source_exchange_id = COALESCE(triples.source_exchange_id, excluded.source_exchange_id),
            source_date = COALESCE(triples.source_date, excluded.source_date),
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(agent_id)
    .bind(&triple.subject)
    .bind(triple.predicate.as_str())
    .bind(&triple.object)
    .bind(triple.confidence)
    .bind(&provenance.source_exchange_id)
    .bind(&provenance.source_date)
    .bind(triple.pending_resolution)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn bump_cooccurrence_in(
    conn: &mut SqliteConnection,
    a: &str,
    b: &str,
    agent_id: &str,
    now: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cooccurrences (agent_id, entity_a, entity_b, count, last_seen)
        VALUES (?1, ?2, ?3, 1, ?4)
        ON CONFLICT(agent_id, entity_a, entity_b) DO UPDATE SET
            count = cooccurrences.count + 1,
            last_seen = excluded.last_seen
        "#,
    )
    .bind(agent_id)
    .bind(a)
    .bind(b)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Register both endpoints and write a single triple
async fn add_triple_in(
    conn: &mut SqliteConnection,
    input: &TripleInput,
    triple: &NormalizedTriple,
    provenance: &Provenance,
    agent_id: &str,
    now: &str,
) -> sqlx::Result<String> {
    register_endpoint_in(conn, &triple.subject, &input.subject, agent_id, now).await?;
    register_endpoint_in(conn, &triple.object, &input.object, agent_id, now).await?;
    insert_triple_in(conn, triple, provenance, agent_id, now).await
}

/// Apply one exchange inside an open transaction
async fn write_batch_in(
    conn: &mut SqliteConnection,
    exchange: &ExchangeWrite,
    now: &str,
) -> sqlx::Result<Vec<String>> {
    let agent_id = exchange.agent_id.as_str();
    let provenance = exchange.provenance();
    let mut registered: HashSet<String> = HashSet::new();

    for input in &exchange.entities {
        let Some(entity) = Entity::new(&input.name, input.resolved_type(), agent_id) else {
            debug!(name = %input.name, "Skipping unusable entity name");
            continue;
        };
        if registered.insert(entity.id.clone()) {
            upsert_entity_in(conn, &entity, now).await?;
        }
    }

    let mut ids: Vec<String> = Vec::new();
    for input in &exchange.triples {
        let Some(triple) = input.normalized() else {
            debug!(
                subject = %input.subject,
                predicate = %input.predicate,
                object = %input.object,
                "Skipping malformed triple"
            );
            continue;
        };

        for (id, surface) in [(&triple.subject, &input.subject), (&triple.object, &input.object)] {
            if registered.insert(id.clone()) {
                register_endpoint_in(conn, id, surface, agent_id, now).await?;
            }
        }

        let id = insert_triple_in(conn, &triple, &provenance, agent_id, now).await?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    let mut pairs: HashSet<(String, String)> = HashSet::new();
    for (a, b) in &exchange.co_occurrences {
        let Some(pair) = ordered_pair(a, b) else {
            debug!(a = %a, b = %b, "Skipping unusable co-occurrence");
            continue;
        };
        if pairs.insert(pair.clone()) {
            bump_cooccurrence_in(conn, &pair.0, &pair.1, agent_id, now).await?;
        }
    }

    for (entity_id, alias) in &exchange.aliases {
        add_alias_in(conn, entity_id, alias, agent_id).await?;
    }

    Ok(ids)
}

/// Append one alias to an existing entity; unknown ids are skipped
async fn add_alias_in(
    conn: &mut SqliteConnection,
    entity_id: &str,
    alias: &str,
    agent_id: &str,
) -> sqlx::Result<()> {
    let row: Option<EntityRow> =
        sqlx::query_as("SELECT * FROM entities WHERE agent_id = ? AND id = ?")
            .bind(agent_id)
            .bind(entity_id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some(row) = row else {
        debug!(entity_id = %entity_id, "Skipping alias for unknown entity");
        return Ok(());
    };
    let mut entity = row
        .into_entity()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    if !entity.add_alias(alias) {
        return Ok(());
    }

    let aliases =
        serde_json::to_string(&entity.aliases).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query("UPDATE entities SET aliases = ? WHERE agent_id = ? AND id = ?")
        .bind(aliases)
        .bind(agent_id)
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn fetch_entity_in(
    conn: &mut SqliteConnection,
    id: &str,
    agent_id: &str,
) -> Result<Option<Entity>> {
    let row: Option<EntityRow> =
        sqlx::query_as("SELECT * FROM entities WHERE agent_id = ? AND id = ?")
            .bind(agent_id)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

    row.map(|r| r.into_entity()).transpose()
}

/// Fold `merge_id` into `keep_id` inside an open transaction
async fn merge_in(
    conn: &mut SqliteConnection,
    keep_id: &str,
    merge_id: &str,
    agent_id: &str,
) -> Result<u64> {
    let mut keep = fetch_entity_in(conn, keep_id, agent_id)
        .await?
        .ok_or_else(|| Error::EntityNotFound(keep_id.to_string()))?;
    let merged = fetch_entity_in(conn, merge_id, agent_id)
        .await?
        .ok_or_else(|| Error::EntityNotFound(merge_id.to_string()))?;

    let rows: Vec<TripleRow> = sqlx::query_as(
        "SELECT * FROM triples WHERE agent_id = ?1 AND (subject = ?2 OR object = ?2)",
    )
    .bind(agent_id)
    .bind(merge_id)
    .fetch_all(&mut *conn)
    .await?;
    let rewritten = rows.len() as u64;

    for row in rows {
        let subject = if row.subject == merge_id { keep_id } else { row.subject.as_str() };
        let object = if row.object == merge_id { keep_id } else { row.object.as_str() };

        if subject == object {
            sqlx::query("DELETE FROM triples WHERE id = ?")
                .bind(&row.id)
                .execute(&mut *conn)
                .await?;
            continue;
        }

        let existing: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM triples
            WHERE agent_id = ? AND subject = ? AND predicate = ? AND object = ? AND id != ?
            "#,
        )
        .bind(agent_id)
        .bind(subject)
        .bind(&row.predicate)
        .bind(object)
        .bind(&row.id)
        .fetch_optional(&mut *conn)
        .await?;

        match existing {
            Some((existing_id,)) => {
                sqlx::query(
                    r#"
                    UPDATE triples SET
                        confidence = MAX(confidence, ?),
                        updated_at = MAX(updated_at, ?),
                        pending_resolution = 0
                    WHERE id = ?
                    "#,
                )
                .bind(row.confidence)
                .bind(&row.updated_at)
                .bind(&existing_id)
                .execute(&mut *conn)
                .await?;
                sqlx::query("DELETE FROM triples WHERE id = ?")
                    .bind(&row.id)
                    .execute(&mut *conn)
                    .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE triples SET subject = ?, object = ?, pending_resolution = 0 WHERE id = ?",
                )
                .bind(subject)
                .bind(object)
                .bind(&row.id)
                .execute(&mut *conn)
                .await?;
            }
        }
    }

    let pairs: Vec<CoOccurrenceRow> = sqlx::query_as(
        r#"
        SELECT entity_a, entity_b, count, last_seen FROM cooccurrences
        WHERE agent_id = ?1 AND (entity_a = ?2 OR entity_b = ?2)
        "#,
    )
    .bind(agent_id)
    .bind(merge_id)
    .fetch_all(&mut *conn)
    .await?;

    for pair in pairs {
        sqlx::query("DELETE FROM cooccurrences WHERE agent_id = ? AND entity_a = ? AND entity_b = ?")
            .bind(agent_id)
            .bind(&pair.entity_a)
            .bind(&pair.entity_b)
            .execute(&mut *conn)
            .await?;

        let partner = if pair.entity_a == merge_id { &pair.entity_b } else { &pair.entity_a };
        let Some((a, b)) = ordered_pair(keep_id, partner) else {
            continue;
        };
        sqlx::query(
            r#"
            INSERT INTO cooccurrences (agent_id, entity_a, entity_b, count, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(agent_id, entity_a, entity_b) DO UPDATE SET
                count = cooccurrences.count + excluded.count,
                last_seen = MAX(cooccurrences.last_seen, excluded.last_seen)
            "#,
        )
        .bind(agent_id)
        .bind(&a)
        .bind(&b)
        .bind(pair.count)
        .bind(&pair.last_seen)
        .execute(&mut *conn)
        .await?;
    }

    for alias in merged.aliases.iter().chain(std::iter::once(&merged.canonical_name)) {
        keep.add_alias(alias);
    }
    keep.mention_count += merged.mention_count;
    keep.first_seen = keep.first_seen.min(merged.first_seen);
    keep.last_seen = keep.last_seen.max(merged.last_seen);

    sqlx::query(
        r#"
        UPDATE entities SET aliases = ?, mention_count = ?, first_seen = ?, last_seen = ?
        WHERE agent_id = ? AND id = ?
        "#,
    )
    .bind(serde_json::to_string(&keep.aliases)?)
    .bind(keep.mention_count as i64)
    .bind(to_db_time(keep.first_seen))
    .bind(to_db_time(keep.last_seen))
    .bind(agent_id)
    .bind(keep_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM entities WHERE agent_id = ? AND id = ?")
        .bind(agent_id)
        .bind(merge_id)
        .execute(&mut *conn)
        .await?;

    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::Predicate;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_store() -> SqliteTripleStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");

        run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        SqliteTripleStore::new(pool)
    }

    async fn age_all_triples(store: &SqliteTripleStore, days: i64) {
        sqlx::query("UPDATE triples SET updated_at = ?, created_at = ?")
            .bind(to_db_time(Utc::now() - Duration::days(days)))
            .bind(to_db_time(Utc::now() - Duration::days(days)))
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_entity_is_idempotent() {
        let store = setup_test_store().await;

        let first = store.upsert_entity("Chris", EntityType::Person, "main").await.unwrap();
        let second = store.upsert_entity("  chris ", EntityType::Person, "main").await.unwrap();
        assert_eq!(first.as_deref(), Some("chris"));
        assert_eq!(first, second);

        let entity = store.get_entity("chris", "main").await.unwrap().unwrap();
        assert_eq!(entity.mention_count, 2);
        assert_eq!(entity.entity_type, EntityType::Person);
        assert_eq!(store.get_stats("main").await.unwrap().total_entities, 1);

        assert!(store.upsert_entity("?", EntityType::Thing, "main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_refines_thing_type() {
        let store = setup_test_store().await;

        store.upsert_entity("Dan", EntityType::Thing, "main").await.unwrap();
        store.upsert_entity("Dan", EntityType::Person, "main").await.unwrap();
        store.upsert_entity("Dan", EntityType::Place, "main").await.unwrap();

        let dan = store.get_entity("dan", "main").await.unwrap().unwrap();
        assert_eq!(dan.entity_type, EntityType::Person);
    }

    #[tokio::test]
    async fn test_triple_dedup_keeps_max_confidence() {
        let store = setup_test_store().await;
        let provenance = Provenance::exchange("ex-1", None);

        let low = TripleInput::new("chris", "knows", "dan").with_confidence(0.6);
        let high = TripleInput::new("chris", "knows", "dan").with_confidence(0.9);
        let lower = TripleInput::new("Chris", "knows", "Dan").with_confidence(0.3);

        let a = store.add_triple(&low, &provenance, "main").await.unwrap();
        let b = store.add_triple(&high, &provenance, "main").await.unwrap();
        let c = store.add_triple(&lower, &provenance, "main").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);

        let triples = store.get_triples_for("chris", "main", 10).await.unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].confidence, 0.9);
        assert_eq!(triples[0].predicate, Predicate::Knows);
    }

    #[tokio::test]
    async fn test_add_triple_registers_endpoints_and_skips_malformed() {
        let store = setup_test_store().await;
        let provenance = Provenance::default();

        let id = store
            .add_triple(&TripleInput::new("Chris", "uses", "Grafana"), &provenance, "main")
            .await
            .unwrap();
        assert!(id.is_some());

        let grafana = store.get_entity("grafana", "main").await.unwrap().unwrap();
        assert_eq!(grafana.entity_type, EntityType::Thing);
        assert_eq!(grafana.canonical_name, "Grafana");

        let skipped = store
            .add_triple(&TripleInput::new("Chris", "teleports", "Mars"), &provenance, "main")
            .await
            .unwrap();
        assert!(skipped.is_none());
        assert!(store.get_entity("mars", "main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_exchange_batches_everything() {
        let store = setup_test_store().await;

        let write = ExchangeWrite::new("main", "ex-1")
            .with_date("2026-10-01")
            .entity("Chris", EntityType::Person)
            .entity("Chris", EntityType::Person)
            .entity("Dan", EntityType::Person)
            .entity("", EntityType::Thing)
            .triple(TripleInput::new("Chris", "knows", "Dan").with_confidence(0.9))
            .triple(TripleInput::new("Dan", "works on", "Dashboard").with_confidence(0.8))
            .triple(TripleInput::new("Chris", "knows", "Dan"))
            .triple(TripleInput::new("Chris", "???", "Dan"))
            .co_occurrence("Dan", "Chris")
            .co_occurrence("Chris", "Dan")
            .co_occurrence("Chris", "chris");

        let ids = store.write_exchange(&write).await.unwrap();
        assert_eq!(ids.len(), 2);

        let chris = store.get_entity("chris", "main").await.unwrap().unwrap();
        assert_eq!(chris.mention_count, 1);
        let dashboard = store.get_entity("dashboard", "main").await.unwrap().unwrap();
        assert_eq!(dashboard.entity_type, EntityType::Thing);

        let knows = store.get_triples_for("chris", "main", 10).await.unwrap();
        assert_eq!(knows.len(), 1);
        assert_eq!(knows[0].confidence, 1.0);
        assert_eq!(knows[0].provenance.source_exchange_id.as_deref(), Some("ex-1"));
        assert_eq!(knows[0].provenance.source_date.as_deref(), Some("2026-10-01"));

        assert_eq!(store.cooccurrence_count("dan", "chris", "main").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_exchange_rolls_back_on_storage_error() {
        let store = setup_test_store().await;
        sqlx::raw_sql(
            r#"
            CREATE TRIGGER reject_boom BEFORE INSERT ON triples
            WHEN NEW.object = 'boom'
            BEGIN SELECT RAISE(ABORT, 'boom rejected'); END;
            "#,
        )
        .execute(store.pool())
        .await
        .unwrap();

        let write = ExchangeWrite::new("main", "ex-bad")
            .entity("Chris", EntityType::Person)
            .triple(TripleInput::new("Chris", "knows", "Dan"))
            .triple(TripleInput::new("Chris", "uses", "boom"))
            .co_occurrence("Chris", "Dan");

        let err = store.write_exchange(&write).await.unwrap_err();
        assert_eq!(err.code(), "E200");
        assert!(err.is_retryable());

        let stats = store.get_stats("main").await.unwrap();
        assert_eq!(stats.total_entities, 0);
        assert_eq!(stats.total_triples, 0);
        assert_eq!(stats.total_cooccurrences, 0);
    }

    #[tokio::test]
    async fn test_get_triples_for_orders_by_recency() {
        let store = setup_test_store().await;
        let provenance = Provenance::default();

        store
            .add_triple(&TripleInput::new("chris", "knows", "dan"), &provenance, "main")
            .await
            .unwrap();
        age_all_triples(&store, 3).await;
        store
            .add_triple(&TripleInput::new("eve", "knows", "chris"), &provenance, "main")
            .await
            .unwrap();

        let triples = store.get_triples_for("Chris", "main", 10).await.unwrap();
        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0].subject, "eve");
        assert_eq!(triples[1].object, "dan");

        let limited = store.get_triples_for("chris", "main", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(store.get_triples_for("chris", "other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decay_only_touches_stale_triples() {
        let store = setup_test_store().await;
        let provenance = Provenance::default();

        store
            .add_triple(&TripleInput::new("chris", "knows", "dan").with_confidence(0.8), &provenance, "main")
            .await
            .unwrap();
        store
            .add_triple(&TripleInput::new("dan", "uses", "vim").with_confidence(0.15), &provenance, "main")
            .await
            .unwrap();
        age_all_triples(&store, 40).await;
        store
            .add_triple(&TripleInput::new("eve", "knows", "dan").with_confidence(0.8), &provenance, "main")
            .await
            .unwrap();

        assert_eq!(store.decay_stale_triples("main", 30).await.unwrap(), 2);
        let chris = store.get_triples_for("chris", "main", 10).await.unwrap();
        assert!((chris[0].confidence - 0.4).abs() < 1e-9);
        let eve = store.get_triples_for("eve", "main", 10).await.unwrap();
        assert_eq!(eve[0].confidence, 0.8);

        // 0.075 is now under the floor and stays put
        assert_eq!(store.decay_stale_triples("main", 30).await.unwrap(), 1);
        let vim = store.get_triples_for("vim", "main", 10).await.unwrap();
        assert!((vim[0].confidence - 0.075).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_merge_entities_rewrites_everything() {
        let store = setup_test_store().await;

        let write = ExchangeWrite::new("main", "ex-1")
            .entity("Bob Martinez", EntityType::Person)
            .entity("bob_m", EntityType::Person)
            .triple(TripleInput::new("bob_m", "works_on", "dashboard").with_confidence(0.7).pending())
            .triple(TripleInput::new("chris", "knows", "bob_m").with_confidence(0.5))
            .triple(TripleInput::new("chris", "knows", "Bob Martinez").with_confidence(0.9))
            .triple(TripleInput::new("bob_m", "knows", "Bob Martinez"))
            .co_occurrence("bob_m", "chris")
            .co_occurrence("Bob Martinez", "chris")
            .co_occurrence("bob_m", "Bob Martinez");
        store.write_exchange(&write).await.unwrap();

        let rewritten = store.merge_entities("bob_martinez", "bob_m", "main").await.unwrap();
        assert_eq!(rewritten, 3);

        assert!(store.get_entity("bob_m", "main").await.unwrap().is_none());
        let kept = store.get_entity("bob_martinez", "main").await.unwrap().unwrap();
        assert_eq!(kept.aliases, vec!["bob_m".to_string()]);
        assert_eq!(kept.mention_count, 2);

        let residual: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM triples WHERE subject = 'bob_m' OR object = 'bob_m'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(residual.0, 0);

        let triples = store.get_triples_for("bob_martinez", "main", 10).await.unwrap();
        assert_eq!(triples.len(), 2);
        let knows = triples.iter().find(|t| t.predicate == Predicate::Knows).unwrap();
        assert_eq!(knows.confidence, 0.9);
        assert!(triples.iter().all(|t| !t.pending_resolution));

        assert_eq!(store.cooccurrence_count("bob_martinez", "chris", "main").await.unwrap(), 2);
        assert_eq!(store.get_stats("main").await.unwrap().total_cooccurrences, 1);

        let found = store.find_entity("bob_m", "main").await.unwrap().unwrap();
        assert_eq!(found.id, "bob_martinez");
    }

    #[tokio::test]
    async fn test_merge_requires_both_entities() {
        let store = setup_test_store().await;
        store.upsert_entity("Bob", EntityType::Person, "main").await.unwrap();

        let err = store.merge_entities("bob", "robert", "main").await.unwrap_err();
        assert_eq!(err.code(), "E001");
        assert!(store.merge_entities("bob", "bob", "main").await.is_err());
        assert!(store.get_entity("bob", "main").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pending_lifecycle() {
        let store = setup_test_store().await;
        let write = ExchangeWrite::new("main", "ex-1")
            .triple(TripleInput::new("chris", "knows", "dana").pending())
            .triple(TripleInput::new("chris", "uses", "vim"));
        store.write_exchange(&write).await.unwrap();

        let pending = store.pending_entities("main").await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|p| p.entity_id.as_str()).collect();
        assert_eq!(pending.len(), 2);
        assert!(ids.contains(&"chris") && ids.contains(&"dana"));
        assert!(pending.iter().all(|p| p.pending_triples == 1));

        assert_eq!(store.clear_pending("dana", "main").await.unwrap(), 1);
        assert!(store.pending_entities("main").await.unwrap().is_empty());
        assert_eq!(store.get_stats("main").await.unwrap().pending_triples, 0);
    }

    #[tokio::test]
    async fn test_traverse_never_revisits_an_entity() {
        let store = setup_test_store().await;
        let write = ExchangeWrite::new("main", "ring")
            .triple(TripleInput::new("aa", "knows", "bb"))
            .triple(TripleInput::new("bb", "knows", "cc"))
            .triple(TripleInput::new("cc", "knows", "dd"))
            .triple(TripleInput::new("dd", "knows", "aa"));
        store.write_exchange(&write).await.unwrap();

        let params = TraversalParams {
            max_depth: 3,
            ..Default::default()
        };
        let paths = store.traverse(&["aa".to_string()], "main", &params).await.unwrap();
        assert!(!paths.is_empty());
        assert!(paths.iter().all(|p| p.depth <= 3));
        for path in &paths {
            let unique: HashSet<&String> = path.entities.iter().collect();
            assert_eq!(unique.len(), path.entities.len(), "revisit in {:?}", path.entities);
            assert_eq!(path.entities.len() as u32, path.depth + 1);
        }
        assert!(paths.iter().any(|p| p.depth == 3));
    }

    #[tokio::test]
    async fn test_traverse_applies_decay_and_confidence_gate() {
        let store = setup_test_store().await;
        let write = ExchangeWrite::new("main", "ex-1")
            .triple(TripleInput::new("chris", "knows", "dan").with_confidence(0.9))
            .triple(TripleInput::new("dan", "works_on", "dashboard").with_confidence(0.8))
            .triple(TripleInput::new("dan", "uses", "excel").with_confidence(0.5));
        store.write_exchange(&write).await.unwrap();

        let paths = store
            .traverse(&["Chris".to_string()], "main", &TraversalParams::default())
            .await
            .unwrap();

        let first = paths.iter().find(|p| p.depth == 1).unwrap();
        assert!((first.score - 0.63).abs() < 1e-9);

        let second: Vec<_> = paths.iter().filter(|p| p.depth == 2).collect();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].endpoint(), Some("dashboard"));
        assert!((second[0].score - 0.441).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_match_template_follows_sequence() {
        let store = setup_test_store().await;
        let write = ExchangeWrite::new("main", "ex-1")
            .triple(TripleInput::new("chris", "knows", "dan").with_confidence(0.9))
            .triple(TripleInput::new("dan", "works_on", "dashboard").with_confidence(0.8))
            .triple(TripleInput::new("eve", "knows", "dan").with_confidence(0.5))
            .triple(TripleInput::new("dan", "knows", "chris"));
        store.write_exchange(&write).await.unwrap();

        let template = PathTemplate::new(vec![Predicate::Knows, Predicate::WorksOn]).unwrap();
        let all = store.match_template(&template, "main", None, 100).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|m| m.end() == "dashboard"));

        let from_chris = store
            .match_template(&template, "main", Some(&["chris".to_string()]), 100)
            .await
            .unwrap();
        assert_eq!(from_chris.len(), 1);
        assert_eq!(from_chris[0].entities, vec!["chris", "dan", "dashboard"]);
        assert!((from_chris[0].path_confidence() - 0.72).abs() < 1e-9);
        assert_eq!(from_chris[0].exchange_ids[1].as_deref(), Some("ex-1"));

        // knows -> knows would return to chris; cycles are excluded
        let loop_template = PathTemplate::new(vec![Predicate::Knows, Predicate::Knows]).unwrap();
        let loops = store
            .match_template(&loop_template, "main", Some(&["chris".to_string()]), 100)
            .await
            .unwrap();
        assert!(loops.is_empty());
    }

    #[tokio::test]
    async fn test_pattern_lifecycle() {
        let store = setup_test_store().await;
        let template = PathTemplate::parse(&["knows", "works_on"]).unwrap();
        let seeds = vec![
            MetaPath::seeded("main", template.clone(), 0.8),
            MetaPath::seeded("main", PathTemplate::parse(&["member_of", "located_in"]).unwrap(), 0.6),
        ];

        assert_eq!(store.seed_static_patterns(&seeds).await.unwrap(), 2);
        assert_eq!(store.seed_static_patterns(&seeds).await.unwrap(), 0);
        assert_eq!(store.get_active_patterns("main").await.unwrap().len(), 2);

        let found = MetaPath::discovered("main", PathTemplate::parse(&["uses", "part_of"]).unwrap(), 0.5, 4, 0.25);
        store.save_pattern(&found).await.unwrap();
        let active = store.get_active_patterns("main").await.unwrap();
        assert_eq!(active.len(), 3);
        assert!(active[0].is_static());

        assert!(store.deactivate_pattern(&found.template, "main").await.unwrap());
        assert!(!store.deactivate_pattern(&found.template, "main").await.unwrap());
        assert_eq!(store.get_active_patterns("main").await.unwrap().len(), 2);

        let all = store.list_patterns("main", true).await.unwrap();
        assert_eq!(all.len(), 3);
        let retired = all.iter().find(|p| !p.active).unwrap();
        assert_eq!(retired.yield_score, 4);
        assert_eq!(retired.template, found.template);
    }

    #[tokio::test]
    async fn test_predicate_stats() {
        let store = setup_test_store().await;
        let write = ExchangeWrite::new("main", "ex-1")
            .triple(TripleInput::new("chris", "knows", "dan").with_confidence(0.8))
            .triple(TripleInput::new("chris", "knows", "eve").with_confidence(0.6))
            .triple(TripleInput::new("dan", "knows", "eve").with_confidence(1.0))
            .triple(TripleInput::new("dan", "uses", "vim"));
        store.write_exchange(&write).await.unwrap();

        let stats = store.get_predicate_stats("main").await.unwrap();
        assert_eq!(stats.len(), 2);
        let knows = &stats[0];
        assert_eq!(knows.predicate, Predicate::Knows);
        assert_eq!(knows.count, 3);
        assert_eq!(knows.unique_subjects, 2);
        assert_eq!(knows.unique_objects, 2);
        assert!((knows.avg_confidence - 0.8).abs() < 1e-9);
        assert!((knows.fanout() - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_agents_are_isolated() {
        let store = setup_test_store().await;
        store
            .write_exchange(&ExchangeWrite::new("a", "ex").triple(TripleInput::new("chris", "knows", "dan")))
            .await
            .unwrap();

        assert!(store.get_entity("chris", "b").await.unwrap().is_none());
        assert!(store.get_triples_for("chris", "b", 10).await.unwrap().is_empty());
        assert!(!store.has_direct_edge("dan", "chris", "b").await.unwrap());
        assert!(store.has_direct_edge("dan", "chris", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_decay_with_oversized_half_life_is_noop() {
        let store = setup_test_store().await;
        let write = ExchangeWrite::new("main", "ex-1")
            .triple(TripleInput::new("chris", "knows", "dan").with_confidence(0.9));
        store.write_exchange(&write).await.unwrap();
        age_all_triples(&store, 400).await;

        assert_eq!(store.decay_stale_triples("main", u32::MAX).await.unwrap(), 0);
        let triples = store.get_triples_for("chris", "main", 10).await.unwrap();
        assert!((triples[0].confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_exchange_aliases_commit_with_the_batch() {
        let store = setup_test_store().await;
        store.upsert_entity("Bob Martinez", EntityType::Person, "main").await.unwrap();
        store.upsert_entity("Billing", EntityType::Thing, "main").await.unwrap();

        let write = ExchangeWrite::new("main", "ex-bob")
            .entity("Billing", EntityType::Thing)
            .triple(TripleInput::new("bob_martinez", "works_on", "Billing"))
            .alias("bob_martinez", "Bob")
            .alias("nobody_here", "Ghost");

        sqlx::query(
            "CREATE TRIGGER reject_triples BEFORE INSERT ON triples BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();
        let err = store.write_exchange(&write).await.unwrap_err();
        assert_eq!(err.code(), "E200");

        let bob = store.get_entity("bob_martinez", "main").await.unwrap().unwrap();
        assert!(bob.aliases.is_empty());
        let billing = store.get_entity("billing", "main").await.unwrap().unwrap();
        assert_eq!(billing.mention_count, 1);

        sqlx::query("DROP TRIGGER reject_triples")
            .execute(store.pool())
            .await
            .unwrap();
        store.write_exchange(&write).await.unwrap();

        let bob = store.get_entity("bob_martinez", "main").await.unwrap().unwrap();
        assert_eq!(bob.aliases, vec!["Bob".to_string()]);
        let billing = store.get_entity("billing", "main").await.unwrap().unwrap();
        assert_eq!(billing.mention_count, 2);
        assert!(store.get_entity("nobody_here", "main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_aliases_and_prefix_lookup() {
        let store = setup_test_store().await;
        store.upsert_entity("Bob Martinez", EntityType::Person, "main").await.unwrap();
        store.upsert_entity("Bobby Tables", EntityType::Person, "main").await.unwrap();
        store
            .add_aliases("bob_martinez", &["Bobbo".to_string(), "bob martinez".to_string()], "main")
            .await
            .unwrap();

        let bob = store.find_entity("BOBBO", "main").await.unwrap().unwrap();
        assert_eq!(bob.id, "bob_martinez");
        assert_eq!(bob.aliases, vec!["Bobbo".to_string()]);

        let prefixed = store.entities_with_prefix("bob", "main", 10).await.unwrap();
        assert_eq!(prefixed.len(), 2);
        assert!(store.entities_with_prefix("zed", "main", 10).await.unwrap().is_empty());

        let recent = store.recent_entities("main", 1).await.unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn test_maintenance_bookkeeping() {
        let store = setup_test_store().await;
        assert!(store.last_maintenance("main", "decay").await.unwrap().is_none());

        let earlier = Utc::now() - Duration::hours(30);
        let later = Utc::now();
        store.record_maintenance("main", "decay", earlier).await.unwrap();
        store.record_maintenance("main", "decay", later).await.unwrap();

        let last = store.last_maintenance("main", "decay").await.unwrap().unwrap();
        assert!((last - later).num_milliseconds().abs() <= 1);
        assert!(store.last_maintenance("main", "discovery").await.unwrap().is_none());
        assert!(store.last_maintenance("other", "decay").await.unwrap().is_none());
    }
}
