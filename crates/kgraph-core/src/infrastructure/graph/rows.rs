//! Database row types and timestamp encoding

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use sqlx::FromRow;

use crate::domain::graph::{
    CoOccurrence, Entity, EntityType, MetaPath, PathTemplate, PatternType, PendingEntity,
    Predicate, PredicateStats, Provenance, Triple,
};
use crate::error::{Error, Result};

/// Encode a timestamp as fixed-width RFC 3339 text (millisecond precision)
pub(crate) fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decode a stored timestamp, accepting SQLite's `CURRENT_TIMESTAMP` form too
pub(crate) fn from_db_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

#[derive(Debug, FromRow)]
pub(crate) struct EntityRow {
    id: String,
    agent_id: String,
    canonical_name: String,
    entity_type: String,
    aliases: String,
    mention_count: i64,
    first_seen: String,
    last_seen: String,
}

impl EntityRow {
    pub(crate) fn into_entity(self) -> Result<Entity> {
        let entity_type = EntityType::parse(&self.entity_type)
            .ok_or_else(|| Error::Other(format!("Invalid entity type: {}", self.entity_type)))?;

        let aliases: Vec<String> = serde_json::from_str(&self.aliases)
            .map_err(|e| Error::Other(format!("Failed to parse aliases: {}", e)))?;

        Ok(Entity {
            id: self.id,
            agent_id: self.agent_id,
            canonical_name: self.canonical_name,
            entity_type,
            aliases,
            mention_count: self.mention_count.max(0) as u64,
            first_seen: from_db_time(&self.first_seen),
            last_seen: from_db_time(&self.last_seen),
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TripleRow {
    pub(crate) id: String,
    agent_id: String,
    pub(crate) subject: String,
    pub(crate) predicate: String,
    pub(crate) object: String,
    pub(crate) confidence: f64,
    source_exchange_id: Option<String>,
    source_date: Option<String>,
    pending_resolution: bool,
    created_at: String,
    pub(crate) updated_at: String,
}

impl TripleRow {
    pub(crate) fn into_triple(self) -> Result<Triple> {
        let predicate = Predicate::parse(&self.predicate)
            .ok_or_else(|| Error::Other(format!("Invalid predicate: {}", self.predicate)))?;

        Ok(Triple {
            id: self.id,
            agent_id: self.agent_id,
            subject: self.subject,
            predicate,
            object: self.object,
            confidence: self.confidence,
            provenance: Provenance {
                source_exchange_id: self.source_exchange_id,
                source_date: self.source_date,
            },
            pending_resolution: self.pending_resolution,
            created_at: from_db_time(&self.created_at),
            updated_at: from_db_time(&self.updated_at),
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct CoOccurrenceRow {
    pub(crate) entity_a: String,
    pub(crate) entity_b: String,
    pub(crate) count: i64,
    pub(crate) last_seen: String,
}

impl CoOccurrenceRow {
    pub(crate) fn into_cooccurrence(self) -> CoOccurrence {
        CoOccurrence {
            entity_a: self.entity_a,
            entity_b: self.entity_b,
            count: self.count.max(0) as u64,
            last_seen: from_db_time(&self.last_seen),
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct MetaPathRow {
    id: String,
    agent_id: String,
    predicates: String,
    pattern_type: String,
    weight: f64,
    yield_score: i64,
    overlap_ratio: f64,
    active: bool,
    last_validated: Option<String>,
    created_at: String,
}

impl MetaPathRow {
    pub(crate) fn into_meta_path(self) -> Result<MetaPath> {
        let pattern_type = PatternType::parse(&self.pattern_type)
            .ok_or_else(|| Error::Other(format!("Invalid pattern type: {}", self.pattern_type)))?;

        Ok(MetaPath {
            id: self.id,
            agent_id: self.agent_id,
            template: PathTemplate::from_key(&self.predicates)?,
            pattern_type,
            weight: self.weight,
            yield_score: self.yield_score.max(0) as u64,
            overlap_ratio: self.overlap_ratio,
            active: self.active,
            last_validated: self.last_validated.as_deref().map(from_db_time),
            created_at: from_db_time(&self.created_at),
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PredicateStatsRow {
    predicate: String,
    count: i64,
    unique_subjects: i64,
    unique_objects: i64,
    avg_confidence: f64,
}

impl PredicateStatsRow {
    /// `None` for rows carrying a predicate outside the vocabulary
    pub(crate) fn into_stats(self) -> Option<PredicateStats> {
        Some(PredicateStats {
            predicate: Predicate::parse(&self.predicate)?,
            count: self.count.max(0) as u64,
            unique_subjects: self.unique_subjects.max(0) as u64,
            unique_objects: self.unique_objects.max(0) as u64,
            avg_confidence: self.avg_confidence,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PendingRow {
    entity_id: String,
    oldest_pending: String,
    pending_triples: i64,
}

impl PendingRow {
    pub(crate) fn into_pending(self) -> PendingEntity {
        PendingEntity {
            entity_id: self.entity_id,
            oldest_pending: from_db_time(&self.oldest_pending),
            pending_triples: self.pending_triples.max(0) as u64,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TraversalRow {
    pub(crate) depth: i64,
    pub(crate) score: f64,
    pub(crate) path: String,
    pub(crate) exchange_id: Option<String>,
    pub(crate) confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_db_time_is_fixed_width_and_ordered() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);

        let a = to_db_time(early);
        let b = to_db_time(late);
        assert_eq!(a, "2026-01-02T03:04:05.000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(from_db_time(&b), late);
    }

    #[test]
    fn test_from_db_time_accepts_sqlite_default() {
        let parsed = from_db_time("2026-01-02 03:04:05");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
    }
}
