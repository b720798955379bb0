//! Database migrations
//!
//! Manages the SQLite schema for an agent graph store. Migrations are
//! versioned and applied automatically when a store is opened.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );
"#;

/// Migration 1: Graph schema
///
/// Timestamps are fixed-width RFC 3339 UTC text so that string comparison
/// orders them chronologically.
const MIGRATION_V1: &str = r#"
    -- Canonical entities, keyed by normalized name
    CREATE TABLE IF NOT EXISTS entities (
        id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        canonical_name TEXT NOT NULL,
        entity_type TEXT NOT NULL DEFAULT 'THING'
            CHECK (entity_type IN ('PERSON', 'ORGANIZATION', 'PLACE', 'CONCEPT', 'THING', 'DATE')),
        aliases TEXT NOT NULL DEFAULT '[]',
        mention_count INTEGER NOT NULL DEFAULT 1 CHECK (mention_count >= 0),
        first_seen TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        last_seen TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        PRIMARY KEY (agent_id, id)
    );

    CREATE INDEX IF NOT EXISTS idx_entities_last_seen ON entities(agent_id, last_seen);

    -- Typed, directed edges; one row per (agent, subject, predicate, object)
    CREATE TABLE IF NOT EXISTS triples (
        id TEXT PRIMARY KEY NOT NULL,
        agent_id TEXT NOT NULL,
        subject TEXT NOT NULL,
        predicate TEXT NOT NULL,
        object TEXT NOT NULL,
        confidence REAL NOT NULL DEFAULT 1.0 CHECK (confidence >= 0.0 AND confidence <= 1.0),
        source_exchange_id TEXT,
        source_date TEXT,
        pending_resolution INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        UNIQUE (agent_id, subject, predicate, object)
    );

    CREATE INDEX IF NOT EXISTS idx_triples_subject ON triples(agent_id, subject);
    CREATE INDEX IF NOT EXISTS idx_triples_object ON triples(agent_id, object);
    CREATE INDEX IF NOT EXISTS idx_triples_predicate ON triples(agent_id, predicate);
    CREATE INDEX IF NOT EXISTS idx_triples_updated_at ON triples(agent_id, updated_at);
    CREATE INDEX IF NOT EXISTS idx_triples_exchange ON triples(agent_id, source_exchange_id);
    CREATE INDEX IF NOT EXISTS idx_triples_pending ON triples(agent_id, pending_resolution);

    -- Undirected co-occurrence pairs, stored with entity_a < entity_b
    CREATE TABLE IF NOT EXISTS cooccurrences (
        agent_id TEXT NOT NULL,
        entity_a TEXT NOT NULL,
        entity_b TEXT NOT NULL,
        count INTEGER NOT NULL DEFAULT 1,
        last_seen TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        PRIMARY KEY (agent_id, entity_a, entity_b),
        CHECK (entity_a < entity_b)
    );

    CREATE INDEX IF NOT EXISTS idx_cooccurrences_b ON cooccurrences(agent_id, entity_b);

    -- Meta-path patterns, unique per predicate sequence
    CREATE TABLE IF NOT EXISTS meta_paths (
        id TEXT PRIMARY KEY NOT NULL,
        agent_id TEXT NOT NULL,
        predicates TEXT NOT NULL,
        pattern_type TEXT NOT NULL CHECK (pattern_type IN ('static', 'discovered')),
        weight REAL NOT NULL DEFAULT 1.0,
        yield_score INTEGER NOT NULL DEFAULT 0,
        overlap_ratio REAL NOT NULL DEFAULT 0.0,
        active INTEGER NOT NULL DEFAULT 1,
        last_validated TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        UNIQUE (agent_id, predicates)
    );

    CREATE INDEX IF NOT EXISTS idx_meta_paths_active ON meta_paths(agent_id, active);
"#;

/// Migration 2: Maintenance bookkeeping
///
/// Last completion time per agent and maintenance task, so the minimum
/// interval between runs holds across process restarts.
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS maintenance_runs (
        agent_id TEXT NOT NULL,
        task TEXT NOT NULL CHECK (task IN ('decay', 'pending', 'discovery', 'validation')),
        last_run TEXT NOT NULL,
        PRIMARY KEY (agent_id, task)
    );
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::debug!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Graph schema");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Maintenance bookkeeping");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}
