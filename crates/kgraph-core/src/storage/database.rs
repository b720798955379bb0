//! SQLite database operations
//!
//! Provides connection pool management for agent graph stores. Each agent
//! owns one database file; `AgentDatabases` opens and caches them.

use crate::storage::migrations;
use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default maximum connections in the pool
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Directory under the data dir holding one file per agent
pub const AGENTS_DIR: &str = "agents";

/// Database configuration options
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to run migrations automatically
    pub auto_migrate: bool,
    /// Journal mode (default: WAL so readers never block on the writer)
    pub journal_mode: SqliteJournalMode,
    /// Synchronous mode
    pub synchronous: SqliteSynchronous,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("kgraph.db"),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            auto_migrate: true,
            journal_mode: SqliteJournalMode::Wal,
            synchronous: SqliteSynchronous::Normal,
        }
    }
}

impl DatabaseConfig {
    /// Create a new database config with the specified path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a config for an in-memory database (useful for testing)
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            max_connections: 1, // In-memory requires single connection
            auto_migrate: true,
            journal_mode: SqliteJournalMode::Memory,
            synchronous: SqliteSynchronous::Normal,
        }
    }

    /// Set the maximum number of connections
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Disable automatic migrations
    pub fn no_migrate(mut self) -> Self {
        self.auto_migrate = false;
        self
    }

    fn is_memory(&self) -> bool {
        self.path.to_string_lossy() == ":memory:"
    }
}

/// Default directory for agent databases
pub fn default_data_dir() -> PathBuf {
    if let Some(data_dir) = dirs::data_dir() {
        data_dir.join("kgraph")
    } else {
        PathBuf::from(".kgraph")
    }
}

/// Database file for one agent under a data directory
pub fn agent_database_path(data_dir: &Path, agent_id: &str) -> Result<PathBuf> {
    let valid = !agent_id.is_empty()
        && agent_id.len() <= 64
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        bail!("Invalid agent id '{}': use letters, digits, '-' or '_'", agent_id);
    }
    Ok(data_dir.join(AGENTS_DIR).join(format!("{}.db", agent_id)))
}

/// Database connection pool wrapper
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    config: DatabaseConfig,
}

impl Database {
    /// Create a new database connection with the given configuration
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !config.is_memory() && !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {:?}", parent)
                })?;
            }
        }

        let connection_str = if config.is_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", config.path.display())
        };

        let connect_options = SqliteConnectOptions::from_str(&connection_str)?
            .journal_mode(config.journal_mode)
            .synchronous(config.synchronous)
            .foreign_keys(true)
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_memory() {
            // Dropping the only connection would drop the database with it
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("Failed to connect to database: {:?}", config.path))?;

        let db = Self {
            pool,
            config: config.clone(),
        };

        if config.auto_migrate {
            db.migrate().await?;
        }

        Ok(db)
    }

    /// Create an in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self> {
        Self::new(DatabaseConfig::in_memory()).await
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get the database configuration
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool)
            .await
            .context("Failed to run database migrations")
    }

    /// Check migration status
    pub async fn migration_status(&self) -> Result<migrations::MigrationStatus> {
        migrations::migration_status(&self.pool)
            .await
            .context("Failed to check migration status")
    }

    /// Check if database is healthy
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    /// Close the database connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

/// Per-agent database registry
///
/// Each agent gets an isolated database. Opened databases are cached so
/// repeated lookups share one pool.
#[derive(Debug, Clone)]
pub struct AgentDatabases {
    /// Root data directory, `None` for in-memory stores
    data_dir: Option<PathBuf>,
    max_connections: u32,
    open: Arc<Mutex<HashMap<String, Database>>>,
}

impl AgentDatabases {
    /// Registry rooted at a data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registry that opens a fresh in-memory database per agent
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            max_connections: 1,
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set the pool size used for file-backed databases
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Root data directory, if file-backed
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Open (or reuse) the database for an agent
    pub async fn open(&self, agent_id: &str) -> Result<Database> {
        let mut open = self.open.lock().await;
        if let Some(db) = open.get(agent_id) {
            return Ok(db.clone());
        }

        let config = match &self.data_dir {
            Some(dir) => DatabaseConfig::with_path(agent_database_path(dir, agent_id)?)
                .max_connections(self.max_connections),
            None => DatabaseConfig::in_memory(),
        };

        let db = Database::new(config)
            .await
            .with_context(|| format!("Failed to open graph store for agent '{}'", agent_id))?;
        tracing::debug!(agent_id = agent_id, path = ?db.path(), "Opened agent database");

        open.insert(agent_id.to_string(), db.clone());
        Ok(db)
    }

    /// Agents with an open database
    pub async fn open_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.open.lock().await.keys().cloned().collect();
        agents.sort();
        agents
    }

    /// Close every open database
    pub async fn close_all(&self) {
        let mut open = self.open.lock().await;
        for (_, db) in open.drain() {
            db.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::in_memory().await.expect("Failed to create in-memory database");

        db.health_check().await.expect("Health check failed");

        let status = db.migration_status().await.expect("Failed to get migration status");
        assert!(!status.needs_migration);
    }

    #[tokio::test]
    async fn test_database_config_builder() {
        let config = DatabaseConfig::with_path("/tmp/graph.db")
            .max_connections(10)
            .no_migrate();

        assert_eq!(config.path, PathBuf::from("/tmp/graph.db"));
        assert_eq!(config.max_connections, 10);
        assert!(!config.auto_migrate);
    }

    #[test]
    fn test_agent_database_path() {
        let dir = Path::new("/data");
        assert_eq!(
            agent_database_path(dir, "main").unwrap(),
            PathBuf::from("/data/agents/main.db")
        );
        assert!(agent_database_path(dir, "../etc").is_err());
        assert!(agent_database_path(dir, "").is_err());
    }

    #[tokio::test]
    async fn test_agent_databases_are_isolated_files() {
        let temp = tempfile::tempdir().unwrap();
        let registry = AgentDatabases::new(temp.path());

        let main = registry.open("main").await.unwrap();
        let other = registry.open("other").await.unwrap();
        assert_ne!(main.path(), other.path());
        assert!(temp.path().join("agents").join("main.db").exists());

        let again = registry.open("main").await.unwrap();
        assert_eq!(again.path(), main.path());
        assert_eq!(registry.open_agents().await, vec!["main", "other"]);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_in_memory_registry_isolates_agents() {
        let registry = AgentDatabases::in_memory();
        let a = registry.open("a").await.unwrap();
        let b = registry.open("b").await.unwrap();

        sqlx::query("INSERT INTO entities (id, agent_id, canonical_name) VALUES ('chris', 'a', 'Chris')")
            .execute(a.pool())
            .await
            .unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entities")
            .fetch_one(b.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
