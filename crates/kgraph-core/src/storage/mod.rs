//! Storage layer - SQLite
//!
//! # Architecture
//!
//! - `database`: Connection pool management and per-agent database files
//! - `migrations`: Schema versioning and automatic migration
//!
//! # Usage
//!
//! ```ignore
//! use kgraph_core::storage::{AgentDatabases, Database};
//!
//! // In-memory database for tests
//! let db = Database::in_memory().await?;
//!
//! // One file per agent for production
//! let registry = AgentDatabases::new(data_dir);
//! let main = registry.open("main").await?;
//! ```

pub mod database;
pub mod migrations;

pub use database::{
    AGENTS_DIR, AgentDatabases, Database, DatabaseConfig, agent_database_path, default_data_dir,
};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};
