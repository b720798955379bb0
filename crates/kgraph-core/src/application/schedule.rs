//! Maintenance scheduling
//!
//! Decay, pending resolution, discovery and validation run off the request
//! path. Each task is gated per agent by a minimum interval; completion
//! times live in the agent's store so the gate survives restarts.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::discovery::{DiscoveryReport, ValidationReport};
use crate::domain::graph::TripleStore;
use crate::domain::resolution::PendingReport;
use crate::error::{Error, Result};

/// Maintenance cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Triples untouched this long have their confidence halved
    pub half_life_days: u32,
    /// Minimum hours between two runs of the same task
    pub min_interval_hours: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            half_life_days: 30,
            min_interval_hours: 24,
        }
    }
}

impl MaintenanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.half_life_days == 0 {
            return Err(Error::ConfigError(
                "maintenance.half_life_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A periodic maintenance task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    /// Halve confidence of stale triples
    Decay,
    /// Batch-resolve pending triples
    Pending,
    /// Mine new meta-paths
    Discovery,
    /// Retire discovered meta-paths that stopped adding value
    Validation,
}

impl MaintenanceTask {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decay => "decay",
            Self::Pending => "pending",
            Self::Discovery => "discovery",
            Self::Validation => "validation",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "decay" => Some(Self::Decay),
            "pending" => Some(Self::Pending),
            "discovery" | "discover" => Some(Self::Discovery),
            "validation" | "validate" => Some(Self::Validation),
            _ => None,
        }
    }

    /// All tasks in run order
    pub fn all() -> &'static [MaintenanceTask] {
        &[Self::Decay, Self::Pending, Self::Discovery, Self::Validation]
    }
}

impl std::fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-agent gate over maintenance tasks
pub struct MaintenanceSchedule<R: TripleStore> {
    repository: Arc<R>,
    min_interval: Duration,
}

impl<R: TripleStore> MaintenanceSchedule<R> {
    /// Create a schedule
    pub fn new(repository: Arc<R>, config: &MaintenanceConfig) -> Self {
        Self {
            repository,
            min_interval: Duration::hours(i64::from(config.min_interval_hours)),
        }
    }

    /// Whether a task may run now
    pub async fn is_due(&self, agent_id: &str, task: MaintenanceTask, now: DateTime<Utc>) -> Result<bool> {
        let last = self.repository.last_maintenance(agent_id, task.as_str()).await?;
        let due = match last {
            Some(at) => now - at >= self.min_interval,
            None => true,
        };
        debug!(agent_id = %agent_id, task = %task, last_run = ?last, due = due, "Maintenance gate");
        Ok(due)
    }

    /// Record that a task finished
    pub async fn mark_run(&self, agent_id: &str, task: MaintenanceTask, at: DateTime<Utc>) -> Result<()> {
        self.repository.record_maintenance(agent_id, task.as_str(), at).await
    }

    /// When a task last finished
    pub async fn last_run(&self, agent_id: &str, task: MaintenanceTask) -> Result<Option<DateTime<Utc>>> {
        self.repository.last_maintenance(agent_id, task.as_str()).await
    }
}

/// Summary of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub agent_id: String,
    /// Triples decayed
    pub decayed: Option<u64>,
    pub pending: Option<PendingReport>,
    pub discovery: Option<DiscoveryReport>,
    pub validation: Option<ValidationReport>,
    /// Tasks skipped because they ran too recently
    pub skipped: Vec<MaintenanceTask>,
}

impl MaintenanceReport {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    /// Whether any task ran
    pub fn ran_anything(&self) -> bool {
        self.decayed.is_some()
            || self.pending.is_some()
            || self.discovery.is_some()
            || self.validation.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::graph::SqliteTripleStore;
    use crate::storage::Database;

    async fn setup(config: &MaintenanceConfig) -> MaintenanceSchedule<SqliteTripleStore> {
        let db = Database::in_memory().await.expect("Failed to create database");
        MaintenanceSchedule::new(Arc::new(SqliteTripleStore::from_database(&db)), config)
    }

    #[test]
    fn test_task_parsing() {
        assert_eq!(MaintenanceTask::parse("discover"), Some(MaintenanceTask::Discovery));
        assert_eq!(MaintenanceTask::parse("Decay"), Some(MaintenanceTask::Decay));
        assert_eq!(MaintenanceTask::parse("vacuum"), None);
        assert_eq!(MaintenanceTask::all().len(), 4);
        assert_eq!(MaintenanceTask::Validation.to_string(), "validation");
    }

    #[tokio::test]
    async fn test_gate_holds_for_min_interval() {
        let schedule = setup(&MaintenanceConfig::default()).await;
        let now = Utc::now();

        assert!(schedule.is_due("main", MaintenanceTask::Decay, now).await.unwrap());
        schedule.mark_run("main", MaintenanceTask::Decay, now).await.unwrap();

        assert!(!schedule.is_due("main", MaintenanceTask::Decay, now + Duration::hours(23)).await.unwrap());
        assert!(schedule.is_due("main", MaintenanceTask::Decay, now + Duration::hours(24)).await.unwrap());

        // Other tasks and agents are gated independently
        assert!(schedule.is_due("main", MaintenanceTask::Discovery, now).await.unwrap());
        assert!(schedule.is_due("other", MaintenanceTask::Decay, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_interval_never_gates() {
        let config = MaintenanceConfig {
            min_interval_hours: 0,
            ..Default::default()
        };
        let schedule = setup(&config).await;
        let now = Utc::now();

        schedule.mark_run("main", MaintenanceTask::Pending, now).await.unwrap();
        assert!(schedule.is_due("main", MaintenanceTask::Pending, now).await.unwrap());
        assert!(schedule.last_run("main", MaintenanceTask::Pending).await.unwrap().is_some());
    }
}
