//! Bounded enrichment work queue
//!
//! Deep extraction (for example an LLM pass over an exchange) is slow and
//! external. Jobs are queued without blocking the caller and drained by an
//! explicit tick; the only suspension point is the [`Enricher`] call itself,
//! never the store's write path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::domain::graph::ExchangeWrite;
use crate::error::{Error, Result};

/// Queue sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Jobs held before new ones are dropped
    pub queue_capacity: usize,
    /// Jobs processed per tick
    pub max_jobs_per_tick: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_jobs_per_tick: 8,
        }
    }
}

impl EnrichmentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::ConfigError(
                "enrichment.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// An exchange awaiting deep extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentJob {
    pub agent_id: String,
    pub source_exchange_id: String,
    #[serde(default)]
    pub source_date: Option<String>,
    /// Raw exchange text
    pub text: String,
}

impl EnrichmentJob {
    pub fn new(
        agent_id: impl Into<String>,
        source_exchange_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            source_exchange_id: source_exchange_id.into(),
            source_date: None,
            text: text.into(),
        }
    }
}

/// External deep extractor
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Extract entities, triples and co-occurrences from one exchange
    async fn enrich(&self, job: &EnrichmentJob) -> Result<ExchangeWrite>;
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentReport {
    /// Jobs taken off the queue
    pub processed: usize,
    /// Triples written from enrichment results
    pub triples_written: usize,
    /// Jobs whose enrichment or ingest failed
    pub failed: usize,
    /// Jobs still queued after the tick
    pub remaining: usize,
}

/// Bounded FIFO of enrichment jobs
pub struct EnrichmentQueue {
    sender: mpsc::Sender<EnrichmentJob>,
    receiver: Mutex<mpsc::Receiver<EnrichmentJob>>,
}

impl EnrichmentQueue {
    /// Create a queue holding at most `capacity` jobs
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Queue a job; returns false when the queue is full
    pub fn enqueue(&self, job: EnrichmentJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    agent_id = %job.agent_id,
                    exchange = %job.source_exchange_id,
                    "Enrichment queue full; dropping job"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Jobs currently queued
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take up to `max_jobs` queued jobs without waiting
    pub async fn drain(&self, max_jobs: usize) -> Vec<EnrichmentJob> {
        let mut receiver = self.receiver.lock().await;
        let mut jobs = Vec::new();
        while jobs.len() < max_jobs {
            match receiver.try_recv() {
                Ok(job) => jobs.push(job),
                Err(_) => break,
            }
        }
        debug!(drained = jobs.len(), "Enrichment jobs drained");
        jobs
    }
}
