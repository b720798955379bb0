//! Application service layer
//!
//! Orchestrates the domain components behind one host-facing service and
//! carries the pieces that live outside a single request: the maintenance
//! schedule, the enrichment work queue and the last-result channel.

pub mod channel;
pub mod enrichment;
pub mod schedule;
pub mod service;

pub use channel::{PublishedResult, QueryResultChannel};
pub use enrichment::{
    Enricher, EnrichmentConfig, EnrichmentJob, EnrichmentQueue, EnrichmentReport,
};
pub use schedule::{MaintenanceConfig, MaintenanceReport, MaintenanceSchedule, MaintenanceTask};
pub use service::{IngestReport, KnowledgeGraphService};
