//! Candidate generation and cost filtering for meta-path discovery

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::graph::{PathTemplate, Predicate, PredicateStats};
use crate::error::{Error, Result};

/// Thresholds for the discovery pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Minimum triples a predicate needs to take part in candidates
    pub min_predicate_count: u64,
    /// Largest qualifying vocabulary for which 3-predicate sequences are tried
    pub max_vocabulary_for_triples: usize,
    /// A candidate needs at least one predicate with fanout below this
    pub low_fanout: f64,
    /// Fanout product must stay under this raised to the sequence length
    pub max_fanout_per_step: f64,
    /// Distinct (start, end) pairs sampled per candidate
    pub sample_size: usize,
    /// Minimum distinct pairs for a candidate to be viable
    pub min_yield: u64,
    /// Maximum share of pairs already joined by a direct edge
    pub max_overlap_ratio: f64,
    /// Upper bound on active static plus discovered patterns
    pub max_active_patterns: usize,
    /// Age in days at which an edge's recency factor halves
    pub recency_horizon_days: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_predicate_count: 5,
            max_vocabulary_for_triples: 6,
            low_fanout: 10.0,
            max_fanout_per_step: 20.0,
            sample_size: 200,
            min_yield: 3,
            max_overlap_ratio: 0.9,
            max_active_patterns: 12,
            recency_horizon_days: 90.0,
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.max_overlap_ratio) {
            return Err(Error::ConfigError(
                "discovery.max_overlap_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.sample_size == 0 || self.recency_horizon_days <= 0.0 {
            return Err(Error::ConfigError(
                "discovery.sample_size and discovery.recency_horizon_days must be positive"
                    .to_string(),
            ));
        }
        if self.low_fanout <= 0.0 || self.max_fanout_per_step <= 0.0 {
            return Err(Error::ConfigError(
                "discovery fanout limits must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Recency weight of an edge last updated `days` ago
    pub fn recency_factor(&self, days: f64) -> f64 {
        1.0 / (1.0 + days.max(0.0) / self.recency_horizon_days)
    }

    /// Gate an evaluated candidate
    pub fn verdict(&self, evaluation: &CandidateEvaluation) -> Verdict {
        if evaluation.yield_score < self.min_yield {
            Verdict::LowYield
        } else if evaluation.overlap_ratio > self.max_overlap_ratio {
            Verdict::Redundant
        } else {
            Verdict::Accepted
        }
    }
}

/// Outcome of gating a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    /// Fewer reachable pairs than `min_yield`
    LowYield,
    /// Endpoints are mostly already directly connected
    Redundant,
}

/// Measured structure of one predicate sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvaluation {
    pub template: PathTemplate,
    /// Distinct (start, end) pairs reached
    pub yield_score: u64,
    /// Share of pairs joined by a single direct edge
    pub overlap_ratio: f64,
    /// Mean recency-weighted path confidence over pairs
    pub avg_path_confidence: f64,
}

impl CandidateEvaluation {
    /// Ranking score: `yield × (1 − overlap) × avg confidence`
    pub fn score(&self) -> f64 {
        self.yield_score as f64 * (1.0 - self.overlap_ratio) * self.avg_path_confidence
    }

    /// Weight stored with a saved pattern
    pub fn weight(&self) -> f64 {
        ((1.0 - self.overlap_ratio) * self.avg_path_confidence).clamp(0.0, 1.0)
    }
}

/// Predicates frequent enough to build candidates from
pub fn qualifying_predicates(stats: &[PredicateStats], min_count: u64) -> Vec<Predicate> {
    let mut predicates: Vec<Predicate> = stats
        .iter()
        .filter(|s| s.count >= min_count)
        .map(|s| s.predicate)
        .collect();
    predicates.sort();
    predicates.dedup();
    predicates
}

/// All ordered 2-sequences, plus 3-sequences for a small vocabulary
pub fn generate_candidates(vocabulary: &[Predicate], config: &DiscoveryConfig) -> Vec<PathTemplate> {
    let mut candidates = Vec::new();

    for &a in vocabulary {
        for &b in vocabulary {
            candidates.extend(PathTemplate::new(vec![a, b]).ok());
        }
    }

    if vocabulary.len() <= config.max_vocabulary_for_triples {
        for &a in vocabulary {
            for &b in vocabulary {
                for &c in vocabulary {
                    candidates.extend(PathTemplate::new(vec![a, b, c]).ok());
                }
            }
        }
    }

    candidates
}

/// Whether evaluating the template against the graph stays affordable
pub fn passes_fanout(
    template: &PathTemplate,
    fanouts: &HashMap<Predicate, f64>,
    config: &DiscoveryConfig,
) -> bool {
    let values: Vec<f64> = template
        .predicates()
        .iter()
        .map(|p| fanouts.get(p).copied().unwrap_or(0.0))
        .collect();

    let has_low = values.iter().any(|&f| f < config.low_fanout);
    let product: f64 = values.iter().product();
    let budget = config.max_fanout_per_step.powi(values.len() as i32);

    has_low && product < budget
}
