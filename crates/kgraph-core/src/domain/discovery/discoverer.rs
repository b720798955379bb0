//! Meta-path discovery and validation
//!
//! Mines an agent's triples for predicate sequences that connect entity
//! pairs not already joined by a direct edge. The pipeline runs off the
//! request path:
//!
//! 1. candidate generation from predicate statistics
//! 2. fanout filter bounding evaluation cost
//! 3. structural viability (sampled reachable pairs, recency weighted)
//! 4. novelty (share of pairs already directly connected)
//!
//! Cancellation is checked between candidates. Each pattern save is its own
//! write, so cancelling never leaves a partially saved pattern.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::graph::{MetaPath, PathTemplate, TripleStore};
use crate::error::Result;

use super::candidate::{
    CandidateEvaluation, DiscoveryConfig, Verdict, generate_candidates, passes_fanout,
    qualifying_predicates,
};

/// Rows fetched per sampled pair when matching a candidate
const MATCH_OVERSAMPLE: usize = 4;

/// Summary of one discovery run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Candidates generated from qualifying predicates (not yet stored)
    pub candidates: usize,
    /// Candidates that passed the fanout filter
    pub affordable: usize,
    /// Candidates evaluated against the graph
    pub evaluated: usize,
    pub rejected_low_yield: usize,
    pub rejected_redundant: usize,
    /// Patterns saved in this run
    pub saved: Vec<String>,
    /// Accepted candidates left unsaved for lack of free slots
    pub over_capacity: usize,
    pub cancelled: bool,
}

/// Summary of one validation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Discovered patterns re-evaluated
    pub checked: usize,
    /// Patterns still viable, with refreshed yield and overlap
    pub refreshed: usize,
    /// Patterns retired
    pub deactivated: Vec<String>,
    pub cancelled: bool,
}

/// Pattern discovery over a triple store
pub struct PatternDiscoverer<R: TripleStore> {
    repository: Arc<R>,
    config: DiscoveryConfig,
}

impl<R: TripleStore> PatternDiscoverer<R> {
    /// Create a discoverer
    pub fn new(repository: Arc<R>, config: DiscoveryConfig) -> Self {
        Self { repository, config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Measure yield, overlap and path confidence of a predicate sequence
    pub async fn evaluate(
        &self,
        template: &PathTemplate,
        agent_id: &str,
    ) -> Result<CandidateEvaluation> {
        let matches = self
            .repository
            .match_template(
                template,
                agent_id,
                None,
                self.config.sample_size.saturating_mul(MATCH_OVERSAMPLE),
            )
            .await?;

        let now = Utc::now();
        let mut best: HashMap<(String, String), f64> = HashMap::new();
        for m in &matches {
            let key = (m.start().to_string(), m.end().to_string());
            if !best.contains_key(&key) && best.len() >= self.config.sample_size {
                continue;
            }

            let confidence: f64 = m
                .confidences
                .iter()
                .zip(&m.updated_at)
                .map(|(c, updated)| {
                    let days = (now - *updated).num_seconds() as f64 / 86_400.0;
                    c * self.config.recency_factor(days)
                })
                .product();

            let entry = best.entry(key).or_insert(0.0);
            *entry = entry.max(confidence);
        }

        let pairs = best.len();
        if pairs == 0 {
            return Ok(CandidateEvaluation {
                template: template.clone(),
                yield_score: 0,
                overlap_ratio: 0.0,
                avg_path_confidence: 0.0,
            });
        }

        let mut direct = 0usize;
        for (start, end) in best.keys() {
            if self.repository.has_direct_edge(start, end, agent_id).await? {
                direct += 1;
            }
        }

        Ok(CandidateEvaluation {
            template: template.clone(),
            yield_score: pairs as u64,
            overlap_ratio: direct as f64 / pairs as f64,
            avg_path_confidence: best.values().sum::<f64>() / pairs as f64,
        })
    }

    /// Run the four-stage pipeline and save the best candidates into free slots
    pub async fn discover(
        &self,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport::default();

        let stats = self.repository.get_predicate_stats(agent_id).await?;
        let vocabulary = qualifying_predicates(&stats, self.config.min_predicate_count);
        let fanouts: HashMap<_, _> = stats.iter().map(|s| (s.predicate, s.fanout())).collect();

        let stored: HashSet<String> = self
            .repository
            .list_patterns(agent_id, true)
            .await?
            .iter()
            .map(|p| p.template.key())
            .collect();

        let candidates: Vec<PathTemplate> = generate_candidates(&vocabulary, &self.config)
            .into_iter()
            .filter(|t| !stored.contains(&t.key()))
            .collect();
        report.candidates = candidates.len();

        let affordable: Vec<PathTemplate> = candidates
            .into_iter()
            .filter(|t| passes_fanout(t, &fanouts, &self.config))
            .collect();
        report.affordable = affordable.len();

        let mut accepted = Vec::new();
        for template in &affordable {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let evaluation = self.evaluate(template, agent_id).await?;
            report.evaluated += 1;
            let verdict = self.config.verdict(&evaluation);
            debug!(
                pattern = %template,
                yield_score = evaluation.yield_score,
                overlap_ratio = evaluation.overlap_ratio,
                verdict = ?verdict,
                "Candidate evaluated"
            );
            match verdict {
                Verdict::Accepted => accepted.push(evaluation),
                Verdict::LowYield => report.rejected_low_yield += 1,
                Verdict::Redundant => report.rejected_redundant += 1,
            }
        }

        accepted.sort_by(|a, b| {
            b.score()
                .total_cmp(&a.score())
                .then_with(|| a.template.key().cmp(&b.template.key()))
        });

        let active = self.repository.get_active_patterns(agent_id).await?.len();
        let free = self.config.max_active_patterns.saturating_sub(active);
        report.over_capacity = accepted.len().saturating_sub(free);

        for evaluation in accepted.into_iter().take(free) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let pattern = MetaPath::discovered(
                agent_id,
                evaluation.template.clone(),
                evaluation.weight(),
                evaluation.yield_score,
                evaluation.overlap_ratio,
            );
            self.repository.save_pattern(&pattern).await?;
            report.saved.push(evaluation.template.to_string());
        }

        info!(
            agent_id = %agent_id,
            candidates = report.candidates,
            evaluated = report.evaluated,
            saved = report.saved.len(),
            cancelled = report.cancelled,
            "Pattern discovery complete"
        );
        Ok(report)
    }

    /// Re-check discovered patterns and retire the ones that stopped adding value
    pub async fn validate_patterns(
        &self,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let patterns = self.repository.get_active_patterns(agent_id).await?;

        for pattern in patterns.into_iter().filter(|p| !p.is_static()) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let evaluation = self.evaluate(&pattern.template, agent_id).await?;
            report.checked += 1;

            if self.config.verdict(&evaluation) == Verdict::Accepted {
                let refreshed = MetaPath {
                    weight: evaluation.weight(),
                    yield_score: evaluation.yield_score,
                    overlap_ratio: evaluation.overlap_ratio,
                    last_validated: Some(Utc::now()),
                    ..pattern
                };
                self.repository.save_pattern(&refreshed).await?;
                report.refreshed += 1;
            } else if self
                .repository
                .deactivate_pattern(&pattern.template, agent_id)
                .await?
            {
                report.deactivated.push(pattern.template.to_string());
            }
        }

        info!(
            agent_id = %agent_id,
            checked = report.checked,
            deactivated = report.deactivated.len(),
            cancelled = report.cancelled,
            "Pattern validation complete"
        );
        Ok(report)
    }
}
