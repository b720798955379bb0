//! Meta-path patterns
//!
//! A meta-path is a fixed sequence of 2-3 predicates used as a reusable
//! multi-hop traversal template. Static patterns are seeded from
//! configuration; discovered patterns come out of the discovery pipeline
//! and are retired (deactivated, never deleted) once they stop adding value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::triple::Predicate;

/// Shortest accepted predicate sequence
pub const MIN_PATTERN_LEN: usize = 2;

/// Longest accepted predicate sequence
pub const MAX_PATTERN_LEN: usize = 3;

/// A validated, ordered predicate sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Predicate>", into = "Vec<Predicate>")]
pub struct PathTemplate {
    predicates: Vec<Predicate>,
}

impl PathTemplate {
    /// Build a template, rejecting sequences outside 2-3 predicates
    pub fn new(predicates: Vec<Predicate>) -> Result<Self> {
        if !(MIN_PATTERN_LEN..=MAX_PATTERN_LEN).contains(&predicates.len()) {
            return Err(Error::InvalidPattern(format!(
                "expected {}-{} predicates, got {}",
                MIN_PATTERN_LEN,
                MAX_PATTERN_LEN,
                predicates.len()
            )));
        }
        Ok(Self { predicates })
    }

    /// Parse from predicate names
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let predicates = names
            .iter()
            .map(|n| {
                Predicate::parse(n.as_ref()).ok_or_else(|| {
                    Error::InvalidPattern(format!("unknown predicate '{}'", n.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(predicates)
    }

    /// Parse the storage key produced by [`PathTemplate::key`]
    pub fn from_key(key: &str) -> Result<Self> {
        let names: Vec<&str> = key.split(',').filter(|s| !s.is_empty()).collect();
        Self::parse(&names)
    }

    /// Ordered predicates
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Number of hops
    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// Always false; templates hold at least two predicates
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Stable key used for per-agent uniqueness
    pub fn key(&self) -> String {
        self.predicates
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl TryFrom<Vec<Predicate>> for PathTemplate {
    type Error = Error;

    fn try_from(predicates: Vec<Predicate>) -> Result<Self> {
        Self::new(predicates)
    }
}

impl From<PathTemplate> for Vec<Predicate> {
    fn from(template: PathTemplate) -> Self {
        template.predicates
    }
}

impl std::fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.predicates.iter().map(|p| p.as_str()).collect();
        write!(f, "{}", names.join(" -> "))
    }
}

/// Where a pattern came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Seeded from configuration
    Static,
    /// Mined by the discovery pipeline
    Discovered,
}

impl PatternType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Discovered => "discovered",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(Self::Static),
            "discovered" => Some(Self::Discovered),
            _ => None,
        }
    }
}

/// A stored meta-path pattern
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaPath {
    pub id: String,
    pub agent_id: String,
    pub template: PathTemplate,
    pub pattern_type: PatternType,
    /// Learned weight applied to path scores
    pub weight: f64,
    /// Distinct entity pairs reachable through the pattern
    pub yield_score: u64,
    /// Fraction of those pairs already directly connected
    pub overlap_ratio: f64,
    pub active: bool,
    pub last_validated: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MetaPath {
    /// A static pattern seeded from configuration
    pub fn seeded(agent_id: impl Into<String>, template: PathTemplate, weight: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            template,
            pattern_type: PatternType::Static,
            weight: weight.clamp(0.0, 1.0),
            yield_score: 0,
            overlap_ratio: 0.0,
            active: true,
            last_validated: None,
            created_at: Utc::now(),
        }
    }

    /// A pattern produced by discovery
    pub fn discovered(
        agent_id: impl Into<String>,
        template: PathTemplate,
        weight: f64,
        yield_score: u64,
        overlap_ratio: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            template,
            pattern_type: PatternType::Discovered,
            weight: weight.clamp(0.0, 1.0),
            yield_score,
            overlap_ratio,
            active: true,
            last_validated: Some(now),
            created_at: now,
        }
    }

    /// Whether the pattern was seeded rather than discovered
    pub fn is_static(&self) -> bool {
        self.pattern_type == PatternType::Static
    }
}
