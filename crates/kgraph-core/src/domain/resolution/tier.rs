//! Resolution outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Candidates shown in a disambiguation hint
pub const MAX_ASK_CANDIDATES: usize = 3;

/// Outcome tier of a single resolution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    /// Mention normalizes to an existing entity id
    Exact,
    /// No candidates; the mention becomes a new entity
    New,
    /// Best candidate accepted automatically
    Assume,
    /// Ambiguous; the caller should ask the user
    Ask,
    /// Plausible but unconfirmed; written with `pending_resolution`
    Defer,
}

impl ResolutionTier {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::New => "new",
            Self::Assume => "assume",
            Self::Ask => "ask",
            Self::Defer => "defer",
        }
    }

    /// Whether writes for this mention must be flagged pending
    pub fn needs_pending(&self) -> bool {
        matches!(self, Self::Ask | Self::Defer)
    }
}

impl std::fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scored candidate entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub entity_id: String,
    pub canonical_name: String,
    pub score: f64,
    pub mention_count: u64,
    pub last_seen: DateTime<Utc>,
}

/// Result of resolving one mention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Mention as given
    pub mention: String,
    pub tier: ResolutionTier,
    /// Entity id the mention should be written under
    ///
    /// The matched entity for `exact` and `assume`; the mention's own id
    /// otherwise. `None` when the mention is unusable.
    pub entity_id: Option<String>,
    pub confidence: f64,
    /// Scored candidates, best first
    pub candidates: Vec<Candidate>,
    /// Disambiguation hint for the `ask` tier
    pub note: Option<String>,
}

impl Resolution {
    pub(crate) fn exact(mention: &str, entity_id: String) -> Self {
        Self {
            mention: mention.to_string(),
            tier: ResolutionTier::Exact,
            entity_id: Some(entity_id),
            confidence: 1.0,
            candidates: Vec::new(),
            note: None,
        }
    }

    pub(crate) fn new_entity(mention: &str, entity_id: Option<String>) -> Self {
        Self {
            mention: mention.to_string(),
            tier: ResolutionTier::New,
            entity_id,
            confidence: 1.0,
            candidates: Vec::new(),
            note: None,
        }
    }

    /// Whether the mention was mapped onto a different existing entity
    pub fn is_rewrite(&self) -> bool {
        self.tier == ResolutionTier::Assume
    }
}

/// Human-readable disambiguation hint
pub fn disambiguation_note(mention: &str, candidates: &[Candidate]) -> String {
    let names: Vec<&str> = candidates
        .iter()
        .take(MAX_ASK_CANDIDATES)
        .map(|c| c.canonical_name.as_str())
        .collect();

    match names.as_slice() {
        [] => format!("\"{}\" is new to me.", mention),
        [only] => format!("Is \"{}\" the same as {}?", mention, only),
        [init @ .., last] => format!(
            "Which \"{}\" do you mean: {} or {}?",
            mention,
            init.join(", "),
            last
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str) -> Candidate {
        Candidate {
            entity_id: name.to_lowercase().replace(' ', "_"),
            canonical_name: name.to_string(),
            score: 0.5,
            mention_count: 1,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_tier_pending_policy() {
        assert!(ResolutionTier::Ask.needs_pending());
        assert!(ResolutionTier::Defer.needs_pending());
        assert!(!ResolutionTier::Assume.needs_pending());
        assert!(!ResolutionTier::Exact.needs_pending());
        assert_eq!(ResolutionTier::Defer.to_string(), "defer");
    }

    #[test]
    fn test_disambiguation_note() {
        assert_eq!(
            disambiguation_note("bob", &[candidate("Bob Martinez")]),
            "Is \"bob\" the same as Bob Martinez?"
        );
        assert_eq!(
            disambiguation_note(
                "bob",
                &[
                    candidate("Bob Martinez"),
                    candidate("Bob Stone"),
                    candidate("Bobby Tables"),
                    candidate("Bob Dylan"),
                ]
            ),
            "Which \"bob\" do you mean: Bob Martinez, Bob Stone or Bobby Tables?"
        );
    }
}
