//! Triples (typed, directed edges) for the conversational knowledge graph
//!
//! A triple connects two entity ids through one of a closed set of
//! canonical predicates. At most one triple exists per
//! (subject, predicate, object, agent); re-insertion keeps the higher
//! confidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::normalize_name;

/// Confidence used when the caller does not supply one
pub const DEFAULT_CONFIDENCE: f64 = 1.0;

/// A directed, typed edge between two entities
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Triple {
    /// Unique identifier for the triple
    pub id: String,
    /// Owning agent
    pub agent_id: String,
    /// Subject entity id
    pub subject: String,
    /// Canonical predicate
    pub predicate: Predicate,
    /// Object entity id
    pub object: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Where the triple came from
    pub provenance: Provenance,
    /// Whether an endpoint still awaits disambiguation
    pub pending_resolution: bool,
    /// When the triple was first written
    pub created_at: DateTime<Utc>,
    /// When the triple was last reinforced
    pub updated_at: DateTime<Utc>,
}

impl Triple {
    /// Create a new triple between two already-normalized entity ids
    pub fn new(
        subject: impl Into<String>,
        predicate: Predicate,
        object: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            subject: subject.into(),
            predicate,
            object: object.into(),
            confidence: DEFAULT_CONFIDENCE,
            provenance: Provenance::default(),
            pending_resolution: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the confidence (clamped to 0.0-1.0)
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    /// Set the provenance
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// The endpoint opposite to `entity_id`, if the triple touches it
    pub fn other_end(&self, entity_id: &str) -> Option<&str> {
        if self.subject == entity_id {
            Some(&self.object)
        } else if self.object == entity_id {
            Some(&self.subject)
        } else {
            None
        }
    }

    /// Whether the triple references the entity on either side
    pub fn touches(&self, entity_id: &str) -> bool {
        self.subject == entity_id || self.object == entity_id
    }
}

/// Source of a triple
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    /// Conversational exchange the triple was mined from
    pub source_exchange_id: Option<String>,
    /// Date of that exchange, as supplied by the caller
    pub source_date: Option<String>,
}

impl Provenance {
    /// Provenance pointing at an exchange
    pub fn exchange(id: impl Into<String>, date: Option<String>) -> Self {
        Self {
            source_exchange_id: Some(id.into()),
            source_date: date,
        }
    }
}

/// Un-normalized triple as handed over by extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripleInput {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub pending_resolution: bool,
}

impl TripleInput {
    /// Create an input triple
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            confidence: None,
            pending_resolution: false,
        }
    }

    /// Set the confidence
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Mark the triple as awaiting resolution
    pub fn pending(mut self) -> Self {
        self.pending_resolution = true;
        self
    }

    /// Normalize endpoints and predicate
    ///
    /// Returns `None` for inputs that must be skipped: unusable names,
    /// unknown predicates, or self-loops.
    pub fn normalized(&self) -> Option<NormalizedTriple> {
        let subject = normalize_name(&self.subject)?;
        let object = normalize_name(&self.object)?;
        let predicate = Predicate::parse(&self.predicate)?;
        if subject == object {
            return None;
        }
        let confidence = match self.confidence {
            Some(c) if c.is_finite() => clamp_confidence(c),
            Some(_) => return None,
            None => DEFAULT_CONFIDENCE,
        };

        Some(NormalizedTriple {
            subject,
            predicate,
            object,
            confidence,
            pending_resolution: self.pending_resolution,
        })
    }
}

/// Triple input after validation
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTriple {
    pub subject: String,
    pub predicate: Predicate,
    pub object: String,
    pub confidence: f64,
    pub pending_resolution: bool,
}

/// Clamp a confidence into [0, 1]
pub fn clamp_confidence(confidence: f64) -> f64 {
    confidence.clamp(0.0, 1.0)
}

/// Canonical predicates (closed vocabulary)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Person knows person
    Knows,
    /// Agent is working on a project or artifact
    WorksOn,
    /// Person is employed at an organization
    WorksAt,
    /// Agent created an artifact
    Created,
    /// Agent uses a tool or thing
    Uses,
    /// Person manages a person, team or project
    Manages,
    /// Entity is a member of a group or organization
    MemberOf,
    /// Entity is a component of a larger entity
    PartOf,
    /// Entity is located in a place
    LocatedIn,
    /// Entity depends on another entity
    DependsOn,
    /// Person prefers something
    Prefers,
    /// Generic association
    RelatedTo,
}

impl Predicate {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Knows => "knows",
            Self::WorksOn => "works_on",
            Self::WorksAt => "works_at",
            Self::Created => "created",
            Self::Uses => "uses",
            Self::Manages => "manages",
            Self::MemberOf => "member_of",
            Self::PartOf => "part_of",
            Self::LocatedIn => "located_in",
            Self::DependsOn => "depends_on",
            Self::Prefers => "prefers",
            Self::RelatedTo => "related_to",
        }
    }

    /// Parse from string, accepting spaces or dashes in place of underscores
    pub fn parse(s: &str) -> Option<Self> {
        let key: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();

        match key.as_str() {
            "knows" | "know" => Some(Self::Knows),
            "works_on" | "working_on" => Some(Self::WorksOn),
            "works_at" | "employed_at" | "works_for" => Some(Self::WorksAt),
            "created" | "built" | "made" => Some(Self::Created),
            "uses" | "use" | "using" => Some(Self::Uses),
            "manages" | "leads" => Some(Self::Manages),
            "member_of" | "belongs_to" => Some(Self::MemberOf),
            "part_of" => Some(Self::PartOf),
            "located_in" | "lives_in" | "based_in" => Some(Self::LocatedIn),
            "depends_on" | "requires" => Some(Self::DependsOn),
            "prefers" | "likes" => Some(Self::Prefers),
            "related_to" | "relates_to" => Some(Self::RelatedTo),
            _ => None,
        }
    }

    /// Get all predicates
    pub fn all() -> &'static [Predicate] {
        &[
            Self::Knows,
            Self::WorksOn,
            Self::WorksAt,
            Self::Created,
            Self::Uses,
            Self::Manages,
            Self::MemberOf,
            Self::PartOf,
            Self::LocatedIn,
            Self::DependsOn,
            Self::Prefers,
            Self::RelatedTo,
        ]
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_vocabulary_is_closed() {
        assert_eq!(Predicate::all().len(), 12);
        for p in Predicate::all() {
            assert_eq!(Predicate::parse(p.as_str()), Some(*p));
        }
        assert_eq!(Predicate::parse("Works On"), Some(Predicate::WorksOn));
        assert_eq!(Predicate::parse("works-at"), Some(Predicate::WorksAt));
        assert_eq!(Predicate::parse("hates"), None);
    }

    #[test]
    fn test_triple_input_normalization() {
        let input = TripleInput::new("Chris", "knows", "Dan").with_confidence(0.6);
        let normalized = input.normalized().unwrap();

        assert_eq!(normalized.subject, "chris");
        assert_eq!(normalized.object, "dan");
        assert_eq!(normalized.predicate, Predicate::Knows);
        assert_eq!(normalized.confidence, 0.6);
    }

    #[test]
    fn test_triple_input_rejects_malformed() {
        assert!(TripleInput::new("Chris", "adores", "Dan").normalized().is_none());
        assert!(TripleInput::new("", "knows", "Dan").normalized().is_none());
        assert!(TripleInput::new("Chris", "knows", "chris").normalized().is_none());
        assert!(
            TripleInput::new("Chris", "knows", "Dan")
                .with_confidence(f64::NAN)
                .normalized()
                .is_none()
        );
    }

    #[test]
    fn test_confidence_defaults_and_clamps() {
        let input = TripleInput::new("Chris", "knows", "Dan");
        assert_eq!(input.normalized().unwrap().confidence, DEFAULT_CONFIDENCE);

        let input = TripleInput::new("Chris", "knows", "Dan").with_confidence(1.7);
        assert_eq!(input.normalized().unwrap().confidence, 1.0);

        let triple = Triple::new("chris", Predicate::Knows, "dan", "main").with_confidence(-0.5);
        assert_eq!(triple.confidence, 0.0);
    }

    #[test]
    fn test_other_end() {
        let triple = Triple::new("chris", Predicate::Knows, "dan", "main");

        assert_eq!(triple.other_end("chris"), Some("dan"));
        assert_eq!(triple.other_end("dan"), Some("chris"));
        assert_eq!(triple.other_end("eve"), None);
        assert!(triple.touches("dan"));
    }
}
