//! Entity types for the conversational knowledge graph
//!
//! Entities are canonical nodes owned by a single agent. The entity id is
//! derived from the normalized surface name, so re-registering the same
//! name always lands on the same row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Joining character used when collapsing whitespace in entity ids
pub const ID_SEPARATOR: char = '_';

/// Minimum length of a normalized entity id
pub const MIN_ID_LEN: usize = 2;

/// Maximum length of a normalized entity id
pub const MAX_ID_LEN: usize = 100;

/// A canonical entity node in an agent's graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    /// Normalized id (lowercase, trimmed, whitespace joined by `_`)
    pub id: String,
    /// Owning agent
    pub agent_id: String,
    /// Human-readable name as first registered
    pub canonical_name: String,
    /// Kind of entity
    pub entity_type: EntityType,
    /// Alternate surface forms
    pub aliases: Vec<String>,
    /// Number of times the entity has been registered
    pub mention_count: u64,
    /// When the entity was first registered
    pub first_seen: DateTime<Utc>,
    /// When the entity was last registered
    pub last_seen: DateTime<Utc>,
}

impl Entity {
    /// Create a fresh entity from a surface name
    ///
    /// Returns `None` when the name does not normalize to a usable id.
    pub fn new(
        name: &str,
        entity_type: EntityType,
        agent_id: impl Into<String>,
    ) -> Option<Self> {
        let id = normalize_name(name)?;
        let now = Utc::now();

        Some(Self {
            id,
            agent_id: agent_id.into(),
            canonical_name: name.split_whitespace().collect::<Vec<_>>().join(" "),
            entity_type,
            aliases: Vec::new(),
            mention_count: 1,
            first_seen: now,
            last_seen: now,
        })
    }

    /// Add an alias unless it duplicates the canonical name or an existing alias
    pub fn add_alias(&mut self, alias: &str) -> bool {
        let alias = alias.trim();
        if alias.is_empty() {
            return false;
        }
        let key = alias.to_lowercase();
        if self.canonical_name.to_lowercase() == key
            || self.aliases.iter().any(|a| a.to_lowercase() == key)
        {
            return false;
        }
        self.aliases.push(alias.to_string());
        true
    }

    /// Check if this entity answers to a name (canonical or alias)
    pub fn matches_name(&self, name: &str) -> bool {
        let Some(id) = normalize_name(name) else {
            return false;
        };
        if self.id == id {
            return true;
        }
        self.aliases
            .iter()
            .any(|alias| normalize_name(alias).as_deref() == Some(id.as_str()))
    }

    /// Days elapsed since the entity was last seen
    pub fn days_since_seen(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_seen).num_seconds().max(0) as f64 / 86_400.0
    }
}

/// Normalize a surface name into an entity id
///
/// Lowercases, trims, drops punctuation other than `-` and `.`, and collapses
/// runs of whitespace or underscores into a single `_`. Degenerate names
/// (too short, too long, or purely numeric punctuation) yield `None`.
pub fn normalize_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ID_SEPARATOR { ' ' } else { c })
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '.')
        .collect();

    let id = cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(&ID_SEPARATOR.to_string());

    let char_len = id.chars().count();
    if char_len < MIN_ID_LEN || char_len > MAX_ID_LEN {
        return None;
    }
    if !id.chars().any(char::is_alphabetic) {
        return None;
    }
    Some(id)
}

/// Types of conversational entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// A person ("Chris", "Dan")
    Person,
    /// A company, team or institution
    Organization,
    /// A location
    Place,
    /// An abstract idea or topic
    Concept,
    /// A concrete artifact ("dashboard", "laptop")
    Thing,
    /// A date or time reference
    Date,
}

impl EntityType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "PERSON",
            Self::Organization => "ORGANIZATION",
            Self::Place => "PLACE",
            Self::Concept => "CONCEPT",
            Self::Thing => "THING",
            Self::Date => "DATE",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "person" | "people" => Some(Self::Person),
            "organization" | "organisation" | "org" | "company" => Some(Self::Organization),
            "place" | "location" | "loc" => Some(Self::Place),
            "concept" | "topic" => Some(Self::Concept),
            "thing" | "object" | "artifact" => Some(Self::Thing),
            "date" | "time" => Some(Self::Date),
            _ => None,
        }
    }

    /// Parse leniently, falling back to `Thing` for unknown labels
    pub fn parse_or_thing(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::Thing)
    }

    /// Get all entity types
    pub fn all() -> &'static [EntityType] {
        &[
            Self::Person,
            Self::Organization,
            Self::Place,
            Self::Concept,
            Self::Thing,
            Self::Date,
        ]
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
