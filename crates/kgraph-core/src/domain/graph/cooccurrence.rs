//! Co-occurrence pairs
//!
//! An undirected, order-normalized pair of entity ids that appeared in the
//! same exchange, with a running count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::normalize_name;

/// A co-occurrence record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoOccurrence {
    pub entity_a: String,
    pub entity_b: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

impl CoOccurrence {
    /// The member of the pair that is not `entity_id`
    pub fn partner_of(&self, entity_id: &str) -> Option<&str> {
        if self.entity_a == entity_id {
            Some(&self.entity_b)
        } else if self.entity_b == entity_id {
            Some(&self.entity_a)
        } else {
            None
        }
    }
}

/// Normalize a pair of names into an ordered id pair
///
/// Returns `None` for unusable names or a pair of identical ids.
pub fn ordered_pair(a: &str, b: &str) -> Option<(String, String)> {
    let a = normalize_name(a)?;
    let b = normalize_name(b)?;
    match a.cmp(&b) {
        std::cmp::Ordering::Less => Some((a, b)),
        std::cmp::Ordering::Greater => Some((b, a)),
        std::cmp::Ordering::Equal => None,
    }
}
