//! Conversational entity resolution
//!
//! Decides whether a mention names an existing entity, a new one, or needs
//! disambiguation. Each attempt ends in one of five tiers:
//!
//! - `exact`: the normalized mention is already an entity id
//! - `new`: nothing resembles it
//! - `assume`: one candidate is convincing enough to accept
//! - `ask`: ambiguous; a disambiguation hint is produced
//! - `defer`: plausible; writes are flagged `pending_resolution`

mod resolver;
mod tier;

pub use resolver::{EntityResolver, PendingReport, ResolverConfig};
pub use tier::{Candidate, MAX_ASK_CANDIDATES, Resolution, ResolutionTier, disambiguation_note};
