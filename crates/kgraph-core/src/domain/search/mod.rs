//! Graph search
//!
//! Answers "which past exchanges relate to these entities?" using direct
//! links, recursive traversal with hop decay, and meta-path templates.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kgraph_core::domain::search::{GraphSearcher, SearchConfig, SearchQuery};
//!
//! let searcher = GraphSearcher::new(store, SearchConfig::default());
//! let response = searcher.search(&SearchQuery::new("main", ["chris"])).await?;
//! for hit in &response.exchanges {
//!     println!("{} {:.3}", hit.id, hit.score);
//! }
//! ```

mod query;
mod searcher;

pub use query::{EntityContext, ExchangeHit, SearchConfig, SearchQuery, SearchResponse};
pub use searcher::GraphSearcher;
