//! Scoped similarity search.
//!
//! - [`scope`]: scope selector parsing and predicate resolution
//! - [`orchestrator`]: k-NN query, hydration, threshold, pagination
//! - [`types`]: query and result types shared with the service boundary

pub mod orchestrator;
pub mod scope;
pub mod types;

pub use orchestrator::{SearchOrchestrator, SearchSettings};
pub use scope::{ScopeResolver, ScopeSelector};
pub use types::{Caller, SearchFilters, SearchHit, SearchQuery, SearchResult};
