//! Resolution: from manifest roots to a fully pinned, hash-carrying
//! closure per section.
//!
//! The engine in [`resolver`] owns all decision logic and runs it
//! single-threaded; IO goes through a [`MetadataProvider`], with fetches
//! scheduled in parallel and memoized per source. The same manifest,
//! configuration, and provider answers always produce the same resolution.

pub use error::{ConflictError, NoCandidateError, RequirementChain, ResolveError};
pub use provider::{Candidate, MetadataProvider};
pub use registry::{DefaultProvider, RegistryClient};
pub use resolver::{Resolution, Resolver};
pub use source::PinnedFetcher;

mod cache;
mod candidate_selector;
mod error;
mod provider;
mod registry;
mod resolver;
mod scheduler;
mod source;

/// Resolution knobs. Everything that shapes a run is explicit here;
/// the engine never reads ambient process state.
#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    /// Concurrent fetch workers. Affects throughput only: `1` fetches
    /// strictly sequentially, and every value produces the same resolution.
    pub workers: usize,
    /// Additional attempts for transient fetch failures.
    pub retries: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            retries: 2,
        }
    }
}
