//! Bounded-parallel fetch execution with deterministic result ordering.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use petrel_normalize::PackageName;
use petrel_spec::Requirement;

use crate::cache::{FetchCache, FetchOutcome, Fetched, SourceKey};
use crate::provider::MetadataProvider;
use crate::ResolverConfig;

/// A unit of fetch work.
#[derive(Debug, Clone)]
pub(crate) enum FetchRequest {
    /// Query an index for every version of a package.
    Index(PackageName),
    /// Query a pinned source for its single candidate.
    Pinned {
        key: SourceKey,
        requirement: Requirement,
    },
}

impl FetchRequest {
    pub(crate) fn key(&self) -> SourceKey {
        match self {
            Self::Index(name) => SourceKey::Index(name.clone()),
            Self::Pinned { key, .. } => key.clone(),
        }
    }
}

impl Display for FetchRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(name) => write!(f, "index metadata for {name}"),
            Self::Pinned { key, .. } => write!(f, "pinned source {key}"),
        }
    }
}

/// Runs independent fetches against a [`MetadataProvider`] with a bounded
/// worker count, returning outcomes in submission order regardless of
/// completion order. Concurrency is a throughput knob only; callers never
/// observe it.
///
/// Transient failures are retried a bounded number of times before they
/// surface. The engine sees only the final outcome per request.
pub(crate) struct FetchScheduler<'a, Provider: MetadataProvider> {
    provider: &'a Provider,
    cache: &'a FetchCache,
    config: &'a ResolverConfig,
}

impl<'a, Provider: MetadataProvider> FetchScheduler<'a, Provider> {
    pub(crate) fn new(
        provider: &'a Provider,
        cache: &'a FetchCache,
        config: &'a ResolverConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            config,
        }
    }

    /// Execute a batch of fetches. `workers == 1` is strictly sequential.
    ///
    /// If the caller abandons the batch because an early outcome is fatal,
    /// in-flight fetches still run to completion through the cache; their
    /// results are discarded, not cancelled mid-write.
    pub(crate) async fn schedule(&self, requests: Vec<FetchRequest>) -> Vec<Arc<FetchOutcome>> {
        let workers = self.config.workers.max(1);
        futures::stream::iter(requests)
            .map(|request| self.execute(request))
            .buffered(workers)
            .collect()
            .await
    }

    /// Execute a single fetch, coalescing with any identical in-flight one.
    pub(crate) async fn fetch_one(&self, request: FetchRequest) -> Arc<FetchOutcome> {
        self.execute(request).await
    }

    async fn execute(&self, request: FetchRequest) -> Arc<FetchOutcome> {
        let key = request.key();
        if self.cache.register(key.clone()) {
            debug!("Fetching {request}");
            let outcome = Arc::new(self.fetch_with_retries(&request).await);
            self.cache.done(key, outcome.clone());
            outcome
        } else {
            self.cache.wait(&key).await
        }
    }

    async fn fetch_with_retries(&self, request: &FetchRequest) -> FetchOutcome {
        let mut attempt = 0;
        loop {
            let result = match request {
                FetchRequest::Index(name) => self
                    .provider
                    .index_candidates(name)
                    .await
                    .map(Fetched::Candidates),
                FetchRequest::Pinned { requirement, .. } => self
                    .provider
                    .pinned_candidate(requirement)
                    .await
                    .map(Fetched::Pinned),
            };
            match result {
                Err(err) if err.is_transient() && attempt < self.config.retries => {
                    attempt += 1;
                    warn!("Retrying {request} after transient failure (attempt {attempt}): {err}");
                }
                result => return result,
            }
        }
    }
}
