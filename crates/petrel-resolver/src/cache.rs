//! Write-once memoization of fetch outcomes, keyed by source identity.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use petrel_normalize::PackageName;
use petrel_spec::RequirementSource;

use crate::error::ResolveError;
use crate::provider::Candidate;

/// The identity of a fetch within one resolution run.
///
/// Index lookups are keyed by package name; pinned sources by their kind and
/// location, so two requirements naming the same checkout share one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum SourceKey {
    Index(PackageName),
    Pinned(String),
}

impl SourceKey {
    /// The key for a pinned (VCS, URL, path) source, or `None` for a
    /// registry source.
    pub(crate) fn pinned(source: &RequirementSource) -> Option<Self> {
        match source {
            RequirementSource::Registry { .. } => None,
            RequirementSource::Vcs {
                kind,
                url,
                reference,
                ..
            } => Some(Self::Pinned(match reference {
                Some(reference) => format!("{kind}+{url}@{reference}"),
                None => format!("{kind}+{url}"),
            })),
            RequirementSource::Url { url } => Some(Self::Pinned(url.clone())),
            RequirementSource::Path { path, .. } => {
                Some(Self::Pinned(path.display().to_string()))
            }
        }
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(name) => write!(f, "index:{name}"),
            Self::Pinned(location) => write!(f, "pinned:{location}"),
        }
    }
}

/// A completed fetch.
#[derive(Debug)]
pub(crate) enum Fetched {
    /// Index candidates, newest first.
    Candidates(Vec<Candidate>),
    /// The single candidate of a pinned source.
    Pinned(Candidate),
}

pub(crate) type FetchOutcome = Result<Fetched, ResolveError>;

/// Coalesces concurrent fetches for the same key into a single underlying
/// query. Every waiter receives the same outcome, success or failure, and a
/// key is only ever written once.
#[derive(Default)]
pub(crate) struct FetchCache {
    entries: DashMap<SourceKey, Entry>,
}

enum Entry {
    Waiting(Arc<Notify>),
    Filled(Arc<FetchOutcome>),
}

impl FetchCache {
    /// Claim a key for fetching.
    ///
    /// Returns `true` if the caller now owns the fetch and must eventually
    /// call [`FetchCache::done`]; `false` if the fetch is already running or
    /// finished, in which case [`FetchCache::wait`] yields the outcome.
    pub(crate) fn register(&self, key: SourceKey) -> bool {
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Entry::Waiting(Arc::new(Notify::new())));
                true
            }
        }
    }

    /// Publish the outcome of a fetch claimed via [`FetchCache::register`].
    pub(crate) fn done(&self, key: SourceKey, outcome: Arc<FetchOutcome>) {
        if let Some(Entry::Waiting(notify)) = self.entries.insert(key, Entry::Filled(outcome)) {
            notify.notify_waiters();
        }
    }

    /// Wait for the outcome of a registered fetch.
    ///
    /// Hangs if the key was never registered, or registered without a
    /// matching [`FetchCache::done`].
    pub(crate) async fn wait(&self, key: &SourceKey) -> Arc<FetchOutcome> {
        loop {
            let notify = {
                let entry = self
                    .entries
                    .get(key)
                    .expect("fetches are registered before they are awaited");
                match entry.value() {
                    Entry::Filled(outcome) => return outcome.clone(),
                    Entry::Waiting(notify) => notify.clone(),
                }
            };
            notify.notified().await;
        }
    }

    /// The outcome of a finished fetch, if any.
    pub(crate) fn get(&self, key: &SourceKey) -> Option<Arc<FetchOutcome>> {
        let entry = self.entries.get(key)?;
        match entry.value() {
            Entry::Filled(outcome) => Some(outcome.clone()),
            Entry::Waiting(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    use petrel_spec::Version;

    #[tokio::test]
    async fn waiters_share_one_outcome() {
        let cache = Arc::new(FetchCache::default());
        let key = SourceKey::Index(PackageName::new("requests").unwrap());

        assert!(cache.register(key.clone()));
        // A second registration loses the claim.
        assert!(!cache.register(key.clone()));

        let waiter = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.wait(&key).await })
        };

        let candidate = Candidate::new(
            PackageName::new("requests").unwrap(),
            Version::from_str("2.18.4").unwrap(),
        );
        cache.done(key.clone(), Arc::new(Ok(Fetched::Pinned(candidate))));

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome.as_ref(), Ok(Fetched::Pinned(_))));
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn pinned_keys_ignore_the_registry() {
        use petrel_spec::VersionSpecifiers;

        let registry = RequirementSource::Registry {
            specifiers: VersionSpecifiers::any(),
        };
        assert!(SourceKey::pinned(&registry).is_none());

        let url = RequirementSource::Url {
            url: "https://example.org/pkg-1.0.tar.gz".to_string(),
        };
        assert_eq!(
            SourceKey::pinned(&url),
            Some(SourceKey::Pinned(
                "https://example.org/pkg-1.0.tar.gz".to_string()
            ))
        );
    }
}
