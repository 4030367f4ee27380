//! Package index queries over HTTP.
//!
//! Indexes serve one JSON document per package listing every version with
//! its artifact digests and declared requirements. Multiple sources are
//! consulted in manifest order and merged; a version listed by several
//! sources must carry identical digests everywhere.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::str::FromStr;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use petrel_manifest::Source;
use petrel_normalize::{ExtraName, PackageName};
use petrel_spec::{MarkerTree, Requirement, RequirementSource, Version, VersionSpecifiers};

use crate::error::ResolveError;
use crate::provider::{Candidate, MetadataProvider};
use crate::source::PinnedFetcher;

/// The per-package index document.
#[derive(Debug, Deserialize)]
pub(crate) struct IndexDocument {
    name: String,
    versions: Vec<VersionEntry>,
}

#[derive(Debug, Deserialize)]
struct VersionEntry {
    version: String,
    #[serde(default)]
    hashes: Vec<String>,
    #[serde(default)]
    requires: Vec<WireRequirement>,
    #[serde(default)]
    extras: Vec<String>,
}

/// A requirement as spelled in index and source metadata.
#[derive(Debug, Deserialize)]
pub(crate) struct WireRequirement {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    markers: Option<String>,
    #[serde(default)]
    extras: Vec<String>,
}

impl WireRequirement {
    pub(crate) fn into_requirement(self, location: &str) -> Result<Requirement, ResolveError> {
        let malformed =
            |reason: String| ResolveError::Metadata(location.to_string(), reason);
        let name = PackageName::new(&self.name).map_err(|err| malformed(err.to_string()))?;
        let specifiers = match &self.version {
            Some(constraint) => {
                VersionSpecifiers::from_str(constraint).map_err(|err| malformed(err.to_string()))?
            }
            None => VersionSpecifiers::any(),
        };
        let mut extras = BTreeSet::new();
        for extra in &self.extras {
            extras.insert(ExtraName::new(extra).map_err(|err| malformed(err.to_string()))?);
        }
        let marker = self
            .markers
            .as_deref()
            .map(MarkerTree::from_str)
            .transpose()
            .map_err(|err| malformed(err.to_string()))?;
        Ok(Requirement {
            name: Some(name),
            extras,
            marker,
            source: RequirementSource::Registry { specifiers },
        })
    }
}

impl VersionEntry {
    fn into_candidate(self, name: &PackageName, location: &str) -> Result<Candidate, ResolveError> {
        let malformed =
            |reason: String| ResolveError::Metadata(location.to_string(), reason);
        let version =
            Version::from_str(&self.version).map_err(|err| malformed(err.to_string()))?;
        let mut requires = Vec::with_capacity(self.requires.len());
        for wire in self.requires {
            requires.push(wire.into_requirement(location)?);
        }
        let mut provided_extras = BTreeSet::new();
        for extra in &self.extras {
            provided_extras
                .insert(ExtraName::new(extra).map_err(|err| malformed(err.to_string()))?);
        }
        Ok(Candidate {
            name: name.clone(),
            version,
            hashes: self.hashes,
            requires,
            provided_extras,
            reference: None,
        })
    }
}

/// Queries the configured indexes for package metadata.
pub struct RegistryClient {
    sources: Vec<(Source, reqwest::Client)>,
}

impl RegistryClient {
    /// Build one HTTP client per configured source.
    pub fn new(sources: &[Source]) -> Result<Self, ResolveError> {
        let mut clients = Vec::with_capacity(sources.len());
        for source in sources {
            let client = reqwest::Client::builder()
                .danger_accept_invalid_certs(!source.verify_ssl)
                .build()
                .map_err(|err| ResolveError::SourceUnavailable {
                    location: source.url.clone(),
                    reason: err.to_string(),
                })?;
            clients.push((source.clone(), client));
        }
        Ok(Self { sources: clients })
    }

    /// All versions of a package across the configured sources, newest
    /// first. A package unknown to every source is an empty list.
    pub(crate) async fn index_candidates(
        &self,
        name: &PackageName,
    ) -> Result<Vec<Candidate>, ResolveError> {
        let mut merged: BTreeMap<Version, Candidate> = BTreeMap::new();
        for (source, client) in &self.sources {
            let url = format!("{}/{name}/json", source.url.trim_end_matches('/'));
            debug!("Querying {url}");
            let response = client.get(&url).send().await.map_err(|err| {
                ResolveError::SourceUnavailable {
                    location: url.clone(),
                    reason: err.to_string(),
                }
            })?;
            if response.status() == StatusCode::NOT_FOUND {
                continue;
            }
            let response =
                response
                    .error_for_status()
                    .map_err(|err| ResolveError::SourceUnavailable {
                        location: url.clone(),
                        reason: err.to_string(),
                    })?;
            let document: IndexDocument = response
                .json()
                .await
                .map_err(|err| ResolveError::Metadata(url.clone(), err.to_string()))?;
            let reported = PackageName::new(&document.name)
                .map_err(|err| ResolveError::Metadata(url.clone(), err.to_string()))?;
            if reported != *name {
                return Err(ResolveError::NameMismatch {
                    given: name.clone(),
                    metadata: reported,
                });
            }
            let mut candidates = Vec::with_capacity(document.versions.len());
            for entry in document.versions {
                candidates.push(entry.into_candidate(name, &url)?);
            }
            merge_candidates(&mut merged, candidates)?;
        }
        Ok(merged.into_values().rev().collect())
    }
}

/// Merge one source's candidates into the accumulated version map.
///
/// The first source to list a version wins its metadata; a later source
/// listing the same version must agree on the artifact digests, anything
/// else means the mirrors have diverged and no pin can be trusted.
fn merge_candidates(
    merged: &mut BTreeMap<Version, Candidate>,
    candidates: Vec<Candidate>,
) -> Result<(), ResolveError> {
    for candidate in candidates {
        match merged.get(&candidate.version) {
            None => {
                merged.insert(candidate.version.clone(), candidate);
            }
            Some(existing) => {
                if existing.hashes != candidate.hashes {
                    return Err(ResolveError::HashMismatch {
                        name: candidate.name.clone(),
                        version: candidate.version.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// The production [`MetadataProvider`]: indexes for registry requirements,
/// direct fetches for pinned ones.
pub struct DefaultProvider {
    registry: RegistryClient,
    pinned: PinnedFetcher,
}

impl DefaultProvider {
    pub fn new(sources: &[Source]) -> Result<Self, ResolveError> {
        Ok(Self {
            registry: RegistryClient::new(sources)?,
            pinned: PinnedFetcher::new(),
        })
    }
}

impl MetadataProvider for DefaultProvider {
    fn index_candidates<'io>(
        &'io self,
        name: &'io PackageName,
    ) -> impl Future<Output = Result<Vec<Candidate>, ResolveError>> + Send + 'io {
        self.registry.index_candidates(name)
    }

    fn pinned_candidate<'io>(
        &'io self,
        requirement: &'io Requirement,
    ) -> impl Future<Output = Result<Candidate, ResolveError>> + Send + 'io {
        self.pinned.fetch(requirement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_document(json: &str) -> IndexDocument {
        serde_json::from_str(json).unwrap()
    }

    fn candidate(name: &str, version: &str, hashes: &[&str]) -> Candidate {
        let mut candidate = Candidate::new(
            PackageName::new(name).unwrap(),
            Version::from_str(version).unwrap(),
        );
        candidate.hashes = hashes.iter().map(ToString::to_string).collect();
        candidate
    }

    #[test]
    fn document_converts_to_candidates() {
        let document = parse_document(
            r#"{
                "name": "requests",
                "versions": [
                    {
                        "version": "2.18.4",
                        "hashes": ["sha256:abc"],
                        "requires": [
                            {"name": "idna", "version": ">=2.5,<2.7"},
                            {"name": "pysocks", "version": ">=1.5.6", "markers": "extra == 'socks'"}
                        ],
                        "extras": ["socks", "security"]
                    }
                ]
            }"#,
        );
        let name = PackageName::new("requests").unwrap();
        let entry = document.versions.into_iter().next().unwrap();
        let candidate = entry.into_candidate(&name, "https://index/requests/json").unwrap();

        assert_eq!(candidate.version, Version::from_str("2.18.4").unwrap());
        assert_eq!(candidate.hashes, ["sha256:abc"]);
        assert_eq!(candidate.requires.len(), 2);
        assert_eq!(
            candidate.requires[0].specifiers().unwrap().to_string(),
            ">=2.5,<2.7"
        );
        assert!(candidate.requires[1].marker.is_some());
        assert_eq!(candidate.provided_extras.len(), 2);
    }

    #[test]
    fn malformed_versions_are_rejected() {
        let document = parse_document(
            r#"{"name": "requests", "versions": [{"version": "not a version"}]}"#,
        );
        let name = PackageName::new("requests").unwrap();
        let entry = document.versions.into_iter().next().unwrap();
        let err = entry
            .into_candidate(&name, "https://index/requests/json")
            .unwrap_err();
        assert!(matches!(err, ResolveError::Metadata(..)), "{err}");
    }

    #[test]
    fn merge_keeps_the_first_listing() {
        let mut merged = BTreeMap::new();
        merge_candidates(&mut merged, vec![candidate("pkg", "1.0", &["sha256:abc"])]).unwrap();
        merge_candidates(
            &mut merged,
            vec![
                candidate("pkg", "1.0", &["sha256:abc"]),
                candidate("pkg", "2.0", &["sha256:def"]),
            ],
        )
        .unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn diverging_mirrors_are_an_error() {
        let mut merged = BTreeMap::new();
        merge_candidates(&mut merged, vec![candidate("pkg", "1.0", &["sha256:abc"])]).unwrap();
        let err = merge_candidates(
            &mut merged,
            vec![candidate("pkg", "1.0", &["sha256:evil"])],
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::HashMismatch { .. }), "{err}");
    }
}
