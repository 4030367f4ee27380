//! Metadata for pinned sources: direct URLs, local paths, VCS checkouts.
//!
//! Every pinned source ultimately yields one candidate, described by a
//! `petrel.json` document (for directories and checkouts) or a sibling
//! `<artifact>.meta.json` document (for single-file artifacts). Artifacts
//! are digested with SHA-256 at fetch time; directories and checkouts have
//! no meaningful artifact to hash.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::debug;

use petrel_normalize::{ExtraName, PackageName};
use petrel_spec::{Requirement, RequirementSource, VcsKind, Version};

use crate::error::ResolveError;
use crate::provider::Candidate;
use crate::registry::WireRequirement;

/// The self-describing metadata document of a pinned source.
#[derive(Debug, Deserialize)]
struct MetadataDocument {
    name: String,
    version: String,
    #[serde(default)]
    requires: Vec<WireRequirement>,
    #[serde(default)]
    extras: Vec<String>,
}

impl MetadataDocument {
    fn into_candidate(self, location: &str) -> Result<Candidate, ResolveError> {
        let malformed = |reason: String| ResolveError::Metadata(location.to_string(), reason);
        let name = PackageName::new(&self.name).map_err(|err| malformed(err.to_string()))?;
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
            name,
            version,
            hashes: Vec::new(),
            requires,
            provided_extras,
            reference: None,
        })
    }
}

fn parse_document(content: &str, location: &str) -> Result<Candidate, ResolveError> {
    let document: MetadataDocument = serde_json::from_str(content)
        .map_err(|err| ResolveError::Metadata(location.to_string(), err.to_string()))?;
    document.into_candidate(location)
}

/// Resolves pinned requirements to their single candidate.
pub struct PinnedFetcher {
    client: reqwest::Client,
}

impl Default for PinnedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PinnedFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub(crate) async fn fetch(&self, requirement: &Requirement) -> Result<Candidate, ResolveError> {
        match &requirement.source {
            RequirementSource::Url { url } => self.fetch_url(url).await,
            RequirementSource::Path { path, editable } => fetch_path(path, *editable).await,
            RequirementSource::Vcs {
                kind,
                url,
                reference,
                subdirectory,
                ..
            } => fetch_vcs(*kind, url, reference.as_deref(), subdirectory.as_deref()).await,
            RequirementSource::Registry { .. } => Err(ResolveError::Metadata(
                requirement.to_string(),
                "a registry requirement is not a pinned source".to_string(),
            )),
        }
    }

    /// Download the artifact for its digest, and its sidecar metadata
    /// document for the candidate description.
    async fn fetch_url(&self, url: &str) -> Result<Candidate, ResolveError> {
        let unavailable = |location: &str, err: reqwest::Error| ResolveError::SourceUnavailable {
            location: location.to_string(),
            reason: err.to_string(),
        };

        debug!("Downloading {url}");
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| unavailable(url, err))?
            .bytes()
            .await
            .map_err(|err| unavailable(url, err))?;
        let digest = format!("sha256:{:x}", Sha256::digest(&bytes));

        let meta_url = format!("{url}.meta.json");
        let content = self
            .client
            .get(&meta_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| unavailable(&meta_url, err))?
            .text()
            .await
            .map_err(|err| unavailable(&meta_url, err))?;

        let mut candidate = parse_document(&content, url)?;
        candidate.hashes = vec![digest];
        Ok(candidate)
    }
}

/// A directory is described by the `petrel.json` it contains; a file
/// artifact by a `<artifact>.meta.json` sibling, and is digested unless the
/// install is editable.
async fn fetch_path(path: &Path, editable: bool) -> Result<Candidate, ResolveError> {
    let location = path.display().to_string();
    let metadata =
        tokio::fs::metadata(path)
            .await
            .map_err(|err| ResolveError::SourceUnavailable {
                location: location.clone(),
                reason: err.to_string(),
            })?;

    if metadata.is_dir() {
        let document_path = path.join("petrel.json");
        let content = tokio::fs::read_to_string(&document_path)
            .await
            .map_err(|err| {
                ResolveError::Metadata(location.clone(), format!("missing package metadata: {err}"))
            })?;
        return parse_document(&content, &location);
    }

    let document_path = PathBuf::from(format!("{}.meta.json", path.display()));
    let content = tokio::fs::read_to_string(&document_path)
        .await
        .map_err(|err| {
            ResolveError::Metadata(location.clone(), format!("missing package metadata: {err}"))
        })?;
    let mut candidate = parse_document(&content, &location)?;
    if !editable {
        let bytes =
            tokio::fs::read(path)
                .await
                .map_err(|err| ResolveError::SourceUnavailable {
                    location: location.clone(),
                    reason: err.to_string(),
                })?;
        candidate.hashes = vec![format!("sha256:{:x}", Sha256::digest(&bytes))];
    }
    Ok(candidate)
}

/// Clone the requested ref into a scratch checkout and resolve it to an
/// immutable revision.
async fn fetch_vcs(
    kind: VcsKind,
    url: &str,
    reference: Option<&str>,
    subdirectory: Option<&str>,
) -> Result<Candidate, ResolveError> {
    let location = match reference {
        Some(reference) => format!("{kind}+{url}@{reference}"),
        None => format!("{kind}+{url}"),
    };
    let checkout = tempfile::tempdir().map_err(|err| ResolveError::SourceUnavailable {
        location: location.clone(),
        reason: err.to_string(),
    })?;
    let target = checkout.path();

    debug!("Cloning {location}");
    let revision = match kind {
        VcsKind::Git => {
            let mut clone = Command::new("git");
            clone.args(["clone", "--quiet", "--depth", "1"]);
            if let Some(reference) = reference {
                clone.args(["--branch", reference]);
            }
            clone.arg(url).arg(target);
            run(&mut clone, &location).await?;

            let mut rev_parse = Command::new("git");
            rev_parse.arg("-C").arg(target).args(["rev-parse", "HEAD"]);
            run(&mut rev_parse, &location).await?
        }
        VcsKind::Hg => {
            let mut clone = Command::new("hg");
            clone.args(["clone", "--quiet"]);
            if let Some(reference) = reference {
                clone.args(["--rev", reference]);
            }
            clone.arg(url).arg(target);
            run(&mut clone, &location).await?;

            let mut identify = Command::new("hg");
            identify
                .args(["identify", "--id"])
                .arg("--cwd")
                .arg(target);
            run(&mut identify, &location).await?
        }
    };

    let mut document_path = target.to_path_buf();
    if let Some(subdirectory) = subdirectory {
        document_path.push(subdirectory);
    }
    document_path.push("petrel.json");
    let content = tokio::fs::read_to_string(&document_path)
        .await
        .map_err(|err| {
            ResolveError::Metadata(location.clone(), format!("missing package metadata: {err}"))
        })?;
    let mut candidate = parse_document(&content, &location)?;
    candidate.reference = Some(revision);
    Ok(candidate)
}

async fn run(command: &mut Command, location: &str) -> Result<String, ResolveError> {
    let output = command
        .output()
        .await
        .map_err(|err| ResolveError::SourceUnavailable {
            location: location.to_string(),
            reason: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(ResolveError::SourceUnavailable {
            location: location.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const DOCUMENT: &str = r#"{
        "name": "my-package",
        "version": "0.1.0",
        "requires": [{"name": "requests", "version": ">=2.0"}]
    }"#;

    #[tokio::test]
    async fn directory_metadata_is_read_from_petrel_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("petrel.json"), DOCUMENT).unwrap();

        let candidate = fetch_path(dir.path(), true).await.unwrap();
        assert_eq!(candidate.name.as_str(), "my-package");
        assert_eq!(candidate.version, Version::from_str("0.1.0").unwrap());
        assert_eq!(candidate.requires.len(), 1);
        assert!(candidate.hashes.is_empty());
    }

    #[tokio::test]
    async fn file_artifacts_are_digested() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("my-package-0.1.0.tar.gz");
        let mut file = std::fs::File::create(&artifact).unwrap();
        file.write_all(b"artifact bytes").unwrap();
        std::fs::write(
            dir.path().join("my-package-0.1.0.tar.gz.meta.json"),
            DOCUMENT,
        )
        .unwrap();

        let candidate = fetch_path(&artifact, false).await.unwrap();
        assert_eq!(candidate.hashes.len(), 1);
        let expected = format!("sha256:{:x}", Sha256::digest(b"artifact bytes"));
        assert_eq!(candidate.hashes[0], expected);
    }

    #[tokio::test]
    async fn missing_metadata_is_malformed_not_transient() {
        let dir = tempfile::tempdir().unwrap();
        let err = fetch_path(dir.path(), true).await.unwrap_err();
        assert!(matches!(err, ResolveError::Metadata(..)), "{err}");
        assert!(!err.is_transient());
    }

    #[test]
    fn documents_parse_into_candidates() {
        let candidate = parse_document(DOCUMENT, "test").unwrap();
        assert_eq!(candidate.name.as_str(), "my-package");
        assert_eq!(
            candidate.requires[0].specifiers().unwrap().to_string(),
            ">=2.0"
        );
    }
}
