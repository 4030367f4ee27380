use std::fmt::{Display, Formatter};

use thiserror::Error;

use petrel_normalize::PackageName;
use petrel_spec::SpecParseError;

/// A resolution failure.
///
/// Errors are cloneable so that a single failed fetch can be shared with
/// every task that coalesced onto it.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// A transient network, VCS, or filesystem failure. Retried a bounded
    /// number of times by the scheduler before surfacing.
    #[error("Failed to reach `{location}`: {reason}")]
    SourceUnavailable { location: String, reason: String },

    #[error(transparent)]
    NoMatchingCandidate(#[from] NoCandidateError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("Package metadata reports name `{metadata}`, but the requirement names `{given}`")]
    NameMismatch {
        given: PackageName,
        metadata: PackageName,
    },

    /// Two sources claim the same version with different artifact digests.
    #[error("Sources disagree about the content of `{name}=={version}`")]
    HashMismatch { name: PackageName, version: String },

    #[error("Metadata from `{0}` is malformed: {1}")]
    Metadata(String, String),

    #[error(transparent)]
    Spec(#[from] SpecParseError),
}

impl ResolveError {
    /// Whether retrying the fetch could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }
}

/// The path of requirements that introduced a constraint, from a manifest
/// root down to the requirement itself. Each link is a rendered requirement,
/// e.g. `requests==2.18.4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementChain(Vec<String>);

impl RequirementChain {
    /// A chain starting at a manifest root.
    pub fn root(link: String) -> Self {
        Self(vec![link])
    }

    /// The chain extended by one more requirement.
    pub fn child(&self, link: String) -> Self {
        let mut links = self.0.clone();
        links.push(link);
        Self(links)
    }

    pub fn links(&self) -> &[String] {
        &self.0
    }
}

impl Display for RequirementChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(" -> "))
    }
}

/// No version of a package satisfies its accumulated constraints.
#[derive(Debug, Clone)]
pub struct NoCandidateError {
    pub name: PackageName,
    /// The rendered intersection of every constraint seen for the name.
    pub constraints: String,
    pub chains: Vec<RequirementChain>,
}

impl std::error::Error for NoCandidateError {}

impl Display for NoCandidateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.constraints == "*" {
            write!(f, "Could not find any version of `{}`", self.name)?;
        } else {
            write!(
                f,
                "Could not find a version of `{}` satisfying `{}`",
                self.name, self.constraints
            )?;
        }
        for chain in &self.chains {
            write!(f, "\n  via: {chain}")?;
        }
        Ok(())
    }
}

/// The accumulated constraints on a package admit no common version.
///
/// Carries the full provenance chain of every competing requirement, so the
/// report names the roots responsible, not just the requirement that was
/// processed last.
#[derive(Debug, Clone)]
pub struct ConflictError {
    pub name: PackageName,
    pub chains: Vec<RequirementChain>,
}

impl std::error::Error for ConflictError {}

impl Display for ConflictError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "The requirements on `{}` cannot be satisfied together:",
            self.name
        )?;
        for chain in &self.chains {
            write!(f, "\n  {chain}")?;
        }
        Ok(())
    }
}
