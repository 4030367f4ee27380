use std::collections::BTreeSet;
use std::future::Future;

use petrel_normalize::{ExtraName, PackageName};
use petrel_spec::{Requirement, Version};

use crate::error::ResolveError;

/// One installable version of a package, as reported by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: PackageName,
    pub version: Version,
    /// `algorithm:digest` strings. Empty for VCS and editable sources,
    /// where hashing is not meaningful.
    pub hashes: Vec<String>,
    /// Declared sub-requirements, including extras-guarded entries.
    pub requires: Vec<Requirement>,
    /// The extras this candidate can provide.
    pub provided_extras: BTreeSet<ExtraName>,
    /// For VCS candidates, the fully resolved revision.
    pub reference: Option<String>,
}

impl Candidate {
    /// A registry candidate with no sub-requirements.
    pub fn new(name: PackageName, version: Version) -> Self {
        Self {
            name,
            version,
            hashes: Vec::new(),
            requires: Vec::new(),
            provided_extras: BTreeSet::new(),
            reference: None,
        }
    }
}

/// The IO backend for resolution.
///
/// Implementations answer two request kinds: an index query (all known
/// versions of a name, newest first) and a pinned source query (the single
/// candidate a VCS, URL, or path requirement denotes). The engine never
/// performs IO directly; tests substitute an in-memory implementation.
pub trait MetadataProvider: Send + Sync {
    /// All known versions of a package, newest first by version ordering.
    ///
    /// An unknown package is an empty list, not an error; the engine
    /// classifies the failure with the constraints it has accumulated.
    fn index_candidates<'io>(
        &'io self,
        name: &'io PackageName,
    ) -> impl Future<Output = Result<Vec<Candidate>, ResolveError>> + Send + 'io;

    /// The single candidate a pinned requirement denotes. The candidate's
    /// own metadata is authoritative for the package name.
    fn pinned_candidate<'io>(
        &'io self,
        requirement: &'io Requirement,
    ) -> impl Future<Output = Result<Candidate, ResolveError>> + Send + 'io;
}
