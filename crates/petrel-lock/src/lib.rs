//! The lockfile: a fully-pinned, hash-verified closure of a manifest.
//!
//! The lockfile is marker-agnostic storage. Markers are carried through
//! unevaluated and only consulted when computing the install set for a
//! concrete environment. Serialization is deterministic: parsing a lockfile
//! and re-serializing it reproduces the input byte for byte.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use petrel_manifest::{Fingerprint, Manifest, Section, Source};
use petrel_normalize::{ExtraName, PackageName};
use petrel_spec::{MarkerEnvironment, MarkerTree, VcsKind, Version};

pub use tree::{render_graph, GraphError, GraphOptions};

mod tree;

/// The lockfile format version written into `_meta`.
pub const LOCK_FORMAT_VERSION: u32 = 1;

/// How a locked package is pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pin {
    /// An exact registry version.
    Version(Version),
    /// A VCS checkout, pinned to the resolved commit where available.
    Vcs {
        kind: VcsKind,
        url: String,
        reference: Option<String>,
    },
    /// A direct URL artifact.
    Url { url: String },
    /// A local path.
    Path { path: String },
}

impl Pin {
    /// The pinned registry version, if this is a registry pin.
    pub fn version(&self) -> Option<&Version> {
        match self {
            Self::Version(version) => Some(version),
            _ => None,
        }
    }

    /// A short human-readable rendering, e.g. `2.18.4` or `git+https://…`.
    pub fn describe(&self) -> String {
        match self {
            Self::Version(version) => version.to_string(),
            Self::Vcs {
                kind,
                url,
                reference,
            } => match reference {
                Some(reference) => format!("{kind}+{url}@{reference}"),
                None => format!("{kind}+{url}"),
            },
            Self::Url { url } => url.clone(),
            Self::Path { path } => path.clone(),
        }
    }
}

/// A resolved package persisted into a lockfile partition.
///
/// Owns its outgoing requires-edges: the packages this one depends on, with
/// the textual constraint that produced each edge. The edges are retained for
/// graph rendering and pruning, not for re-resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedPackage {
    pub pin: Pin,
    /// `algorithm:digest` entries, kept sorted. Empty only for VCS and
    /// editable path sources, where hashing is not meaningful.
    pub hashes: Vec<String>,
    /// Carried through unevaluated.
    pub marker: Option<MarkerTree>,
    pub editable: bool,
    /// Extras that were activated for this package during resolution.
    pub extras: BTreeSet<ExtraName>,
    /// Requires-edges: dependency name to the constraint text that produced
    /// the edge.
    pub requires: BTreeMap<PackageName, String>,
}

/// The `_meta` block of a lockfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    /// Fingerprint of the manifest this lockfile was derived from.
    pub manifest_hash: Fingerprint,
    pub format_version: u32,
    pub sources: Vec<Source>,
}

/// A parsed lockfile: meta block plus two independent partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lockfile {
    pub meta: Meta,
    pub default: BTreeMap<PackageName, LockedPackage>,
    pub develop: BTreeMap<PackageName, LockedPackage>,
}

/// A failure to read or interpret a lockfile.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to read lockfile at `{0}`")]
    Io(String, #[source] std::io::Error),

    #[error("Failed to parse lockfile")]
    Json(#[from] serde_json::Error),

    #[error("Malformed lockfile: {0}")]
    Malformed(String),

    #[error(
        "Corrupt lockfile: `{package}` in `{partition}` requires `{target}`, which is not \
         present in that partition"
    )]
    DanglingEdge {
        partition: &'static str,
        package: PackageName,
        target: PackageName,
    },

    #[error("Corrupt lockfile: re-serializing does not reproduce the input")]
    NonCanonical,
}

impl Lockfile {
    /// Create a lockfile from resolved partitions.
    pub fn new(
        manifest_hash: Fingerprint,
        sources: Vec<Source>,
        default: BTreeMap<PackageName, LockedPackage>,
        develop: BTreeMap<PackageName, LockedPackage>,
    ) -> Self {
        Self {
            meta: Meta {
                manifest_hash,
                format_version: LOCK_FORMAT_VERSION,
                sources,
            },
            default,
            develop,
        }
    }

    pub fn partition(&self, section: Section) -> &BTreeMap<PackageName, LockedPackage> {
        match section {
            Section::Default => &self.default,
            Section::Develop => &self.develop,
        }
    }

    /// Read and validate a lockfile from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| LockError::Io(path.display().to_string(), err))?;
        Self::from_str(&content)
    }

    /// Serialize into the canonical lockfile text.
    ///
    /// Partitions serialize `default` then `develop`; package names sort
    /// (already case-folded by normalization); fields are in fixed order;
    /// hashes sort lexicographically.
    pub fn to_string_canonical(&self) -> String {
        let wire = WireLockfile::from(self);
        let mut output =
            serde_json::to_string_pretty(&wire).expect("lockfile serialization is infallible");
        output.push('\n');
        output
    }

    /// Validate that every requires-edge targets a package present in the
    /// same partition.
    fn validate_edges(&self) -> Result<(), LockError> {
        for (section, partition) in [
            (Section::Default, &self.default),
            (Section::Develop, &self.develop),
        ] {
            for (name, package) in partition {
                for target in package.requires.keys() {
                    if !partition.contains_key(target) {
                        return Err(LockError::DanglingEdge {
                            partition: section.lock_key(),
                            package: name.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Compute the set of packages to install from a partition into a
    /// concrete environment: those whose marker is absent or evaluates true.
    ///
    /// Non-matching entries stay in the lockfile; they are only excluded
    /// from the install set.
    pub fn install_set<'lock>(
        &'lock self,
        section: Section,
        env: &MarkerEnvironment,
    ) -> Vec<(&'lock PackageName, &'lock LockedPackage)> {
        self.partition(section)
            .iter()
            .filter(|(_, package)| {
                package.marker.as_ref().map_or(true, |marker| {
                    let extras = package.extras.iter().cloned().collect::<Vec<_>>();
                    marker.evaluate(env, &extras)
                })
            })
            .collect()
    }

    /// Remove the given roots from a partition and prune every package that
    /// is no longer reachable from the remaining roots.
    ///
    /// `roots` is the set of root package names that remain declared in the
    /// manifest section. Traversal is cycle-tolerant.
    pub fn retain_reachable(&mut self, section: Section, roots: &BTreeSet<PackageName>) {
        let partition = match section {
            Section::Default => &mut self.default,
            Section::Develop => &mut self.develop,
        };

        let mut reachable = BTreeSet::new();
        let mut stack = roots
            .iter()
            .filter(|root| partition.contains_key(*root))
            .cloned()
            .collect::<Vec<_>>();
        while let Some(name) = stack.pop() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            if let Some(package) = partition.get(&name) {
                stack.extend(package.requires.keys().cloned());
            }
        }

        partition.retain(|name, _| reachable.contains(name));
    }
}

impl FromStr for Lockfile {
    type Err = LockError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let wire: WireLockfile = serde_json::from_str(content)?;
        let lockfile = Lockfile::try_from(wire)?;
        lockfile.validate_edges()?;

        // The round-trip law is part of lockfile validity: a file that does
        // not reproduce itself is treated as corrupt rather than silently
        // rewritten.
        if lockfile.to_string_canonical() != ensure_trailing_newline(content) {
            return Err(LockError::NonCanonical);
        }
        Ok(lockfile)
    }
}

fn ensure_trailing_newline(content: &str) -> String {
    if content.ends_with('\n') {
        content.to_string()
    } else {
        format!("{content}\n")
    }
}

/// `is_stale` is purely structural: it compares the manifest's current
/// fingerprint with the one recorded at lock time, and never resolves.
pub fn is_stale(manifest: &Manifest, lockfile: &Lockfile) -> bool {
    manifest.fingerprint() != lockfile.meta.manifest_hash
}

// Wire representation. Field order here is the serialization order.

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireLockfile {
    #[serde(rename = "_meta")]
    meta: WireMeta,
    default: BTreeMap<PackageName, WirePackage>,
    develop: BTreeMap<PackageName, WirePackage>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMeta {
    hash: WireHash,
    #[serde(rename = "lock-version")]
    lock_version: u32,
    sources: Vec<WireSource>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireHash {
    sha256: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireSource {
    name: String,
    url: String,
    verify_ssl: bool,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct WirePackage {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    git: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hg: Option<String>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    editable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    hashes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    markers: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    extras: BTreeSet<ExtraName>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    requires: BTreeMap<PackageName, String>,
}

impl From<&Lockfile> for WireLockfile {
    fn from(lockfile: &Lockfile) -> Self {
        let partition = |packages: &BTreeMap<PackageName, LockedPackage>| {
            packages
                .iter()
                .map(|(name, package)| (name.clone(), WirePackage::from(package)))
                .collect()
        };
        Self {
            meta: WireMeta {
                hash: WireHash {
                    sha256: lockfile.meta.manifest_hash.to_string(),
                },
                lock_version: lockfile.meta.format_version,
                sources: lockfile
                    .meta
                    .sources
                    .iter()
                    .map(|source| WireSource {
                        name: source.name.clone(),
                        url: source.url.clone(),
                        verify_ssl: source.verify_ssl,
                    })
                    .collect(),
            },
            default: partition(&lockfile.default),
            develop: partition(&lockfile.develop),
        }
    }
}

impl From<&LockedPackage> for WirePackage {
    fn from(package: &LockedPackage) -> Self {
        let mut hashes = package.hashes.clone();
        hashes.sort_unstable();
        let mut wire = WirePackage {
            editable: package.editable,
            hashes,
            markers: package.marker.as_ref().map(ToString::to_string),
            extras: package.extras.clone(),
            requires: package.requires.clone(),
            ..WirePackage::default()
        };
        match &package.pin {
            Pin::Version(version) => wire.version = Some(format!("=={version}")),
            Pin::Vcs {
                kind,
                url,
                reference,
            } => {
                match kind {
                    VcsKind::Git => wire.git = Some(url.clone()),
                    VcsKind::Hg => wire.hg = Some(url.clone()),
                }
                wire.reference.clone_from(reference);
            }
            Pin::Url { url } => wire.file = Some(url.clone()),
            Pin::Path { path } => wire.path = Some(path.clone()),
        }
        wire
    }
}

impl TryFrom<WirePackage> for LockedPackage {
    type Error = LockError;

    fn try_from(wire: WirePackage) -> Result<Self, Self::Error> {
        let pin = if let Some(version) = &wire.version {
            let bare = version.strip_prefix("==").unwrap_or(version);
            Pin::Version(
                Version::from_str(bare)
                    .map_err(|err| LockError::Malformed(err.to_string()))?,
            )
        } else if let Some(url) = &wire.git {
            Pin::Vcs {
                kind: VcsKind::Git,
                url: url.clone(),
                reference: wire.reference.clone(),
            }
        } else if let Some(url) = &wire.hg {
            Pin::Vcs {
                kind: VcsKind::Hg,
                url: url.clone(),
                reference: wire.reference.clone(),
            }
        } else if let Some(url) = &wire.file {
            Pin::Url { url: url.clone() }
        } else if let Some(path) = &wire.path {
            Pin::Path { path: path.clone() }
        } else {
            return Err(LockError::Malformed(
                "a locked package must carry a version, git, hg, file, or path pin".to_string(),
            ));
        };

        let marker = wire
            .markers
            .as_deref()
            .map(MarkerTree::from_str)
            .transpose()
            .map_err(|err| LockError::Malformed(err.to_string()))?;

        Ok(Self {
            pin,
            hashes: wire.hashes,
            marker,
            editable: wire.editable,
            extras: wire.extras,
            requires: wire.requires,
        })
    }
}

impl TryFrom<WireLockfile> for Lockfile {
    type Error = LockError;

    fn try_from(wire: WireLockfile) -> Result<Self, Self::Error> {
        let partition = |packages: BTreeMap<PackageName, WirePackage>| {
            packages
                .into_iter()
                .map(|(name, package)| Ok((name, LockedPackage::try_from(package)?)))
                .collect::<Result<BTreeMap<_, _>, LockError>>()
        };
        Ok(Self {
            meta: Meta {
                manifest_hash: Fingerprint::from(wire.meta.hash.sha256),
                format_version: wire.meta.lock_version,
                sources: wire
                    .meta
                    .sources
                    .into_iter()
                    .map(|source| Source {
                        name: source.name,
                        url: source.url,
                        verify_ssl: source.verify_ssl,
                    })
                    .collect(),
            },
            default: partition(wire.default)?,
            develop: partition(wire.develop)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn registry_package(version: &str, requires: &[(&str, &str)]) -> LockedPackage {
        LockedPackage {
            pin: Pin::Version(Version::from_str(version).unwrap()),
            hashes: vec![format!("sha256:{:064}", version.len())],
            marker: None,
            editable: false,
            extras: BTreeSet::new(),
            requires: requires
                .iter()
                .map(|(name, constraint)| {
                    (PackageName::new(name).unwrap(), (*constraint).to_string())
                })
                .collect(),
        }
    }

    pub(crate) fn requests_lockfile() -> Lockfile {
        let mut default = BTreeMap::new();
        default.insert(
            PackageName::new("requests").unwrap(),
            registry_package(
                "2.18.4",
                &[
                    ("certifi", ">=2017.4.17"),
                    ("chardet", ">=3.0.2,<3.1.0"),
                    ("idna", ">=2.5,<2.7"),
                    ("urllib3", ">=1.21.1,<1.23"),
                ],
            ),
        );
        default.insert(
            PackageName::new("certifi").unwrap(),
            registry_package("2017.7.27.1", &[]),
        );
        default.insert(
            PackageName::new("chardet").unwrap(),
            registry_package("3.0.4", &[]),
        );
        default.insert(
            PackageName::new("idna").unwrap(),
            registry_package("2.6", &[]),
        );
        default.insert(
            PackageName::new("urllib3").unwrap(),
            registry_package("1.22", &[]),
        );
        Lockfile::new(
            Fingerprint::from("0".repeat(64)),
            vec![Source::default()],
            default,
            BTreeMap::new(),
        )
    }

    #[test]
    fn roundtrip() {
        let lockfile = requests_lockfile();
        let serialized = lockfile.to_string_canonical();
        let parsed = Lockfile::from_str(&serialized).unwrap();
        assert_eq!(parsed, lockfile);
        assert_eq!(parsed.to_string_canonical(), serialized);
    }

    #[test]
    fn hashes_serialize_sorted() {
        let mut lockfile = requests_lockfile();
        let name = PackageName::new("requests").unwrap();
        lockfile.default.get_mut(&name).unwrap().hashes = vec![
            format!("sha256:{}", "f".repeat(64)),
            format!("sha256:{}", "a".repeat(64)),
        ];
        let serialized = lockfile.to_string_canonical();
        let parsed = Lockfile::from_str(&serialized).unwrap();
        let hashes = &parsed.default[&name].hashes;
        assert!(hashes.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn dangling_edge_is_corrupt() {
        let mut lockfile = requests_lockfile();
        let name = PackageName::new("certifi").unwrap();
        lockfile.default.remove(&name);
        let serialized = lockfile.to_string_canonical();
        assert!(matches!(
            Lockfile::from_str(&serialized),
            Err(LockError::DanglingEdge { .. })
        ));
    }

    #[test]
    fn staleness() {
        let manifest: Manifest = "[packages]\nrequests = \"*\"\n".parse().unwrap();
        let mut lockfile = requests_lockfile();
        assert!(is_stale(&manifest, &lockfile));
        lockfile.meta.manifest_hash = manifest.fingerprint();
        assert!(!is_stale(&manifest, &lockfile));
    }

    #[test]
    fn install_set_filters_markers() {
        let mut lockfile = requests_lockfile();
        let name = PackageName::new("requests").unwrap();
        lockfile.default.get_mut(&name).unwrap().marker =
            Some("os_name == 'nonexistent_os'".parse().unwrap());

        let env = MarkerEnvironment {
            os_name: Some("posix".to_string()),
            ..MarkerEnvironment::default()
        };
        let installed = lockfile.install_set(Section::Default, &env);
        assert!(installed.iter().all(|(name, _)| name.as_str() != "requests"));
        // The marker stays in the lockfile itself.
        assert!(lockfile.default[&name].marker.is_some());
    }

    #[test]
    fn prune_unreachable() {
        let mut lockfile = requests_lockfile();
        // requests is the sole root; removing it empties the partition.
        let roots = BTreeSet::new();
        lockfile.retain_reachable(Section::Default, &roots);
        assert!(lockfile.default.is_empty());
    }

    #[test]
    fn prune_keeps_shared_dependencies() {
        let mut lockfile = requests_lockfile();
        // Add a second root that also requires idna.
        lockfile.default.insert(
            PackageName::new("yarl").unwrap(),
            registry_package("1.0", &[("idna", ">=2.0")]),
        );
        let roots = [PackageName::new("yarl").unwrap()].into_iter().collect();
        lockfile.retain_reachable(Section::Default, &roots);
        assert!(lockfile.default.contains_key(&PackageName::new("yarl").unwrap()));
        assert!(lockfile.default.contains_key(&PackageName::new("idna").unwrap()));
        assert!(!lockfile.default.contains_key(&PackageName::new("requests").unwrap()));
        assert!(!lockfile.default.contains_key(&PackageName::new("certifi").unwrap()));
    }

    #[test]
    fn prune_tolerates_cycles() {
        let mut lockfile = requests_lockfile();
        lockfile.default.insert(
            PackageName::new("ouro-a").unwrap(),
            registry_package("1.0", &[("ouro-b", "*")]),
        );
        lockfile.default.insert(
            PackageName::new("ouro-b").unwrap(),
            registry_package("1.0", &[("ouro-a", "*")]),
        );
        // Neither cycle member is reachable from the remaining root.
        let roots = [PackageName::new("requests").unwrap()].into_iter().collect();
        lockfile.retain_reachable(Section::Default, &roots);
        assert!(!lockfile.default.contains_key(&PackageName::new("ouro-a").unwrap()));
        assert!(!lockfile.default.contains_key(&PackageName::new("ouro-b").unwrap()));
    }

    #[test]
    fn non_canonical_input_is_corrupt() {
        let lockfile = requests_lockfile();
        let serialized = lockfile.to_string_canonical();
        // Reordered whitespace breaks the byte-identity law.
        let mangled = serialized.replace("    ", "  ");
        assert!(matches!(
            Lockfile::from_str(&mangled),
            Err(LockError::NonCanonical)
        ));
    }
}
