use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;

use petrel_normalize::{ExtraName, PackageName};

use crate::marker::MarkerTree;
use crate::specifier::VersionSpecifiers;
use crate::SpecParseError;

/// The version control system backing a VCS requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VcsKind {
    Git,
    Hg,
}

impl VcsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Hg => "hg",
        }
    }
}

impl std::fmt::Display for VcsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a requirement is satisfied from. Exactly one kind per requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequirementSource {
    /// A package index lookup constrained by version specifiers.
    Registry { specifiers: VersionSpecifiers },
    /// A VCS checkout at a specific ref.
    Vcs {
        kind: VcsKind,
        url: String,
        reference: Option<String>,
        subdirectory: Option<String>,
        editable: bool,
    },
    /// A direct URL to an artifact.
    Url { url: String },
    /// A local path, possibly installed editable.
    Path { path: PathBuf, editable: bool },
}

impl RequirementSource {
    /// Whether this source pins a single candidate (VCS, URL, path), as
    /// opposed to an index lookup over many versions.
    pub fn is_pinned(&self) -> bool {
        !matches!(self, Self::Registry { .. })
    }

    pub fn is_editable(&self) -> bool {
        matches!(
            self,
            Self::Vcs { editable: true, .. } | Self::Path { editable: true, .. }
        )
    }
}

/// A single dependency declaration in canonical form.
///
/// The name is known for registry requirements (the manifest key), but may be
/// pending for path/URL/VCS sources until the source's own metadata has been
/// fetched; the fetched name is then authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: Option<PackageName>,
    pub extras: BTreeSet<ExtraName>,
    pub marker: Option<MarkerTree>,
    pub source: RequirementSource,
}

/// Marker component keys accepted as individual manifest table entries, e.g.
/// `os_name = "== 'nt'"`.
const MARKER_COMPONENT_KEYS: &[&str] = &[
    "os_name",
    "sys_platform",
    "platform_machine",
    "platform_system",
    "platform_python_implementation",
    "python_version",
    "python_full_version",
];

impl Requirement {
    /// A registry requirement with no extras or marker.
    pub fn registry(name: PackageName, specifiers: VersionSpecifiers) -> Self {
        Self {
            name: Some(name),
            extras: BTreeSet::new(),
            marker: None,
            source: RequirementSource::Registry { specifiers },
        }
    }

    /// The version constraint, for registry requirements.
    pub fn specifiers(&self) -> Option<&VersionSpecifiers> {
        match &self.source {
            RequirementSource::Registry { specifiers } => Some(specifiers),
            _ => None,
        }
    }

    /// Parse a manifest section entry: either a bare constraint string
    /// (`requests = ">=2.0"`) or a structured table.
    pub fn parse(name: &str, value: &toml::Value) -> Result<Self, SpecParseError> {
        let name = PackageName::new(name)
            .map_err(|err| SpecParseError::requirement(name, err.to_string()))?;
        match value {
            toml::Value::String(constraint) => {
                let specifiers = VersionSpecifiers::from_str(constraint)?;
                Ok(Self::registry(name, specifiers))
            }
            toml::Value::Table(table) => Self::parse_table(name, table),
            _ => Err(SpecParseError::requirement(
                name.as_str(),
                "expected a version string or a table",
            )),
        }
    }

    fn parse_table(name: PackageName, table: &toml::Table) -> Result<Self, SpecParseError> {
        let get_str = |key: &str| -> Result<Option<&str>, SpecParseError> {
            match table.get(key) {
                None => Ok(None),
                Some(toml::Value::String(value)) => Ok(Some(value.as_str())),
                Some(_) => Err(SpecParseError::requirement(
                    name.as_str(),
                    format!("`{key}` must be a string"),
                )),
            }
        };

        for key in table.keys() {
            if !matches!(
                key.as_str(),
                "version"
                    | "extras"
                    | "markers"
                    | "git"
                    | "hg"
                    | "ref"
                    | "subdirectory"
                    | "file"
                    | "path"
                    | "editable"
            ) && !MARKER_COMPONENT_KEYS.contains(&key.as_str())
            {
                return Err(SpecParseError::requirement(
                    name.as_str(),
                    format!("unknown key `{key}`"),
                ));
            }
        }

        let mut extras = BTreeSet::new();
        match table.get("extras") {
            None => {}
            Some(toml::Value::Array(values)) => {
                for value in values {
                    let toml::Value::String(extra) = value else {
                        return Err(SpecParseError::requirement(
                            name.as_str(),
                            "`extras` must be an array of strings",
                        ));
                    };
                    extras.insert(ExtraName::new(extra).map_err(|err| {
                        SpecParseError::requirement(name.as_str(), err.to_string())
                    })?);
                }
            }
            Some(_) => {
                return Err(SpecParseError::requirement(
                    name.as_str(),
                    "`extras` must be an array of strings",
                ));
            }
        }

        // A `markers` string and individual marker component keys are
        // conjoined into a single expression.
        let mut marker_clauses = Vec::new();
        if let Some(markers) = get_str("markers")? {
            marker_clauses.push(MarkerTree::from_str(markers)?);
        }
        for key in MARKER_COMPONENT_KEYS {
            if let Some(component) = get_str(key)? {
                marker_clauses.push(MarkerTree::from_str(&format!("{key} {component}"))?);
            }
        }
        let marker = match marker_clauses.len() {
            0 => None,
            1 => marker_clauses.pop(),
            _ => Some(MarkerTree::And(marker_clauses)),
        };

        let editable = match table.get("editable") {
            None => false,
            Some(toml::Value::Boolean(editable)) => *editable,
            Some(_) => {
                return Err(SpecParseError::requirement(
                    name.as_str(),
                    "`editable` must be a boolean",
                ));
            }
        };

        let vcs = if let Some(url) = get_str("git")? {
            Some((VcsKind::Git, url))
        } else if let Some(url) = get_str("hg")? {
            Some((VcsKind::Hg, url))
        } else {
            None
        };

        let source = if let Some((kind, url)) = vcs {
            RequirementSource::Vcs {
                kind,
                url: url.to_string(),
                reference: get_str("ref")?.map(ToString::to_string),
                subdirectory: get_str("subdirectory")?.map(ToString::to_string),
                editable,
            }
        } else if let Some(url) = get_str("file")? {
            if editable {
                return Err(SpecParseError::requirement(
                    name.as_str(),
                    "`editable` is not supported for `file` requirements",
                ));
            }
            RequirementSource::Url {
                url: url.to_string(),
            }
        } else if let Some(path) = get_str("path")? {
            RequirementSource::Path {
                path: PathBuf::from(path),
                editable,
            }
        } else {
            if editable {
                return Err(SpecParseError::requirement(
                    name.as_str(),
                    "`editable` requires a `git`, `hg`, or `path` source",
                ));
            }
            let specifiers = match get_str("version")? {
                Some(constraint) => VersionSpecifiers::from_str(constraint)?,
                None => VersionSpecifiers::any(),
            };
            RequirementSource::Registry { specifiers }
        };

        if source.is_pinned() && table.contains_key("version") {
            return Err(SpecParseError::requirement(
                name.as_str(),
                "`version` cannot be combined with a `git`, `hg`, `file`, or `path` source",
            ));
        }

        Ok(Self {
            name: Some(name),
            extras,
            marker,
            source,
        })
    }

    /// Render back into a manifest entry. The left inverse of [`Self::parse`]:
    /// `parse(name, render(x)) == x` for any `x` produced by `parse`.
    ///
    /// Extras and marker clauses render in a stable sorted/canonical order, so
    /// rendering is deterministic regardless of the input spelling.
    pub fn render(&self) -> toml::Value {
        let simple = self.extras.is_empty() && self.marker.is_none();
        if let RequirementSource::Registry { specifiers } = &self.source {
            if simple {
                return toml::Value::String(specifiers.to_string());
            }
        }

        let mut table = toml::Table::new();
        match &self.source {
            RequirementSource::Registry { specifiers } => {
                table.insert(
                    "version".to_string(),
                    toml::Value::String(specifiers.to_string()),
                );
            }
            RequirementSource::Vcs {
                kind,
                url,
                reference,
                subdirectory,
                editable,
            } => {
                table.insert(kind.to_string(), toml::Value::String(url.clone()));
                if let Some(reference) = reference {
                    table.insert("ref".to_string(), toml::Value::String(reference.clone()));
                }
                if let Some(subdirectory) = subdirectory {
                    table.insert(
                        "subdirectory".to_string(),
                        toml::Value::String(subdirectory.clone()),
                    );
                }
                if *editable {
                    table.insert("editable".to_string(), toml::Value::Boolean(true));
                }
            }
            RequirementSource::Url { url } => {
                table.insert("file".to_string(), toml::Value::String(url.clone()));
            }
            RequirementSource::Path { path, editable } => {
                table.insert(
                    "path".to_string(),
                    toml::Value::String(path.display().to_string()),
                );
                if *editable {
                    table.insert("editable".to_string(), toml::Value::Boolean(true));
                }
            }
        }
        if !self.extras.is_empty() {
            table.insert(
                "extras".to_string(),
                toml::Value::Array(
                    self.extras
                        .iter()
                        .map(|extra| toml::Value::String(extra.to_string()))
                        .collect(),
                ),
            );
        }
        if let Some(marker) = &self.marker {
            table.insert("markers".to_string(), toml::Value::String(marker.to_string()));
        }
        toml::Value::Table(table)
    }
}

impl std::fmt::Display for Requirement {
    /// Pip-style rendering for diagnostics, e.g. `requests[socks]>=2.0; os_name == 'nt'`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}")?,
            None => f.write_str("<unnamed>")?,
        }
        if !self.extras.is_empty() {
            let extras = self
                .extras
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "[{extras}]")?;
        }
        match &self.source {
            RequirementSource::Registry { specifiers } => {
                if !specifiers.is_empty() {
                    write!(f, "{specifiers}")?;
                }
            }
            RequirementSource::Vcs { kind, url, reference, .. } => {
                write!(f, " @ {kind}+{url}")?;
                if let Some(reference) = reference {
                    write!(f, "@{reference}")?;
                }
            }
            RequirementSource::Url { url } => write!(f, " @ {url}")?,
            RequirementSource::Path { path, .. } => write!(f, " @ {}", path.display())?,
        }
        if let Some(marker) = &self.marker {
            write!(f, "; {marker}")?;
        }
        Ok(())
    }
}
