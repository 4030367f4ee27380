//! The user-authored project manifest: direct dependencies, dev
//! dependencies, index sources, and the Python version constraint.
//!
//! The manifest is the input to resolution; the lockfile records a
//! fingerprint of it so that drift can be detected without resolving.

use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use petrel_normalize::PackageName;
use petrel_spec::{Requirement, SpecParseError};

/// The default package index, used when a manifest declares no sources.
pub const DEFAULT_SOURCE_URL: &str = "https://pypi.org/simple";

/// A manifest section; maps onto a lockfile partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    /// `[packages]`, locked into the `default` partition.
    Default,
    /// `[dev-packages]`, locked into the `develop` partition.
    Develop,
}

impl Section {
    /// The manifest header for this section.
    pub fn manifest_key(self) -> &'static str {
        match self {
            Self::Default => "packages",
            Self::Develop => "dev-packages",
        }
    }

    /// The lockfile partition name for this section.
    pub fn lock_key(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Develop => "develop",
        }
    }
}

/// A package index declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub url: String,
    pub verify_ssl: bool,
}

impl Default for Source {
    fn default() -> Self {
        Self {
            name: "pypi".to_string(),
            url: DEFAULT_SOURCE_URL.to_string(),
            verify_ssl: true,
        }
    }
}

/// Global interpreter constraints from `[requires]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requires {
    pub python_version: Option<String>,
}

/// A parsed manifest: ordered requirement sections plus global attributes.
///
/// Entry order within a section is preserved for rewriting, but never affects
/// resolution or the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub sources: Vec<Source>,
    pub requires: Requires,
    packages: IndexMap<PackageName, Requirement>,
    dev_packages: IndexMap<PackageName, Requirement>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            sources: vec![Source::default()],
            requires: Requires::default(),
            packages: IndexMap::new(),
            dev_packages: IndexMap::new(),
        }
    }
}

/// A failure to read, parse, or interpret a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest at `{0}`")]
    Io(String, #[source] std::io::Error),

    #[error("Failed to parse manifest")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Spec(#[from] SpecParseError),

    #[error("Duplicate package `{0}` in `[{1}]` (names are compared after normalization)")]
    DuplicateName(PackageName, &'static str),

    #[error("`[{0}]` must be a table")]
    MalformedSection(&'static str),
}

impl Manifest {
    /// Read and parse a manifest file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let content = fs_err_read_to_string(path)?;
        Self::from_str(&content)
    }

    /// The requirements of a section, in declaration order.
    pub fn section(&self, section: Section) -> impl Iterator<Item = &Requirement> {
        match section {
            Section::Default => self.packages.values(),
            Section::Develop => self.dev_packages.values(),
        }
    }

    /// Whether the given root is declared in the given section.
    pub fn contains(&self, section: Section, name: &PackageName) -> bool {
        match section {
            Section::Default => self.packages.contains_key(name),
            Section::Develop => self.dev_packages.contains_key(name),
        }
    }

    /// Add or replace a root requirement. Returns the previous entry, if any.
    pub fn insert(&mut self, section: Section, requirement: Requirement) -> Option<Requirement> {
        let name = requirement
            .name
            .clone()
            .expect("manifest requirements are always named");
        match section {
            Section::Default => self.packages.insert(name, requirement),
            Section::Develop => self.dev_packages.insert(name, requirement),
        }
    }

    /// Remove a root requirement by name, from both sections.
    pub fn remove(&mut self, name: &PackageName) -> Option<Requirement> {
        let default = self.packages.shift_remove(name);
        let develop = self.dev_packages.shift_remove(name);
        default.or(develop)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.dev_packages.is_empty()
    }

    /// A deterministic digest of the manifest's requirement set.
    ///
    /// Stable under section and entry reordering: sections hash in a fixed
    /// order and entries hash sorted by normalized name in their canonical
    /// rendered form, so only a change in meaning changes the digest.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for source in &self.sources {
            hasher.update(b"source\0");
            hasher.update(source.url.as_bytes());
            hasher.update([0, u8::from(source.verify_ssl)]);
        }
        if let Some(python_version) = &self.requires.python_version {
            hasher.update(b"requires\0");
            hasher.update(python_version.as_bytes());
            hasher.update([0]);
        }
        for (section, entries) in [
            (Section::Default, &self.packages),
            (Section::Develop, &self.dev_packages),
        ] {
            hasher.update(section.lock_key().as_bytes());
            hasher.update([0]);
            let mut names = entries.keys().collect::<Vec<_>>();
            names.sort();
            for name in names {
                hasher.update(name.as_str().as_bytes());
                hasher.update([0]);
                hasher.update(render_inline(&entries[name].render()).as_bytes());
                hasher.update([0]);
            }
        }
        Fingerprint(format!("{:x}", hasher.finalize()))
    }
}

impl FromStr for Manifest {
    type Err = ManifestError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let document = toml::from_str::<toml::Table>(content)?;

        let mut sources = Vec::new();
        if let Some(value) = document.get("source") {
            let toml::Value::Array(entries) = value else {
                return Err(ManifestError::MalformedSection("source"));
            };
            for entry in entries {
                let toml::Value::Table(table) = entry else {
                    return Err(ManifestError::MalformedSection("source"));
                };
                sources.push(Source {
                    name: table
                        .get("name")
                        .and_then(toml::Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    url: table
                        .get("url")
                        .and_then(toml::Value::as_str)
                        .unwrap_or(DEFAULT_SOURCE_URL)
                        .to_string(),
                    verify_ssl: table
                        .get("verify_ssl")
                        .and_then(toml::Value::as_bool)
                        .unwrap_or(true),
                });
            }
        }
        if sources.is_empty() {
            sources.push(Source::default());
        }

        let requires = Requires {
            python_version: document
                .get("requires")
                .and_then(toml::Value::as_table)
                .and_then(|table| table.get("python_version"))
                .and_then(toml::Value::as_str)
                .map(ToString::to_string),
        };

        let mut manifest = Self {
            sources,
            requires,
            packages: IndexMap::new(),
            dev_packages: IndexMap::new(),
        };

        for section in [Section::Default, Section::Develop] {
            let Some(value) = document.get(section.manifest_key()) else {
                continue;
            };
            let toml::Value::Table(table) = value else {
                return Err(ManifestError::MalformedSection(section.manifest_key()));
            };
            for (name, entry) in table {
                let requirement = Requirement::parse(name, entry)?;
                let name = requirement
                    .name
                    .clone()
                    .expect("parsed manifest requirements are named");
                if manifest.insert(section, requirement).is_some() {
                    return Err(ManifestError::DuplicateName(name, section.manifest_key()));
                }
            }
        }

        Ok(manifest)
    }
}

impl std::fmt::Display for Manifest {
    /// Render in the stable manifest layout: sources, requires, packages,
    /// dev-packages. Structured requirements render as inline tables.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for source in &self.sources {
            writeln!(f, "[[source]]")?;
            writeln!(f, "url = {}", quote(&source.url))?;
            writeln!(f, "verify_ssl = {}", source.verify_ssl)?;
            writeln!(f, "name = {}", quote(&source.name))?;
            writeln!(f)?;
        }
        if let Some(python_version) = &self.requires.python_version {
            writeln!(f, "[requires]")?;
            writeln!(f, "python_version = {}", quote(python_version))?;
            writeln!(f)?;
        }
        for (section, entries) in [
            (Section::Default, &self.packages),
            (Section::Develop, &self.dev_packages),
        ] {
            writeln!(f, "[{}]", section.manifest_key())?;
            for (name, requirement) in entries {
                writeln!(f, "{name} = {}", render_inline(&requirement.render()))?;
            }
            if section == Section::Default {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Quote a string as a TOML basic string.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Render a requirement entry value in inline form, as it appears on the
/// right-hand side of `name = …` in a manifest section.
fn render_inline(value: &toml::Value) -> String {
    match value {
        toml::Value::String(string) => quote(string),
        toml::Value::Boolean(boolean) => boolean.to_string(),
        toml::Value::Array(values) => {
            let rendered = values.iter().map(render_inline).collect::<Vec<_>>();
            format!("[{}]", rendered.join(", "))
        }
        toml::Value::Table(table) => {
            let rendered = table
                .iter()
                .map(|(key, value)| format!("{key} = {}", render_inline(value)))
                .collect::<Vec<_>>();
            format!("{{{}}}", rendered.join(", "))
        }
        other => other.to_string(),
    }
}

fn fs_err_read_to_string(path: &Path) -> Result<String, ManifestError> {
    std::fs::read_to_string(path)
        .map_err(|err| ManifestError::Io(path.display().to_string(), err))
}

/// A deterministic digest of a manifest's normalized content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(digest: String) -> Self {
        Self(digest)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[[source]]
url = "https://pypi.org/simple"
verify_ssl = true
name = "pypi"

[requires]
python_version = "3.6"

[packages]
requests = "*"
urllib3 = ">=1.21.1,<1.23"
records = {version = "*", extras = ["pandas"]}

[dev-packages]
pytest = "*"
"#;

    #[test]
    fn parse() {
        let manifest = Manifest::from_str(MANIFEST).unwrap();
        assert_eq!(manifest.section(Section::Default).count(), 3);
        assert_eq!(manifest.section(Section::Develop).count(), 1);
        assert_eq!(manifest.requires.python_version.as_deref(), Some("3.6"));
        assert_eq!(manifest.sources.len(), 1);
    }

    #[test]
    fn duplicate_names_after_normalization() {
        let content = r#"
[packages]
Foo_Bar = "*"
foo-bar = ">=1.0"
"#;
        assert!(matches!(
            Manifest::from_str(content),
            Err(ManifestError::DuplicateName(..))
        ));
    }

    #[test]
    fn fingerprint_stable_under_reordering() {
        let reordered = r#"
[dev-packages]
pytest = "*"

[packages]
records = {version = "*", extras = ["pandas"]}
urllib3 = ">=1.21.1,<1.23"
requests = "*"

[requires]
python_version = "3.6"

[[source]]
url = "https://pypi.org/simple"
verify_ssl = true
name = "pypi"
"#;
        let original = Manifest::from_str(MANIFEST).unwrap();
        let shuffled = Manifest::from_str(reordered).unwrap();
        assert_eq!(original.fingerprint(), shuffled.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let original = Manifest::from_str(MANIFEST).unwrap();
        let mut edited = original.clone();
        edited.insert(
            Section::Default,
            Requirement::registry(
                PackageName::new("requests").unwrap(),
                "==2.18.4".parse().unwrap(),
            ),
        );
        assert_ne!(original.fingerprint(), edited.fingerprint());
    }

    #[test]
    fn render_roundtrip() {
        let manifest = Manifest::from_str(MANIFEST).unwrap();
        let rendered = manifest.to_string();
        assert_eq!(Manifest::from_str(&rendered).unwrap(), manifest);
    }

    #[test]
    fn insert_and_remove() {
        let mut manifest = Manifest::from_str(MANIFEST).unwrap();
        let name = PackageName::new("requests").unwrap();
        assert!(manifest.contains(Section::Default, &name));
        assert!(manifest.remove(&name).is_some());
        assert!(!manifest.contains(Section::Default, &name));
        assert!(manifest.remove(&name).is_none());
    }

    #[test]
    fn from_path() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("Pipfile");
        std::fs::write(&path, MANIFEST).unwrap();
        let manifest = Manifest::from_path(&path).unwrap();
        assert_eq!(manifest.section(Section::Default).count(), 3);
    }
}
