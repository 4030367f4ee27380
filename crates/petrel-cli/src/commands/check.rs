use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};

use petrel_manifest::{Manifest, Section};
use petrel_normalize::PackageName;

use crate::commands::ExitStatus;
use crate::printer::Printer;

/// Report declared packages that never appear in an observed-imports
/// listing.
///
/// The import scanning itself is external; this consumes its output. Each
/// line is either a bare top-level import name, or a `package: import`
/// mapping for packages whose import name differs from their package name
/// (e.g. `GitPython: git`). Unmapped packages fall back to the underscored
/// normalized name. `#` comments and blank lines are ignored.
pub(crate) fn check_unused(
    manifest_path: &Path,
    imports_path: &Path,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let manifest = Manifest::from_path(manifest_path)?;
    let content = std::fs::read_to_string(imports_path)
        .with_context(|| format!("Failed to read imports listing at `{}`", imports_path.display()))?;

    let mut observed = BTreeSet::new();
    let mut mapping: BTreeMap<PackageName, String> = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((package, import)) = line.split_once(':') {
            let package = PackageName::new(package.trim()).with_context(|| {
                format!("Invalid package name in imports listing: `{}`", package.trim())
            })?;
            let import = normalize_import(import.trim());
            observed.insert(import.clone());
            mapping.insert(package, import);
        } else {
            observed.insert(normalize_import(line));
        }
    }

    let mut unused = BTreeSet::new();
    for section in [Section::Default, Section::Develop] {
        for requirement in manifest.section(section) {
            let Some(name) = &requirement.name else { continue };
            let import = mapping
                .get(name)
                .cloned()
                // Unmapped names map to import names by underscoring.
                .unwrap_or_else(|| name.as_str().replace('-', "_"));
            if !observed.contains(&import) {
                unused.insert(name.clone());
            }
        }
    }

    if unused.is_empty() {
        writeln!(printer, "All declared packages are imported.")?;
        return Ok(ExitStatus::Success);
    }
    for name in &unused {
        writeln!(printer, "Package `{name}` is declared but never imported")?;
    }
    Ok(ExitStatus::Failure)
}

fn normalize_import(import: &str) -> String {
    import.to_lowercase().replace('-', "_")
}
