use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;

use petrel_lock::{LockError, Lockfile};
use petrel_manifest::{Manifest, Section};
use petrel_normalize::PackageName;

use crate::commands::{write_atomic, ExitStatus};
use crate::printer::Printer;

/// Remove declared packages from the manifest and prune the lockfile of
/// everything reachable only through them.
pub(crate) fn uninstall(
    manifest_path: &Path,
    lockfile_path: &Path,
    packages: &[PackageName],
    mut printer: Printer,
) -> Result<ExitStatus> {
    let mut manifest = Manifest::from_path(manifest_path)?;

    let mut removed = Vec::new();
    for name in packages {
        if manifest.remove(name).is_some() {
            removed.push(name);
        } else {
            writeln!(printer, "`{name}` is not a declared dependency")?;
        }
    }
    if removed.is_empty() {
        return Ok(ExitStatus::Usage);
    }

    write_atomic(manifest_path, &manifest.to_string())?;

    match Lockfile::from_path(lockfile_path) {
        Ok(mut lockfile) => {
            for section in [Section::Default, Section::Develop] {
                let roots: BTreeSet<PackageName> = manifest
                    .section(section)
                    .filter_map(|requirement| requirement.name.clone())
                    .collect();
                lockfile.retain_reachable(section, &roots);
            }
            lockfile.meta.manifest_hash = manifest.fingerprint();
            write_atomic(lockfile_path, &lockfile.to_string_canonical())?;
        }
        // Nothing locked yet; the manifest edit is the whole change.
        Err(LockError::Io(..)) => {}
        Err(err) => return Err(err.into()),
    }

    for name in removed {
        writeln!(printer, "Removed {name}")?;
    }
    Ok(ExitStatus::Success)
}
