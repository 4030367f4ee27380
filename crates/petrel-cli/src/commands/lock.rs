use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use petrel_lock::LockedPackage;
use petrel_manifest::{Manifest, Section};
use petrel_normalize::PackageName;
use petrel_resolver::ResolverConfig;

use crate::commands::{relock, ExitStatus};
use crate::printer::Printer;

/// Resolve the manifest and write the lockfile, or print a flat pinned
/// requirement list with `--requirements`.
pub(crate) async fn lock(
    manifest_path: &Path,
    lockfile_path: &Path,
    requirements: bool,
    dev: bool,
    config: ResolverConfig,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let manifest = Manifest::from_path(manifest_path)?;

    if requirements {
        let provider = petrel_resolver::DefaultProvider::new(&manifest.sources)?;
        let resolver = petrel_resolver::Resolver::new(&manifest, config, &provider);
        let resolution = resolver.resolve().await?;
        let lockfile = resolution.into_lockfile(&manifest);
        let section = if dev { Section::Develop } else { Section::Default };
        print_requirements(lockfile.partition(section));
        return Ok(ExitStatus::Success);
    }

    relock(&manifest, lockfile_path, config, &mut printer).await?;
    Ok(ExitStatus::Success)
}

/// One pip-style line per package: pin, marker, and hashes.
#[allow(clippy::print_stdout)]
fn print_requirements(packages: &BTreeMap<PackageName, LockedPackage>) {
    for (name, package) in packages {
        let mut line = if package.editable {
            format!("-e {}", package.pin.describe())
        } else {
            match package.pin.version() {
                Some(version) => format!("{name}=={version}"),
                None => format!("{name} @ {}", package.pin.describe()),
            }
        };
        if let Some(marker) = &package.marker {
            line.push_str(&format!(" ; {marker}"));
        }
        for hash in &package.hashes {
            line.push_str(&format!(" --hash={hash}"));
        }
        println!("{line}");
    }
}
