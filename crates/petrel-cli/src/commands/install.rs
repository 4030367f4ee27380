use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;

use petrel_lock::{is_stale, LockError, Lockfile};
use petrel_manifest::{Manifest, Section};
use petrel_resolver::ResolverConfig;

use crate::commands::{relock, ExitStatus, StaleLockfile};
use crate::environment::current_environment;
use crate::printer::Printer;

/// Ensure the lockfile is current, then compute and print the install set
/// for the target environment.
///
/// With `--deploy`, a missing or stale lockfile is a hard failure and
/// nothing is resolved or written.
pub(crate) async fn install(
    manifest_path: &Path,
    lockfile_path: &Path,
    dev: bool,
    deploy: bool,
    config: ResolverConfig,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let manifest = Manifest::from_path(manifest_path)?;

    let lockfile = if deploy {
        let lockfile = match Lockfile::from_path(lockfile_path) {
            Ok(lockfile) => lockfile,
            Err(LockError::Io(..)) => return Err(StaleLockfile.into()),
            Err(err) => return Err(err.into()),
        };
        if is_stale(&manifest, &lockfile) {
            return Err(StaleLockfile.into());
        }
        lockfile
    } else {
        match Lockfile::from_path(lockfile_path) {
            Ok(lockfile) if !is_stale(&manifest, &lockfile) => lockfile,
            // Stale or missing: relock. Corruption is surfaced, never
            // silently repaired by re-resolving.
            Ok(_) | Err(LockError::Io(..)) => {
                relock(&manifest, lockfile_path, config, &mut printer).await?
            }
            Err(err) => return Err(err.into()),
        }
    };

    let environment = current_environment();
    let mut install: BTreeMap<_, _> = lockfile
        .install_set(Section::Default, &environment)
        .into_iter()
        .collect();
    if dev {
        install.extend(lockfile.install_set(Section::Develop, &environment));
    }

    for (name, package) in &install {
        #[allow(clippy::print_stdout)]
        {
            println!("{name}=={}", package.pin.describe());
        }
    }
    writeln!(printer, "Install set: {} package(s)", install.len())?;
    Ok(ExitStatus::Success)
}
