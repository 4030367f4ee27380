use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use thiserror::Error;

pub(crate) use check::check_unused;
pub(crate) use graph::graph;
pub(crate) use install::install;
pub(crate) use lock::lock;
pub(crate) use uninstall::uninstall;
pub(crate) use update::update;

use petrel_lock::Lockfile;
use petrel_manifest::{Manifest, Section};
use petrel_resolver::{DefaultProvider, Resolver, ResolverConfig};

use crate::printer::Printer;

mod check;
mod graph;
mod install;
mod lock;
mod uninstall;
mod update;

#[derive(Copy, Clone, Debug)]
pub(crate) enum ExitStatus {
    /// The command succeeded.
    Success,

    /// The command failed, or a check found problems to report.
    Failure,

    /// The command was invoked with an incompatible or invalid option set.
    Usage,

    /// The manifest or a requirement could not be parsed.
    MalformedSpec,

    /// A source could not be reached, even after retries.
    SourceUnavailable,

    /// No version of some package satisfies its constraints.
    NoMatchingCandidate,

    /// The requirements on some package cannot be satisfied together.
    Conflict,

    /// The lockfile is out of date with the manifest.
    Stale,

    /// The lockfile is corrupt.
    CorruptLockfile,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => ExitCode::from(0),
            ExitStatus::Failure => ExitCode::from(1),
            ExitStatus::Usage => ExitCode::from(2),
            ExitStatus::MalformedSpec => ExitCode::from(3),
            ExitStatus::SourceUnavailable => ExitCode::from(4),
            ExitStatus::NoMatchingCandidate => ExitCode::from(5),
            ExitStatus::Conflict => ExitCode::from(6),
            ExitStatus::Stale => ExitCode::from(7),
            ExitStatus::CorruptLockfile => ExitCode::from(8),
        }
    }
}

/// The lockfile no longer matches the manifest it was derived from.
#[derive(Debug, Error)]
#[error("The lockfile is out of date with the manifest; run `petrel lock` to update it")]
pub(crate) struct StaleLockfile;

/// Resolve the manifest and atomically replace the lockfile.
///
/// On any failure the previous lockfile, if any, is left untouched.
pub(crate) async fn relock(
    manifest: &Manifest,
    lockfile_path: &Path,
    config: ResolverConfig,
    printer: &mut Printer,
) -> Result<Lockfile> {
    let provider = DefaultProvider::new(&manifest.sources)?;
    let resolver = Resolver::new(manifest, config, &provider);
    let resolution = resolver.resolve().await?;
    let lockfile = resolution.into_lockfile(manifest);

    write_atomic(lockfile_path, &lockfile.to_string_canonical())?;
    let count = lockfile.partition(Section::Default).len()
        + lockfile.partition(Section::Develop).len();
    writeln!(
        printer,
        "Locked {count} package(s) to {}",
        lockfile_path.display()
    )?;
    Ok(lockfile)
}

/// Write via a temporary file in the target directory and rename into
/// place, so readers never observe a partial file.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let directory = match path.parent() {
        Some(parent) if parent != Path::new("") => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(directory)
        .with_context(|| format!("Failed to create a temporary file in `{}`", directory.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write `{}`", path.display()))?;
    file.persist(path)
        .with_context(|| format!("Failed to replace `{}`", path.display()))?;
    Ok(())
}
