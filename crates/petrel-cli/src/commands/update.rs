use std::path::Path;

use anyhow::Result;

use petrel_manifest::Manifest;
use petrel_resolver::ResolverConfig;

use crate::commands::{relock, ExitStatus};
use crate::printer::Printer;

/// Re-resolve every requirement from scratch and rewrite the lockfile,
/// ignoring any existing pins.
pub(crate) async fn update(
    manifest_path: &Path,
    lockfile_path: &Path,
    config: ResolverConfig,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let manifest = Manifest::from_path(manifest_path)?;
    relock(&manifest, lockfile_path, config, &mut printer).await?;
    Ok(ExitStatus::Success)
}
