use std::path::Path;

use anyhow::Result;

use petrel_lock::{render_graph, GraphError, GraphOptions, Lockfile};
use petrel_manifest::Section;

use crate::commands::ExitStatus;
use crate::printer::Printer;

/// Render the locked requires-graph, forward or reversed, text or JSON.
pub(crate) fn graph(
    lockfile_path: &Path,
    reverse: bool,
    json: bool,
    dev: bool,
    _printer: Printer,
) -> Result<ExitStatus> {
    // Incompatible flags are a usage error before any file is touched.
    if reverse && json {
        return Err(GraphError::IncompatibleOptions.into());
    }

    let lockfile = Lockfile::from_path(lockfile_path)?;
    let section = if dev { Section::Develop } else { Section::Default };
    let rendered = render_graph(lockfile.partition(section), GraphOptions { reverse, json })?;

    #[allow(clippy::print_stdout)]
    {
        print!("{rendered}");
        if !rendered.ends_with('\n') {
            println!();
        }
    }
    Ok(ExitStatus::Success)
}
