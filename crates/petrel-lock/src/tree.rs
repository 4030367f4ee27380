//! Render the requires-graph of a lockfile partition, forward or reversed.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use serde::Serialize;
use thiserror::Error;

use petrel_normalize::PackageName;

use crate::LockedPackage;

/// Output options for graph rendering.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphOptions {
    /// Invert the graph: list, for every package, the packages that depend
    /// on it.
    pub reverse: bool,
    /// Emit a machine-readable JSON document instead of a text tree.
    pub json: bool,
}

/// A graph rendering failure.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Using both --reverse and --json together is not supported.")]
    IncompatibleOptions,

    #[error("Failed to serialize graph")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct JsonPackage<'lock> {
    name: &'lock PackageName,
    version: String,
    dependencies: Vec<JsonDependency<'lock>>,
}

#[derive(Serialize)]
struct JsonDependency<'lock> {
    name: &'lock PackageName,
    required: &'lock str,
}

/// Render the requires-graph of a partition.
///
/// Incompatible flag combinations are rejected before any output is
/// produced.
pub fn render_graph(
    packages: &BTreeMap<PackageName, LockedPackage>,
    options: GraphOptions,
) -> Result<String, GraphError> {
    if options.reverse && options.json {
        return Err(GraphError::IncompatibleOptions);
    }
    if options.json {
        render_json(packages)
    } else if options.reverse {
        Ok(render_reverse(packages))
    } else {
        Ok(render_forward(packages))
    }
}

fn render_json(packages: &BTreeMap<PackageName, LockedPackage>) -> Result<String, GraphError> {
    let entries = packages
        .iter()
        .map(|(name, package)| JsonPackage {
            name,
            version: package.pin.describe(),
            dependencies: package
                .requires
                .iter()
                .map(|(target, constraint)| JsonDependency {
                    name: target,
                    required: constraint,
                })
                .collect(),
        })
        .collect::<Vec<_>>();
    let mut output = serde_json::to_string_pretty(&entries)?;
    output.push('\n');
    Ok(output)
}

/// Forward mode: each root at top level, sub-dependencies nested beneath
/// with the constraint that produced the edge.
fn render_forward(packages: &BTreeMap<PackageName, LockedPackage>) -> String {
    // Roots are the packages nothing else in the partition depends on.
    let dependents = invert(packages);
    let mut lines = Vec::new();
    let mut visited = FxHashSet::default();

    for (name, package) in packages {
        if !dependents.contains_key(name) {
            visit_forward(packages, name, package, None, 0, &mut visited, &mut lines);
        }
    }
    // Cycle members with no outside dependent are reachable from no root;
    // show them rather than dropping them.
    for (name, package) in packages {
        if !visited.contains(name) {
            visit_forward(packages, name, package, None, 0, &mut visited, &mut lines);
        }
    }

    lines.join("\n") + "\n"
}

fn visit_forward<'lock>(
    packages: &'lock BTreeMap<PackageName, LockedPackage>,
    name: &'lock PackageName,
    package: &'lock LockedPackage,
    constraint: Option<&str>,
    depth: usize,
    visited: &mut FxHashSet<&'lock PackageName>,
    lines: &mut Vec<String>,
) {
    let mut header = format!("{name}=={}", package.pin.describe());
    if let Some(constraint) = constraint {
        header.push_str(&format!(
            " [requires: {}]",
            describe_constraint(name, constraint)
        ));
    }
    let indent = "  ".repeat(depth);
    let prefix = if depth == 0 { "" } else { "- " };

    if !visited.insert(name) {
        // Already rendered in full elsewhere (or a cycle back-edge).
        lines.push(format!("{indent}{prefix}{header} (*)"));
        return;
    }
    lines.push(format!("{indent}{prefix}{header}"));

    for (target, constraint) in &package.requires {
        if let Some((target, target_package)) = packages.get_key_value(target) {
            visit_forward(
                packages,
                target,
                target_package,
                Some(constraint),
                depth + 1,
                visited,
                lines,
            );
        }
    }
}

/// Reverse mode: every package printed as a header, with its dependents
/// nested beneath it. A dependent always appears after the dependency it
/// references, so a textual search finds the dependency header first.
fn render_reverse(packages: &BTreeMap<PackageName, LockedPackage>) -> String {
    let dependents = invert(packages);
    let mut lines = Vec::new();

    for (name, package) in packages {
        lines.push(format!("{name}=={}", package.pin.describe()));
        if let Some(dependents) = dependents.get(name) {
            for (dependent, constraint) in dependents {
                let dependent_package = &packages[*dependent];
                lines.push(format!(
                    "  - {dependent}=={} [requires: {}]",
                    dependent_package.pin.describe(),
                    describe_constraint(name, constraint),
                ));
            }
        }
    }

    lines.join("\n") + "\n"
}

/// The `name(constraint)` text shown for an edge, e.g. `certifi>=2017.4.17`.
/// An unconstrained edge renders as the bare name.
fn describe_constraint(name: &PackageName, constraint: &str) -> String {
    if constraint == "*" {
        name.to_string()
    } else {
        format!("{name}{constraint}")
    }
}

/// Invert the requires-edges: dependency name to `(dependent, constraint)`,
/// sorted by dependent name.
fn invert(
    packages: &BTreeMap<PackageName, LockedPackage>,
) -> BTreeMap<&PackageName, Vec<(&PackageName, &str)>> {
    let mut dependents: BTreeMap<&PackageName, Vec<(&PackageName, &str)>> = BTreeMap::new();
    for (name, package) in packages {
        for (target, constraint) in &package.requires {
            if packages.contains_key(target) {
                dependents
                    .entry(target)
                    .or_default()
                    .push((name, constraint.as_str()));
            }
        }
    }
    for entries in dependents.values_mut() {
        entries.sort_unstable();
    }
    dependents
}
