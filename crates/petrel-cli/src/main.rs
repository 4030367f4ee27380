use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;

use petrel_lock::{GraphError, LockError};
use petrel_manifest::ManifestError;
use petrel_normalize::PackageName;
use petrel_resolver::{ResolveError, ResolverConfig};

use crate::commands::{ExitStatus, StaleLockfile};

mod commands;
mod environment;
mod logging;
mod printer;

#[derive(Parser)]
#[command(name = "petrel", author, version)]
#[command(about = "Manifest-driven Python dependency locking")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Do not print any output.
    #[arg(global = true, long, short, conflicts_with = "verbose")]
    quiet: bool,

    /// Use verbose output.
    #[arg(global = true, long, short, conflicts_with = "quiet")]
    verbose: bool,

    /// The manifest to operate on.
    #[arg(global = true, long, default_value = "Pipfile")]
    manifest: PathBuf,

    /// The lockfile to read and write.
    #[arg(global = true, long, default_value = "Pipfile.lock")]
    lockfile: PathBuf,

    /// The number of parallel metadata fetches.
    #[arg(global = true, long, default_value_t = ResolverConfig::default().workers)]
    workers: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the manifest and write the lockfile.
    Lock(LockArgs),
    /// Ensure the lockfile is current, then compute the install set.
    Install(InstallArgs),
    /// Re-resolve every requirement and rewrite the lockfile.
    Update,
    /// Remove declared packages and prune the lockfile.
    Uninstall(UninstallArgs),
    /// Render the locked requires-graph.
    Graph(GraphArgs),
    /// Check the manifest against an observed-imports listing.
    Check(CheckArgs),
}

#[derive(Args)]
struct LockArgs {
    /// Print a flat pinned requirement list instead of writing the lockfile.
    #[arg(short, long)]
    requirements: bool,

    /// With `--requirements`, list the develop section instead.
    #[arg(long, requires = "requirements")]
    dev: bool,
}

#[derive(Args)]
struct InstallArgs {
    /// Include the develop section in the install set.
    #[arg(long)]
    dev: bool,

    /// Fail if the lockfile is missing or stale instead of re-resolving.
    #[arg(long)]
    deploy: bool,
}

#[derive(Args)]
struct UninstallArgs {
    /// The packages to remove.
    #[arg(required = true)]
    package: Vec<PackageName>,
}

#[derive(Args)]
struct GraphArgs {
    /// List, for every package, the packages that depend on it.
    #[arg(long)]
    reverse: bool,

    /// Emit a machine-readable JSON document.
    #[arg(long)]
    json: bool,

    /// Render the develop partition instead of default.
    #[arg(long)]
    dev: bool,
}

#[derive(Args)]
struct CheckArgs {
    /// Report declared packages absent from the given imports listing.
    #[arg(long, value_name = "IMPORTS_FILE")]
    unused: PathBuf,
}

async fn inner() -> Result<ExitStatus> {
    let cli = Cli::parse();

    logging::setup_logging(if cli.verbose {
        logging::Level::Verbose
    } else {
        logging::Level::Default
    });

    let printer = if cli.quiet {
        printer::Printer::Quiet
    } else if cli.verbose {
        printer::Printer::Verbose
    } else {
        printer::Printer::Default
    };

    let config = ResolverConfig {
        workers: cli.workers,
        ..ResolverConfig::default()
    };

    match cli.command {
        Commands::Lock(args) => {
            commands::lock(
                &cli.manifest,
                &cli.lockfile,
                args.requirements,
                args.dev,
                config,
                printer,
            )
            .await
        }
        Commands::Install(args) => {
            commands::install(
                &cli.manifest,
                &cli.lockfile,
                args.dev,
                args.deploy,
                config,
                printer,
            )
            .await
        }
        Commands::Update => commands::update(&cli.manifest, &cli.lockfile, config, printer).await,
        Commands::Uninstall(args) => {
            commands::uninstall(&cli.manifest, &cli.lockfile, &args.package, printer)
        }
        Commands::Graph(args) => {
            commands::graph(&cli.lockfile, args.reverse, args.json, args.dev, printer)
        }
        Commands::Check(args) => commands::check_unused(&cli.manifest, &args.unused, printer),
    }
}

/// Map a failure to the exit code of its error class.
fn classify(err: &anyhow::Error) -> ExitStatus {
    if err.downcast_ref::<StaleLockfile>().is_some() {
        return ExitStatus::Stale;
    }
    if let Some(err) = err.downcast_ref::<ResolveError>() {
        return match err {
            ResolveError::SourceUnavailable { .. } => ExitStatus::SourceUnavailable,
            ResolveError::NoMatchingCandidate(_) => ExitStatus::NoMatchingCandidate,
            ResolveError::Conflict(_) => ExitStatus::Conflict,
            ResolveError::Spec(_) => ExitStatus::MalformedSpec,
            _ => ExitStatus::Failure,
        };
    }
    if let Some(err) = err.downcast_ref::<GraphError>() {
        return match err {
            GraphError::IncompatibleOptions => ExitStatus::Usage,
            GraphError::Json(_) => ExitStatus::Failure,
        };
    }
    if err.downcast_ref::<LockError>().is_some() {
        return ExitStatus::CorruptLockfile;
    }
    if let Some(err) = err.downcast_ref::<ManifestError>() {
        return match err {
            ManifestError::Io(..) => ExitStatus::Failure,
            _ => ExitStatus::MalformedSpec,
        };
    }
    ExitStatus::Failure
}

#[tokio::main]
async fn main() -> ExitCode {
    match inner().await {
        Ok(status) => status.into(),
        Err(err) => {
            #[allow(clippy::print_stderr)]
            {
                let mut causes = err.chain();
                if let Some(cause) = causes.next() {
                    eprintln!("{}: {cause}", "error".red().bold());
                }
                for cause in causes {
                    eprintln!("  {}: {cause}", "Caused by".red().bold());
                }
            }
            classify(&err).into()
        }
    }
}
