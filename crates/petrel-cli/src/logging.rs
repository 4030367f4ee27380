use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_tree::time::Uptime;
use tracing_tree::HierarchicalLayer;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    /// Show deliberately user-facing messages and errors.
    #[default]
    Default,
    /// Show all messages, including debug messages.
    Verbose,
}

/// Configure `tracing` based on the given [`Level`], taking into account the
/// `RUST_LOG` environment variable.
///
/// The [`Level`] dictates the default filters (which `RUST_LOG` can
/// override) along with the formatting of the output: [`Level::Verbose`]
/// includes targets and uptimes, [`Level::Default`] shows nothing.
pub(crate) fn setup_logging(level: Level) {
    match level {
        Level::Default => {
            // Show nothing, but allow `RUST_LOG` to override.
            let filter = EnvFilter::builder()
                .with_default_directive(LevelFilter::OFF.into())
                .from_env_lossy();

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .without_time()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        Level::Verbose => {
            // Show `DEBUG` messages from our crates, but allow `RUST_LOG` to
            // override.
            let filter = EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("petrel=debug"))
                .unwrap();

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    HierarchicalLayer::default()
                        .with_targets(true)
                        .with_timer(Uptime::default())
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
}
