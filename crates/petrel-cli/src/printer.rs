#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Printer {
    /// A printer that prints user-facing messages to standard error.
    Default,
    /// A printer that suppresses all output.
    Quiet,
    /// A printer that prints all output, including debug messages.
    Verbose,
}

impl std::fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        match self {
            Self::Default | Self::Verbose => {
                #[allow(clippy::print_stderr)]
                {
                    eprint!("{s}");
                }
            }
            Self::Quiet => {}
        }

        Ok(())
    }
}
