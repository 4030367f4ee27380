//! The requirement model: versions, version specifiers, environment markers,
//! and dependency declarations in canonical in-memory form.

use thiserror::Error;

pub use marker::{MarkerEnvironment, MarkerExpression, MarkerKey, MarkerOperator, MarkerTree};
pub use requirement::{Requirement, RequirementSource, VcsKind};
pub use specifier::{Operator, VersionSpecifier, VersionSpecifiers};
pub use version::{PreRelease, PreReleaseKind, Version};

mod marker;
mod requirement;
mod specifier;
mod version;

/// A malformed version, specifier, marker, or requirement declaration.
///
/// Parse failures are always surfaced to the user, never recovered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Couldn't parse {kind} `{input}`: {message}")]
pub struct SpecParseError {
    kind: &'static str,
    input: String,
    message: String,
}

impl SpecParseError {
    pub(crate) fn version(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "version",
            input: input.into(),
            message: message.into(),
        }
    }

    pub(crate) fn specifier(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "version specifier",
            input: input.into(),
            message: message.into(),
        }
    }

    pub(crate) fn marker(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "marker expression",
            input: input.into(),
            message: message.into(),
        }
    }

    pub(crate) fn requirement(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "requirement",
            input: input.into(),
            message: message.into(),
        }
    }
}
