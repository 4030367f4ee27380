//! Normalized package and extra names.
//!
//! Package names in manifests and lockfiles are compared after PEP 503-style
//! normalization: `Foo_Bar`, `foo-bar` and `FOO.BAR` all refer to the same
//! package.

use thiserror::Error;

pub use extra_name::ExtraName;
pub use package_name::PackageName;

mod extra_name;
mod package_name;

/// Validate a package or extra name and normalize it.
///
/// Lowercases the name and collapses runs of `-`, `_`, and `.` down to a
/// single `-`. Normalization is idempotent: normalizing an already-normalized
/// name returns it unchanged.
pub(crate) fn validate_and_normalize(name: &str) -> Result<String, InvalidNameError> {
    let mut normalized = String::with_capacity(name.len());

    let mut last = None;
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' => normalized.push(byte.to_ascii_lowercase() as char),
            b'a'..=b'z' | b'0'..=b'9' => normalized.push(byte as char),
            b'-' | b'_' | b'.' => match last {
                // Names can't start with punctuation.
                None => return Err(InvalidNameError(name.to_string())),
                Some(b'-' | b'_' | b'.') => {}
                Some(_) => normalized.push('-'),
            },
            _ => return Err(InvalidNameError(name.to_string())),
        }
        last = Some(byte);
    }

    // Names can't end with punctuation.
    if matches!(last, None | Some(b'-' | b'_' | b'.')) {
        return Err(InvalidNameError(name.to_string()));
    }

    Ok(normalized)
}

/// An invalid [`PackageName`] or [`ExtraName`].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error(
    "Not a valid package or extra name: \"{0}\". Names must start and end with a letter or digit \
     and may only contain -, _, ., and alphanumeric characters."
)]
pub struct InvalidNameError(String);

impl InvalidNameError {
    /// Returns the invalid name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn normalize() {
        let inputs = [
            "friendly-bard",
            "Friendly-Bard",
            "FRIENDLY-BARD",
            "friendly.bard",
            "friendly_bard",
            "friendly--bard",
            "FrIeNdLy-._.-bArD",
        ];
        for input in inputs {
            assert_eq!(
                PackageName::from_str(input).unwrap().as_str(),
                "friendly-bard"
            );
        }
    }

    #[test]
    fn idempotent() {
        let once = PackageName::from_str("Charset__Normalizer").unwrap();
        let twice = PackageName::from_str(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn unchanged() {
        // Already normalized.
        assert_eq!(
            PackageName::from_str("requests").unwrap().as_str(),
            "requests"
        );
    }

    #[test]
    fn invalid() {
        let inputs = ["-starts-with-dash", "ends-with-dash-", "", "no spaces", "no!marks"];
        for input in inputs {
            assert!(PackageName::from_str(input).is_err(), "{input}");
        }
    }
}
