use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::SpecParseError;

/// A package version: epoch, release segments, and optional pre-release,
/// post-release, and dev-release suffixes.
///
/// Ordering follows the standard version precedence rules: for a given
/// release, dev releases sort before pre-releases, pre-releases before the
/// final release, and post-releases after it. Release segments compare
/// numerically with implicit zero padding, so `1.0` and `1.0.0` are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    epoch: u64,
    release: Vec<u64>,
    pre: Option<PreRelease>,
    post: Option<u64>,
    dev: Option<u64>,
}

/// The kind of a pre-release segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreReleaseKind {
    Alpha,
    Beta,
    Rc,
}

/// A pre-release segment, such as the `rc1` in `2.0rc1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PreRelease {
    pub kind: PreReleaseKind,
    pub number: u64,
}

impl Version {
    /// Construct a final release from its release segments.
    pub fn from_release(release: Vec<u64>) -> Self {
        Self {
            epoch: 0,
            release,
            pre: None,
            post: None,
            dev: None,
        }
    }

    /// Set the pre-release segment.
    #[must_use]
    pub fn with_pre(mut self, pre: PreRelease) -> Self {
        self.pre = Some(pre);
        self
    }

    /// Set the dev-release segment.
    #[must_use]
    pub fn with_dev(mut self, dev: u64) -> Self {
        self.dev = Some(dev);
        self
    }

    /// Set the post-release segment.
    #[must_use]
    pub fn with_post(mut self, post: u64) -> Self {
        self.post = Some(post);
        self
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn pre(&self) -> Option<PreRelease> {
        self.pre
    }

    /// Whether this is a pre-release (including dev releases).
    pub fn any_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    /// Compare release segments with implicit zero padding.
    fn cmp_release(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for index in 0..len {
            let left = self.release.get(index).copied().unwrap_or(0);
            let right = other.release.get(index).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => {}
                ordering => return ordering,
            }
        }
        Ordering::Equal
    }

    /// The suffix sort key: dev < pre < final < post for the same release.
    fn suffix_key(&self) -> (PreKey, PostKey, DevKey) {
        let pre = match self.pre {
            // A dev release without a pre-release sorts before any pre-release.
            None if self.post.is_none() && self.dev.is_some() => PreKey::Min,
            None => PreKey::Final,
            Some(pre) => PreKey::Pre(pre),
        };
        let post = match self.post {
            None => PostKey::Min,
            Some(number) => PostKey::Post(number),
        };
        let dev = match self.dev {
            None => DevKey::Final,
            Some(number) => DevKey::Dev(number),
        };
        (pre, post, dev)
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum PreKey {
    Min,
    Pre(PreRelease),
    Final,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum PostKey {
    Min,
    Post(u64),
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum DevKey {
    Dev(u64),
    Final,
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.cmp_release(other))
            .then_with(|| self.suffix_key().cmp(&other.suffix_key()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = SpecParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SpecParseError::version(input, "empty version"));
        }
        let lower = trimmed.to_ascii_lowercase();
        let mut rest = lower.as_str();

        // Optional epoch, e.g. `1!2.0`.
        let mut epoch = 0;
        if let Some((prefix, suffix)) = rest.split_once('!') {
            epoch = prefix
                .parse::<u64>()
                .map_err(|_| SpecParseError::version(input, "invalid epoch"))?;
            rest = suffix;
        }

        // Release segments.
        let mut release = Vec::new();
        loop {
            let digits = leading_digits(rest);
            if digits.is_empty() {
                return Err(SpecParseError::version(input, "expected a release segment"));
            }
            release.push(
                digits
                    .parse::<u64>()
                    .map_err(|_| SpecParseError::version(input, "release segment too large"))?,
            );
            rest = &rest[digits.len()..];
            match rest.strip_prefix('.') {
                // A trailing suffix such as `.post1` ends the release.
                Some(suffix) if suffix.starts_with(|c: char| c.is_ascii_digit()) => rest = suffix,
                _ => break,
            }
        }

        // Optional pre-release, e.g. `a1`, `b2`, `rc3`.
        let mut pre = None;
        for (label, kind) in [
            ("alpha", PreReleaseKind::Alpha),
            ("beta", PreReleaseKind::Beta),
            ("rc", PreReleaseKind::Rc),
            ("a", PreReleaseKind::Alpha),
            ("b", PreReleaseKind::Beta),
            ("c", PreReleaseKind::Rc),
        ] {
            if let Some(suffix) = rest
                .strip_prefix('.')
                .unwrap_or(rest)
                .strip_prefix(label)
            {
                let digits = leading_digits(suffix);
                let number = if digits.is_empty() {
                    0
                } else {
                    digits
                        .parse::<u64>()
                        .map_err(|_| SpecParseError::version(input, "pre-release number too large"))?
                };
                pre = Some(PreRelease { kind, number });
                rest = &suffix[digits.len()..];
                break;
            }
        }

        // Optional post-release, e.g. `.post1`.
        let mut post = None;
        for label in [".post", "-"] {
            if let Some(suffix) = rest.strip_prefix(label) {
                let digits = leading_digits(suffix);
                if digits.is_empty() {
                    return Err(SpecParseError::version(input, "expected a post-release number"));
                }
                post = Some(
                    digits
                        .parse::<u64>()
                        .map_err(|_| SpecParseError::version(input, "post-release number too large"))?,
                );
                rest = &suffix[digits.len()..];
                break;
            }
        }

        // Optional dev-release, e.g. `.dev1`.
        let mut dev = None;
        if let Some(suffix) = rest.strip_prefix(".dev") {
            let digits = leading_digits(suffix);
            dev = Some(if digits.is_empty() {
                0
            } else {
                digits
                    .parse::<u64>()
                    .map_err(|_| SpecParseError::version(input, "dev-release number too large"))?
            });
            rest = &suffix[digits.len()..];
        }

        if !rest.is_empty() {
            return Err(SpecParseError::version(
                input,
                format!("unexpected trailing input `{rest}`"),
            ));
        }

        Ok(Self {
            epoch,
            release,
            pre,
            post,
            dev,
        })
    }
}

fn leading_digits(input: &str) -> &str {
    let end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    &input[..end]
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}!", self.epoch)?;
        }
        let release = self
            .release
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{release}")?;
        if let Some(PreRelease { kind, number }) = self.pre {
            let label = match kind {
                PreReleaseKind::Alpha => "a",
                PreReleaseKind::Beta => "b",
                PreReleaseKind::Rc => "rc",
            };
            write!(f, "{label}{number}")?;
        }
        if let Some(post) = self.post {
            write!(f, ".post{post}")?;
        }
        if let Some(dev) = self.dev {
            write!(f, ".dev{dev}")?;
        }
        Ok(())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        Self::from_str(&string).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(input: &str) -> Version {
        Version::from_str(input).unwrap()
    }

    #[test]
    fn parse_display_roundtrip() {
        for input in [
            "1.0", "2.18.4", "1!2.0", "1.0a1", "1.0b2", "1.0rc3", "1.0.post1", "1.0.dev2",
            "3.0rc1.post2.dev3",
        ] {
            assert_eq!(version(input).to_string(), input);
        }
    }

    #[test]
    fn parse_alternate_spellings() {
        assert_eq!(version("1.0alpha1"), version("1.0a1"));
        assert_eq!(version("1.0beta2"), version("1.0b2"));
        assert_eq!(version("1.0c1"), version("1.0rc1"));
        assert_eq!(version("1.0-1"), version("1.0.post1"));
        assert_eq!(version("1.0.RC1"), version("1.0rc1"));
    }

    #[test]
    fn zero_padding() {
        assert_eq!(version("1.0"), version("1.0.0"));
        assert!(version("1.0.1") > version("1.0"));
    }

    #[test]
    fn precedence() {
        let ordered = [
            "0.9", "1.0.dev1", "1.0a1", "1.0a2", "1.0b1", "1.0rc1", "1.0", "1.0.post1", "1.1",
            "1!0.5",
        ];
        for window in ordered.windows(2) {
            assert!(
                version(window[0]) < version(window[1]),
                "{} < {}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn prerelease_detection() {
        assert!(version("1.0a1").any_prerelease());
        assert!(version("1.0.dev1").any_prerelease());
        assert!(!version("1.0").any_prerelease());
        assert!(!version("1.0.post1").any_prerelease());
    }

    #[test]
    fn invalid() {
        for input in ["", "abc", "1.0.x", "1..0", "!2.0"] {
            assert!(Version::from_str(input).is_err(), "{input}");
        }
    }
}
