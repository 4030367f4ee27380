use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::version::Version;
use crate::SpecParseError;

/// A version comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanEqual,
    /// `~=`
    TildeEqual,
}

impl Operator {
    fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanEqual => ">=",
            Self::TildeEqual => "~=",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single version comparison clause, such as `>=1.21.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionSpecifier {
    operator: Operator,
    version: Version,
}

impl VersionSpecifier {
    /// Build a specifier, validating operator-specific constraints.
    ///
    /// `~=` requires at least two release segments.
    pub fn new(operator: Operator, version: Version) -> Result<Self, SpecParseError> {
        if operator == Operator::TildeEqual && version.release().len() < 2 {
            return Err(SpecParseError::specifier(
                format!("~={version}"),
                "~= operator requires at least two release segments",
            ));
        }
        Ok(Self { operator, version })
    }

    /// An exact `==` pin for the given version.
    pub fn equals_version(version: Version) -> Self {
        Self {
            operator: Operator::Equal,
            version,
        }
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Whether the given version satisfies this clause.
    pub fn contains(&self, version: &Version) -> bool {
        match self.operator {
            Operator::Equal => version == &self.version,
            Operator::NotEqual => version != &self.version,
            Operator::LessThan => version < &self.version,
            Operator::LessThanEqual => version <= &self.version,
            Operator::GreaterThan => version > &self.version,
            Operator::GreaterThanEqual => version >= &self.version,
            Operator::TildeEqual => {
                // `~=1.4.5` is equivalent to `>=1.4.5, ==1.4.*`.
                if version < &self.version {
                    return false;
                }
                let prefix_len = self.version.release().len() - 1;
                let prefix = &self.version.release()[..prefix_len];
                let padded = (0..prefix_len)
                    .map(|index| version.release().get(index).copied().unwrap_or(0))
                    .collect::<Vec<_>>();
                version.epoch() == self.version.epoch() && padded == prefix
            }
        }
    }
}

impl FromStr for VersionSpecifier {
    type Err = SpecParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let (operator, rest) = if let Some(rest) = trimmed.strip_prefix("==") {
            (Operator::Equal, rest)
        } else if let Some(rest) = trimmed.strip_prefix("!=") {
            (Operator::NotEqual, rest)
        } else if let Some(rest) = trimmed.strip_prefix("<=") {
            (Operator::LessThanEqual, rest)
        } else if let Some(rest) = trimmed.strip_prefix(">=") {
            (Operator::GreaterThanEqual, rest)
        } else if let Some(rest) = trimmed.strip_prefix("~=") {
            (Operator::TildeEqual, rest)
        } else if let Some(rest) = trimmed.strip_prefix('<') {
            (Operator::LessThan, rest)
        } else if let Some(rest) = trimmed.strip_prefix('>') {
            (Operator::GreaterThan, rest)
        } else {
            return Err(SpecParseError::specifier(
                input,
                "expected a comparison operator such as `==` or `>=`",
            ));
        };
        let version = Version::from_str(rest.trim())?;
        Self::new(operator, version)
    }
}

impl std::fmt::Display for VersionSpecifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.operator, self.version)
    }
}

/// A comma-separated conjunction of version clauses. Empty means "any
/// version".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VersionSpecifiers(Vec<VersionSpecifier>);

impl VersionSpecifiers {
    /// The empty set of clauses, satisfied by every version.
    pub fn any() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionSpecifier> {
        self.0.iter()
    }

    /// Whether the given version satisfies every clause.
    pub fn contains(&self, version: &Version) -> bool {
        self.0.iter().all(|specifier| specifier.contains(version))
    }

    /// Whether any clause mentions a pre-release version, which opts the
    /// requirement into pre-release candidates.
    pub fn any_prerelease(&self) -> bool {
        self.0
            .iter()
            .any(|specifier| specifier.version().any_prerelease())
    }
}

impl From<VersionSpecifier> for VersionSpecifiers {
    fn from(specifier: VersionSpecifier) -> Self {
        Self(vec![specifier])
    }
}

impl FromIterator<VersionSpecifier> for VersionSpecifiers {
    fn from_iter<T: IntoIterator<Item = VersionSpecifier>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for VersionSpecifiers {
    type Err = SpecParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self::any());
        }
        trimmed
            .split(',')
            .map(|clause| VersionSpecifier::from_str(clause.trim()))
            .collect()
    }
}

impl std::fmt::Display for VersionSpecifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("*");
        }
        let clauses = self
            .0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&clauses)
    }
}

impl Serialize for VersionSpecifiers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionSpecifiers {
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

    fn specifiers(input: &str) -> VersionSpecifiers {
        VersionSpecifiers::from_str(input).unwrap()
    }

    #[test]
    fn contains() {
        let range = specifiers(">=1.21.1,<1.23");
        assert!(range.contains(&version("1.21.1")));
        assert!(range.contains(&version("1.22")));
        assert!(!range.contains(&version("1.23")));
        assert!(!range.contains(&version("1.21")));
    }

    #[test]
    fn exact() {
        let pin = specifiers("==2.18.4");
        assert!(pin.contains(&version("2.18.4")));
        assert!(!pin.contains(&version("2.18.5")));
    }

    #[test]
    fn any() {
        assert!(specifiers("*").contains(&version("0.1.dev0")));
        assert!(specifiers("").is_empty());
        assert_eq!(specifiers("*").to_string(), "*");
    }

    #[test]
    fn tilde_equal() {
        let compatible = specifiers("~=1.4.5");
        assert!(compatible.contains(&version("1.4.5")));
        assert!(compatible.contains(&version("1.4.9")));
        assert!(!compatible.contains(&version("1.5.0")));
        assert!(!compatible.contains(&version("1.4.4")));
    }

    #[test]
    fn tilde_equal_arity() {
        assert!(VersionSpecifier::from_str("~=1").is_err());
    }

    #[test]
    fn roundtrip() {
        for input in [">=1.21.1,<1.23", "==2.18.4", "~=3.1.0", "!=1.25", "*"] {
            assert_eq!(specifiers(input).to_string(), input);
        }
    }

    #[test]
    fn invalid() {
        for input in ["==", "1.0", ">>1.0", ">=one"] {
            assert!(VersionSpecifiers::from_str(input).is_err(), "{input}");
        }
    }
}
