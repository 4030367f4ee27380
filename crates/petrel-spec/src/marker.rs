//! Environment marker expressions.
//!
//! Markers make a requirement conditional on the target environment, e.g.
//! `os_name == 'nt'` or `python_version >= '3.7' and extra == 'socks'`. The
//! lockfile stores markers unevaluated; they are only consulted when
//! computing the install set for a concrete environment.

use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use petrel_normalize::ExtraName;

use crate::version::Version;
use crate::SpecParseError;

/// An environment attribute that can appear on the left-hand side of a
/// marker comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKey {
    /// `os_name`
    OsName,
    /// `sys_platform`
    SysPlatform,
    /// `platform_machine`
    PlatformMachine,
    /// `platform_system`
    PlatformSystem,
    /// `platform_release`
    PlatformRelease,
    /// `platform_version`
    PlatformVersion,
    /// `platform_python_implementation`
    PlatformPythonImplementation,
    /// `implementation_name`
    ImplementationName,
    /// `python_version`
    PythonVersion,
    /// `python_full_version`
    PythonFullVersion,
    /// `extra`
    Extra,
}

impl MarkerKey {
    /// Whether values for this key compare as versions rather than strings.
    fn is_version(self) -> bool {
        matches!(self, Self::PythonVersion | Self::PythonFullVersion)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::OsName => "os_name",
            Self::SysPlatform => "sys_platform",
            Self::PlatformMachine => "platform_machine",
            Self::PlatformSystem => "platform_system",
            Self::PlatformRelease => "platform_release",
            Self::PlatformVersion => "platform_version",
            Self::PlatformPythonImplementation => "platform_python_implementation",
            Self::ImplementationName => "implementation_name",
            Self::PythonVersion => "python_version",
            Self::PythonFullVersion => "python_full_version",
            Self::Extra => "extra",
        }
    }
}

impl FromStr for MarkerKey {
    type Err = ();

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "os_name" => Ok(Self::OsName),
            "sys_platform" => Ok(Self::SysPlatform),
            "platform_machine" => Ok(Self::PlatformMachine),
            "platform_system" => Ok(Self::PlatformSystem),
            "platform_release" => Ok(Self::PlatformRelease),
            "platform_version" => Ok(Self::PlatformVersion),
            "platform_python_implementation" => Ok(Self::PlatformPythonImplementation),
            "implementation_name" => Ok(Self::ImplementationName),
            "python_version" => Ok(Self::PythonVersion),
            "python_full_version" => Ok(Self::PythonFullVersion),
            "extra" => Ok(Self::Extra),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A comparison operator inside a marker expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    In,
    NotIn,
}

impl MarkerOperator {
    fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanEqual => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }

    /// The operator with its operands swapped, for normalizing
    /// `'nt' == os_name` into `os_name == 'nt'`.
    fn flipped(self) -> Option<Self> {
        match self {
            Self::Equal => Some(Self::Equal),
            Self::NotEqual => Some(Self::NotEqual),
            Self::LessThan => Some(Self::GreaterThan),
            Self::LessThanEqual => Some(Self::GreaterThanEqual),
            Self::GreaterThan => Some(Self::LessThan),
            Self::GreaterThanEqual => Some(Self::LessThanEqual),
            // `in` has no mirrored form with a key on the left.
            Self::In | Self::NotIn => None,
        }
    }
}

impl std::fmt::Display for MarkerOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single comparison, e.g. `os_name == 'nt'`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarkerExpression {
    pub key: MarkerKey,
    pub operator: MarkerOperator,
    pub value: String,
}

impl std::fmt::Display for MarkerExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} '{}'", self.key, self.operator, self.value)
    }
}

/// A parsed marker expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MarkerTree {
    Expression(MarkerExpression),
    And(Vec<MarkerTree>),
    Or(Vec<MarkerTree>),
}

impl MarkerTree {
    /// Evaluate against a concrete environment, with the given extras
    /// considered active.
    ///
    /// Evaluation is total: a comparison against an attribute the
    /// environment does not define is `false`, never an error.
    pub fn evaluate(&self, env: &MarkerEnvironment, extras: &[ExtraName]) -> bool {
        self.evaluate_inner(Some(env), extras)
    }

    /// Evaluate only the `extra` comparisons, treating every environment
    /// comparison as satisfied.
    ///
    /// Resolution proceeds as if all environment markers match, so this is
    /// the only marker filtering applied while resolving: an extra-guarded
    /// sub-requirement is skipped unless that extra was activated.
    pub fn evaluate_optimistically(&self, extras: &[ExtraName]) -> bool {
        self.evaluate_inner(None, extras)
    }

    fn evaluate_inner(&self, env: Option<&MarkerEnvironment>, extras: &[ExtraName]) -> bool {
        match self {
            Self::Expression(expression) => Self::evaluate_expression(expression, env, extras),
            Self::And(children) => children
                .iter()
                .all(|child| child.evaluate_inner(env, extras)),
            Self::Or(children) => children
                .iter()
                .any(|child| child.evaluate_inner(env, extras)),
        }
    }

    fn evaluate_expression(
        expression: &MarkerExpression,
        env: Option<&MarkerEnvironment>,
        extras: &[ExtraName],
    ) -> bool {
        if expression.key == MarkerKey::Extra {
            let Ok(extra) = ExtraName::new(&expression.value) else {
                return false;
            };
            let contained = extras.contains(&extra);
            return match expression.operator {
                MarkerOperator::Equal | MarkerOperator::In => contained,
                MarkerOperator::NotEqual | MarkerOperator::NotIn => !contained,
                // Ordering comparisons against `extra` are meaningless.
                _ => false,
            };
        }

        // Without an environment, every non-extra comparison is satisfied.
        let Some(env) = env else {
            return true;
        };

        // Comparisons against an undefined attribute are false.
        let Some(left) = env.get(expression.key) else {
            return false;
        };

        if expression.key.is_version() {
            if let (Ok(left), Ok(right)) = (
                Version::from_str(left),
                Version::from_str(&expression.value),
            ) {
                return match expression.operator {
                    MarkerOperator::Equal => left == right,
                    MarkerOperator::NotEqual => left != right,
                    MarkerOperator::LessThan => left < right,
                    MarkerOperator::LessThanEqual => left <= right,
                    MarkerOperator::GreaterThan => left > right,
                    MarkerOperator::GreaterThanEqual => left >= right,
                    MarkerOperator::In => expression.value.contains(left.to_string().as_str()),
                    MarkerOperator::NotIn => !expression.value.contains(left.to_string().as_str()),
                };
            }
        }

        let right = expression.value.as_str();
        match expression.operator {
            MarkerOperator::Equal => left == right,
            MarkerOperator::NotEqual => left != right,
            MarkerOperator::LessThan => left < right,
            MarkerOperator::LessThanEqual => left <= right,
            MarkerOperator::GreaterThan => left > right,
            MarkerOperator::GreaterThanEqual => left >= right,
            MarkerOperator::In => right.contains(left),
            MarkerOperator::NotIn => !right.contains(left),
        }
    }

    /// Render nested children, parenthesizing mixed conjunctions.
    fn fmt_child(child: &Self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match child {
            Self::Expression(_) => write!(f, "{child}"),
            Self::And(_) | Self::Or(_) => write!(f, "({child})"),
        }
    }
}

impl std::fmt::Display for MarkerTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expression(expression) => write!(f, "{expression}"),
            Self::And(children) => {
                for (index, child) in children.iter().enumerate() {
                    if index > 0 {
                        f.write_str(" and ")?;
                    }
                    Self::fmt_child(child, f)?;
                }
                Ok(())
            }
            Self::Or(children) => {
                for (index, child) in children.iter().enumerate() {
                    if index > 0 {
                        f.write_str(" or ")?;
                    }
                    Self::fmt_child(child, f)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for MarkerTree {
    type Err = SpecParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            input,
            chars: input.char_indices().peekable(),
        };
        let tree = parser.parse_or()?;
        parser.skip_whitespace();
        if let Some((position, _)) = parser.chars.peek().copied() {
            return Err(SpecParseError::marker(
                input,
                format!("unexpected trailing input at offset {position}"),
            ));
        }
        Ok(tree)
    }
}

impl Serialize for MarkerTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MarkerTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        Self::from_str(&string).map_err(serde::de::Error::custom)
    }
}

/// A recursive-descent parser over the marker grammar:
///
/// ```text
/// or_expr  := and_expr ('or' and_expr)*
/// and_expr := atom ('and' atom)*
/// atom     := '(' or_expr ')' | value op value
/// value    := marker key | quoted string
/// ```
struct Parser<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

enum Value {
    Key(MarkerKey),
    Literal(String),
}

impl Parser<'_> {
    fn parse_or(&mut self) -> Result<MarkerTree, SpecParseError> {
        let mut children = vec![self.parse_and()?];
        while self.eat_word("or") {
            children.push(self.parse_and()?);
        }
        Ok(match children.len() {
            1 => children.remove(0),
            _ => MarkerTree::Or(children),
        })
    }

    fn parse_and(&mut self) -> Result<MarkerTree, SpecParseError> {
        let mut children = vec![self.parse_atom()?];
        while self.eat_word("and") {
            children.push(self.parse_atom()?);
        }
        Ok(match children.len() {
            1 => children.remove(0),
            _ => MarkerTree::And(children),
        })
    }

    fn parse_atom(&mut self) -> Result<MarkerTree, SpecParseError> {
        self.skip_whitespace();
        if self.eat_char('(') {
            let tree = self.parse_or()?;
            self.skip_whitespace();
            if !self.eat_char(')') {
                return Err(SpecParseError::marker(self.input, "expected `)`"));
            }
            return Ok(tree);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<MarkerTree, SpecParseError> {
        let left = self.parse_value()?;
        let operator = self.parse_operator()?;
        let right = self.parse_value()?;

        let (key, operator, value) = match (left, right) {
            (Value::Key(key), Value::Literal(value)) => (key, operator, value),
            (Value::Literal(value), Value::Key(key)) => {
                let Some(flipped) = operator.flipped() else {
                    return Err(SpecParseError::marker(
                        self.input,
                        format!("`{operator}` requires a marker key on the left-hand side"),
                    ));
                };
                (key, flipped, value)
            }
            (Value::Key(_), Value::Key(_)) => {
                return Err(SpecParseError::marker(
                    self.input,
                    "comparing two marker keys is not supported",
                ));
            }
            (Value::Literal(_), Value::Literal(_)) => {
                return Err(SpecParseError::marker(
                    self.input,
                    "comparing two quoted strings is not supported",
                ));
            }
        };

        Ok(MarkerTree::Expression(MarkerExpression {
            key,
            operator,
            value,
        }))
    }

    fn parse_value(&mut self) -> Result<Value, SpecParseError> {
        self.skip_whitespace();
        match self.chars.peek().copied() {
            Some((_, quote @ ('\'' | '"'))) => {
                self.chars.next();
                let mut literal = String::new();
                loop {
                    match self.chars.next() {
                        Some((_, c)) if c == quote => break,
                        Some((_, c)) => literal.push(c),
                        None => {
                            return Err(SpecParseError::marker(
                                self.input,
                                "unterminated string literal",
                            ));
                        }
                    }
                }
                Ok(Value::Literal(literal))
            }
            Some((start, c)) if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some((position, c)) = self.chars.peek().copied() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        end = position + c.len_utf8();
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                let word = &self.input[start..end];
                MarkerKey::from_str(word).map(Value::Key).map_err(|()| {
                    SpecParseError::marker(self.input, format!("unknown marker key `{word}`"))
                })
            }
            _ => Err(SpecParseError::marker(
                self.input,
                "expected a marker key or quoted string",
            )),
        }
    }

    fn parse_operator(&mut self) -> Result<MarkerOperator, SpecParseError> {
        self.skip_whitespace();
        if self.eat_str("==") {
            Ok(MarkerOperator::Equal)
        } else if self.eat_str("!=") {
            Ok(MarkerOperator::NotEqual)
        } else if self.eat_str("<=") {
            Ok(MarkerOperator::LessThanEqual)
        } else if self.eat_str(">=") {
            Ok(MarkerOperator::GreaterThanEqual)
        } else if self.eat_char('<') {
            Ok(MarkerOperator::LessThan)
        } else if self.eat_char('>') {
            Ok(MarkerOperator::GreaterThan)
        } else if self.eat_word("not") {
            if self.eat_word("in") {
                Ok(MarkerOperator::NotIn)
            } else {
                Err(SpecParseError::marker(self.input, "expected `in` after `not`"))
            }
        } else if self.eat_word("in") {
            Ok(MarkerOperator::In)
        } else {
            Err(SpecParseError::marker(
                self.input,
                "expected a comparison operator",
            ))
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn eat_char(&mut self, expected: char) -> bool {
        if matches!(self.chars.peek(), Some((_, c)) if *c == expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, expected: &str) -> bool {
        let mut lookahead = self.chars.clone();
        for expected_char in expected.chars() {
            match lookahead.next() {
                Some((_, c)) if c == expected_char => {}
                _ => return false,
            }
        }
        self.chars = lookahead;
        true
    }

    /// Consume a bare word followed by a non-word boundary.
    fn eat_word(&mut self, word: &str) -> bool {
        self.skip_whitespace();
        let mut lookahead = self.chars.clone();
        for expected_char in word.chars() {
            match lookahead.next() {
                Some((_, c)) if c == expected_char => {}
                _ => return false,
            }
        }
        if matches!(lookahead.peek(), Some((_, c)) if c.is_ascii_alphanumeric() || *c == '_') {
            return false;
        }
        self.chars = lookahead;
        true
    }
}

/// A concrete target environment for marker evaluation.
///
/// Attributes are optional: a marker comparing against an attribute the
/// descriptor leaves unset evaluates to `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerEnvironment {
    pub os_name: Option<String>,
    pub sys_platform: Option<String>,
    pub platform_machine: Option<String>,
    pub platform_system: Option<String>,
    pub platform_release: Option<String>,
    pub platform_version: Option<String>,
    pub platform_python_implementation: Option<String>,
    pub implementation_name: Option<String>,
    pub python_version: Option<String>,
    pub python_full_version: Option<String>,
}

impl MarkerEnvironment {
    fn get(&self, key: MarkerKey) -> Option<&str> {
        match key {
            MarkerKey::OsName => self.os_name.as_deref(),
            MarkerKey::SysPlatform => self.sys_platform.as_deref(),
            MarkerKey::PlatformMachine => self.platform_machine.as_deref(),
            MarkerKey::PlatformSystem => self.platform_system.as_deref(),
            MarkerKey::PlatformRelease => self.platform_release.as_deref(),
            MarkerKey::PlatformVersion => self.platform_version.as_deref(),
            MarkerKey::PlatformPythonImplementation => {
                self.platform_python_implementation.as_deref()
            }
            MarkerKey::ImplementationName => self.implementation_name.as_deref(),
            MarkerKey::PythonVersion => self.python_version.as_deref(),
            MarkerKey::PythonFullVersion => self.python_full_version.as_deref(),
            MarkerKey::Extra => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(input: &str) -> MarkerTree {
        MarkerTree::from_str(input).unwrap()
    }

    fn linux_env() -> MarkerEnvironment {
        MarkerEnvironment {
            os_name: Some("posix".to_string()),
            sys_platform: Some("linux".to_string()),
            python_version: Some("3.6".to_string()),
            python_full_version: Some("3.6.4".to_string()),
            ..MarkerEnvironment::default()
        }
    }

    #[test]
    fn simple_comparison() {
        let env = linux_env();
        assert!(marker("os_name == 'posix'").evaluate(&env, &[]));
        assert!(!marker("os_name == 'nt'").evaluate(&env, &[]));
        assert!(marker("os_name != 'nt'").evaluate(&env, &[]));
    }

    #[test]
    fn version_comparison() {
        let env = linux_env();
        assert!(marker("python_version >= '3.6'").evaluate(&env, &[]));
        assert!(marker("python_version < '3.10'").evaluate(&env, &[]));
        // Lexicographic comparison would get this wrong: "3.6" > "3.10".
        assert!(!marker("python_version < '3.6'").evaluate(&env, &[]));
    }

    #[test]
    fn undefined_attribute_is_false() {
        let env = linux_env();
        assert!(!marker("platform_machine == 'x86_64'").evaluate(&env, &[]));
        assert!(!marker("platform_machine != 'x86_64'").evaluate(&env, &[]));
        assert!(marker("platform_machine == 'x86_64' or os_name == 'posix'").evaluate(&env, &[]));
    }

    #[test]
    fn boolean_structure() {
        let env = linux_env();
        assert!(marker("os_name == 'posix' and python_version >= '3.0'").evaluate(&env, &[]));
        assert!(!marker("os_name == 'nt' and python_version >= '3.0'").evaluate(&env, &[]));
        assert!(marker("os_name == 'nt' or python_version >= '3.0'").evaluate(&env, &[]));
        assert!(marker("(os_name == 'nt' or os_name == 'posix') and python_version >= '3.0'")
            .evaluate(&env, &[]));
    }

    #[test]
    fn reversed_operands() {
        let env = linux_env();
        assert_eq!(marker("'posix' == os_name"), marker("os_name == 'posix'"));
        assert!(marker("'3.4' < python_version").evaluate(&env, &[]));
    }

    #[test]
    fn extras() {
        let socks = ExtraName::new("socks").unwrap();
        let expression = marker("extra == 'socks'");
        assert!(expression.evaluate_optimistically(std::slice::from_ref(&socks)));
        assert!(!expression.evaluate_optimistically(&[]));
        // Environment markers are assumed satisfied during resolution.
        assert!(marker("os_name == 'nonexistent_os'").evaluate_optimistically(&[]));
    }

    #[test]
    fn display_roundtrip() {
        for input in [
            "os_name == 'nt'",
            "os_name == 'nt' and python_version >= '3.6'",
            "extra == 'socks' or extra == 'security'",
            "(os_name == 'nt' or os_name == 'posix') and extra == 'tls'",
        ] {
            let parsed = marker(input);
            assert_eq!(MarkerTree::from_str(&parsed.to_string()).unwrap(), parsed);
            assert_eq!(parsed.to_string(), input);
        }
    }

    #[test]
    fn invalid() {
        for input in [
            "os_name ==",
            "== 'nt'",
            "os_name = 'nt'",
            "os_name == 'nt' and",
            "bogus_key == 'nt'",
            "'a' == 'b'",
            "(os_name == 'nt'",
        ] {
            assert!(MarkerTree::from_str(input).is_err(), "{input}");
        }
    }
}
