//! Version requirements.
//!
//! A [`VersionReq`] is parsed from the requirement strings found in
//! application manifests and reduced to a list of plain comparators that are
//! all ANDed together:
//!
//! | Input            | Meaning                    |
//! |------------------|----------------------------|
//! | `1.2.3`, `=1.2.3`| exactly `1.2.3`            |
//! | `^1.2.3`         | `>=1.2.3, <2.0.0`          |
//! | `^0.2.3`         | `>=0.2.3, <0.3.0`          |
//! | `^0.0.3`         | `>=0.0.3, <0.0.4`          |
//! | `~1.2.3`         | `>=1.2.3, <1.3.0`          |
//! | `~1.2`           | `>=1.2.0, <1.3.0`          |
//! | `1.2.*`, `1.2`   | `>=1.2.0, <1.3.0`          |
//! | `1.*`, `1`       | `>=1.0.0, <2.0.0`          |
//! | `*`              | any version                |
//! | `>=1.2.3, <2.0.0`| both comparators           |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::version::{Version, is_numeric_segment};

/// A single comparison against a concrete version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `=`
    Exact,
    /// `>`
    Greater,
    /// `>=`
    GreaterEq,
    /// `<`
    Less,
    /// `<=`
    LessEq,
}

/// One bound of a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Comparator {
    /// The comparison to apply.
    pub op: Op,
    /// The version compared against.
    pub version: Version,
}

impl Comparator {
    const fn new(op: Op, version: Version) -> Self {
        Self { op, version }
    }

    /// Whether `version` satisfies this bound.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        match self.op {
            Op::Exact => *version == self.version,
            Op::Greater => *version > self.version,
            Op::GreaterEq => *version >= self.version,
            Op::Less => *version < self.version,
            Op::LessEq => *version <= self.version,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            Op::Exact => "=",
            Op::Greater => ">",
            Op::GreaterEq => ">=",
            Op::Less => "<",
            Op::LessEq => "<=",
        };
        write!(f, "{op}{}", self.version)
    }
}

/// A parsed version requirement: a conjunction of [`Comparator`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReq {
    source: String,
    comparators: Vec<Comparator>,
}

/// Why a requirement string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequirementErrorKind {
    /// Nothing to parse.
    #[error("requirement is empty")]
    Empty,
    /// A comma with nothing on one side.
    #[error("empty comparator in list")]
    EmptyClause,
    /// An operator with no version after it.
    #[error("missing version after '{0}'")]
    MissingVersion(String),
    /// A segment that is neither digits nor a wildcard.
    #[error("'{0}' is not a version number")]
    InvalidNumber(String),
    /// More than `major.minor.patch`.
    #[error("'{0}' has more than three version parts")]
    TooManyParts(String),
    /// `1.*.3` and friends.
    #[error("wildcard must only be followed by wildcards in '{0}'")]
    MisplacedWildcard(String),
    /// `>=1.*`, `^1.*`, ...
    #[error("wildcard cannot be combined with operator '{0}'")]
    WildcardWithOperator(String),
}

/// Error returned when a requirement string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version requirement '{input}': {kind}")]
pub struct RequirementParseError {
    /// The full requirement string as given.
    pub input: String,
    /// What was wrong with it.
    pub kind: RequirementErrorKind,
}

impl VersionReq {
    /// Parse a requirement string.
    ///
    /// # Errors
    ///
    /// Returns [`RequirementParseError`] describing the first malformed
    /// comparator.
    pub fn parse(input: &str) -> Result<Self, RequirementParseError> {
        let fail = |kind| RequirementParseError {
            input: input.to_string(),
            kind,
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(fail(RequirementErrorKind::Empty));
        }

        let mut comparators = Vec::new();
        for clause in trimmed.split(',') {
            parse_clause(clause.trim(), &mut comparators).map_err(fail)?;
        }

        Ok(Self {
            source: trimmed.to_string(),
            comparators,
        })
    }

    /// A requirement matching exactly one version.
    #[must_use]
    pub fn exact(version: Version) -> Self {
        Self {
            source: format!("={version}"),
            comparators: vec![Comparator::new(Op::Exact, version)],
        }
    }

    /// A requirement matching every version.
    #[must_use]
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            comparators: Vec::new(),
        }
    }

    /// Whether `version` satisfies every comparator.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }

    /// The highest version in `candidates` that satisfies this requirement.
    pub fn best_match<'a, I>(&self, candidates: I) -> Option<Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        candidates
            .into_iter()
            .filter(|v| self.matches(v))
            .max()
            .copied()
    }

    /// The comparators this requirement reduced to.
    #[must_use]
    pub fn comparators(&self) -> &[Comparator] {
        &self.comparators
    }

    /// The requirement as originally written (trimmed).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for VersionReq {
    type Err = RequirementParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionReq {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for VersionReq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseOp {
    Eq,
    Caret,
    Tilde,
    Gt,
    Ge,
    Lt,
    Le,
}

impl ClauseOp {
    fn split(clause: &str) -> (Option<Self>, &str) {
        const OPS: [(&str, ClauseOp); 7] = [
            (">=", ClauseOp::Ge),
            ("<=", ClauseOp::Le),
            (">", ClauseOp::Gt),
            ("<", ClauseOp::Lt),
            ("=", ClauseOp::Eq),
            ("^", ClauseOp::Caret),
            ("~", ClauseOp::Tilde),
        ];
        for (token, op) in OPS {
            if let Some(rest) = clause.strip_prefix(token) {
                return (Some(op), rest.trim_start());
            }
        }
        (None, clause)
    }

    const fn token(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Caret => "^",
            Self::Tilde => "~",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

/// A possibly incomplete version: `1`, `1.2`, `1.2.3`, `1.*`, `*`.
#[derive(Debug, Clone, Copy)]
struct Partial {
    major: Option<u32>,
    minor: Option<u32>,
    patch: Option<u32>,
    has_wildcard: bool,
}

impl Partial {
    fn parse(text: &str) -> Result<Self, RequirementErrorKind> {
        let parts: Vec<&str> = text.split('.').collect();
        if parts.len() > 3 {
            return Err(RequirementErrorKind::TooManyParts(text.to_string()));
        }

        let mut numbers = [None; 3];
        let mut has_wildcard = false;
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if matches!(*part, "*" | "x" | "X") {
                has_wildcard = true;
            } else if has_wildcard {
                return Err(RequirementErrorKind::MisplacedWildcard(text.to_string()));
            } else if is_numeric_segment(part) {
                *slot = Some(
                    part.parse()
                        .map_err(|_| RequirementErrorKind::InvalidNumber((*part).to_string()))?,
                );
            } else {
                return Err(RequirementErrorKind::InvalidNumber((*part).to_string()));
            }
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            has_wildcard,
        })
    }

    fn floor(self) -> Version {
        Version::new(
            self.major.unwrap_or(0),
            self.minor.unwrap_or(0),
            self.patch.unwrap_or(0),
        )
    }
}

fn parse_clause(clause: &str, out: &mut Vec<Comparator>) -> Result<(), RequirementErrorKind> {
    if clause.is_empty() {
        return Err(RequirementErrorKind::EmptyClause);
    }

    let (op, rest) = ClauseOp::split(clause);
    if rest.is_empty() {
        let token = op.map_or("", ClauseOp::token);
        return Err(RequirementErrorKind::MissingVersion(token.to_string()));
    }

    let partial = Partial::parse(rest)?;
    if partial.has_wildcard
        && let Some(op) = op
        && op != ClauseOp::Eq
    {
        return Err(RequirementErrorKind::WildcardWithOperator(
            op.token().to_string(),
        ));
    }

    let floor = partial.floor();
    match (op.unwrap_or(ClauseOp::Eq), partial.major, partial.minor, partial.patch) {
        // `*`
        (ClauseOp::Eq | ClauseOp::Caret | ClauseOp::Tilde, None, _, _) => {}
        (ClauseOp::Gt | ClauseOp::Ge | ClauseOp::Lt | ClauseOp::Le, None, _, _) => {
            return Err(RequirementErrorKind::MissingVersion(
                op.map_or("", ClauseOp::token).to_string(),
            ));
        },

        (ClauseOp::Eq, Some(_), Some(_), Some(_)) => out.push(Comparator::new(Op::Exact, floor)),
        (ClauseOp::Eq | ClauseOp::Tilde, Some(major), Some(minor), _) => {
            range(out, floor, next_minor(major, minor));
        },
        (ClauseOp::Eq | ClauseOp::Tilde | ClauseOp::Caret, Some(major), None, _) => {
            range(out, floor, next_major(major));
        },

        (ClauseOp::Caret, Some(major), Some(minor), patch) => {
            let upper = if major > 0 {
                next_major(major)
            } else if minor > 0 || patch.is_none() {
                next_minor(0, minor)
            } else {
                next_patch(0, 0, patch.unwrap_or(0))
            };
            range(out, floor, upper);
        },

        (ClauseOp::Gt, Some(major), Some(minor), Some(patch)) => {
            out.push(Comparator::new(Op::Greater, Version::new(major, minor, patch)));
        },
        (ClauseOp::Gt, Some(major), Some(minor), None) => {
            out.push(lower_bound(next_minor(major, minor)));
        },
        (ClauseOp::Gt, Some(major), None, _) => out.push(lower_bound(next_major(major))),

        (ClauseOp::Ge, Some(_), _, _) => out.push(Comparator::new(Op::GreaterEq, floor)),
        (ClauseOp::Lt, Some(_), _, _) => out.push(Comparator::new(Op::Less, floor)),

        (ClauseOp::Le, Some(major), Some(minor), Some(patch)) => {
            out.push(Comparator::new(Op::LessEq, Version::new(major, minor, patch)));
        },
        (ClauseOp::Le, Some(major), Some(minor), None) => {
            if let Some(upper) = next_minor(major, minor) {
                out.push(Comparator::new(Op::Less, upper));
            }
        },
        (ClauseOp::Le, Some(major), None, _) => {
            if let Some(upper) = next_major(major) {
                out.push(Comparator::new(Op::Less, upper));
            }
        },
    }
    Ok(())
}

/// `>= floor` and, when representable, `< upper`.
fn range(out: &mut Vec<Comparator>, floor: Version, upper: Option<Version>) {
    out.push(Comparator::new(Op::GreaterEq, floor));
    if let Some(upper) = upper {
        out.push(Comparator::new(Op::Less, upper));
    }
}

/// `>= bound`, or an unsatisfiable bound when it overflowed.
fn lower_bound(bound: Option<Version>) -> Comparator {
    match bound {
        Some(v) => Comparator::new(Op::GreaterEq, v),
        None => Comparator::new(Op::Greater, Version::new(u32::MAX, u32::MAX, u32::MAX)),
    }
}

fn next_major(major: u32) -> Option<Version> {
    major.checked_add(1).map(|m| Version::new(m, 0, 0))
}

fn next_minor(major: u32, minor: u32) -> Option<Version> {
    match minor.checked_add(1) {
        Some(m) => Some(Version::new(major, m, 0)),
        None => next_major(major),
    }
}

fn next_patch(major: u32, minor: u32, patch: u32) -> Option<Version> {
    match patch.checked_add(1) {
        Some(p) => Some(Version::new(major, minor, p)),
        None => next_minor(major, minor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(s: &str) -> VersionReq {
        VersionReq::parse(s).unwrap()
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn caret_bounds_at_major() {
        let r = req("^1.2.3");
        assert!(r.matches(&v("1.2.3")));
        assert!(r.matches(&v("1.2.4")));
        assert!(r.matches(&v("1.9.9")));
        assert!(!r.matches(&v("1.2.2")));
        assert!(!r.matches(&v("2.0.0")));
    }

    #[test]
    fn caret_treats_leading_zeros_as_breaking() {
        let r = req("^0.2.3");
        assert!(r.matches(&v("0.2.9")));
        assert!(!r.matches(&v("0.3.0")));
        assert!(!r.matches(&v("0.2.2")));

        let r = req("^0.0.3");
        assert!(r.matches(&v("0.0.3")));
        assert!(!r.matches(&v("0.0.4")));
        assert!(!r.matches(&v("0.1.0")));
        assert!(!r.matches(&v("0.0.2")));
    }

    #[test]
    fn caret_with_partial_versions() {
        assert!(req("^1.2").matches(&v("1.7.0")));
        assert!(!req("^1.2").matches(&v("1.1.9")));
        assert!(req("^0.0").matches(&v("0.0.7")));
        assert!(!req("^0.0").matches(&v("0.1.0")));
        assert!(req("^0").matches(&v("0.9.0")));
        assert!(!req("^0").matches(&v("1.0.0")));
    }

    #[test]
    fn tilde_bounds_at_minor() {
        let r = req("~1.2.3");
        assert!(r.matches(&v("1.2.3")));
        assert!(r.matches(&v("1.2.99")));
        assert!(!r.matches(&v("1.3.0")));
        assert!(!r.matches(&v("1.2.2")));

        let r = req("~1.2");
        assert!(r.matches(&v("1.2.0")));
        assert!(!r.matches(&v("1.3.0")));

        assert!(req("~1").matches(&v("1.8.0")));
        assert!(!req("~1").matches(&v("2.0.0")));
    }

    #[test]
    fn wildcard_equals_tilde() {
        let wild = req("1.2.*");
        let tilde = req("~1.2.0");
        for s in ["1.1.9", "1.2.0", "1.2.7", "1.3.0"] {
            assert_eq!(wild.matches(&v(s)), tilde.matches(&v(s)), "{s}");
        }
        assert!(req("1.x").matches(&v("1.5.0")));
        assert!(!req("1.*.*").matches(&v("2.0.0")));
        assert!(req("*").matches(&v("0.0.1")));
        assert!(req("1.2").matches(&v("1.2.8")));
    }

    #[test]
    fn exact_pin() {
        let r = req("1.2.3");
        assert!(r.matches(&v("1.2.3")));
        assert!(!r.matches(&v("1.2.4")));
        assert_eq!(req("=1.2.3"), VersionReq { source: "=1.2.3".into(), ..r });
    }

    #[test]
    fn comparator_lists_are_anded() {
        let r = req(">=1.2.3, <2.0.0");
        assert!(r.matches(&v("1.2.3")));
        assert!(r.matches(&v("1.99.0")));
        assert!(!r.matches(&v("2.0.0")));
        assert!(!r.matches(&v("1.2.2")));

        let r = req(">1.2, <=1.4");
        assert!(!r.matches(&v("1.2.9")));
        assert!(r.matches(&v("1.3.0")));
        assert!(r.matches(&v("1.4.9")));
        assert!(!r.matches(&v("1.5.0")));

        let r = req("> 1.0.0 , < 1.0.5, ~1.0");
        assert!(r.matches(&v("1.0.4")));
        assert!(!r.matches(&v("1.0.0")));
    }

    #[test]
    fn malformed_requirements_are_rejected() {
        let cases = [
            ("", RequirementErrorKind::Empty),
            ("   ", RequirementErrorKind::Empty),
            (">=1.0.0,", RequirementErrorKind::EmptyClause),
            (">=", RequirementErrorKind::MissingVersion(">=".into())),
            ("^1.a.0", RequirementErrorKind::InvalidNumber("a".into())),
            ("1.2.3.4", RequirementErrorKind::TooManyParts("1.2.3.4".into())),
            ("1.*.3", RequirementErrorKind::MisplacedWildcard("1.*.3".into())),
            (">=1.*", RequirementErrorKind::WildcardWithOperator(">=".into())),
            ("^1.2.x", RequirementErrorKind::WildcardWithOperator("^".into())),
            ("latest", RequirementErrorKind::InvalidNumber("latest".into())),
        ];
        for (input, kind) in cases {
            let err = VersionReq::parse(input).unwrap_err();
            assert_eq!(err.kind, kind, "input: {input:?}");
        }
    }

    #[test]
    fn error_message_names_the_input() {
        let err = VersionReq::parse("^one").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("^one"), "{msg}");
        assert!(msg.contains("not a version number"), "{msg}");
    }

    #[test]
    fn best_match_picks_maximum() {
        let versions = [v("1.2.0"), v("1.9.1"), v("2.0.0"), v("1.10.0")];
        assert_eq!(req("^1.2").best_match(&versions), Some(v("1.10.0")));
        assert_eq!(req("^3").best_match(&versions), None);
    }

    #[test]
    fn overflowing_bounds_are_open() {
        let max = u32::MAX;
        let r = req(&format!("^{max}.0.0"));
        assert!(r.matches(&Version::new(max, 7, 0)));
        assert!(!req(&format!(">{max}")).matches(&Version::new(max, max, max)));
    }

    #[test]
    fn serde_uses_source_text() {
        let r: VersionReq = serde_json::from_str("\"^1.2\"").unwrap();
        assert_eq!(r.as_str(), "^1.2");
        assert_eq!(serde_json::to_string(&r).unwrap(), "\"^1.2\"");
        assert!(serde_json::from_str::<VersionReq>("\"^\"").is_err());
    }
}
