//! Specification tree
//!
//! A link specification is either an **atomic** node (one measure applied to a
//! source and a target property expression, with a threshold) or a
//! **composite** node (a binary combinator over two sub-specifications, with an
//! optional threshold override).
//!
//! Trees are built once (by the parser or the checked constructors below) and
//! never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpecError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("`{name}` expects {expected} arguments, found {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("unknown preprocessing function `{name}`")]
    UnknownFunction { name: String },
    #[error("atomic measure `{measure}` is missing its threshold")]
    MissingThreshold { measure: String },
    #[error("threshold {value} of `{node}` is outside [0, 1]")]
    ThresholdOutOfRange { node: String, value: f64 },
    #[error("`{expression}` refers to variable `{found}`, expected `{expected}`")]
    WrongVariable {
        expression: String,
        expected: String,
        found: String,
    },
}

pub(crate) fn check_threshold(node: impl FnOnce() -> String, value: f64) -> Result<(), SpecError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SpecError::ThresholdOutOfRange {
            node: node(),
            value,
        })
    }
}

// ============================================================================
// Combinators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    And,
    Or,
    Minus,
    Xor,
}

impl Combinator {
    pub const ALL: [Combinator; 4] = [
        Combinator::And,
        Combinator::Or,
        Combinator::Minus,
        Combinator::Xor,
    ];

    /// Case-insensitive keyword lookup.
    pub fn from_keyword(word: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.keyword().eq_ignore_ascii_case(word))
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Combinator::And => "AND",
            Combinator::Or => "OR",
            Combinator::Minus => "MINUS",
            Combinator::Xor => "XOR",
        }
    }

    /// Whether swapping the operands leaves the result unchanged.
    pub fn is_commutative(self) -> bool {
        !matches!(self, Combinator::Minus)
    }
}

impl fmt::Display for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

// ============================================================================
// Property expressions
// ============================================================================

/// Value preprocessing applied before a measure compares values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Lowercase,
    Uppercase,
    Trim,
    /// Drop a trailing `@lang` tag.
    NoLang,
    /// Keep only the local name of an IRI.
    CleanIri,
    /// Keep digits, sign and decimal separator.
    Number,
    /// Replace everything but letters and digits with a space.
    RegularAlphabet,
}

impl Transform {
    pub const ALL: [Transform; 7] = [
        Transform::Lowercase,
        Transform::Uppercase,
        Transform::Trim,
        Transform::NoLang,
        Transform::CleanIri,
        Transform::Number,
        Transform::RegularAlphabet,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Transform::Lowercase => "lowercase",
            Transform::Uppercase => "uppercase",
            Transform::Trim => "trim",
            Transform::NoLang => "nolang",
            Transform::CleanIri => "cleaniri",
            Transform::Number => "number",
            Transform::RegularAlphabet => "regularalphabet",
        }
    }

    pub fn apply(self, value: &str) -> String {
        match self {
            Transform::Lowercase => value.to_lowercase(),
            Transform::Uppercase => value.to_uppercase(),
            Transform::Trim => value.trim().to_string(),
            Transform::NoLang => match value.rfind('@') {
                Some(at)
                    if at + 1 < value.len()
                        && value[at + 1..]
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '-') =>
                {
                    value[..at].to_string()
                }
                _ => value.to_string(),
            },
            Transform::CleanIri => match value.rfind(['/', '#']) {
                Some(idx) => value[idx + 1..].to_string(),
                None => value.to_string(),
            },
            Transform::Number => value
                .chars()
                .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
                .collect(),
            Transform::RegularAlphabet => value
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { ' ' })
                .collect(),
        }
    }
}

impl FromStr for Transform {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| SpecError::UnknownFunction {
                name: s.to_string(),
            })
    }
}

/// `var.property` or, for interval-valued measures, `var.begin|end`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyRef {
    pub var: String,
    pub property: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_property: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyExpr {
    Property(PropertyRef),
    Apply {
        function: Transform,
        arg: Box<PropertyExpr>,
    },
}

impl PropertyExpr {
    pub fn property(var: impl Into<String>, property: impl Into<String>) -> Self {
        PropertyExpr::Property(PropertyRef {
            var: var.into(),
            property: property.into(),
            end_property: None,
        })
    }

    pub fn interval(
        var: impl Into<String>,
        begin: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        PropertyExpr::Property(PropertyRef {
            var: var.into(),
            property: begin.into(),
            end_property: Some(end.into()),
        })
    }

    pub fn apply(function: Transform, arg: PropertyExpr) -> Self {
        PropertyExpr::Apply {
            function,
            arg: Box::new(arg),
        }
    }

    /// The property reference at the bottom of the expression.
    pub fn reference(&self) -> &PropertyRef {
        match self {
            PropertyExpr::Property(r) => r,
            PropertyExpr::Apply { arg, .. } => arg.reference(),
        }
    }

    /// Transforms in application order (innermost first).
    pub fn transforms(&self) -> Vec<Transform> {
        let mut out = Vec::new();
        let mut cur = self;
        while let PropertyExpr::Apply { function, arg } = cur {
            out.push(*function);
            cur = arg;
        }
        out.reverse();
        out
    }

    pub fn var(&self) -> &str {
        &self.reference().var
    }

    /// Apply the transform chain to one raw value.
    pub fn preprocess(&self, value: &str) -> String {
        self.transforms()
            .into_iter()
            .fold(value.to_string(), |acc, t| t.apply(&acc))
    }
}

impl fmt::Display for PropertyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.var, self.property)?;
        if let Some(end) = &self.end_property {
            write!(f, "|{end}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PropertyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyExpr::Property(r) => r.fmt(f),
            PropertyExpr::Apply { function, arg } => write!(f, "{}({arg})", function.name()),
        }
    }
}

// ============================================================================
// Tree
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicSpec {
    pub measure: String,
    pub source: PropertyExpr,
    pub target: PropertyExpr,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSpec {
    pub op: Combinator,
    pub left: Box<LinkSpec>,
    pub right: Box<LinkSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl CompositeSpec {
    /// Threshold applied after combination; `0` when no override is given.
    pub fn effective_threshold(&self) -> f64 {
        self.threshold.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum LinkSpec {
    Atomic(AtomicSpec),
    Composite(CompositeSpec),
}

impl LinkSpec {
    /// Checked constructor for an atomic node.
    pub fn atomic(
        measure: impl Into<String>,
        source: PropertyExpr,
        target: PropertyExpr,
        threshold: f64,
    ) -> Result<Self, SpecError> {
        let atomic = AtomicSpec {
            measure: measure.into().to_ascii_lowercase(),
            source,
            target,
            threshold,
        };
        check_threshold(|| atomic.to_string(), threshold)?;
        Ok(LinkSpec::Atomic(atomic))
    }

    /// Checked constructor for a composite node.
    pub fn composite(
        op: Combinator,
        left: LinkSpec,
        right: LinkSpec,
        threshold: Option<f64>,
    ) -> Result<Self, SpecError> {
        let composite = CompositeSpec {
            op,
            left: Box::new(left),
            right: Box::new(right),
            threshold,
        };
        if let Some(t) = threshold {
            check_threshold(|| composite.to_string(), t)?;
        }
        Ok(LinkSpec::Composite(composite))
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, LinkSpec::Atomic(_))
    }

    /// Check every threshold in the tree. Trees built by the parser or the
    /// checked constructors always pass; deserialized or hand-built ones may not.
    pub fn validate(&self) -> Result<(), SpecError> {
        match self {
            LinkSpec::Atomic(a) => check_threshold(|| a.to_string(), a.threshold),
            LinkSpec::Composite(c) => {
                if let Some(t) = c.threshold {
                    check_threshold(|| c.to_string(), t)?;
                }
                c.left.validate()?;
                c.right.validate()
            }
        }
    }

    /// Threshold applied at this node.
    pub fn threshold(&self) -> f64 {
        match self {
            LinkSpec::Atomic(a) => a.threshold,
            LinkSpec::Composite(c) => c.effective_threshold(),
        }
    }

    /// All atomic leaves, left to right.
    pub fn atoms(&self) -> Vec<&AtomicSpec> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a AtomicSpec>) {
        match self {
            LinkSpec::Atomic(a) => out.push(a),
            LinkSpec::Composite(c) => {
                c.left.collect_atoms(out);
                c.right.collect_atoms(out);
            }
        }
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        match self {
            LinkSpec::Atomic(_) => 1,
            LinkSpec::Composite(c) => 1 + c.left.size() + c.right.size(),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            LinkSpec::Atomic(_) => 1,
            LinkSpec::Composite(c) => 1 + c.left.depth().max(c.right.depth()),
        }
    }
}

impl fmt::Display for AtomicSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({},{})|{}",
            self.measure, self.source, self.target, self.threshold
        )
    }
}

impl fmt::Display for CompositeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{})", self.op, self.left, self.right)?;
        if let Some(t) = self.threshold {
            write!(f, "|{t}")?;
        }
        Ok(())
    }
}

impl fmt::Display for LinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkSpec::Atomic(a) => a.fmt(f),
            LinkSpec::Composite(c) => c.fmt(f),
        }
    }
}
