//! Textual grammar for link specifications.
//!
//! ```text
//! spec      := composite | atomic
//! composite := OP '(' spec ',' spec ')' [ '|' threshold ]     OP ∈ AND | OR | MINUS | XOR
//! atomic    := measure '(' propexpr ',' propexpr ')' '|' threshold
//! propexpr  := function '(' propexpr ')' | var '.' property [ '|' property ]
//! ```
//!
//! Parsing happens in two steps: nom produces a raw tree, then `lower` checks
//! arity, thresholds, preprocessing functions and variables while building the
//! final [`LinkSpec`].

use nom::{
    bytes::complete::{take_while, take_while1},
    character::complete::{char as pchar, multispace0},
    combinator::{map_res, opt, recognize},
    multi::separated_list1,
    number::complete::recognize_float,
    sequence::{delimited, pair, preceded},
    IResult,
};

use crate::spec::{check_threshold, AtomicSpec, Combinator, LinkSpec, PropertyExpr, PropertyRef, SpecError, Transform};

/// Variable names that identify source and target property references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOptions {
    pub source_var: String,
    pub target_var: String,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            source_var: "x".to_string(),
            target_var: "y".to_string(),
        }
    }
}

impl ParseOptions {
    /// Accepts SPARQL-style variables (`?src`) as well as bare names.
    pub fn new(source_var: &str, target_var: &str) -> Self {
        Self {
            source_var: source_var.trim_start_matches('?').to_string(),
            target_var: target_var.trim_start_matches('?').to_string(),
        }
    }
}

pub fn parse_link_spec(text: &str) -> Result<LinkSpec, SpecError> {
    parse_link_spec_with(text, &ParseOptions::default())
}

pub fn parse_link_spec_with(text: &str, options: &ParseOptions) -> Result<LinkSpec, SpecError> {
    let raw = run_parser(text, raw_node)?;
    lower(raw, options)
}

/// Parse a standalone property expression such as `lowercase(x.name)`.
pub fn parse_property_expr(text: &str) -> Result<PropertyExpr, SpecError> {
    let raw = run_parser(text, raw_expr)?;
    lower_expr(raw)
}

fn run_parser<'a, O>(
    text: &'a str,
    mut parser: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> Result<O, SpecError> {
    match parser(text) {
        Ok((rest, out)) => {
            let rest_trimmed = rest.trim_start();
            if rest_trimmed.is_empty() {
                Ok(out)
            } else {
                Err(SpecError::Syntax {
                    offset: text.len() - rest_trimmed.len(),
                    message: format!("unexpected trailing input `{}`", excerpt(rest_trimmed)),
                })
            }
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(SpecError::Syntax {
            offset: text.len() - e.input.len(),
            message: if e.input.is_empty() {
                "unexpected end of input".to_string()
            } else {
                format!("unexpected input `{}`", excerpt(e.input))
            },
        }),
        Err(nom::Err::Incomplete(_)) => Err(SpecError::Syntax {
            offset: text.len(),
            message: "unexpected end of input".to_string(),
        }),
    }
}

fn excerpt(s: &str) -> String {
    s.chars().take(16).collect()
}

// ============================================================================
// Raw grammar
// ============================================================================

#[derive(Debug)]
enum RawExpr<'a> {
    Ref {
        var: &'a str,
        property: &'a str,
        end: Option<&'a str>,
    },
    Call {
        name: &'a str,
        arg: Box<RawExpr<'a>>,
    },
}

#[derive(Debug)]
enum RawNode<'a> {
    Composite {
        op: Combinator,
        children: Vec<RawNode<'a>>,
        threshold: Option<f64>,
    },
    Atomic {
        measure: &'a str,
        args: Vec<RawExpr<'a>>,
        threshold: Option<f64>,
    },
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn property_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && !matches!(c, ',' | '(' | ')' | '|'))(input)
}

fn threshold(input: &str) -> IResult<&str, f64> {
    map_res(recognize_float, str::parse::<f64>)(input)
}

fn threshold_suffix(input: &str) -> IResult<&str, Option<f64>> {
    opt(preceded(ws(pchar('|')), ws(threshold)))(input)
}

fn raw_expr(input: &str) -> IResult<&str, RawExpr<'_>> {
    let (rest, name) = ws(identifier)(input)?;
    if let Ok((rest, _)) = pchar::<&str, nom::error::Error<&str>>('(')(rest) {
        let (rest, arg) = raw_expr(rest)?;
        let (rest, _) = ws(pchar(')'))(rest)?;
        return Ok((
            rest,
            RawExpr::Call {
                name,
                arg: Box::new(arg),
            },
        ));
    }
    let (rest, _) = pchar('.')(rest)?;
    let (rest, property) = property_name(rest)?;
    let (rest, end) = opt(preceded(pchar('|'), property_name))(rest)?;
    let (rest, _) = multispace0(rest)?;
    Ok((
        rest,
        RawExpr::Ref {
            var: name,
            property,
            end,
        },
    ))
}

fn raw_node(input: &str) -> IResult<&str, RawNode<'_>> {
    let (rest, name) = ws(identifier)(input)?;
    let (rest, _) = ws(pchar('('))(rest)?;
    if let Some(op) = Combinator::from_keyword(name) {
        let (rest, children) = separated_list1(ws(pchar(',')), raw_node)(rest)?;
        let (rest, _) = ws(pchar(')'))(rest)?;
        let (rest, threshold) = threshold_suffix(rest)?;
        Ok((
            rest,
            RawNode::Composite {
                op,
                children,
                threshold,
            },
        ))
    } else {
        let (rest, args) = separated_list1(ws(pchar(',')), raw_expr)(rest)?;
        let (rest, _) = ws(pchar(')'))(rest)?;
        let (rest, threshold) = threshold_suffix(rest)?;
        Ok((
            rest,
            RawNode::Atomic {
                measure: name,
                args,
                threshold,
            },
        ))
    }
}

// ============================================================================
// Lowering + validation
// ============================================================================

fn lower(raw: RawNode<'_>, options: &ParseOptions) -> Result<LinkSpec, SpecError> {
    match raw {
        RawNode::Composite {
            op,
            children,
            threshold,
        } => {
            let found = children.len();
            let mut it = children.into_iter();
            let (Some(left), Some(right), None) = (it.next(), it.next(), it.next()) else {
                return Err(SpecError::Arity {
                    name: op.keyword().to_string(),
                    expected: 2,
                    found,
                });
            };
            let left = lower(left, options)?;
            let right = lower(right, options)?;
            LinkSpec::composite(op, left, right, threshold)
        }
        RawNode::Atomic {
            measure,
            args,
            threshold,
        } => {
            let found = args.len();
            let mut it = args.into_iter();
            let (Some(source), Some(target), None) = (it.next(), it.next(), it.next()) else {
                return Err(SpecError::Arity {
                    name: measure.to_string(),
                    expected: 2,
                    found,
                });
            };
            let Some(threshold) = threshold else {
                return Err(SpecError::MissingThreshold {
                    measure: measure.to_string(),
                });
            };
            let source = lower_expr(source)?;
            let target = lower_expr(target)?;
            check_var(&source, &options.source_var)?;
            check_var(&target, &options.target_var)?;
            let atomic = AtomicSpec {
                measure: measure.to_ascii_lowercase(),
                source,
                target,
                threshold,
            };
            check_threshold(|| atomic.to_string(), threshold)?;
            Ok(LinkSpec::Atomic(atomic))
        }
    }
}

fn lower_expr(raw: RawExpr<'_>) -> Result<PropertyExpr, SpecError> {
    match raw {
        RawExpr::Ref { var, property, end } => Ok(PropertyExpr::Property(PropertyRef {
            var: var.to_string(),
            property: property.to_string(),
            end_property: end.map(str::to_string),
        })),
        RawExpr::Call { name, arg } => {
            let function: Transform = name.parse()?;
            Ok(PropertyExpr::apply(function, lower_expr(*arg)?))
        }
    }
}

fn check_var(expr: &PropertyExpr, expected: &str) -> Result<(), SpecError> {
    let found = expr.var();
    if found == expected {
        Ok(())
    } else {
        Err(SpecError::WrongVariable {
            expression: expr.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_atomic() {
        let spec = parse_link_spec("levenshtein(x.name, y.name)|0.9").unwrap();
        let LinkSpec::Atomic(a) = spec else {
            panic!("expected atomic");
        };
        assert_eq!(a.measure, "levenshtein");
        assert_eq!(a.source, PropertyExpr::property("x", "name"));
        assert_eq!(a.target, PropertyExpr::property("y", "name"));
        assert_eq!(a.threshold, 0.9);
    }

    #[test]
    fn parses_nested_composites_case_insensitively() {
        let spec = parse_link_spec(
            "and( cosine(x.name,y.name)|0.8 , minus(jaccard(x.desc,y.desc)|0.5, exactmatch(x.id,y.id)|1) )|0.6",
        )
        .unwrap();
        let LinkSpec::Composite(c) = &spec else {
            panic!("expected composite");
        };
        assert_eq!(c.op, Combinator::And);
        assert_eq!(c.threshold, Some(0.6));
        assert!(c.left.is_atomic());
        assert!(matches!(&*c.right, LinkSpec::Composite(m) if m.op == Combinator::Minus));
        assert_eq!(spec.atoms().len(), 3);
    }

    #[test]
    fn parses_interval_and_prefixed_properties() {
        let spec =
            parse_link_spec("tmp_starts(x.ex:begin|ex:end, y.begin|end)|1.0").unwrap();
        let LinkSpec::Atomic(a) = spec else {
            panic!("expected atomic");
        };
        assert_eq!(a.source, PropertyExpr::interval("x", "ex:begin", "ex:end"));
        assert_eq!(a.target, PropertyExpr::interval("y", "begin", "end"));
    }

    #[test]
    fn parses_preprocessing_chain() {
        let expr = parse_property_expr("lowercase(nolang(x.rdfs:label))").unwrap();
        assert_eq!(
            expr.transforms(),
            vec![Transform::NoLang, Transform::Lowercase]
        );
        assert_eq!(expr.reference().property, "rdfs:label");
    }

    #[test]
    fn rejects_wrong_arity() {
        let err = parse_link_spec("AND(jaccard(x.a,y.a)|0.5)").unwrap_err();
        assert_eq!(
            err,
            SpecError::Arity {
                name: "AND".to_string(),
                expected: 2,
                found: 1
            }
        );
        let err = parse_link_spec("jaccard(x.a,y.a,y.b)|0.5").unwrap_err();
        assert!(matches!(err, SpecError::Arity { found: 3, .. }));
    }

    #[test]
    fn rejects_missing_or_invalid_threshold() {
        assert_eq!(
            parse_link_spec("jaccard(x.a,y.a)").unwrap_err(),
            SpecError::MissingThreshold {
                measure: "jaccard".to_string()
            }
        );
        assert!(matches!(
            parse_link_spec("jaccard(x.a,y.a)|1.2").unwrap_err(),
            SpecError::ThresholdOutOfRange { .. }
        ));
        assert!(matches!(
            parse_link_spec("OR(jaccard(x.a,y.a)|0.2,cosine(x.a,y.a)|0.3)|-0.1").unwrap_err(),
            SpecError::ThresholdOutOfRange { .. }
        ));
    }

    #[test]
    fn rejects_swapped_variables() {
        let err = parse_link_spec("jaccard(y.a,x.a)|0.5").unwrap_err();
        assert!(matches!(err, SpecError::WrongVariable { .. }));

        let options = ParseOptions::new("?src", "?dst");
        assert!(parse_link_spec_with("jaccard(src.a,dst.a)|0.5", &options).is_ok());
    }

    #[test]
    fn rejects_unknown_function() {
        let err = parse_link_spec("jaccard(stem(x.a),y.a)|0.5").unwrap_err();
        assert_eq!(
            err,
            SpecError::UnknownFunction {
                name: "stem".to_string()
            }
        );
    }

    #[test]
    fn reports_offset_of_trailing_garbage() {
        let err = parse_link_spec("jaccard(x.a,y.a)|0.5 )").unwrap_err();
        assert!(matches!(err, SpecError::Syntax { offset: 21, .. }), "{err:?}");
    }
}
