//! Link specification language
//!
//! This crate defines the declarative **link specification** tree used by the
//! link-discovery engine, together with a parser for its textual form:
//!
//! ```text
//! AND(levenshtein(lowercase(x.name), lowercase(y.name))|0.9,
//!     tmp_during(x.begin|end, y.begin|end)|1.0)|0.8
//! ```
//!
//! - `spec`: the immutable tree (atomic measures, binary combinators,
//!   property expressions) and its canonical rendering.
//! - `parser`: the nom grammar turning text into a validated tree.
//!
//! The tree knows nothing about which measures exist; checking measure names
//! against a catalog is the engine's job.

pub mod parser;
pub mod spec;

pub use parser::{parse_link_spec, parse_link_spec_with, parse_property_expr, ParseOptions};
pub use spec::{
    AtomicSpec, Combinator, CompositeSpec, LinkSpec, PropertyExpr, PropertyRef, SpecError,
    Transform,
};
