//! Execution planning.
//!
//! A [`Plan`] mirrors the specification tree and decides, per node:
//!
//! - which registered implementation evaluates each leaf;
//! - in which order the two children of a commutative composite run;
//! - whether a conjunction with one atomic child is run as a filter (evaluate
//!   the other child, then score only its pairs with the atomic measure).
//!
//! Two planners are available. [`PlannerKind::Canonical`] picks the first
//! implementation of each measure and keeps the tree as written; it is the
//! reference every other plan must agree with. [`PlannerKind::CostBased`] uses
//! the mappers' runtime / result-size estimates. MINUS is never reordered.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use linkspec_dsl::{AtomicSpec, Combinator, CompositeSpec, LinkSpec};
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};
use crate::measures::{AtomicMapper, Capability};
use crate::registry::Registry;

/// Cost of touching one pair while combining two child mappings.
const COMBINE_COST: f64 = 0.05;

/// Pre-order position of a node in the specification tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlannerKind {
    Canonical,
    #[default]
    CostBased,
}

impl PlannerKind {
    pub fn name(self) -> &'static str {
        match self {
            PlannerKind::Canonical => "canonical",
            PlannerKind::CostBased => "cost-based",
        }
    }
}

impl FromStr for PlannerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "canonical" => Ok(PlannerKind::Canonical),
            "cost-based" | "cost_based" | "costbased" => Ok(PlannerKind::CostBased),
            other => Err(format!(
                "unknown planner `{other}` (expected `canonical` or `cost-based`)"
            )),
        }
    }
}

/// Planner estimates for one node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Estimate {
    pub runtime: f64,
    /// Expected number of pairs.
    pub size: f64,
}

// ============================================================================
// Plan tree
// ============================================================================

/// Evaluate one leaf with a chosen implementation.
#[derive(Clone)]
pub struct RunStep {
    pub id: NodeId,
    pub spec: AtomicSpec,
    pub mapper: Arc<dyn AtomicMapper>,
    pub estimate: Estimate,
}

impl fmt::Debug for RunStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunStep")
            .field("id", &self.id)
            .field("spec", &self.spec.to_string())
            .field("mapper", &self.mapper.name())
            .field("estimate", &self.estimate)
            .finish()
    }
}

/// Evaluate both children, then combine them with `op`.
#[derive(Debug, Clone)]
pub struct CombineStep {
    pub id: NodeId,
    pub op: Combinator,
    pub threshold: f64,
    pub expression: String,
    pub left: Box<PlanNode>,
    pub right: Box<PlanNode>,
    /// Evaluate `right` before `left` when running sequentially.
    pub right_first: bool,
    pub estimate: Estimate,
}

/// Conjunction evaluated as `input` followed by per-pair scoring with
/// `filter`'s measure.
#[derive(Debug, Clone)]
pub struct FilterStep {
    pub id: NodeId,
    pub threshold: f64,
    pub expression: String,
    pub input: Box<PlanNode>,
    pub filter: RunStep,
    pub estimate: Estimate,
}

#[derive(Debug, Clone)]
pub enum PlanNode {
    Run(RunStep),
    Combine(CombineStep),
    Filter(FilterStep),
}

impl PlanNode {
    pub fn id(&self) -> NodeId {
        match self {
            PlanNode::Run(r) => r.id,
            PlanNode::Combine(c) => c.id,
            PlanNode::Filter(f) => f.id,
        }
    }

    pub fn estimate(&self) -> Estimate {
        match self {
            PlanNode::Run(r) => r.estimate,
            PlanNode::Combine(c) => c.estimate,
            PlanNode::Filter(f) => f.estimate,
        }
    }

    /// Number of plan nodes, counting a filter's atomic leaf.
    pub fn size(&self) -> usize {
        match self {
            PlanNode::Run(_) => 1,
            PlanNode::Combine(c) => 1 + c.left.size() + c.right.size(),
            PlanNode::Filter(f) => 2 + f.input.size(),
        }
    }

    fn explain_into(&self, depth: usize, out: &mut Vec<String>) {
        let pad = "  ".repeat(depth);
        match self {
            PlanNode::Run(r) => out.push(format!(
                "{pad}{} run {} via {}  [cost {:.1}, ~{:.1} pairs]",
                r.id,
                r.spec,
                r.mapper.name(),
                r.estimate.runtime,
                r.estimate.size
            )),
            PlanNode::Combine(c) => {
                out.push(format!(
                    "{pad}{} {}|{}{}  [cost {:.1}, ~{:.1} pairs]",
                    c.id,
                    c.op,
                    c.threshold,
                    if c.right_first { " (right first)" } else { "" },
                    c.estimate.runtime,
                    c.estimate.size
                ));
                c.left.explain_into(depth + 1, out);
                c.right.explain_into(depth + 1, out);
            }
            PlanNode::Filter(f) => {
                out.push(format!(
                    "{pad}{} AND|{} as filter  [cost {:.1}, ~{:.1} pairs]",
                    f.id, f.threshold, f.estimate.runtime, f.estimate.size
                ));
                f.input.explain_into(depth + 1, out);
                out.push(format!(
                    "{pad}  {} score {} via {} per pair",
                    f.filter.id,
                    f.filter.spec,
                    f.filter.mapper.name()
                ));
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub root: PlanNode,
    pub kind: PlannerKind,
    pub source_size: usize,
    pub target_size: usize,
}

impl Plan {
    pub fn estimate(&self) -> Estimate {
        self.root.estimate()
    }

    /// One line per node, children indented under their parent.
    pub fn explain_lines(&self) -> Vec<String> {
        let mut out = vec![format!(
            "{} plan over {} x {} entities",
            self.kind.name(),
            self.source_size,
            self.target_size
        )];
        self.root.explain_into(1, &mut out);
        out
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.explain_lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Planner
// ============================================================================

pub struct Planner<'r> {
    registry: &'r Registry,
    kind: PlannerKind,
}

impl<'r> Planner<'r> {
    pub fn new(registry: &'r Registry, kind: PlannerKind) -> Self {
        Self { registry, kind }
    }

    pub fn plan(&self, spec: &LinkSpec, source_size: usize, target_size: usize) -> Result<Plan> {
        spec.validate()?;
        self.registry.validate(spec)?;
        let mut next = 0;
        let root = self.plan_node(spec, &mut next, source_size, target_size)?;
        tracing::debug!(
            planner = self.kind.name(),
            nodes = root.size(),
            runtime = root.estimate().runtime,
            "plan ready"
        );
        Ok(Plan {
            root,
            kind: self.kind,
            source_size,
            target_size,
        })
    }

    fn plan_node(
        &self,
        spec: &LinkSpec,
        next: &mut usize,
        source_size: usize,
        target_size: usize,
    ) -> Result<PlanNode> {
        let id = NodeId(*next);
        *next += 1;
        match spec {
            LinkSpec::Atomic(atom) => Ok(PlanNode::Run(self.plan_leaf(
                id,
                atom,
                source_size,
                target_size,
            )?)),
            LinkSpec::Composite(composite) => {
                let left = self.plan_node(&composite.left, next, source_size, target_size)?;
                let right = self.plan_node(&composite.right, next, source_size, target_size)?;
                let prepare = (source_size + target_size) as f64;
                Ok(self.plan_composite(id, composite, left, right, prepare))
            }
        }
    }

    fn plan_leaf(
        &self,
        id: NodeId,
        atom: &AtomicSpec,
        source_size: usize,
        target_size: usize,
    ) -> Result<RunStep> {
        let candidates = self
            .registry
            .implementations(&atom.measure)
            .unwrap_or_default();
        let runtime = |m: &Arc<dyn AtomicMapper>| {
            m.estimate_runtime(source_size, target_size, atom.threshold)
        };
        let chosen = match self.kind {
            PlannerKind::Canonical => candidates.into_iter().next(),
            PlannerKind::CostBased => candidates
                .into_iter()
                .min_by(|a, b| runtime(a).total_cmp(&runtime(b))),
        };
        let Some(mapper) = chosen else {
            return Err(LinkError::NoImplementation {
                measure: atom.measure.clone(),
                expression: atom.to_string(),
            });
        };
        let estimate = Estimate {
            runtime: runtime(&mapper),
            size: mapper.estimate_result_size(source_size, target_size, atom.threshold),
        };
        Ok(RunStep {
            id,
            spec: atom.clone(),
            mapper,
            estimate,
        })
    }

    fn plan_composite(
        &self,
        id: NodeId,
        composite: &CompositeSpec,
        left: PlanNode,
        right: PlanNode,
        prepare: f64,
    ) -> PlanNode {
        let threshold = composite.effective_threshold();
        let expression = composite.to_string();
        let (le, re) = (left.estimate(), right.estimate());
        let size = match composite.op {
            Combinator::And => le.size.min(re.size),
            Combinator::Or | Combinator::Xor => le.size + re.size,
            Combinator::Minus => le.size,
        };
        let cost_based = self.kind == PlannerKind::CostBased;

        let filter_choice = if cost_based && composite.op == Combinator::And {
            match (
                filter_runtime(&left, &right, prepare),
                filter_runtime(&right, &left, prepare),
            ) {
                (Some(r), Some(l)) => Some(l < r),
                (Some(_), None) => Some(false),
                (None, Some(_)) => Some(true),
                (None, None) => None,
            }
        } else {
            None
        };

        match (filter_choice, left, right) {
            (Some(true), PlanNode::Run(filter), input) | (Some(false), input, PlanNode::Run(filter)) => {
                let ie = input.estimate();
                PlanNode::Filter(FilterStep {
                    id,
                    threshold,
                    expression,
                    estimate: Estimate {
                        runtime: ie.runtime + prepare + ie.size * filter.mapper.pair_cost(),
                        size,
                    },
                    input: Box::new(input),
                    filter,
                })
            }
            (_, left, right) => PlanNode::Combine(CombineStep {
                id,
                op: composite.op,
                threshold,
                expression,
                right_first: cost_based
                    && composite.op.is_commutative()
                    && re.runtime < le.runtime,
                estimate: Estimate {
                    runtime: le.runtime + re.runtime + COMBINE_COST * (le.size + re.size),
                    size,
                },
                left: Box::new(left),
                right: Box::new(right),
            }),
        }
    }
}

/// Runtime of evaluating `input` and scoring its pairs with `filter`, when
/// that beats running `filter`'s leaf on its own. `prepare` is the cost of
/// preparing every entity's values for the filter.
fn filter_runtime(input: &PlanNode, filter: &PlanNode, prepare: f64) -> Option<f64> {
    let PlanNode::Run(step) = filter else {
        return None;
    };
    if !step.mapper.supports(Capability::PairScore) {
        return None;
    }
    let scoring = prepare + input.estimate().size * step.mapper.pair_cost();
    (scoring < step.estimate.runtime).then_some(input.estimate().runtime + scoring)
}
