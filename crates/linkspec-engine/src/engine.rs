//! Plan execution.
//!
//! Nodes are evaluated post-order: children first, then the combination. With
//! `parallel` enabled, the two children of a composite run under
//! `rayon::join` and leaf mappers partition their source keys across the pool;
//! the result does not depend on the choice.
//!
//! Cancellation and the time budget are checked before every leaf and every
//! combination, so a run stops at the next node boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use linkspec_dsl::{AtomicSpec, Combinator};
use rayon::prelude::*;
use serde::Serialize;

use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::error::{LinkError, Result};
use crate::mapping::Mapping;
use crate::measures::{accepts, EvalOptions, MapperInput, SkipCounter};
use crate::planner::{NodeId, Plan, PlanNode, RunStep};

/// Shared flag that asks a running evaluation to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-node statistics of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub node: NodeId,
    pub expression: String,
    /// Mapper implementation, for leaves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    pub output_size: usize,
    pub skipped_values: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub mapping: Mapping,
    /// Ordered by node id.
    pub nodes: Vec<NodeReport>,
    pub elapsed: Duration,
}

impl Execution {
    pub fn report(&self, node: NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|r| r.node == node)
    }

    pub fn skipped_values(&self) -> u64 {
        self.nodes.iter().map(|r| r.skipped_values).sum()
    }
}

type NodeResult = Result<(Mapping, Vec<NodeReport>)>;

pub struct ExecutionEngine<'c> {
    source: &'c dyn Cache,
    target: &'c dyn Cache,
    options: EvalOptions,
    time_budget: Option<Duration>,
    cancel: CancellationToken,
}

impl<'c> ExecutionEngine<'c> {
    pub fn new(source: &'c dyn Cache, target: &'c dyn Cache) -> Self {
        Self {
            source,
            target,
            options: EvalOptions::default(),
            time_budget: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.with_options(config.eval_options())
            .with_time_budget(config.time_budget())
    }

    pub fn with_options(mut self, options: EvalOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn execute(&self, plan: &Plan) -> Result<Execution> {
        let started = Instant::now();
        let (mapping, mut nodes) = self.eval(&plan.root, started)?;
        nodes.sort_by_key(|r| r.node);
        let elapsed = started.elapsed();
        tracing::info!(
            pairs = mapping.size(),
            nodes = nodes.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "link discovery finished"
        );
        Ok(Execution {
            mapping,
            nodes,
            elapsed,
        })
    }

    fn checkpoint(&self, node: NodeId, started: Instant) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::warn!(node = %node, "evaluation cancelled");
            return Err(LinkError::Cancelled { node });
        }
        if let Some(budget) = self.time_budget {
            let elapsed = started.elapsed();
            if elapsed >= budget {
                tracing::warn!(node = %node, ?budget, ?elapsed, "time budget exceeded");
                return Err(LinkError::TimeBudgetExceeded {
                    node,
                    budget,
                    elapsed,
                });
            }
        }
        Ok(())
    }

    fn input<'a>(
        &'a self,
        id: NodeId,
        spec: &'a AtomicSpec,
        expression: &'a str,
        skipped: &'a SkipCounter,
    ) -> MapperInput<'a> {
        MapperInput {
            source: self.source,
            target: self.target,
            source_expr: &spec.source,
            target_expr: &spec.target,
            threshold: spec.threshold,
            node: id,
            expression,
            options: self.options,
            skipped,
        }
    }

    fn eval(&self, node: &PlanNode, started: Instant) -> NodeResult {
        match node {
            PlanNode::Run(step) => self.eval_leaf(step, started),
            PlanNode::Combine(c) => {
                let ((left, mut reports), (right, right_reports)) = if self.options.parallel {
                    let (l, r) = rayon::join(
                        || self.eval(&c.left, started),
                        || self.eval(&c.right, started),
                    );
                    (l?, r?)
                } else if c.right_first {
                    let r = self.eval(&c.right, started)?;
                    (self.eval(&c.left, started)?, r)
                } else {
                    let l = self.eval(&c.left, started)?;
                    (l, self.eval(&c.right, started)?)
                };
                reports.extend(right_reports);

                self.checkpoint(c.id, started)?;
                let t0 = Instant::now();
                let mapping = match c.op {
                    Combinator::And => left.intersection(&right, c.threshold),
                    Combinator::Or => left.union(&right, c.threshold),
                    Combinator::Minus => left.difference(&right, c.threshold),
                    Combinator::Xor => left.xor(&right, c.threshold),
                };
                tracing::debug!(node = %c.id, op = %c.op, pairs = mapping.size(), "combined");
                reports.push(NodeReport {
                    node: c.id,
                    expression: c.expression.clone(),
                    implementation: None,
                    output_size: mapping.size(),
                    skipped_values: 0,
                    elapsed: t0.elapsed(),
                });
                Ok((mapping, reports))
            }
            PlanNode::Filter(f) => {
                let (input, mut reports) = self.eval(&f.input, started)?;
                self.checkpoint(f.filter.id, started)?;

                let t0 = Instant::now();
                let expression = f.filter.spec.to_string();
                let skipped = SkipCounter::new();
                let leaf = self.input(f.filter.id, &f.filter.spec, &expression, &skipped);
                let scorer = f.filter.mapper.pair_scorer(&leaf)?;
                let check = |&(s, t, score): &(&str, &str, f64)| {
                    let single = scorer.score(s, t);
                    accepts(single, leaf.threshold).then_some((score, single))
                };
                let pairs: Vec<(&str, &str, f64)> = input.iter().collect();
                let scored: Vec<Option<(f64, f64)>> =
                    if self.options.parallel && pairs.len() >= self.options.min_parallel_sources {
                        pairs.par_iter().map(check).collect()
                    } else {
                        pairs.iter().map(check).collect()
                    };
                if skipped.get() > 0 {
                    tracing::warn!(
                        node = %f.filter.id,
                        measure = %f.filter.spec.measure,
                        skipped = skipped.get(),
                        "values could not be interpreted and were skipped"
                    );
                }

                let mut passed = 0;
                let mut mapping = Mapping::new();
                for (&(s, t, _), hit) in pairs.iter().zip(scored) {
                    let Some((input_score, single)) = hit else {
                        continue;
                    };
                    passed += 1;
                    let combined = input_score.min(single);
                    if combined >= f.threshold {
                        mapping.add(s, t, combined);
                    }
                }
                tracing::debug!(
                    node = %f.id,
                    candidates = pairs.len(),
                    pairs = mapping.size(),
                    "filtered"
                );
                reports.push(NodeReport {
                    node: f.filter.id,
                    expression,
                    implementation: Some(format!("{} (per pair)", f.filter.mapper.name())),
                    output_size: passed,
                    skipped_values: skipped.get(),
                    elapsed: t0.elapsed(),
                });
                reports.push(NodeReport {
                    node: f.id,
                    expression: f.expression.clone(),
                    implementation: None,
                    output_size: mapping.size(),
                    skipped_values: 0,
                    elapsed: t0.elapsed(),
                });
                Ok((mapping, reports))
            }
        }
    }

    fn eval_leaf(&self, step: &RunStep, started: Instant) -> NodeResult {
        self.checkpoint(step.id, started)?;
        let t0 = Instant::now();
        let expression = step.spec.to_string();
        let skipped = SkipCounter::new();
        let input = self.input(step.id, &step.spec, &expression, &skipped);
        let mapping = step.mapper.evaluate(&input)?;
        let elapsed = t0.elapsed();

        let skipped = skipped.get();
        if skipped > 0 {
            tracing::warn!(
                node = %step.id,
                measure = %step.spec.measure,
                skipped,
                "values could not be interpreted and were skipped"
            );
        }
        tracing::debug!(
            node = %step.id,
            implementation = step.mapper.name(),
            pairs = mapping.size(),
            elapsed_ms = elapsed.as_millis() as u64,
            "leaf evaluated"
        );
        let report = NodeReport {
            node: step.id,
            expression,
            implementation: Some(step.mapper.name().to_string()),
            output_size: mapping.size(),
            skipped_values: skipped,
            elapsed,
        };
        Ok((mapping, vec![report]))
    }
}

#[cfg(test)]
mod tests {
    use linkspec_dsl::parse_link_spec;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::planner::{Planner, PlannerKind};
    use crate::registry::Registry;

    fn caches() -> (MemoryCache, MemoryCache) {
        let mut source = MemoryCache::new();
        source.add_value("s1", "name", "Apple");
        source.add_value("s2", "name", "Pear");
        let mut target = MemoryCache::new();
        target.add_value("t1", "name", "Apple");
        target.add_value("t2", "name", "Apples");
        (source, target)
    }

    fn plan(text: &str) -> Plan {
        let registry = Registry::with_defaults();
        Planner::new(&registry, PlannerKind::CostBased)
            .plan(&parse_link_spec(text).unwrap(), 2, 2)
            .unwrap()
    }

    #[test]
    fn reports_cover_every_node_in_id_order() {
        let (source, target) = caches();
        let exec = ExecutionEngine::new(&source, &target)
            .execute(&plan(
                "OR(levenshtein(x.name,y.name)|0.8, exactmatch(x.name,y.name)|1)|0.5",
            ))
            .unwrap();
        let ids: Vec<_> = exec.nodes.iter().map(|r| r.node.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(exec.mapping.get("s1", "t1"), Some(1.0));
        assert!(exec.report(NodeId(1)).unwrap().implementation.is_some());
        assert_eq!(exec.report(NodeId(0)).unwrap().output_size, exec.mapping.size());
    }

    #[test]
    fn cancelled_token_stops_before_first_leaf() {
        let (source, target) = caches();
        let token = CancellationToken::new();
        token.cancel();
        let err = ExecutionEngine::new(&source, &target)
            .with_cancellation(token)
            .execute(&plan("levenshtein(x.name,y.name)|0.8"))
            .unwrap_err();
        assert!(matches!(err, LinkError::Cancelled { node: NodeId(0) }));
    }

    #[test]
    fn zero_budget_is_exceeded() {
        let (source, target) = caches();
        let err = ExecutionEngine::new(&source, &target)
            .with_time_budget(Some(Duration::ZERO))
            .execute(&plan("AND(jaro(x.name,y.name)|0.8, exactmatch(x.name,y.name)|1)"))
            .unwrap_err();
        assert!(matches!(err, LinkError::TimeBudgetExceeded { .. }), "{err}");
    }
}
