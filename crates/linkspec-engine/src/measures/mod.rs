//! Atomic measure mappers
//!
//! Every leaf of a link specification is evaluated by an [`AtomicMapper`]. All
//! mappers share one contract so the planner can treat them uniformly:
//!
//! - `evaluate` scans the two caches and returns the pairs whose score is
//!   strictly positive and `>= threshold`;
//! - `estimate_runtime` / `estimate_result_size` are cheap cost hints (no data
//!   scan) that only need to be monotonic and comparable across mappers;
//! - `supports` advertises optional capabilities (pairwise scoring for the
//!   AND-filter strategy, partitioned parallel evaluation);
//! - `pair_scorer` prepares every entity once and then scores single pairs.
//!   Values it cannot interpret are counted exactly as `evaluate` counts them,
//!   so a leaf reports the same skips whichever way it is run.
//!
//! Several implementations may serve the same measure name (e.g. a nested-loop
//! scan and an inverted-index variant); they must produce identical mappings.

pub mod string;
pub mod temporal;
pub mod topology;

use std::sync::atomic::{AtomicU64, Ordering};

use linkspec_dsl::PropertyExpr;
use rayon::prelude::*;

use crate::cache::Cache;
use crate::error::{LinkError, Result};
use crate::mapping::Mapping;
use crate::planner::NodeId;

/// Optional mapper capabilities queried by the planner and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `pair_scorer` is implemented and agrees with `evaluate`.
    PairScore,
    /// `evaluate` partitions source keys across the rayon pool.
    Parallel,
}

/// Knobs shared by every mapper invocation of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalOptions {
    pub parallel: bool,
    /// Below this many source entities evaluation stays on the calling thread.
    pub min_parallel_sources: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            min_parallel_sources: 256,
        }
    }
}

/// Counts values a mapper could not interpret (bad dates, bad WKT, ...).
#[derive(Debug, Default)]
pub struct SkipCounter(AtomicU64);

impl SkipCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything one leaf evaluation needs.
pub struct MapperInput<'a> {
    pub source: &'a dyn Cache,
    pub target: &'a dyn Cache,
    pub source_expr: &'a PropertyExpr,
    pub target_expr: &'a PropertyExpr,
    pub threshold: f64,
    pub node: NodeId,
    /// Rendered leaf, used in error messages.
    pub expression: &'a str,
    pub options: EvalOptions,
    pub skipped: &'a SkipCounter,
}

impl MapperInput<'_> {
    pub fn error(&self, message: impl Into<String>) -> LinkError {
        LinkError::Evaluation {
            node: self.node,
            expression: self.expression.to_string(),
            message: message.into(),
        }
    }

    /// Preprocessed source values of one entity.
    pub fn source_values(&self, key: &str) -> Vec<String> {
        resolve_values(self.source, key, self.source_expr)
    }

    /// Preprocessed target values of one entity.
    pub fn target_values(&self, key: &str) -> Vec<String> {
        resolve_values(self.target, key, self.target_expr)
    }

    fn run_parallel(&self, source_count: usize) -> bool {
        self.options.parallel && source_count >= self.options.min_parallel_sources.max(1)
    }
}

pub trait AtomicMapper: Send + Sync {
    /// Implementation name, e.g. `nested-loop` or `token-index`.
    fn name(&self) -> &str;

    fn evaluate(&self, input: &MapperInput<'_>) -> Result<Mapping>;

    fn estimate_runtime(&self, source_size: usize, target_size: usize, threshold: f64) -> f64;

    fn estimate_result_size(&self, source_size: usize, target_size: usize, threshold: f64) -> f64;

    fn supports(&self, _capability: Capability) -> bool {
        false
    }

    /// Prepare the values of every source and target entity for pairwise
    /// scoring, recording unusable values in `input.skipped`.
    fn pair_scorer(&self, input: &MapperInput<'_>) -> Result<Box<dyn PairScorer>> {
        Err(input.error(format!("`{}` cannot score single pairs", self.name())))
    }

    /// Estimated cost of one `PairScorer::score` call.
    fn pair_cost(&self) -> f64 {
        1.0
    }
}

/// Scores single pairs from values prepared by [`AtomicMapper::pair_scorer`].
pub trait PairScorer: Send + Sync {
    /// Score of one pair, `0.0` when either entity has no usable value.
    fn score(&self, source_key: &str, target_key: &str) -> f64;
}

/// The emission rule shared by all mappers.
pub fn accepts(score: f64, threshold: f64) -> bool {
    score > 0.0 && score >= threshold
}

/// Values of `expr`'s property on `key`, with the transform chain applied.
pub fn resolve_values(cache: &dyn Cache, key: &str, expr: &PropertyExpr) -> Vec<String> {
    let reference = expr.reference();
    cache
        .property_values(key, &reference.property)
        .iter()
        .map(|v| expr.preprocess(v))
        .collect()
}

/// Run `per_source` for every source key, on the rayon pool when the input
/// allows it, and collect the emitted `(target, score)` pairs.
///
/// Partitions never share a source key, so merging partial mappings cannot
/// collide.
pub(crate) fn map_sources<F>(input: &MapperInput<'_>, keys: &[&str], per_source: F) -> Result<Mapping>
where
    F: Fn(&str) -> Result<Vec<(String, f64)>> + Sync,
{
    let run_chunk = |chunk: &[&str]| -> Result<Mapping> {
        let mut partial = Mapping::new();
        for &key in chunk {
            for (target, score) in per_source(key)? {
                partial.add(key, target, score);
            }
        }
        Ok(partial)
    };

    if !input.run_parallel(keys.len()) {
        return run_chunk(keys);
    }

    let chunk_size = (keys.len() / (rayon::current_num_threads() * 4)).max(16);
    let partials = keys
        .par_chunks(chunk_size)
        .map(run_chunk)
        .collect::<Result<Vec<_>>>()?;
    let mut out = Mapping::new();
    for partial in partials {
        out.absorb(partial);
    }
    Ok(out)
}

pub(crate) fn pairs(source_size: usize, target_size: usize) -> f64 {
    source_size as f64 * target_size as f64
}
