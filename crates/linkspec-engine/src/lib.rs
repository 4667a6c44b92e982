//! Link discovery engine
//!
//! Finds pairs of entities across a source and a target cache that satisfy a
//! declarative link specification, and scores each pair in `[0, 1]`.
//!
//! Pipeline:
//! 1. **Specification**: parsed by `linkspec-dsl` into a tree of atomic
//!    measures and combinators (AND / OR / MINUS / XOR) with thresholds.
//! 2. **Registry**: validates measure names and supplies candidate mapper
//!    implementations.
//! 3. **Planner**: picks implementations, orders commutative children and may
//!    run a conjunction as a filter, from the mappers' cost hints.
//! 4. **Engine**: evaluates the plan post-order over the caches, combining
//!    child mappings with the mapping algebra.
//!
//! ## Module Organization
//!
//! - `cache`: entity caches (`Cache` trait, `MemoryCache`)
//! - `mapping`: scored pair sets and their algebra
//! - `measures`: the `AtomicMapper` contract and the string, temporal
//!   (Allen) and topological (RCC-8) mappers
//! - `registry`, `planner`, `engine`: planning and execution
//! - `policy`: acceptance / review split of a final mapping
//! - `config`: engine options

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod measures;
pub mod planner;
pub mod policy;
pub mod registry;

pub use cache::{Cache, Instance, MemoryCache};
pub use config::EngineConfig;
pub use engine::{CancellationToken, Execution, ExecutionEngine, NodeReport};
pub use error::{LinkError, Result};
pub use mapping::Mapping;
pub use measures::{AtomicMapper, Capability, EvalOptions, MapperInput, PairScorer};
pub use planner::{NodeId, Plan, PlanNode, Planner, PlannerKind};
pub use policy::{verification_threshold, LinkSplit, ReviewPolicy};
pub use registry::Registry;

use linkspec_dsl::LinkSpec;

/// Validate, plan and execute `spec` in one call.
pub fn discover_links(
    spec: &LinkSpec,
    source: &dyn Cache,
    target: &dyn Cache,
    registry: &Registry,
    config: &EngineConfig,
) -> Result<Execution> {
    let plan = Planner::new(registry, config.planner).plan(spec, source.len(), target.len())?;
    tracing::debug!(plan = %plan, "executing");
    ExecutionEngine::new(source, target)
        .with_config(config)
        .execute(&plan)
}
