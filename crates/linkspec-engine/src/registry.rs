//! Measure catalog: measure name -> candidate mapper implementations.
//!
//! The first implementation registered for a measure is its reference
//! implementation (used by the canonical planner); later ones are
//! alternatives the cost-based planner may prefer.

use std::collections::BTreeMap;
use std::sync::Arc;

use linkspec_dsl::LinkSpec;

use crate::error::{LinkError, Result};
use crate::measures::string::{
    HashJoinMapper, LengthFilterMapper, NestedLoopMapper, StringMeasure, TokenIndexMapper,
};
use crate::measures::temporal::{AllenMapper, AllenRelation};
use crate::measures::topology::{Rcc8, TopologyMapper, TOPOLOGY_ALIASES};
use crate::measures::AtomicMapper;

pub type MapperFactory = Arc<dyn Fn() -> Box<dyn AtomicMapper> + Send + Sync>;

/// Point-set distances that validate as measure names but ship no mapper.
pub const UNIMPLEMENTED_MEASURES: [&str; 4] = ["hausdorff", "frechet", "orthodromic", "geomean"];

#[derive(Clone, Default)]
pub struct Registry {
    measures: BTreeMap<String, Vec<MapperFactory>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.measures.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

impl Registry {
    /// A registry without any measure.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The bundled catalog: string, temporal and topological measures.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        for measure in StringMeasure::ALL {
            registry.register(measure.name(), move || Box::new(NestedLoopMapper::new(measure)));
            if measure.is_token_based() {
                registry.register(measure.name(), move || Box::new(TokenIndexMapper::new(measure)));
            }
        }
        registry.register(StringMeasure::Levenshtein.name(), || Box::new(LengthFilterMapper));
        registry.register(StringMeasure::ExactMatch.name(), || Box::new(HashJoinMapper));

        for relation in AllenRelation::ALL {
            for name in std::iter::once(relation.measure_name()).chain(relation.alias()) {
                registry.register(name, move || Box::new(AllenMapper::new(relation)));
            }
        }

        for relation in Rcc8::ALL {
            registry.register(relation.measure_name(), move || {
                Box::new(TopologyMapper::new(&[relation]))
            });
        }
        for (name, relations) in TOPOLOGY_ALIASES {
            registry.register(name, move || Box::new(TopologyMapper::new(relations)));
        }

        for name in UNIMPLEMENTED_MEASURES {
            registry.declare(name);
        }
        registry
    }

    /// Add an implementation for `measure` (names are case-insensitive).
    pub fn register<F>(&mut self, measure: &str, factory: F)
    where
        F: Fn() -> Box<dyn AtomicMapper> + Send + Sync + 'static,
    {
        self.measures
            .entry(measure.to_ascii_lowercase())
            .or_default()
            .push(Arc::new(factory));
    }

    /// Make `measure` a known name without providing an implementation.
    pub fn declare(&mut self, measure: &str) {
        self.measures
            .entry(measure.to_ascii_lowercase())
            .or_default();
    }

    pub fn contains(&self, measure: &str) -> bool {
        self.measures.contains_key(&measure.to_ascii_lowercase())
    }

    pub fn measures(&self) -> impl Iterator<Item = &str> {
        self.measures.keys().map(String::as_str)
    }

    /// Fresh instances of every implementation of `measure`, in registration
    /// order. `None` when the measure is unknown.
    pub fn implementations(&self, measure: &str) -> Option<Vec<Arc<dyn AtomicMapper>>> {
        let factories = self.measures.get(&measure.to_ascii_lowercase())?;
        Some(factories.iter().map(|f| Arc::from(f())).collect())
    }

    /// Check that every leaf names a known measure.
    pub fn validate(&self, spec: &LinkSpec) -> Result<()> {
        for atom in spec.atoms() {
            if !self.contains(&atom.measure) {
                return Err(LinkError::UnknownMeasure {
                    measure: atom.measure.clone(),
                    expression: atom.to_string(),
                });
            }
        }
        Ok(())
    }
}
