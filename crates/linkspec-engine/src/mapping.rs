//! Mappings: sparse scored (source, target) pairs and their algebra.
//!
//! A [`Mapping`] holds at most one score per pair. The algebra operations
//! borrow both inputs and return a fresh mapping; the threshold is applied to
//! the *combined* score (post-filter, `score >= threshold`).
//!
//! | op | pair kept when | score |
//! |---|---|---|
//! | union | in either input | max |
//! | intersection | in both inputs | min |
//! | difference | in left, not in right | left |
//! | xor | in exactly one input | that input's |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mapping {
    map: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair, overwriting any previous score.
    pub fn add(&mut self, source: impl Into<String>, target: impl Into<String>, score: f64) {
        debug_assert!((0.0..=1.0).contains(&score), "score {score} outside [0, 1]");
        self.map
            .entry(source.into())
            .or_default()
            .insert(target.into(), score);
    }

    pub fn get(&self, source: &str, target: &str) -> Option<f64> {
        self.map.get(source)?.get(target).copied()
    }

    pub fn contains(&self, source: &str, target: &str) -> bool {
        self.get(source, target).is_some()
    }

    /// Number of pairs.
    pub fn size(&self) -> usize {
        self.map.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of distinct source keys with at least one pair.
    pub fn source_count(&self) -> usize {
        self.map.len()
    }

    /// Targets of one source key.
    pub fn targets_of(&self, source: &str) -> Option<&BTreeMap<String, f64>> {
        self.map.get(source)
    }

    /// Pairs grouped by source key, both levels in key order.
    pub fn by_source(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, f64>)> {
        self.map.iter().map(|(s, ts)| (s.as_str(), ts))
    }

    /// All pairs in (source, target) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.map.iter().flat_map(|(s, ts)| {
            ts.iter()
                .map(move |(t, score)| (s.as_str(), t.as_str(), *score))
        })
    }

    /// Pairs with `score >= threshold`.
    pub fn filter(&self, threshold: f64) -> Mapping {
        self.iter()
            .filter(|(_, _, score)| *score >= threshold)
            .collect()
    }

    /// OR: max of both scores where a pair appears twice.
    pub fn union(&self, other: &Mapping, threshold: f64) -> Mapping {
        let mut out = Mapping::new();
        for (s, t, score) in self.iter() {
            let combined = other.get(s, t).map_or(score, |o| score.max(o));
            if combined >= threshold {
                out.add(s, t, combined);
            }
        }
        for (s, t, score) in other.iter() {
            if !self.contains(s, t) && score >= threshold {
                out.add(s, t, score);
            }
        }
        out
    }

    /// AND: pairs present in both, scored by the weaker side.
    pub fn intersection(&self, other: &Mapping, threshold: f64) -> Mapping {
        // Walk the smaller side; the result does not depend on the choice.
        let (small, large) = if self.size() <= other.size() {
            (self, other)
        } else {
            (other, self)
        };
        let mut out = Mapping::new();
        for (s, t, score) in small.iter() {
            if let Some(o) = large.get(s, t) {
                let combined = score.min(o);
                if combined >= threshold {
                    out.add(s, t, combined);
                }
            }
        }
        out
    }

    /// MINUS: pairs of `self` absent from `other`, left score kept.
    pub fn difference(&self, other: &Mapping, threshold: f64) -> Mapping {
        self.iter()
            .filter(|(s, t, score)| !other.contains(s, t) && *score >= threshold)
            .collect()
    }

    /// XOR: pairs present in exactly one side.
    pub fn xor(&self, other: &Mapping, threshold: f64) -> Mapping {
        let mut out = self.difference(other, threshold);
        for (s, t, score) in other.iter() {
            if !self.contains(s, t) && score >= threshold {
                out.add(s, t, score);
            }
        }
        out
    }

    /// Merge a mapping computed over a disjoint set of source keys.
    pub(crate) fn absorb(&mut self, other: Mapping) {
        for (s, targets) in other.map {
            for (t, score) in targets {
                self.add(s.clone(), t, score);
            }
        }
    }
}

impl<S, T> FromIterator<(S, T, f64)> for Mapping
where
    S: Into<String>,
    T: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (S, T, f64)>>(iter: I) -> Self {
        let mut m = Mapping::new();
        for (s, t, score) in iter {
            m.add(s, t, score);
        }
        m
    }
}
