//! String and numeric similarity measures.
//!
//! Each measure has a nested-loop mapper (the reference implementation) and,
//! where the measure allows it, an indexed variant:
//!
//! - token measures (`jaccard`, `cosine`, `overlap`, `trigrams`) use an inverted
//!   index over tokens; a pair scores above zero only if it shares a token, so
//!   candidates drawn from the index are complete;
//! - `levenshtein` uses a length window: `sim >= θ` implies
//!   `θ·|a| <= |b| <= |a|/θ`;
//! - `exactmatch` is a hash join.
//!
//! Indexed variants always rescore candidates with the exact measure, so they
//! return the same mapping as the nested loop.

use std::collections::BTreeMap;

use ahash::AHashMap;
use roaring::RoaringBitmap;

use super::{
    accepts, map_sources, pairs, AtomicMapper, Capability, MapperInput, PairScorer, SkipCounter,
};
use crate::error::Result;
use crate::mapping::Mapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringMeasure {
    Levenshtein,
    Jaro,
    JaroWinkler,
    Jaccard,
    Cosine,
    Overlap,
    Trigrams,
    ExactMatch,
    Euclidean,
}

impl StringMeasure {
    pub const ALL: [StringMeasure; 9] = [
        StringMeasure::Levenshtein,
        StringMeasure::Jaro,
        StringMeasure::JaroWinkler,
        StringMeasure::Jaccard,
        StringMeasure::Cosine,
        StringMeasure::Overlap,
        StringMeasure::Trigrams,
        StringMeasure::ExactMatch,
        StringMeasure::Euclidean,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StringMeasure::Levenshtein => "levenshtein",
            StringMeasure::Jaro => "jaro",
            StringMeasure::JaroWinkler => "jarowinkler",
            StringMeasure::Jaccard => "jaccard",
            StringMeasure::Cosine => "cosine",
            StringMeasure::Overlap => "overlap",
            StringMeasure::Trigrams => "trigrams",
            StringMeasure::ExactMatch => "exactmatch",
            StringMeasure::Euclidean => "euclidean",
        }
    }

    /// Whether the measure compares token bags and supports an inverted index.
    pub fn is_token_based(self) -> bool {
        matches!(
            self,
            StringMeasure::Jaccard
                | StringMeasure::Cosine
                | StringMeasure::Overlap
                | StringMeasure::Trigrams
        )
    }

    /// Turn raw (already preprocessed) values into comparable form.
    pub fn prepare(self, raw: &[String], skipped: &SkipCounter) -> Vec<Prepared> {
        match self {
            StringMeasure::Jaccard | StringMeasure::Cosine | StringMeasure::Overlap => raw
                .iter()
                .map(|v| Prepared::Bag(word_tokens(v)))
                .collect(),
            StringMeasure::Trigrams => raw.iter().map(|v| Prepared::Bag(trigrams(v))).collect(),
            StringMeasure::Euclidean => raw
                .iter()
                .filter_map(|v| match v.trim().parse::<f64>() {
                    Ok(n) if n.is_finite() => Some(Prepared::Number(n)),
                    _ => {
                        skipped.record();
                        None
                    }
                })
                .collect(),
            _ => raw.iter().cloned().map(Prepared::Text).collect(),
        }
    }

    /// Similarity of two prepared values, in `[0, 1]`.
    pub fn score(self, a: &Prepared, b: &Prepared) -> f64 {
        let s = match (self, a, b) {
            (StringMeasure::Levenshtein, Prepared::Text(a), Prepared::Text(b)) => {
                strsim::normalized_levenshtein(a, b)
            }
            (StringMeasure::Jaro, Prepared::Text(a), Prepared::Text(b)) => strsim::jaro(a, b),
            (StringMeasure::JaroWinkler, Prepared::Text(a), Prepared::Text(b)) => {
                strsim::jaro_winkler(a, b)
            }
            (StringMeasure::ExactMatch, Prepared::Text(a), Prepared::Text(b)) => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            (StringMeasure::Jaccard, Prepared::Bag(a), Prepared::Bag(b)) => {
                let common = common_distinct(a, b) as f64;
                let union = (a.len() + b.len()) as f64 - common;
                ratio(common, union)
            }
            (StringMeasure::Overlap, Prepared::Bag(a), Prepared::Bag(b)) => {
                ratio(common_distinct(a, b) as f64, a.len().min(b.len()) as f64)
            }
            (StringMeasure::Trigrams, Prepared::Bag(a), Prepared::Bag(b)) => ratio(
                2.0 * common_distinct(a, b) as f64,
                (a.len() + b.len()) as f64,
            ),
            (StringMeasure::Cosine, Prepared::Bag(a), Prepared::Bag(b)) => {
                let dot = dot_product(a, b);
                let na: f64 = a.iter().map(|(_, c)| (*c as f64).powi(2)).sum();
                let nb: f64 = b.iter().map(|(_, c)| (*c as f64).powi(2)).sum();
                ratio(dot, (na * nb).sqrt())
            }
            (StringMeasure::Euclidean, Prepared::Number(a), Prepared::Number(b)) => {
                1.0 / (1.0 + (a - b).abs())
            }
            _ => 0.0,
        };
        s.clamp(0.0, 1.0)
    }

    /// Entity-level score: the best score over all value pairs.
    pub fn entity_score(self, source: &[Prepared], target: &[Prepared]) -> f64 {
        let mut best = 0.0_f64;
        for a in source {
            for b in target {
                best = best.max(self.score(a, b));
                if best >= 1.0 {
                    return best;
                }
            }
        }
        best
    }

    fn pair_weight(self) -> f64 {
        match self {
            StringMeasure::Levenshtein => 4.0,
            StringMeasure::Trigrams => 3.0,
            StringMeasure::Jaccard | StringMeasure::Cosine | StringMeasure::Overlap => 2.5,
            StringMeasure::Jaro | StringMeasure::JaroWinkler => 2.0,
            StringMeasure::ExactMatch | StringMeasure::Euclidean => 0.5,
        }
    }

    fn estimate_result_size(self, source_size: usize, target_size: usize, threshold: f64) -> f64 {
        match self {
            StringMeasure::ExactMatch => source_size.min(target_size) as f64,
            _ => {
                let slack = 1.0 - threshold.clamp(0.0, 1.0);
                pairs(source_size, target_size) * (0.001 + 0.2 * slack * slack)
            }
        }
    }
}

/// A value ready for comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    Text(String),
    /// Sorted `(token, count)` pairs.
    Bag(Vec<(String, u32)>),
    Number(f64),
}

impl Prepared {
    fn tokens(&self) -> impl Iterator<Item = &str> {
        let bag: &[(String, u32)] = match self {
            Prepared::Bag(bag) => bag,
            _ => &[],
        };
        bag.iter().map(|(t, _)| t.as_str())
    }

    fn text(&self) -> Option<&str> {
        match self {
            Prepared::Text(s) => Some(s),
            _ => None,
        }
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        (num / den).min(1.0)
    } else {
        0.0
    }
}

fn into_bag(tokens: impl Iterator<Item = String>) -> Vec<(String, u32)> {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for t in tokens {
        *counts.entry(t).or_default() += 1;
    }
    counts.into_iter().collect()
}

/// Lowercased alphanumeric runs.
pub fn word_tokens(value: &str) -> Vec<(String, u32)> {
    into_bag(
        value
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase),
    )
}

/// Lowercased character trigrams over `"  " + value + " "`.
pub fn trigrams(value: &str) -> Vec<(String, u32)> {
    if value.is_empty() {
        return Vec::new();
    }
    let padded: Vec<char> = "  "
        .chars()
        .chain(value.to_lowercase().chars())
        .chain(std::iter::once(' '))
        .collect();
    into_bag(padded.windows(3).map(|w| w.iter().collect()))
}

fn common_distinct(a: &[(String, u32)], b: &[(String, u32)]) -> usize {
    merge_common(a, b).count()
}

fn dot_product(a: &[(String, u32)], b: &[(String, u32)]) -> f64 {
    merge_common(a, b).map(|(x, y)| x as f64 * y as f64).sum()
}

/// Counts of tokens present in both sorted bags.
fn merge_common<'a>(
    a: &'a [(String, u32)],
    b: &'a [(String, u32)],
) -> impl Iterator<Item = (u32, u32)> + 'a {
    let (mut i, mut j) = (0, 0);
    std::iter::from_fn(move || {
        while i < a.len() && j < b.len() {
            match a[i].0.cmp(&b[j].0) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    let out = (a[i].1, b[j].1);
                    i += 1;
                    j += 1;
                    return Some(out);
                }
            }
        }
        None
    })
}

/// Target entities with at least one usable value, in cache order.
fn prepared_targets<'a>(
    measure: StringMeasure,
    input: &MapperInput<'a>,
) -> Vec<(&'a str, Vec<Prepared>)> {
    input
        .target
        .keys()
        .into_iter()
        .filter_map(|k| {
            let values = measure.prepare(&input.target_values(k), input.skipped);
            (!values.is_empty()).then_some((k, values))
        })
        .collect()
}

fn score_candidates(
    measure: StringMeasure,
    threshold: f64,
    source: &[Prepared],
    targets: &[(&str, Vec<Prepared>)],
    candidates: &RoaringBitmap,
) -> Vec<(String, f64)> {
    candidates
        .iter()
        .filter_map(|ord| {
            let (key, values) = &targets[ord as usize];
            let score = measure.entity_score(source, values);
            accepts(score, threshold).then(|| (key.to_string(), score))
        })
        .collect()
}

/// Values of every entity on both sides, prepared once for pairwise scoring.
struct PreparedPairs {
    measure: StringMeasure,
    sources: AHashMap<String, Vec<Prepared>>,
    targets: AHashMap<String, Vec<Prepared>>,
}

impl PairScorer for PreparedPairs {
    fn score(&self, source_key: &str, target_key: &str) -> f64 {
        match (self.sources.get(source_key), self.targets.get(target_key)) {
            (Some(source), Some(target)) => self.measure.entity_score(source, target),
            _ => 0.0,
        }
    }
}

/// Prepares targets, then sources, counting skips the same way `evaluate` does.
fn prepared_pairs(measure: StringMeasure, input: &MapperInput<'_>) -> Box<dyn PairScorer> {
    let targets = prepared_targets(measure, input)
        .into_iter()
        .map(|(k, values)| (k.to_string(), values))
        .collect();
    let sources = input
        .source
        .keys()
        .into_iter()
        .filter_map(|k| {
            let values = measure.prepare(&input.source_values(k), input.skipped);
            (!values.is_empty()).then(|| (k.to_string(), values))
        })
        .collect();
    Box::new(PreparedPairs {
        measure,
        sources,
        targets,
    })
}

// ============================================================================
// Nested loop
// ============================================================================

/// Scores every source entity against every target entity.
#[derive(Debug, Clone)]
pub struct NestedLoopMapper {
    measure: StringMeasure,
}

impl NestedLoopMapper {
    pub fn new(measure: StringMeasure) -> Self {
        Self { measure }
    }
}

impl AtomicMapper for NestedLoopMapper {
    fn name(&self) -> &str {
        "nested-loop"
    }

    fn evaluate(&self, input: &MapperInput<'_>) -> Result<Mapping> {
        let targets = prepared_targets(self.measure, input);
        let sources = input.source.keys();
        map_sources(input, &sources, |key| {
            let values = self.measure.prepare(&input.source_values(key), input.skipped);
            if values.is_empty() {
                return Ok(Vec::new());
            }
            Ok(targets
                .iter()
                .filter_map(|(t, tv)| {
                    let score = self.measure.entity_score(&values, tv);
                    accepts(score, input.threshold).then(|| (t.to_string(), score))
                })
                .collect())
        })
    }

    fn estimate_runtime(&self, source_size: usize, target_size: usize, _threshold: f64) -> f64 {
        (source_size + target_size) as f64 + self.measure.pair_weight() * pairs(source_size, target_size)
    }

    fn estimate_result_size(&self, source_size: usize, target_size: usize, threshold: f64) -> f64 {
        self.measure
            .estimate_result_size(source_size, target_size, threshold)
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::PairScore | Capability::Parallel)
    }

    fn pair_scorer(&self, input: &MapperInput<'_>) -> Result<Box<dyn PairScorer>> {
        Ok(prepared_pairs(self.measure, input))
    }

    fn pair_cost(&self) -> f64 {
        1.0 + self.measure.pair_weight()
    }
}

// ============================================================================
// Token inverted index
// ============================================================================

/// Candidate generation through shared tokens (token measures only).
#[derive(Debug, Clone)]
pub struct TokenIndexMapper {
    measure: StringMeasure,
}

impl TokenIndexMapper {
    pub fn new(measure: StringMeasure) -> Self {
        debug_assert!(measure.is_token_based());
        Self { measure }
    }
}

impl AtomicMapper for TokenIndexMapper {
    fn name(&self) -> &str {
        "token-index"
    }

    fn evaluate(&self, input: &MapperInput<'_>) -> Result<Mapping> {
        let targets = prepared_targets(self.measure, input);
        let mut index: AHashMap<&str, RoaringBitmap> = AHashMap::new();
        for (ord, (_, values)) in targets.iter().enumerate() {
            for token in values.iter().flat_map(Prepared::tokens) {
                index.entry(token).or_default().insert(ord as u32);
            }
        }
        tracing::trace!(tokens = index.len(), targets = targets.len(), "token index built");

        let sources = input.source.keys();
        map_sources(input, &sources, |key| {
            let values = self.measure.prepare(&input.source_values(key), input.skipped);
            let mut candidates = RoaringBitmap::new();
            for token in values.iter().flat_map(Prepared::tokens) {
                if let Some(posting) = index.get(token) {
                    candidates |= posting;
                }
            }
            Ok(score_candidates(
                self.measure,
                input.threshold,
                &values,
                &targets,
                &candidates,
            ))
        })
    }

    fn estimate_runtime(&self, source_size: usize, target_size: usize, threshold: f64) -> f64 {
        let candidate_ratio = 0.05 + 0.45 * (1.0 - threshold.clamp(0.0, 1.0));
        2.0 * (source_size + target_size) as f64
            + self.measure.pair_weight() * pairs(source_size, target_size) * candidate_ratio
    }

    fn estimate_result_size(&self, source_size: usize, target_size: usize, threshold: f64) -> f64 {
        self.measure
            .estimate_result_size(source_size, target_size, threshold)
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::PairScore | Capability::Parallel)
    }

    fn pair_scorer(&self, input: &MapperInput<'_>) -> Result<Box<dyn PairScorer>> {
        Ok(prepared_pairs(self.measure, input))
    }

    fn pair_cost(&self) -> f64 {
        1.0 + self.measure.pair_weight()
    }
}

// ============================================================================
// Length window (levenshtein)
// ============================================================================

/// Only compares strings whose lengths can reach the threshold.
#[derive(Debug, Clone, Default)]
pub struct LengthFilterMapper;

/// Inclusive char-length range of targets that can score `>= threshold`
/// against a source of length `len`, widened by one on each side.
pub fn length_window(len: usize, threshold: f64) -> (usize, usize) {
    if threshold <= 0.0 {
        return (0, usize::MAX);
    }
    let lo = (threshold * len as f64).floor() as usize;
    let hi = (len as f64 / threshold).ceil() as usize;
    (lo.saturating_sub(1), hi.saturating_add(1))
}

impl AtomicMapper for LengthFilterMapper {
    fn name(&self) -> &str {
        "length-filter"
    }

    fn evaluate(&self, input: &MapperInput<'_>) -> Result<Mapping> {
        let measure = StringMeasure::Levenshtein;
        let targets = prepared_targets(measure, input);
        let mut by_length: BTreeMap<usize, RoaringBitmap> = BTreeMap::new();
        for (ord, (_, values)) in targets.iter().enumerate() {
            for text in values.iter().filter_map(Prepared::text) {
                by_length
                    .entry(text.chars().count())
                    .or_default()
                    .insert(ord as u32);
            }
        }

        let sources = input.source.keys();
        map_sources(input, &sources, |key| {
            let values = measure.prepare(&input.source_values(key), input.skipped);
            let mut candidates = RoaringBitmap::new();
            for text in values.iter().filter_map(Prepared::text) {
                let (lo, hi) = length_window(text.chars().count(), input.threshold);
                for (_, ords) in by_length.range(lo..=hi) {
                    candidates |= ords;
                }
            }
            Ok(score_candidates(
                measure,
                input.threshold,
                &values,
                &targets,
                &candidates,
            ))
        })
    }

    fn estimate_runtime(&self, source_size: usize, target_size: usize, threshold: f64) -> f64 {
        let window = 0.1 + 0.9 * (1.0 - threshold.clamp(0.0, 1.0));
        (source_size + target_size) as f64 * ((target_size + 2) as f64).log2()
            + StringMeasure::Levenshtein.pair_weight() * pairs(source_size, target_size) * window
    }

    fn estimate_result_size(&self, source_size: usize, target_size: usize, threshold: f64) -> f64 {
        StringMeasure::Levenshtein.estimate_result_size(source_size, target_size, threshold)
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::PairScore | Capability::Parallel)
    }

    fn pair_scorer(&self, input: &MapperInput<'_>) -> Result<Box<dyn PairScorer>> {
        Ok(prepared_pairs(StringMeasure::Levenshtein, input))
    }

    fn pair_cost(&self) -> f64 {
        1.0 + StringMeasure::Levenshtein.pair_weight()
    }
}

// ============================================================================
// Hash join (exactmatch)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct HashJoinMapper;

impl AtomicMapper for HashJoinMapper {
    fn name(&self) -> &str {
        "hash-join"
    }

    fn evaluate(&self, input: &MapperInput<'_>) -> Result<Mapping> {
        let targets = prepared_targets(StringMeasure::ExactMatch, input);
        let mut index: AHashMap<&str, RoaringBitmap> = AHashMap::new();
        for (ord, (_, values)) in targets.iter().enumerate() {
            for text in values.iter().filter_map(Prepared::text) {
                index.entry(text).or_default().insert(ord as u32);
            }
        }

        let sources = input.source.keys();
        map_sources(input, &sources, |key| {
            let mut hits = RoaringBitmap::new();
            for value in input.source_values(key) {
                if let Some(ords) = index.get(value.as_str()) {
                    hits |= ords;
                }
            }
            Ok(hits
                .iter()
                .map(|ord| (targets[ord as usize].0.to_string(), 1.0))
                .collect())
        })
    }

    fn estimate_runtime(&self, source_size: usize, target_size: usize, _threshold: f64) -> f64 {
        2.0 * (source_size + target_size) as f64 + source_size.min(target_size) as f64
    }

    fn estimate_result_size(&self, source_size: usize, target_size: usize, threshold: f64) -> f64 {
        StringMeasure::ExactMatch.estimate_result_size(source_size, target_size, threshold)
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::PairScore | Capability::Parallel)
    }

    fn pair_scorer(&self, input: &MapperInput<'_>) -> Result<Box<dyn PairScorer>> {
        Ok(prepared_pairs(StringMeasure::ExactMatch, input))
    }

    fn pair_cost(&self) -> f64 {
        1.0 + StringMeasure::ExactMatch.pair_weight()
    }
}
