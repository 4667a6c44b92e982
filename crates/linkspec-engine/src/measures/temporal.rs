//! Allen interval relations.
//!
//! An interval is read from two properties (`x.begin|end`). Every relation is a
//! conjunction of *primitive* comparisons between one endpoint of the source
//! interval and one endpoint of the target interval, e.g. `Overlaps` is
//! `bs < bt ∧ es > bt ∧ es < et`.
//!
//! Each primitive is materialised once as a map from source entity to the set
//! of target ordinals satisfying it (binary search over target endpoints sorted
//! by value). The relation's mapping is the entity-wise intersection of its
//! primitive maps. Every emitted pair scores 1.
//!
//! Endpoint values may be integers, decimals, RFC 3339 timestamps or
//! `YYYY-MM-DD` dates; anything else is skipped and counted.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate};
use linkspec_dsl::PropertyExpr;
use rayon::prelude::*;
use roaring::RoaringBitmap;

use super::{pairs, AtomicMapper, Capability, MapperInput, SkipCounter};
use crate::cache::Cache;
use crate::error::Result;
use crate::mapping::Mapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Begin,
    End,
}

/// `source.endpoint <order> target.endpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Primitive {
    pub source: Endpoint,
    pub target: Endpoint,
    pub order: Ordering,
}

macro_rules! prim {
    ($source:expr, $order:expr, $target:expr) => {
        Primitive {
            source: $source,
            target: $target,
            order: $order,
        }
    };
}

use Endpoint::{Begin as B, End as E};
use Ordering::{Equal as EQ, Greater as GT, Less as LT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllenRelation {
    Before,
    After,
    Meets,
    IsMetBy,
    Overlaps,
    IsOverlappedBy,
    Starts,
    IsStartedBy,
    During,
    DuringReverse,
    Finishes,
    IsFinishedBy,
    Equals,
}

impl AllenRelation {
    pub const ALL: [AllenRelation; 13] = [
        AllenRelation::Before,
        AllenRelation::After,
        AllenRelation::Meets,
        AllenRelation::IsMetBy,
        AllenRelation::Overlaps,
        AllenRelation::IsOverlappedBy,
        AllenRelation::Starts,
        AllenRelation::IsStartedBy,
        AllenRelation::During,
        AllenRelation::DuringReverse,
        AllenRelation::Finishes,
        AllenRelation::IsFinishedBy,
        AllenRelation::Equals,
    ];

    /// Measure name, e.g. `tmp_overlaps`.
    pub fn measure_name(self) -> &'static str {
        match self {
            AllenRelation::Before => "tmp_before",
            AllenRelation::After => "tmp_after",
            AllenRelation::Meets => "tmp_meets",
            AllenRelation::IsMetBy => "tmp_ismetby",
            AllenRelation::Overlaps => "tmp_overlaps",
            AllenRelation::IsOverlappedBy => "tmp_isoverlappedby",
            AllenRelation::Starts => "tmp_starts",
            AllenRelation::IsStartedBy => "tmp_isstartedby",
            AllenRelation::During => "tmp_during",
            AllenRelation::DuringReverse => "tmp_duringreverse",
            AllenRelation::Finishes => "tmp_finishes",
            AllenRelation::IsFinishedBy => "tmp_isfinishedby",
            AllenRelation::Equals => "tmp_equals",
        }
    }

    /// Underscored spelling also accepted for the inverse relations.
    pub fn alias(self) -> Option<&'static str> {
        match self {
            AllenRelation::IsMetBy => Some("tmp_is_met_by"),
            AllenRelation::IsOverlappedBy => Some("tmp_is_overlapped_by"),
            AllenRelation::IsStartedBy => Some("tmp_is_started_by"),
            AllenRelation::DuringReverse => Some("tmp_during_reverse"),
            AllenRelation::IsFinishedBy => Some("tmp_is_finished_by"),
            _ => None,
        }
    }

    pub fn primitives(self) -> &'static [Primitive] {
        match self {
            AllenRelation::Before => &[prim!(E, LT, B)],
            AllenRelation::After => &[prim!(B, GT, E)],
            AllenRelation::Meets => &[prim!(E, EQ, B)],
            AllenRelation::IsMetBy => &[prim!(B, EQ, E)],
            AllenRelation::Overlaps => &[prim!(B, LT, B), prim!(E, GT, B), prim!(E, LT, E)],
            AllenRelation::IsOverlappedBy => &[prim!(B, GT, B), prim!(B, LT, E), prim!(E, GT, E)],
            AllenRelation::Starts => &[prim!(B, EQ, B), prim!(E, LT, E)],
            AllenRelation::IsStartedBy => &[prim!(B, EQ, B), prim!(E, GT, E)],
            AllenRelation::During => &[prim!(B, GT, B), prim!(E, LT, E)],
            AllenRelation::DuringReverse => &[prim!(B, LT, B), prim!(E, GT, E)],
            AllenRelation::Finishes => &[prim!(B, GT, B), prim!(E, EQ, E)],
            AllenRelation::IsFinishedBy => &[prim!(B, LT, B), prim!(E, EQ, E)],
            AllenRelation::Equals => &[prim!(B, EQ, B), prim!(E, EQ, E)],
        }
    }

    /// Direct check on two intervals.
    pub fn holds(self, source: Interval, target: Interval) -> bool {
        self.primitives().iter().all(|p| {
            source
                .at(p.source)
                .total_cmp(&target.at(p.target))
                == p.order
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub begin: f64,
    pub end: f64,
}

impl Interval {
    fn at(self, endpoint: Endpoint) -> f64 {
        match endpoint {
            Endpoint::Begin => self.begin,
            Endpoint::End => self.end,
        }
    }
}

/// Parse one endpoint value. Timestamps become epoch milliseconds.
pub fn parse_time(value: &str) -> Option<f64> {
    let value = value.trim();
    if let Ok(n) = value.parse::<f64>() {
        return n.is_finite().then_some(n);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.timestamp_millis() as f64);
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(midnight.and_utc().timestamp_millis() as f64)
}

/// First parsable begin and end of one entity. Missing properties yield
/// `None` silently; unparsable values are counted.
fn read_interval(
    cache: &dyn Cache,
    key: &str,
    expr: &PropertyExpr,
    end_property: &str,
    skipped: &SkipCounter,
) -> Option<Interval> {
    let first = |property: &str| {
        cache
            .property_values(key, property)
            .iter()
            .find_map(|raw| {
                let parsed = parse_time(&expr.preprocess(raw));
                if parsed.is_none() {
                    skipped.record();
                }
                parsed
            })
    };
    let begin = first(&expr.reference().property)?;
    let end = first(end_property)?;
    Some(Interval { begin, end })
}

// ============================================================================
// Primitive maps
// ============================================================================

/// Target endpoint values sorted ascending, paired with target ordinals.
struct SortedEndpoints {
    begin: Vec<(f64, u32)>,
    end: Vec<(f64, u32)>,
}

impl SortedEndpoints {
    fn new(targets: &[Interval]) -> Self {
        let sorted = |endpoint: Endpoint| {
            let mut v: Vec<(f64, u32)> = targets
                .iter()
                .enumerate()
                .map(|(ord, iv)| (iv.at(endpoint), ord as u32))
                .collect();
            v.sort_by(|a, b| a.0.total_cmp(&b.0));
            v
        };
        Self {
            begin: sorted(Endpoint::Begin),
            end: sorted(Endpoint::End),
        }
    }

    /// Targets whose `endpoint` value `v_t` satisfies `value <order> v_t`.
    fn matching(&self, endpoint: Endpoint, order: Ordering, value: f64) -> RoaringBitmap {
        let sorted = match endpoint {
            Endpoint::Begin => &self.begin,
            Endpoint::End => &self.end,
        };
        let below = sorted.partition_point(|(v, _)| v.total_cmp(&value) == Ordering::Less);
        let through = sorted.partition_point(|(v, _)| v.total_cmp(&value) != Ordering::Greater);
        let range = match order {
            // value < v_t
            Ordering::Less => through..sorted.len(),
            Ordering::Equal => below..through,
            // value > v_t
            Ordering::Greater => 0..below,
        };
        sorted[range].iter().map(|(_, ord)| *ord).collect()
    }
}

/// Source ordinal to satisfying target ordinals, for one primitive.
type PrimitiveMap = BTreeMap<u32, RoaringBitmap>;

fn primitive_map(
    primitive: Primitive,
    sources: &[Interval],
    targets: &SortedEndpoints,
    parallel: bool,
) -> PrimitiveMap {
    let one = |(ord, iv): (usize, &Interval)| {
        let hits = targets.matching(primitive.target, primitive.order, iv.at(primitive.source));
        (!hits.is_empty()).then_some((ord as u32, hits))
    };
    if parallel {
        sources.par_iter().enumerate().filter_map(one).collect()
    } else {
        sources.iter().enumerate().filter_map(one).collect()
    }
}

// ============================================================================
// Mapper
// ============================================================================

#[derive(Debug, Clone)]
pub struct AllenMapper {
    relation: AllenRelation,
}

impl AllenMapper {
    pub fn new(relation: AllenRelation) -> Self {
        Self { relation }
    }

    pub fn relation(&self) -> AllenRelation {
        self.relation
    }
}

/// Entities with a readable interval, in cache order.
fn load_intervals<'a>(
    input: &MapperInput<'_>,
    cache: &'a dyn Cache,
    expr: &PropertyExpr,
) -> Result<(Vec<&'a str>, Vec<Interval>)> {
    let Some(end_property) = expr.reference().end_property.as_deref() else {
        return Err(input.error(format!(
            "`{expr}` must name both interval endpoints (`var.begin|end`)"
        )));
    };
    let mut keys = Vec::new();
    let mut intervals = Vec::new();
    for key in cache.keys() {
        if let Some(iv) = read_interval(cache, key, expr, end_property, input.skipped) {
            keys.push(key);
            intervals.push(iv);
        }
    }
    Ok((keys, intervals))
}

impl AtomicMapper for AllenMapper {
    fn name(&self) -> &str {
        "primitive-maps"
    }

    fn evaluate(&self, input: &MapperInput<'_>) -> Result<Mapping> {
        let (source_keys, sources) = load_intervals(input, input.source, input.source_expr)?;
        let (target_keys, targets) = load_intervals(input, input.target, input.target_expr)?;
        let sorted = SortedEndpoints::new(&targets);
        let parallel =
            input.options.parallel && sources.len() >= input.options.min_parallel_sources.max(1);

        let mut maps = self
            .relation
            .primitives()
            .iter()
            .map(|p| primitive_map(*p, &sources, &sorted, parallel));
        let Some(mut combined) = maps.next() else {
            return Ok(Mapping::new());
        };
        for next in maps {
            combined = combined
                .into_iter()
                .filter_map(|(ord, hits)| {
                    let other = next.get(&ord)?;
                    let both = hits & other;
                    (!both.is_empty()).then_some((ord, both))
                })
                .collect();
        }

        let mut out = Mapping::new();
        for (source_ord, hits) in combined {
            let source = source_keys[source_ord as usize];
            for target_ord in hits.iter() {
                out.add(source, target_keys[target_ord as usize], 1.0);
            }
        }
        Ok(out)
    }

    fn estimate_runtime(&self, source_size: usize, target_size: usize, _threshold: f64) -> f64 {
        let k = self.relation.primitives().len() as f64;
        let log_t = ((target_size + 2) as f64).log2();
        2.0 * target_size as f64 * log_t
            + k * source_size as f64 * log_t
            + 0.05 * k * pairs(source_size, target_size)
    }

    fn estimate_result_size(&self, source_size: usize, target_size: usize, _threshold: f64) -> f64 {
        // Equality-based relations are far rarer than order-based ones.
        let share = if self
            .relation
            .primitives()
            .iter()
            .any(|p| p.order == Ordering::Equal)
        {
            0.01
        } else {
            0.25
        };
        pairs(source_size, target_size) * share
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::Parallel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::LinkError;
    use crate::measures::testing::run_with;

    fn iv(begin: f64, end: f64) -> Interval {
        Interval { begin, end }
    }

    #[test]
    fn exactly_one_relation_holds_for_proper_intervals() {
        let cases = [
            (iv(0.0, 5.0), iv(0.0, 10.0), AllenRelation::Starts),
            (iv(0.0, 2.0), iv(3.0, 4.0), AllenRelation::Before),
            (iv(0.0, 3.0), iv(3.0, 4.0), AllenRelation::Meets),
            (iv(0.0, 3.5), iv(3.0, 4.0), AllenRelation::Overlaps),
            (iv(3.0, 4.0), iv(0.0, 3.5), AllenRelation::IsOverlappedBy),
            (iv(2.0, 3.0), iv(0.0, 5.0), AllenRelation::During),
            (iv(2.0, 5.0), iv(0.0, 5.0), AllenRelation::Finishes),
            (iv(0.0, 5.0), iv(0.0, 5.0), AllenRelation::Equals),
            (iv(6.0, 7.0), iv(0.0, 5.0), AllenRelation::After),
        ];
        for (s, t, expected) in cases {
            let holding: Vec<_> = AllenRelation::ALL
                .into_iter()
                .filter(|r| r.holds(s, t))
                .collect();
            assert_eq!(holding, vec![expected], "{s:?} vs {t:?}");
        }
    }

    #[test]
    fn parses_numbers_dates_and_timestamps() {
        assert_eq!(parse_time(" 42 "), Some(42.0));
        assert_eq!(parse_time("1970-01-02"), Some(86_400_000.0));
        assert_eq!(parse_time("1970-01-01T00:00:01Z"), Some(1_000.0));
        assert_eq!(parse_time("yesterday"), None);
    }

    fn caches() -> (MemoryCache, MemoryCache) {
        let mut source = MemoryCache::new();
        source.add_value("s1", "begin", "0");
        source.add_value("s1", "end", "5");
        source.add_value("s2", "begin", "soon");
        source.add_value("s2", "end", "5");
        source.add_value("s3", "begin", "1");

        let mut target = MemoryCache::new();
        for (key, b, e) in [("t1", "0", "10"), ("t2", "0", "5"), ("t3", "5", "8"), ("t4", "6", "9")] {
            target.add_value(key, "begin", b);
            target.add_value(key, "end", e);
        }
        (source, target)
    }

    #[test]
    fn primitive_intersection_matches_direct_check() {
        let (source, target) = caches();
        for relation in AllenRelation::ALL {
            let (mapping, skipped) = run_with(
                &AllenMapper::new(relation),
                &source,
                &target,
                "x.begin|end",
                "y.begin|end",
                0.5,
            )
            .unwrap();
            assert_eq!(skipped, 1, "`soon` is not a time");
            let expected: Mapping = [
                ("t1", iv(0.0, 10.0)),
                ("t2", iv(0.0, 5.0)),
                ("t3", iv(5.0, 8.0)),
                ("t4", iv(6.0, 9.0)),
            ]
            .into_iter()
            .filter(|(_, t)| relation.holds(iv(0.0, 5.0), *t))
            .map(|(key, _)| ("s1", key, 1.0))
            .collect();
            assert_eq!(mapping, expected, "{}", relation.measure_name());
        }
    }

    #[test]
    fn starts_but_not_finishes() {
        let (source, target) = caches();
        let eval = |relation| {
            run_with(
                &AllenMapper::new(relation),
                &source,
                &target,
                "x.begin|end",
                "y.begin|end",
                1.0,
            )
            .unwrap()
            .0
        };
        assert_eq!(eval(AllenRelation::Starts).get("s1", "t1"), Some(1.0));
        assert!(!eval(AllenRelation::Finishes).contains("s1", "t1"));
        assert!(!eval(AllenRelation::Equals).contains("s1", "t1"));
        assert!(!eval(AllenRelation::Before).contains("s1", "t1"));
        assert!(eval(AllenRelation::Meets).contains("s1", "t3"));
        assert!(eval(AllenRelation::Before).contains("s1", "t4"));
    }

    #[test]
    fn missing_end_property_is_an_evaluation_error() {
        let (source, target) = caches();
        let err = run_with(
            &AllenMapper::new(AllenRelation::Before),
            &source,
            &target,
            "x.begin",
            "y.begin|end",
            1.0,
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::Evaluation { .. }), "{err}");
    }
}
