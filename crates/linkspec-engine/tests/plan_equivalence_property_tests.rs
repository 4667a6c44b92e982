use linkspec_dsl::{Combinator, LinkSpec, PropertyExpr};
use linkspec_engine::measures::temporal::AllenRelation;
use linkspec_engine::measures::topology::{Rcc8, TOPOLOGY_ALIASES};
use linkspec_engine::{
    Cache, EngineConfig, EvalOptions, ExecutionEngine, Mapping, MemoryCache, Planner, PlannerKind,
    Registry,
};
use proptest::prelude::*;

const WORDS: [&str; 8] = [
    "apple", "Apples", "pie", "banana", "split", "cherry", "kiwi", "tree",
];

const STRING_MEASURES: [&str; 9] = [
    "levenshtein",
    "jaro",
    "jarowinkler",
    "jaccard",
    "cosine",
    "overlap",
    "trigrams",
    "exactmatch",
    "euclidean",
];

const THRESHOLDS: [f64; 6] = [0.0, 0.25, 0.5, 0.75, 0.9, 1.0];

/// String, temporal and topological measure names.
fn all_measures() -> Vec<&'static str> {
    let mut measures = STRING_MEASURES.to_vec();
    measures.extend(AllenRelation::ALL.iter().map(|r| r.measure_name()));
    measures.extend(Rcc8::ALL.iter().map(|r| r.measure_name()));
    measures.extend(TOPOLOGY_ALIASES.iter().map(|(name, _)| *name));
    measures
}

fn label_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(WORDS.to_vec()), 1..=2).prop_map(|w| w.join(" "))
}

/// `begin`/`end` on a small integer grid, sometimes unparsable.
fn interval_strategy() -> impl Strategy<Value = (String, String)> {
    prop_oneof![
        6 => (0u32..4, 0u32..3).prop_map(|(begin, len)| (begin.to_string(), (begin + len).to_string())),
        1 => Just(("soon".to_string(), "3".to_string())),
    ]
}

/// Axis-aligned squares on a small grid, sometimes malformed.
fn geometry_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        6 => (0u32..4, 0u32..2, 1u32..3).prop_map(|(x, y, size)| {
            let (x2, y2) = (x + size, y + size);
            format!("POLYGON(({x} {y}, {x2} {y}, {x2} {y2}, {x} {y2}, {x} {y}))")
        }),
        1 => Just("POLYGON((oops))".to_string()),
    ]
}

/// Entities with labels, a small integer `n`, and optionally an interval
/// and a geometry.
fn cache_strategy(prefix: &'static str) -> impl Strategy<Value = MemoryCache> {
    prop::collection::vec(
        (
            prop::collection::vec(label_strategy(), 0..=2),
            0u32..6,
            prop::option::of(interval_strategy()),
            prop::option::of(geometry_strategy()),
        ),
        1..=6,
    )
    .prop_map(move |entities| {
        let mut cache = MemoryCache::new();
        for (i, (labels, n, interval, geometry)) in entities.into_iter().enumerate() {
            let key = format!("{prefix}{i}");
            for label in labels {
                cache.add_value(key.as_str(), "label", label);
            }
            cache.add_value(key.as_str(), "n", n.to_string());
            if let Some((begin, end)) = interval {
                cache.add_value(key.as_str(), "begin", begin);
                cache.add_value(key.as_str(), "end", end);
            }
            if let Some(wkt) = geometry {
                cache.add_value(key.as_str(), "geom", wkt);
            }
        }
        cache
    })
}

fn leaf_strategy() -> impl Strategy<Value = LinkSpec> {
    (
        prop::sample::select(all_measures()),
        prop::sample::select(THRESHOLDS.to_vec()),
    )
        .prop_map(|(measure, threshold)| {
            let (source, target) = if measure.starts_with("tmp_") {
                (
                    PropertyExpr::interval("x", "begin", "end"),
                    PropertyExpr::interval("y", "begin", "end"),
                )
            } else {
                let property = match measure {
                    "euclidean" => "n",
                    m if m.starts_with("top_") => "geom",
                    _ => "label",
                };
                (
                    PropertyExpr::property("x", property),
                    PropertyExpr::property("y", property),
                )
            };
            LinkSpec::atomic(measure, source, target, threshold).unwrap()
        })
}

fn spec_strategy() -> impl Strategy<Value = LinkSpec> {
    leaf_strategy().prop_recursive(3, 12, 2, |inner| {
        (
            prop::sample::select(Combinator::ALL.to_vec()),
            inner.clone(),
            inner,
            prop::option::of(prop::sample::select(THRESHOLDS.to_vec())),
        )
            .prop_map(|(op, left, right, threshold)| {
                LinkSpec::composite(op, left, right, threshold).unwrap()
            })
    })
}

fn run(
    spec: &LinkSpec,
    source: &MemoryCache,
    target: &MemoryCache,
    kind: PlannerKind,
    planned_sizes: (usize, usize),
    options: EvalOptions,
) -> Mapping {
    let registry = Registry::with_defaults();
    let plan = Planner::new(&registry, kind)
        .plan(spec, planned_sizes.0, planned_sizes.1)
        .expect("plan");
    ExecutionEngine::new(source, target)
        .with_options(options)
        .execute(&plan)
        .expect("execute")
        .mapping
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn cost_based_parallel_plans_match_canonical_sequential(
        spec in spec_strategy(),
        source in cache_strategy("s"),
        target in cache_strategy("t"),
        planned in prop::sample::select(vec![(1usize, 1usize), (6, 6), (50_000, 50_000), (10, 200_000)]),
    ) {
        let sequential = EngineConfig::sequential().eval_options();
        let parallel = EvalOptions { parallel: true, min_parallel_sources: 1 };

        let reference = run(&spec, &source, &target, PlannerKind::Canonical, (source.len(), target.len()), sequential);
        // Planning against made-up sizes steers the planner towards indexes
        // and filters without changing what the plan computes.
        let optimised = run(&spec, &source, &target, PlannerKind::CostBased, planned, parallel);
        prop_assert_eq!(&optimised, &reference, "spec {}", spec);

        let optimised_sequential = run(&spec, &source, &target, PlannerKind::CostBased, planned, sequential);
        prop_assert_eq!(&optimised_sequential, &reference, "spec {}", spec);
    }

    #[test]
    fn raising_a_leaf_threshold_only_removes_pairs(
        measure in prop::sample::select(STRING_MEASURES.to_vec()),
        low in prop::sample::select(THRESHOLDS.to_vec()),
        high in prop::sample::select(THRESHOLDS.to_vec()),
        source in cache_strategy("s"),
        target in cache_strategy("t"),
    ) {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        let property = if measure == "euclidean" { "n" } else { "label" };
        let leaf = |threshold| {
            LinkSpec::atomic(
                measure,
                PropertyExpr::property("x", property),
                PropertyExpr::property("y", property),
                threshold,
            )
            .unwrap()
        };
        let options = EngineConfig::sequential().eval_options();
        let sizes = (source.len(), target.len());
        let loose = run(&leaf(low), &source, &target, PlannerKind::CostBased, sizes, options);
        let strict = run(&leaf(high), &source, &target, PlannerKind::CostBased, sizes, options);
        for (s, t, score) in strict.iter() {
            prop_assert_eq!(loose.get(s, t), Some(score));
            prop_assert!(score >= high && score > 0.0);
        }
    }
}
