use std::io::Write;

use linkspec_dsl::parse_link_spec;
use linkspec_engine::{
    discover_links, AtomicMapper, CancellationToken, EngineConfig, ExecutionEngine, LinkError,
    MapperInput, Mapping, MemoryCache, NodeId, PlanNode, Planner, PlannerKind, Registry,
    ReviewPolicy,
};

fn names(entities: &[(&str, &str)]) -> MemoryCache {
    let mut cache = MemoryCache::new();
    for (key, name) in entities {
        cache.add_value(*key, "name", *name);
    }
    cache
}

fn discover(text: &str, source: &MemoryCache, target: &MemoryCache) -> linkspec_engine::Result<Mapping> {
    let spec = parse_link_spec(text)?;
    let exec = discover_links(
        &spec,
        source,
        target,
        &Registry::with_defaults(),
        &EngineConfig::default(),
    )?;
    Ok(exec.mapping)
}

/// Returns a fixed mapping, filtered by the leaf threshold.
struct FixedMapper {
    pairs: Mapping,
    on_evaluate: Option<CancellationToken>,
}

impl AtomicMapper for FixedMapper {
    fn name(&self) -> &str {
        "fixed"
    }

    fn evaluate(&self, input: &MapperInput<'_>) -> linkspec_engine::Result<Mapping> {
        if let Some(token) = &self.on_evaluate {
            token.cancel();
        }
        Ok(self.pairs.filter(input.threshold))
    }

    fn estimate_runtime(&self, _: usize, _: usize, _: f64) -> f64 {
        1.0
    }

    fn estimate_result_size(&self, _: usize, _: usize, _: f64) -> f64 {
        self.pairs.size() as f64
    }
}

fn fixed_registry(measures: Vec<(&str, Mapping, Option<CancellationToken>)>) -> Registry {
    let mut registry = Registry::with_defaults();
    for (name, pairs, on_evaluate) in measures {
        registry.register(name, move || {
            Box::new(FixedMapper {
                pairs: pairs.clone(),
                on_evaluate: on_evaluate.clone(),
            })
        });
    }
    registry
}

#[test]
fn identical_names_link_with_full_score() {
    let source = names(&[("s1", "Apple")]);
    let target = names(&[("t1", "Apple")]);
    let mapping = discover("levenshtein(x.name, y.name)|0.9", &source, &target).unwrap();
    let expected: Mapping = [("s1", "t1", 1.0)].into_iter().collect();
    assert_eq!(mapping, expected);
}

#[test]
fn conjunction_keeps_the_weaker_leaf_score() {
    let registry = fixed_registry(vec![
        ("fixed_a", [("s1", "t1", 0.9)].into_iter().collect(), None),
        ("fixed_b", [("s1", "t1", 0.6)].into_iter().collect(), None),
    ]);
    let spec = parse_link_spec("AND(fixed_a(x.p,y.p)|0.5, fixed_b(x.p,y.p)|0.5)|0.5").unwrap();
    let empty = MemoryCache::new();
    let exec = discover_links(&spec, &empty, &empty, &registry, &EngineConfig::default()).unwrap();
    assert_eq!(exec.mapping.get("s1", "t1"), Some(0.6));
    assert_eq!(exec.mapping.size(), 1);
}

#[test]
fn absent_property_yields_no_pairs() {
    let source = names(&[("s1", "Apple")]);
    let target = names(&[("t1", "Apple")]);
    for text in [
        "jaccard(x.label, y.label)|0.1",
        "OR(trigrams(x.name, y.nope)|0.1, exactmatch(x.nope, y.name)|1)",
        "tmp_before(x.begin|end, y.begin|end)|1",
        "top_intersects(x.geom, y.geom)|1",
    ] {
        let mapping = discover(text, &source, &target).unwrap();
        assert!(mapping.is_empty(), "{text}");
    }
}

#[test]
fn preprocessing_applies_before_comparison() {
    let source = names(&[("s1", "  APPLE@en ")]);
    let target = names(&[("t1", "apple")]);
    let plain = discover("exactmatch(x.name, y.name)|1", &source, &target).unwrap();
    assert!(plain.is_empty());
    let cleaned = discover(
        "exactmatch(lowercase(nolang(trim(x.name))), y.name)|1",
        &source,
        &target,
    )
    .unwrap();
    assert_eq!(cleaned.get("s1", "t1"), Some(1.0));
}

#[test]
fn minus_keeps_operand_order() {
    let source = names(&[("s1", "Apple"), ("s2", "Apples")]);
    let target = names(&[("t1", "Apple")]);
    let lev_minus_exact = discover(
        "MINUS(levenshtein(x.name,y.name)|0.8, exactmatch(x.name,y.name)|1)",
        &source,
        &target,
    )
    .unwrap();
    let exact_minus_lev = discover(
        "MINUS(exactmatch(x.name,y.name)|1, levenshtein(x.name,y.name)|0.8)",
        &source,
        &target,
    )
    .unwrap();
    assert_eq!(lev_minus_exact.iter().collect::<Vec<_>>(), vec![("s2", "t1", 1.0 - 1.0 / 6.0)]);
    assert!(exact_minus_lev.is_empty());
}

#[test]
fn allen_relations_end_to_end() {
    let mut source = MemoryCache::new();
    source.add_value("s1", "begin", "2024-01-01");
    source.add_value("s1", "end", "2024-01-05");
    let mut target = MemoryCache::new();
    target.add_value("t1", "start", "2024-01-01T00:00:00Z");
    target.add_value("t1", "stop", "2024-01-10");

    let starts = discover("tmp_starts(x.begin|end, y.start|stop)|1", &source, &target).unwrap();
    assert_eq!(starts.get("s1", "t1"), Some(1.0));
    for relation in ["tmp_finishes", "tmp_equals", "tmp_before"] {
        let text = format!("{relation}(x.begin|end, y.start|stop)|1");
        assert!(discover(&text, &source, &target).unwrap().is_empty(), "{relation}");
    }
}

#[test]
fn malformed_interval_reference_aborts_without_partial_result() {
    let mut source = MemoryCache::new();
    source.add_value("s1", "begin", "1");
    source.add_value("s1", "end", "2");
    source.add_value("s1", "name", "Apple");
    let mut target = source.clone();
    target.add_value("s1", "name", "Apple");

    let err = discover(
        "OR(exactmatch(x.name,y.name)|1, tmp_before(x.begin, y.begin|end)|1)",
        &source,
        &target,
    )
    .unwrap_err();
    match err {
        LinkError::Evaluation { node, expression, .. } => {
            assert_eq!(node, NodeId(2));
            assert!(expression.starts_with("tmp_before"), "{expression}");
        }
        other => panic!("expected evaluation error, got {other}"),
    }
    assert!(!LinkError::Cancelled { node: NodeId(0) }.is_planning_error());
}

#[test]
fn unparsable_values_are_skipped_and_reported() {
    let mut source = MemoryCache::new();
    source.add_value("s1", "n", "4");
    source.add_value("s2", "n", "four");
    let mut target = MemoryCache::new();
    target.add_value("t1", "n", "4");

    let spec = parse_link_spec("euclidean(x.n, y.n)|0.5").unwrap();
    let exec = discover_links(
        &spec,
        &source,
        &target,
        &Registry::with_defaults(),
        &EngineConfig::default(),
    )
    .unwrap();
    assert_eq!(exec.mapping.get("s1", "t1"), Some(1.0));
    assert_eq!(exec.mapping.size(), 1);
    assert_eq!(exec.skipped_values(), 1);
    assert_eq!(exec.report(NodeId(0)).unwrap().skipped_values, 1);
}

#[test]
fn skipped_values_do_not_depend_on_the_plan() {
    let mut source = MemoryCache::new();
    source.add_value("s1", "name", "Apple");
    source.add_value("s1", "n", "four");
    source.add_value("s2", "name", "Pear");
    source.add_value("s2", "n", "3");
    let mut target = MemoryCache::new();
    target.add_value("t1", "name", "Apple");
    target.add_value("t1", "n", "4");
    target.add_value("t2", "name", "Pear");
    target.add_value("t2", "n", "3");

    let registry = Registry::with_defaults();
    let spec =
        parse_link_spec("AND(exactmatch(x.name, y.name)|1, euclidean(x.n, y.n)|0.5)").unwrap();
    let run = |kind| {
        let plan = Planner::new(&registry, kind).plan(&spec, 1000, 1000).unwrap();
        let exec = ExecutionEngine::new(&source, &target)
            .with_config(&EngineConfig::sequential())
            .execute(&plan)
            .unwrap();
        (plan, exec)
    };

    let (canonical_plan, canonical) = run(PlannerKind::Canonical);
    let (filter_plan, filtered) = run(PlannerKind::CostBased);
    assert!(matches!(canonical_plan.root, PlanNode::Combine(_)));
    assert!(matches!(filter_plan.root, PlanNode::Filter(_)), "{filter_plan}");

    assert_eq!(filtered.mapping, canonical.mapping);
    assert_eq!(canonical.mapping.get("s2", "t2"), Some(1.0));
    assert_eq!(canonical.skipped_values(), 1);
    assert_eq!(filtered.skipped_values(), 1);
    assert_eq!(filtered.report(NodeId(2)).unwrap().skipped_values, 1);
}

#[test]
fn cancellation_during_a_leaf_stops_the_next_node() {
    let token = CancellationToken::new();
    let registry = fixed_registry(vec![
        ("fixed_a", [("s1", "t1", 0.9)].into_iter().collect(), Some(token.clone())),
        ("fixed_b", [("s1", "t1", 0.6)].into_iter().collect(), None),
    ]);
    let spec = parse_link_spec("AND(fixed_a(x.p,y.p)|0.5, fixed_b(x.p,y.p)|0.5)").unwrap();
    let plan = Planner::new(&registry, PlannerKind::Canonical)
        .plan(&spec, 1, 1)
        .unwrap();
    let empty = MemoryCache::new();
    let err = ExecutionEngine::new(&empty, &empty)
        .with_config(&EngineConfig::sequential())
        .with_cancellation(token)
        .execute(&plan)
        .unwrap_err();
    // fixed_a (#1) runs and cancels; fixed_b (#2) never starts.
    assert!(matches!(err, LinkError::Cancelled { node: NodeId(2) }), "{err}");
}

#[test]
fn time_budget_from_config() {
    let source = names(&[("s1", "Apple")]);
    let target = names(&[("t1", "Apple")]);
    let config = EngineConfig::from_json_str(r#"{ "time_budget_ms": 0 }"#).unwrap();
    let spec = parse_link_spec("jaro(x.name,y.name)|0.5").unwrap();
    let err = discover_links(&spec, &source, &target, &Registry::with_defaults(), &config)
        .unwrap_err();
    assert!(matches!(err, LinkError::TimeBudgetExceeded { .. }), "{err}");
}

#[test]
fn review_split_of_a_final_mapping() {
    let source = names(&[("s1", "Apple"), ("s2", "Appel"), ("s3", "Pear")]);
    let target = names(&[("t1", "Apple")]);
    let mapping = discover("levenshtein(x.name,y.name)|0.5", &source, &target).unwrap();
    let split = ReviewPolicy::new(0.9, None).unwrap().split(&mapping);
    assert!(split.accepted.contains("s1", "t1"));
    // "Appel" is two edits from "Apple": 0.6, below the 0.8 review band.
    assert!(!split.review.contains("s2", "t1"));
    let wide = ReviewPolicy::new(0.9, Some(0.6)).unwrap().split(&mapping);
    assert!(wide.review.contains("s2", "t1"));
    assert!(!wide.accepted.contains("s3", "t1"));
}

#[test]
fn caches_load_from_json_files() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{ "s1": {{ "name": ["Apple"] }}, "s2": {{ "name": ["Kiwi"] }} }}"#
    )
    .unwrap();
    let source = MemoryCache::from_reader(std::fs::File::open(file.path()).unwrap()).unwrap();
    let target = names(&[("t1", "apple")]);
    let mapping = discover("jaccard(x.name, y.name)|1", &source, &target).unwrap();
    assert_eq!(mapping.iter().collect::<Vec<_>>(), vec![("s1", "t1", 1.0)]);
}
