//! RCC-8 topological relations between polygons.
//!
//! Geometries are WKT `POLYGON` literals (outer ring only). Classification
//! splits each polygon's boundary at its intersections with the other
//! polygon's boundary and locates the midpoint of every resulting piece as
//! inside / on / outside the other polygon:
//!
//! | A's pieces | B's pieces | relation |
//! |---|---|---|
//! | all on B | all on A | EQ |
//! | none outside B | | TPP (boundaries touch) / NTPP |
//! | | none outside A | TPPi / NTPPi |
//! | some inside B, or B's some inside A | | PO |
//! | otherwise | | EC (boundaries touch) / DC |
//!
//! A bounding-box test rejects most disjoint pairs before any segment work.

use ahash::AHashMap;

use super::{
    accepts, map_sources, pairs, AtomicMapper, Capability, MapperInput, PairScorer, SkipCounter,
};
use crate::cache::Cache;
use crate::error::Result;
use crate::mapping::Mapping;

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rcc8 {
    /// Disconnected.
    Dc,
    /// Externally connected.
    Ec,
    /// Partially overlapping.
    Po,
    Eq,
    /// Tangential proper part.
    Tpp,
    /// Non-tangential proper part.
    Ntpp,
    Tppi,
    Ntppi,
}

impl Rcc8 {
    pub const ALL: [Rcc8; 8] = [
        Rcc8::Dc,
        Rcc8::Ec,
        Rcc8::Po,
        Rcc8::Eq,
        Rcc8::Tpp,
        Rcc8::Ntpp,
        Rcc8::Tppi,
        Rcc8::Ntppi,
    ];

    pub fn measure_name(self) -> &'static str {
        match self {
            Rcc8::Dc => "top_dc",
            Rcc8::Ec => "top_ec",
            Rcc8::Po => "top_po",
            Rcc8::Eq => "top_eq",
            Rcc8::Tpp => "top_tpp",
            Rcc8::Ntpp => "top_ntpp",
            Rcc8::Tppi => "top_tppi",
            Rcc8::Ntppi => "top_ntppi",
        }
    }
}

/// Named unions of base relations (`top_within` = TPP ∪ NTPP, ...).
pub const TOPOLOGY_ALIASES: [(&str, &[Rcc8]); 7] = [
    ("top_disjoint", &[Rcc8::Dc]),
    ("top_touches", &[Rcc8::Ec]),
    ("top_overlaps", &[Rcc8::Po]),
    ("top_equals", &[Rcc8::Eq]),
    ("top_within", &[Rcc8::Tpp, Rcc8::Ntpp]),
    ("top_contains", &[Rcc8::Tppi, Rcc8::Ntppi]),
    (
        "top_intersects",
        &[
            Rcc8::Ec,
            Rcc8::Po,
            Rcc8::Eq,
            Rcc8::Tpp,
            Rcc8::Ntpp,
            Rcc8::Tppi,
            Rcc8::Ntppi,
        ],
    ),
];

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    x: f64,
    y: f64,
}

impl Point {
    fn sub(self, o: Point) -> Point {
        Point {
            x: self.x - o.x,
            y: self.y - o.y,
        }
    }

    fn cross(self, o: Point) -> f64 {
        self.x * o.y - self.y * o.x
    }

    fn dot(self, o: Point) -> f64 {
        self.x * o.x + self.y * o.y
    }

    fn lerp(self, to: Point, t: f64) -> Point {
        Point {
            x: self.x + (to.x - self.x) * t,
            y: self.y + (to.y - self.y) * t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BBox {
    min: Point,
    max: Point,
}

impl BBox {
    fn intersects(&self, o: &BBox) -> bool {
        self.min.x <= o.max.x + EPS
            && o.min.x <= self.max.x + EPS
            && self.min.y <= o.max.y + EPS
            && o.min.y <= self.max.y + EPS
    }
}

/// Simple polygon without holes.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    /// Open ring: the closing vertex is not repeated.
    ring: Vec<Point>,
    bbox: BBox,
}

impl Polygon {
    /// Parse `POLYGON ((x y, x y, ...))`. Inner rings are ignored.
    pub fn from_wkt(text: &str) -> Option<Polygon> {
        let text = text.trim();
        let head = text.get(..7)?;
        if !head.eq_ignore_ascii_case("POLYGON") {
            return None;
        }
        let body = text[7..].trim().strip_prefix('(')?.strip_suffix(')')?.trim();
        let outer = body.strip_prefix('(')?;
        let outer = &outer[..outer.find(')')?];

        let mut ring = Vec::new();
        for pair in outer.split(',') {
            let mut coords = pair.split_whitespace().map(str::parse::<f64>);
            let x = coords.next()?.ok()?;
            let y = coords.next()?.ok()?;
            if !x.is_finite() || !y.is_finite() {
                return None;
            }
            ring.push(Point { x, y });
        }
        ring.dedup();
        while ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        if ring.len() < 3 {
            return None;
        }
        Some(Polygon::new(ring))
    }

    fn new(ring: Vec<Point>) -> Polygon {
        let mut bbox = BBox {
            min: ring[0],
            max: ring[0],
        };
        for p in &ring {
            bbox.min.x = bbox.min.x.min(p.x);
            bbox.min.y = bbox.min.y.min(p.y);
            bbox.max.x = bbox.max.x.max(p.x);
            bbox.max.y = bbox.max.y.max(p.y);
        }
        Polygon { ring, bbox }
    }

    fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.ring.len();
        (0..n).map(move |i| (self.ring[i], self.ring[(i + 1) % n]))
    }

    fn locate(&self, p: Point) -> Location {
        if self.edges().any(|(a, b)| on_segment(p, a, b)) {
            return Location::Boundary;
        }
        // Even-odd ray cast towards +x.
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > p.y) != (b.y > p.y) {
                let x = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
                if x > p.x {
                    inside = !inside;
                }
            }
        }
        if inside {
            Location::Inside
        } else {
            Location::Outside
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Inside,
    Boundary,
    Outside,
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let ab = b.sub(a);
    let ap = p.sub(a);
    let len2 = ab.dot(ab);
    if len2 == 0.0 {
        return ap.dot(ap) <= EPS * EPS;
    }
    if ab.cross(ap).abs() > EPS * len2.sqrt() {
        return false;
    }
    let t = ap.dot(ab) / len2;
    (-EPS..=1.0 + EPS).contains(&t)
}

/// Parameters along `p→q` where it meets `r→s`. Returns whether they meet.
fn split_points(p: Point, q: Point, r: Point, s: Point, out: &mut Vec<f64>) -> bool {
    let d = q.sub(p);
    let e = s.sub(r);
    let denom = d.cross(e);
    let rp = r.sub(p);
    if denom.abs() > EPS {
        let t = rp.cross(e) / denom;
        let u = rp.cross(d) / denom;
        if (-EPS..=1.0 + EPS).contains(&t) && (-EPS..=1.0 + EPS).contains(&u) {
            out.push(t.clamp(0.0, 1.0));
            return true;
        }
        return false;
    }
    // Parallel: only collinear overlaps matter.
    let len2 = d.dot(d);
    if len2 == 0.0 {
        return false;
    }
    if rp.cross(d).abs() > EPS * len2.sqrt() {
        return false;
    }
    let tr = rp.dot(d) / len2;
    let ts = s.sub(p).dot(d) / len2;
    let (lo, hi) = if tr <= ts { (tr, ts) } else { (ts, tr) };
    if hi < -EPS || lo > 1.0 + EPS {
        return false;
    }
    for t in [tr, ts] {
        if (0.0..=1.0).contains(&t) {
            out.push(t);
        }
    }
    true
}

/// Where the pieces of `a`'s boundary lie relative to `b`.
#[derive(Debug, Default)]
struct Pieces {
    inside: bool,
    outside: bool,
    contact: bool,
}

fn boundary_pieces(a: &Polygon, b: &Polygon) -> Pieces {
    let mut pieces = Pieces::default();
    let mut cuts = Vec::new();
    for (p, q) in a.edges() {
        cuts.clear();
        cuts.extend([0.0, 1.0]);
        for (r, s) in b.edges() {
            pieces.contact |= split_points(p, q, r, s, &mut cuts);
        }
        cuts.sort_by(f64::total_cmp);
        for w in cuts.windows(2) {
            if w[1] - w[0] <= EPS {
                continue;
            }
            match b.locate(p.lerp(q, (w[0] + w[1]) / 2.0)) {
                Location::Inside => pieces.inside = true,
                Location::Outside => pieces.outside = true,
                Location::Boundary => {}
            }
        }
    }
    pieces
}

pub fn classify(a: &Polygon, b: &Polygon) -> Rcc8 {
    if !a.bbox.intersects(&b.bbox) {
        return Rcc8::Dc;
    }
    let pa = boundary_pieces(a, b);
    let pb = boundary_pieces(b, a);
    let contact = pa.contact;

    if !pa.inside && !pa.outside && !pb.inside && !pb.outside {
        return Rcc8::Eq;
    }
    if !pa.outside && !pb.inside {
        return if contact { Rcc8::Tpp } else { Rcc8::Ntpp };
    }
    if !pb.outside && !pa.inside {
        return if contact { Rcc8::Tppi } else { Rcc8::Ntppi };
    }
    if pa.inside || pb.inside {
        return Rcc8::Po;
    }
    if contact {
        Rcc8::Ec
    } else {
        Rcc8::Dc
    }
}

// ============================================================================
// Mapper
// ============================================================================

/// Emits pairs whose relation is one of `relations`; matches score 1.
#[derive(Debug, Clone)]
pub struct TopologyMapper {
    relations: Vec<Rcc8>,
}

impl TopologyMapper {
    pub fn new(relations: &[Rcc8]) -> Self {
        Self {
            relations: relations.to_vec(),
        }
    }

    fn matches(&self, a: &Polygon, b: &Polygon) -> bool {
        self.relations.contains(&classify(a, b))
    }
}

fn polygons(values: &[String], skipped: &SkipCounter) -> Vec<Polygon> {
    values
        .iter()
        .filter_map(|v| {
            let polygon = Polygon::from_wkt(v);
            if polygon.is_none() {
                skipped.record();
            }
            polygon
        })
        .collect()
}

fn shapes_by_key(
    cache: &dyn Cache,
    values: impl Fn(&str) -> Vec<String>,
    skipped: &SkipCounter,
) -> AHashMap<String, Vec<Polygon>> {
    cache
        .keys()
        .into_iter()
        .filter_map(|k| {
            let shapes = polygons(&values(k), skipped);
            (!shapes.is_empty()).then(|| (k.to_string(), shapes))
        })
        .collect()
}

/// Polygons of every entity, parsed once.
struct ShapePairs {
    mapper: TopologyMapper,
    sources: AHashMap<String, Vec<Polygon>>,
    targets: AHashMap<String, Vec<Polygon>>,
}

impl PairScorer for ShapePairs {
    fn score(&self, source_key: &str, target_key: &str) -> f64 {
        let (Some(source), Some(target)) =
            (self.sources.get(source_key), self.targets.get(target_key))
        else {
            return 0.0;
        };
        let hit = source
            .iter()
            .any(|s| target.iter().any(|t| self.mapper.matches(s, t)));
        if hit {
            1.0
        } else {
            0.0
        }
    }
}

impl AtomicMapper for TopologyMapper {
    fn name(&self) -> &str {
        "rcc8"
    }

    fn evaluate(&self, input: &MapperInput<'_>) -> Result<Mapping> {
        let targets: Vec<(&str, Vec<Polygon>)> = input
            .target
            .keys()
            .into_iter()
            .filter_map(|k| {
                let shapes = polygons(&input.target_values(k), input.skipped);
                (!shapes.is_empty()).then_some((k, shapes))
            })
            .collect();

        let sources = input.source.keys();
        map_sources(input, &sources, |key| {
            let shapes = polygons(&input.source_values(key), input.skipped);
            Ok(targets
                .iter()
                .filter(|(_, ts)| {
                    shapes
                        .iter()
                        .any(|s| ts.iter().any(|t| self.matches(s, t)))
                })
                .map(|(t, _)| (t.to_string(), 1.0))
                .filter(|(_, score)| accepts(*score, input.threshold))
                .collect())
        })
    }

    fn estimate_runtime(&self, source_size: usize, target_size: usize, _threshold: f64) -> f64 {
        (source_size + target_size) as f64 * 4.0 + 6.0 * pairs(source_size, target_size)
    }

    fn estimate_result_size(&self, source_size: usize, target_size: usize, _threshold: f64) -> f64 {
        let share = if self.relations.contains(&Rcc8::Dc) {
            0.9
        } else {
            0.02 * self.relations.len() as f64
        };
        pairs(source_size, target_size) * share
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::PairScore | Capability::Parallel)
    }

    fn pair_scorer(&self, input: &MapperInput<'_>) -> Result<Box<dyn PairScorer>> {
        let targets = shapes_by_key(input.target, |k| input.target_values(k), input.skipped);
        let sources = shapes_by_key(input.source, |k| input.source_values(k), input.skipped);
        Ok(Box::new(ShapePairs {
            mapper: self.clone(),
            sources,
            targets,
        }))
    }

    fn pair_cost(&self) -> f64 {
        8.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::measures::testing::{run_with, scorer};

    fn square(x0: f64, y0: f64, size: f64) -> Polygon {
        let wkt = format!(
            "POLYGON(({x0} {y0}, {x1} {y0}, {x1} {y1}, {x0} {y1}, {x0} {y0}))",
            x1 = x0 + size,
            y1 = y0 + size
        );
        Polygon::from_wkt(&wkt).unwrap()
    }

    #[test]
    fn parses_wkt_and_rejects_garbage() {
        let p = Polygon::from_wkt("polygon ((0 0, 4 0, 4 4, 0 4, 0 0), (1 1, 2 1, 2 2, 1 1))").unwrap();
        assert_eq!(p.ring.len(), 4);
        assert!(Polygon::from_wkt("POINT (1 2)").is_none());
        assert!(Polygon::from_wkt("POLYGON ((0 0, 1 1))").is_none());
        assert!(Polygon::from_wkt("POLYGON ((0 0, a 1, 2 2, 0 0))").is_none());
    }

    #[test]
    fn classifies_all_eight_relations() {
        let big = square(0.0, 0.0, 4.0);
        let cases = [
            (square(10.0, 10.0, 1.0), Rcc8::Dc),
            (square(4.0, 0.0, 2.0), Rcc8::Ec),
            (square(2.0, 2.0, 4.0), Rcc8::Po),
            (square(0.0, 0.0, 4.0), Rcc8::Eq),
            (square(0.0, 0.0, 2.0), Rcc8::Tpp),
            (square(1.0, 1.0, 2.0), Rcc8::Ntpp),
        ];
        for (small, expected) in cases {
            assert_eq!(classify(&small, &big), expected, "{small:?}");
        }
        assert_eq!(classify(&big, &square(0.0, 0.0, 2.0)), Rcc8::Tppi);
        assert_eq!(classify(&big, &square(1.0, 1.0, 2.0)), Rcc8::Ntppi);
    }

    #[test]
    fn corner_contact_is_external() {
        assert_eq!(
            classify(&square(0.0, 0.0, 1.0), &square(1.0, 1.0, 1.0)),
            Rcc8::Ec
        );
    }

    #[test]
    fn disjoint_boxes_with_overlapping_bounds() {
        // L-shaped neighbour whose box covers the square but whose area does not.
        let l = Polygon::from_wkt("POLYGON ((0 0, 10 0, 10 1, 1 1, 1 10, 0 10, 0 0))").unwrap();
        assert_eq!(classify(&square(5.0, 5.0, 1.0), &l), Rcc8::Dc);
    }

    #[test]
    fn within_alias_collects_proper_parts() {
        let mut source = MemoryCache::new();
        source.add_value("inner", "geom", "POLYGON((1 1, 2 1, 2 2, 1 2, 1 1))");
        source.add_value("edge", "geom", "POLYGON((0 0, 2 0, 2 2, 0 2, 0 0))");
        source.add_value("far", "geom", "POLYGON((9 9, 10 9, 10 10, 9 10, 9 9))");
        source.add_value("broken", "geom", "POLYGON((oops))");
        let mut target = MemoryCache::new();
        target.add_value("region", "geom", "POLYGON((0 0, 4 0, 4 4, 0 4, 0 0))");

        let within = TOPOLOGY_ALIASES
            .iter()
            .find(|(name, _)| *name == "top_within")
            .unwrap()
            .1;
        let (mapping, skipped) = run_with(
            &TopologyMapper::new(within),
            &source,
            &target,
            "x.geom",
            "y.geom",
            1.0,
        )
        .unwrap();
        assert_eq!(skipped, 1);
        assert!(mapping.contains("inner", "region"));
        assert!(mapping.contains("edge", "region"));
        assert!(!mapping.contains("far", "region"));
        assert_eq!(mapping.size(), 2);
    }

    #[test]
    fn pair_scorer_parses_each_geometry_once() {
        let mut source = MemoryCache::new();
        source.add_value("inner", "label", "POLYGON((1 1, 2 1, 2 2, 1 2, 1 1))");
        source.add_value("broken", "label", "POLYGON((oops))");
        let mut target = MemoryCache::new();
        target.add_value("region", "label", "POLYGON((0 0, 4 0, 4 4, 0 4, 0 0))");

        let (scorer, skipped) = scorer(&TopologyMapper::new(&[Rcc8::Ntpp]), &source, &target);
        assert_eq!(skipped, 1);
        assert_eq!(scorer.score("inner", "region"), 1.0);
        assert_eq!(scorer.score("broken", "region"), 0.0);
        assert_eq!(scorer.score("inner", "nowhere"), 0.0);
    }
}
