//! Complexity estimator (C4).
//!
//! Scores a SQL-ish predicate fragment by matching spatial/geometry
//! function names and structural markers with regexes, the same
//! technique this crate's sibling config loaders use for recognizing
//! environment-variable placeholders: compile once into statics, apply
//! per call.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A named function/marker and the score it contributes each time it
/// matches. Mirrors the empirical weight table (spec §4.4, supplemented
/// by SPEC_FULL.md §C.4).
struct Weight {
    pattern: &'static str,
    score: f64,
}

const SPATIAL_PREDICATE_WEIGHTS: &[Weight] = &[
    Weight { pattern: r"\bST_Intersects\b", score: 5.0 },
    Weight { pattern: r"\bST_Contains\b", score: 8.0 },
    Weight { pattern: r"\bST_Equals\b", score: 15.0 },
    Weight { pattern: r"\bST_Within\b", score: 8.0 },
    Weight { pattern: r"\bST_Overlaps\b", score: 10.0 },
    Weight { pattern: r"\bST_Touches\b", score: 6.0 },
    Weight { pattern: r"\bST_Crosses\b", score: 7.0 },
    Weight { pattern: r"\bST_Disjoint\b", score: 4.0 },
    Weight { pattern: r"\bST_DWithin\b", score: 6.0 },
    Weight { pattern: r"\bST_Covers\b", score: 9.0 },
    Weight { pattern: r"\bST_CoveredBy\b", score: 9.0 },
];

const GEOMETRY_FUNCTION_WEIGHTS: &[Weight] = &[
    Weight { pattern: r"\bST_Union\b", score: 15.0 },
    Weight { pattern: r"\bST_SetSRID\b", score: 1.0 },
    Weight { pattern: r"\bST_IsEmpty\b", score: 1.0 },
    Weight { pattern: r"\bST_IsValid\b", score: 3.0 },
    Weight { pattern: r"\bST_Area\b", score: 3.0 },
    Weight { pattern: r"\bST_Length\b", score: 3.0 },
    Weight { pattern: r"\bST_GeomFromText\b", score: 2.0 },
    Weight { pattern: r"\bST_MakeEnvelope\b", score: 1.0 },
    Weight { pattern: r"\bST_Collect\b", score: 8.0 },
    Weight { pattern: r"\bST_Difference\b", score: 18.0 },
    Weight { pattern: r"\bST_Intersection\b", score: 18.0 },
    Weight { pattern: r"\bST_Extent\b", score: 5.0 },
    Weight { pattern: r"\bST_UnaryUnion\b", score: 12.0 },
];

const TRANSFORM_WEIGHT: f64 = 4.0;
static TRANSFORM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bST_Transform\b").expect("static regex"));

const BUFFER_WEIGHT_POSITIVE: f64 = 12.0;
const BUFFER_WEIGHT_NEGATIVE: f64 = 18.0;
static BUFFER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ST_Buffer\([^)]*?,\s*(-?[0-9.]+)").expect("static regex"));

const EXISTS_WEIGHT: f64 = 20.0;
static EXISTS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bEXISTS\s*\(").expect("static regex"));

const IN_SUBQUERY_WEIGHT: f64 = 15.0;
static IN_SUBQUERY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bIN\s*\(\s*SELECT\b").expect("static regex"));

static COMPILED_SPATIAL: LazyLock<Vec<(Regex, f64)>> = LazyLock::new(|| compile(SPATIAL_PREDICATE_WEIGHTS));
static COMPILED_GEOMETRY: LazyLock<Vec<(Regex, f64)>> = LazyLock::new(|| compile(GEOMETRY_FUNCTION_WEIGHTS));

fn compile(weights: &[Weight]) -> Vec<(Regex, f64)> {
    weights
        .iter()
        .map(|w| (Regex::new(w.pattern).expect("static regex"), w.score))
        .collect()
}

/// Classification bands for a total complexity score (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Trivial,
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl ComplexityLevel {
    #[must_use]
    pub fn classify(score: f64) -> Self {
        if score < 10.0 {
            ComplexityLevel::Trivial
        } else if score < 50.0 {
            ComplexityLevel::Simple
        } else if score < 150.0 {
            ComplexityLevel::Moderate
        } else if score < 500.0 {
            ComplexityLevel::Complex
        } else {
            ComplexityLevel::VeryComplex
        }
    }
}

/// Strategy recommended purely from the complexity level (spec §4.4);
/// the planner (C7) may override this with feature-count-aware rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedStrategy {
    Direct,
    Materialized,
    TwoPhase,
    Progressive,
}

impl ComplexityLevel {
    #[must_use]
    pub fn recommended_strategy(self) -> RecommendedStrategy {
        match self {
            ComplexityLevel::Trivial | ComplexityLevel::Simple => RecommendedStrategy::Direct,
            ComplexityLevel::Moderate => RecommendedStrategy::Materialized,
            ComplexityLevel::Complex => RecommendedStrategy::TwoPhase,
            ComplexityLevel::VeryComplex => RecommendedStrategy::Progressive,
        }
    }
}

/// Full score breakdown for a predicate (spec §4.4 `ComplexityBreakdown`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityBreakdown {
    pub spatial_predicate_cost: f64,
    pub buffer_cost: f64,
    pub transform_cost: f64,
    pub geometry_function_cost: f64,
    pub subquery_cost: f64,
    pub volume_multiplier: f64,
    pub total_score: f64,
    pub level: ComplexityLevel,
}

/// Scores a SQL-ish predicate against `feature_count` rows of context.
#[must_use]
pub fn estimate_complexity(sql: &str, feature_count: u64) -> ComplexityBreakdown {
    let spatial_predicate_cost = sum_matches(&COMPILED_SPATIAL, sql);
    let geometry_function_cost = sum_matches(&COMPILED_GEOMETRY, sql);

    let transform_cost = TRANSFORM_RE.find_iter(sql).count() as f64 * TRANSFORM_WEIGHT;

    let buffer_cost: f64 = BUFFER_RE
        .captures_iter(sql)
        .map(|c| {
            let is_negative = c
                .get(1)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .is_some_and(|v| v < 0.0);
            if is_negative {
                BUFFER_WEIGHT_NEGATIVE
            } else {
                BUFFER_WEIGHT_POSITIVE
            }
        })
        .sum();

    let subquery_cost = EXISTS_RE.find_iter(sql).count() as f64 * EXISTS_WEIGHT
        + IN_SUBQUERY_RE.find_iter(sql).count() as f64 * IN_SUBQUERY_WEIGHT;

    let volume_multiplier = volume_multiplier(feature_count);

    let base_total = spatial_predicate_cost + buffer_cost + transform_cost + geometry_function_cost + subquery_cost;
    let total_score = base_total * volume_multiplier;
    let level = ComplexityLevel::classify(total_score);

    ComplexityBreakdown {
        spatial_predicate_cost,
        buffer_cost,
        transform_cost,
        geometry_function_cost,
        subquery_cost,
        volume_multiplier,
        total_score,
        level,
    }
}

fn sum_matches(weights: &[(Regex, f64)], sql: &str) -> f64 {
    weights
        .iter()
        .map(|(re, score)| re.find_iter(sql).count() as f64 * score)
        .sum()
}

/// `1 + log10(max(1, features/10_000)) * 0.5` (spec §4.4).
#[must_use]
pub fn volume_multiplier(feature_count: u64) -> f64 {
    let ratio = (feature_count as f64 / 10_000.0).max(1.0);
    1.0 + ratio.log10() * 0.5
}

/// Whether the two-phase bbox-then-exact path should be used, given the
/// breakdown, feature count, and whether source bounds are available
/// (spec §4.4 `should_use_two_phase`).
#[must_use]
pub fn should_use_two_phase(
    breakdown: &ComplexityBreakdown,
    feature_count: u64,
    has_bounds: bool,
    has_buffer: bool,
    spatial_predicate_count: usize,
) -> bool {
    if !has_bounds {
        return false;
    }
    breakdown.level >= ComplexityLevel::Complex
        || (has_buffer && feature_count > 10_000)
        || (breakdown.subquery_cost > 0.0 && feature_count > 5_000)
        || (feature_count > 50_000 && spatial_predicate_count >= 2)
}

impl PartialOrd for ComplexityLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComplexityLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        rank(*self).cmp(&rank(*other))
    }
}

fn rank(level: ComplexityLevel) -> u8 {
    match level {
        ComplexityLevel::Trivial => 0,
        ComplexityLevel::Simple => 1,
        ComplexityLevel::Moderate => 2,
        ComplexityLevel::Complex => 3,
        ComplexityLevel::VeryComplex => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_bands() {
        assert_eq!(ComplexityLevel::classify(9.9), ComplexityLevel::Trivial);
        assert_eq!(ComplexityLevel::classify(49.9), ComplexityLevel::Simple);
        assert_eq!(ComplexityLevel::classify(149.9), ComplexityLevel::Moderate);
        assert_eq!(ComplexityLevel::classify(499.9), ComplexityLevel::Complex);
        assert_eq!(ComplexityLevel::classify(500.0), ComplexityLevel::VeryComplex);
    }

    #[test]
    fn negative_buffer_costs_more_than_positive() {
        let pos = estimate_complexity("ST_Buffer(g, 5, '')", 1);
        let neg = estimate_complexity("ST_Buffer(g, -5, '')", 1);
        assert!(neg.buffer_cost > pos.buffer_cost);
    }

    #[test]
    fn exists_and_in_subquery_both_score() {
        let b = estimate_complexity("EXISTS (SELECT 1 FROM x) AND pk IN (SELECT pk FROM y)", 1);
        assert!((b.subquery_cost - (EXISTS_WEIGHT + IN_SUBQUERY_WEIGHT)).abs() < f64::EPSILON);
    }

    #[test]
    fn volume_multiplier_is_one_below_ten_thousand() {
        assert!((volume_multiplier(5_000) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn volume_multiplier_grows_with_scale() {
        assert!(volume_multiplier(1_000_000) > volume_multiplier(10_000));
    }

    #[test]
    fn two_phase_requires_bounds() {
        let breakdown = estimate_complexity("ST_Intersects(a,b)", 1);
        assert!(!should_use_two_phase(&breakdown, 100_000, false, false, 2));
    }

    #[test]
    fn two_phase_triggers_on_high_complexity() {
        let breakdown = ComplexityBreakdown {
            spatial_predicate_cost: 0.0,
            buffer_cost: 0.0,
            transform_cost: 0.0,
            geometry_function_cost: 0.0,
            subquery_cost: 0.0,
            volume_multiplier: 1.0,
            total_score: 600.0,
            level: ComplexityLevel::VeryComplex,
        };
        assert!(should_use_two_phase(&breakdown, 1, true, false, 0));
    }

    #[test]
    fn boundary_feature_count_and_complexity_direct_vs_two_phase() {
        // spec §8: feature_count=9_999 complexity=99 -> DIRECT-eligible (not two-phase);
        // 10_000/complexity 100 -> TWO_PHASE-eligible.
        let low = ComplexityBreakdown {
            spatial_predicate_cost: 0.0,
            buffer_cost: 0.0,
            transform_cost: 0.0,
            geometry_function_cost: 0.0,
            subquery_cost: 0.0,
            volume_multiplier: 1.0,
            total_score: 99.0,
            level: ComplexityLevel::classify(99.0),
        };
        assert!(!should_use_two_phase(&low, 9_999, true, false, 0));

        let high = ComplexityBreakdown {
            total_score: 500.0,
            level: ComplexityLevel::classify(500.0),
            ..low
        };
        assert!(should_use_two_phase(&high, 10_000, true, false, 0));
    }
}
