//! Filter planner (C7).
//!
//! Turns layer statistics plus an optional attribute/spatial filter
//! into a [`FilterPlan`] via the cascading rules in spec §4.7. This
//! module makes the strategy decision; C8 backend executors turn the
//! plan into actual SQL/processing calls.

use std::collections::BTreeMap;

use crate::model::{Extent, FilterPlan, FilterStep, LayerStatistics, Strategy};

/// Inputs the planner needs for a single target layer (spec §4.7).
#[derive(Debug, Clone)]
pub struct PlannerInput<'a> {
    pub stats: &'a LayerStatistics,
    pub attribute_filter: Option<&'a str>,
    /// Pre-computed via [`selectivity_from_sample`] against a bounded
    /// feature sample (spec §4.7); `None` when no attribute filter is
    /// present.
    pub attribute_selectivity: Option<f64>,
    pub spatial_extent: Option<Extent>,
    pub has_spatial_filter: bool,
    pub complexity_score: f64,
}

/// Sample size used for attribute-selectivity estimation (spec §4.7).
pub const SELECTIVITY_SAMPLE_SIZE: usize = 200;

/// Empirical dampening factor applied to bbox-overlap spatial
/// selectivity (spec §4.7).
const SPATIAL_SELECTIVITY_DAMPENING: f64 = 0.7;

/// Base chunk size for `PROGRESSIVE_CHUNKS`, halved above 1M features
/// (spec §4.7).
const PROGRESSIVE_CHUNK_BASE: f64 = 10_000.0;
const PROGRESSIVE_CHUNK_MIN: usize = 1_000;
const PROGRESSIVE_CHUNK_MAX: usize = 50_000;

/// Row/byte size estimation constants carried over from the original
/// `_legacy` estimator (SPEC_FULL §C.5): 8 bytes per id, 50 bytes of
/// per-row overhead, and an assumed average vertex count per geometry
/// when no sampled average is available.
const BYTES_PER_ID: u64 = 8;
const ROW_OVERHEAD_BYTES: u64 = 50;
const DEFAULT_AVG_VERTICES: f64 = 50.0;
/// Bytes per vertex coordinate pair (two `f64`s) in an estimated WKB
/// payload.
const BYTES_PER_VERTEX: f64 = 16.0;

/// Estimates the in-memory footprint of a chunk of `chunk_size` rows,
/// each carrying a primary key and a geometry with `avg_vertices`
/// vertices on average, used to size progressive/lazy-cursor chunks
/// (SPEC_FULL §C.5). Falls back to [`DEFAULT_AVG_VERTICES`] when the
/// caller has no sampled average.
#[must_use]
pub fn estimate_row_bytes(chunk_size: usize, avg_vertices: Option<f64>) -> u64 {
    let avg_vertices = avg_vertices.unwrap_or(DEFAULT_AVG_VERTICES).max(0.0);
    let geometry_bytes = (avg_vertices * BYTES_PER_VERTEX) as u64;
    let per_row = BYTES_PER_ID + ROW_OVERHEAD_BYTES + geometry_bytes;
    per_row * chunk_size as u64
}

/// Estimates spatial selectivity from the overlap ratio of two extents,
/// with the empirical dampening factor, clamped to `[0, 1]` (spec §4.7).
#[must_use]
pub fn estimate_spatial_selectivity(target_extent: &Extent, source_extent: &Extent) -> f64 {
    let target_area = target_extent.area();
    if target_area <= 0.0 {
        return 0.0;
    }
    let ratio = target_extent.overlap_area(source_extent) / target_area * SPATIAL_SELECTIVITY_DAMPENING;
    ratio.clamp(0.0, 1.0)
}

/// Estimates attribute selectivity from a bounded sample: `matches /
/// sampled` (spec §4.7). The sample evaluation itself is delegated to
/// the Host through the caller; this just turns counts into a ratio.
#[must_use]
pub fn selectivity_from_sample(matches: usize, sampled: usize) -> f64 {
    if sampled == 0 {
        return 1.0;
    }
    (matches as f64 / sampled as f64).clamp(0.0, 1.0)
}

fn progressive_chunk_size(feature_count: u64, complexity_score: f64) -> usize {
    let base = if feature_count > 1_000_000 { PROGRESSIVE_CHUNK_BASE / 2.0 } else { PROGRESSIVE_CHUNK_BASE };
    let divisor = (complexity_score / 2.0).max(1.0);
    let size = (base / divisor) as usize;
    size.clamp(PROGRESSIVE_CHUNK_MIN, PROGRESSIVE_CHUNK_MAX)
}

/// Builds a plan for a single target layer using the cascading rules
/// from spec §4.7, in order.
#[must_use]
pub fn plan(input: &PlannerInput<'_>) -> FilterPlan {
    let feature_count = input.stats.feature_count;

    if feature_count <= 1_000 {
        return direct_plan(input);
    }

    if let (Some(attr), Some(attr_selectivity)) = (input.attribute_filter, input.attribute_selectivity) {
        if attr_selectivity < 0.3 && feature_count > 1_000 {
            return attribute_first_plan(input, attr, attr_selectivity);
        }
    }

    if input.has_spatial_filter && feature_count > 50_000 {
        let spatial_sel = match (input.spatial_extent, input.stats.extent_bounds) {
            (Some(target), Some(source)) => estimate_spatial_selectivity(&target, &source),
            _ => 1.0,
        };
        if spatial_sel < 0.5 {
            return bbox_then_exact_plan(input, spatial_sel);
        }
    }

    if feature_count > 200_000 {
        return progressive_chunks_plan(input);
    }

    hybrid_plan(input)
}

fn direct_plan(input: &PlannerInput<'_>) -> FilterPlan {
    FilterPlan {
        strategy: Strategy::Direct,
        steps: vec![FilterStep {
            kind: "direct".to_string(),
            expression: input.attribute_filter.map(ToString::to_string),
            estimated_output: input.stats.feature_count,
            metadata: BTreeMap::new(),
        }],
        estimated_selectivity: 1.0,
        estimated_cost: 1.0,
        chunk_size: 0,
        use_spatial_index: input.stats.has_spatial_index,
        attribute_filter: input.attribute_filter.map(ToString::to_string),
        spatial_filter: None,
    }
}

fn attribute_first_plan(input: &PlannerInput<'_>, attr: &str, attr_selectivity: f64) -> FilterPlan {
    let estimated_after_attr = (input.stats.feature_count as f64 * attr_selectivity) as u64;
    let mut steps = vec![FilterStep {
        kind: "attribute".to_string(),
        expression: Some(attr.to_string()),
        estimated_output: estimated_after_attr,
        metadata: BTreeMap::new(),
    }];
    if input.has_spatial_filter {
        steps.push(FilterStep {
            kind: "spatial".to_string(),
            expression: None,
            estimated_output: estimated_after_attr,
            metadata: BTreeMap::new(),
        });
    }
    FilterPlan {
        strategy: Strategy::AttributeFirst,
        steps,
        estimated_selectivity: attr_selectivity,
        estimated_cost: attr_selectivity * input.stats.feature_count as f64,
        chunk_size: 0,
        use_spatial_index: input.stats.has_spatial_index,
        attribute_filter: Some(attr.to_string()),
        spatial_filter: None,
    }
}

fn bbox_then_exact_plan(input: &PlannerInput<'_>, spatial_sel: f64) -> FilterPlan {
    let bbox_output = (input.stats.feature_count as f64 * spatial_sel * 1.5) as u64;
    let mut steps = Vec::new();
    if let Some(attr) = input.attribute_filter {
        steps.push(FilterStep {
            kind: "attribute".to_string(),
            expression: Some(attr.to_string()),
            estimated_output: input.stats.feature_count,
            metadata: BTreeMap::new(),
        });
    }
    steps.push(FilterStep {
        kind: "bbox_filter".to_string(),
        expression: None,
        estimated_output: bbox_output,
        metadata: BTreeMap::new(),
    });
    steps.push(FilterStep {
        kind: "exact_spatial".to_string(),
        expression: None,
        estimated_output: bbox_output,
        metadata: BTreeMap::new(),
    });
    FilterPlan {
        strategy: Strategy::BboxThenExact,
        steps,
        estimated_selectivity: spatial_sel,
        estimated_cost: bbox_output as f64,
        chunk_size: 0,
        use_spatial_index: true,
        attribute_filter: input.attribute_filter.map(ToString::to_string),
        spatial_filter: Some("bbox_then_exact".to_string()),
    }
}

fn progressive_chunks_plan(input: &PlannerInput<'_>) -> FilterPlan {
    let chunk_size = progressive_chunk_size(input.stats.feature_count, input.complexity_score);
    let avg_vertices = (input.stats.avg_vertices_per_feature > 0.0).then_some(input.stats.avg_vertices_per_feature);
    let mut metadata = BTreeMap::new();
    metadata.insert("estimated_chunk_bytes".to_string(), estimate_row_bytes(chunk_size, avg_vertices).to_string());
    FilterPlan {
        strategy: Strategy::ProgressiveChunks,
        steps: vec![FilterStep {
            kind: "progressive_chunk".to_string(),
            expression: input.attribute_filter.map(ToString::to_string),
            estimated_output: input.stats.feature_count,
            metadata,
        }],
        estimated_selectivity: 1.0,
        estimated_cost: input.stats.feature_count as f64,
        chunk_size,
        use_spatial_index: input.stats.has_spatial_index,
        attribute_filter: input.attribute_filter.map(ToString::to_string),
        spatial_filter: input.has_spatial_filter.then(|| "progressive".to_string()),
    }
}

fn hybrid_plan(input: &PlannerInput<'_>) -> FilterPlan {
    FilterPlan {
        strategy: Strategy::Hybrid,
        steps: vec![FilterStep {
            kind: "hybrid".to_string(),
            expression: input.attribute_filter.map(ToString::to_string),
            estimated_output: input.stats.feature_count,
            metadata: BTreeMap::new(),
        }],
        estimated_selectivity: 0.5,
        estimated_cost: input.stats.feature_count as f64,
        chunk_size: 0,
        use_spatial_index: input.stats.has_spatial_index,
        attribute_filter: input.attribute_filter.map(ToString::to_string),
        spatial_filter: input.has_spatial_filter.then(|| "hybrid".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(feature_count: u64, has_spatial_index: bool, extent_bounds: Option<Extent>) -> LayerStatistics {
        LayerStatistics {
            feature_count,
            extent_area: 0.0,
            extent_bounds,
            has_spatial_index,
            geometry_type: None,
            avg_vertices_per_feature: 0.0,
            estimated_complexity: 0.0,
        }
    }

    #[test]
    fn small_layer_is_direct() {
        let s = stats(1_000, true, None);
        let input = PlannerInput {
            stats: &s,
            attribute_filter: None,
            attribute_selectivity: None,
            spatial_extent: None,
            has_spatial_filter: false,
            complexity_score: 1.0,
        };
        assert_eq!(plan(&input).strategy, Strategy::Direct);
    }

    #[test]
    fn huge_layer_without_other_triggers_is_progressive() {
        let s = stats(300_000, true, None);
        let input = PlannerInput {
            stats: &s,
            attribute_filter: None,
            attribute_selectivity: None,
            spatial_extent: None,
            has_spatial_filter: false,
            complexity_score: 1.0,
        };
        assert_eq!(plan(&input).strategy, Strategy::ProgressiveChunks);
    }

    #[test]
    fn progressive_chunk_size_is_bounded() {
        let size = progressive_chunk_size(2_000_000, 20.0);
        assert!(size >= PROGRESSIVE_CHUNK_MIN);
        assert!(size <= PROGRESSIVE_CHUNK_MAX);
    }

    #[test]
    fn moderate_layer_without_triggers_is_hybrid() {
        let s = stats(5_000, true, None);
        let input = PlannerInput {
            stats: &s,
            attribute_filter: None,
            attribute_selectivity: None,
            spatial_extent: None,
            has_spatial_filter: false,
            complexity_score: 1.0,
        };
        assert_eq!(plan(&input).strategy, Strategy::Hybrid);
    }

    #[test]
    fn row_bytes_use_default_vertex_count_when_unsampled() {
        let bytes = estimate_row_bytes(1_000, None);
        assert_eq!(bytes, (8 + 50 + 50 * 16) * 1_000);
    }

    #[test]
    fn row_bytes_scale_with_sampled_vertex_average() {
        let sparse = estimate_row_bytes(1_000, Some(4.0));
        let dense = estimate_row_bytes(1_000, Some(200.0));
        assert!(dense > sparse);
    }

    #[test]
    fn progressive_plan_reports_estimated_chunk_bytes() {
        let s = stats(300_000, true, None);
        let input = PlannerInput {
            stats: &s,
            attribute_filter: None,
            attribute_selectivity: None,
            spatial_extent: None,
            has_spatial_filter: false,
            complexity_score: 1.0,
        };
        let p = plan(&input);
        assert!(p.steps[0].metadata.contains_key("estimated_chunk_bytes"));
    }

    #[test]
    fn spatial_selectivity_is_dampened_and_clamped() {
        let target = Extent { xmin: 0.0, ymin: 0.0, xmax: 10.0, ymax: 10.0 };
        let source = Extent { xmin: 0.0, ymin: 0.0, xmax: 10.0, ymax: 10.0 };
        let sel = estimate_spatial_selectivity(&target, &source);
        assert!((sel - 0.7).abs() < f64::EPSILON);
    }
}
