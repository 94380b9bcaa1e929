//! In-process (OGR) executor (spec §4.8.3).
//!
//! Used when no database backs a layer's provider. All geometry work is
//! delegated to the [`crate::host::Host`] (spec §1 Non-goals: the engine
//! never implements its own geometry library); this module only owns
//! the chunking, worker-pool dispatch, and FID-range compaction around
//! those calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::host::{BoxedHost, LayerHandle};
use crate::model::{Backend as BackendKind, BackendMetrics, FilterExpression, LayerInfo, SpatialPredicate, Strategy};

use super::port::{backend_tag, resolve_old_subset, ApplyOutcome, ApplyRequest};

/// Attribute pre-filter chunk size (spec §4.8.3).
const ATTRIBUTE_CHUNK_SIZE: usize = 1_000;

/// Default target-feature chunk size for the spatial pass, used when C7
/// didn't hand down a `FilterPlan::chunk_size` (spec §4.8.3).
const SPATIAL_CHUNK_SIZE: usize = 5_000;

/// Above this fraction of compacted ranges vs. raw FIDs, emit
/// consecutive-range compaction instead of a flat `IN (...)` list
/// (spec §4.8.3: "≤⅓ ranges vs. FIDs").
const RANGE_COMPACTION_RATIO: f64 = 1.0 / 3.0;

pub struct OgrBackend {
    host: Arc<BoxedHost>,
    metrics: Mutex<BackendMetrics>,
}

impl OgrBackend {
    #[must_use]
    pub fn new(host: Arc<BoxedHost>) -> Self {
        OgrBackend {
            host,
            metrics: Mutex::new(BackendMetrics::default()),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> BackendMetrics {
        self.metrics.lock().expect("metrics lock").clone()
    }

    /// Walks `layer`'s features in chunks, applying `attribute_filter`
    /// through the host, reporting progress every chunk (spec §4.8.3
    /// step 1).
    async fn collect_candidate_fids(
        &self,
        handle: &LayerHandle,
        attribute_filter: Option<&str>,
        cancelled: &AtomicBool,
    ) -> EngineResult<Vec<i64>> {
        let mut fids = Vec::new();
        let mut offset = 0usize;
        loop {
            if cancelled.load(Ordering::Relaxed) || self.host.is_cancelled() {
                return Err(EngineError::AbortedByUser);
            }
            let chunk = self
                .host
                .target_feature_chunk(handle, attribute_filter, ATTRIBUTE_CHUNK_SIZE, offset)
                .await?;
            let len = chunk.len();
            fids.extend(chunk.iter().map(|f| f.fid));
            offset += len;
            if len < ATTRIBUTE_CHUNK_SIZE {
                break;
            }
        }
        Ok(fids)
    }

    /// Spatial pass: iterates target features in chunks, testing each
    /// against the staged source geometry. Datasets smaller than twice
    /// the chunk size run inline to avoid pool overhead; larger ones
    /// dispatch every chunk's WKB pairs to a `rayon` pool (spec §4.8.3
    /// step 2: "small datasets (< 2×chunk) run sequentially"). The
    /// sequential/parallel decision is made once against the *total*
    /// dataset size, not per chunk — a single chunk is never larger than
    /// `chunk_size`, so comparing a chunk's own length against
    /// `2 * chunk_size` would never select the parallel path. `chunk_size`
    /// comes from C7's plan when it produced one (spec §4.7
    /// `PROGRESSIVE_CHUNKS`/`chunk_size`), falling back to the spec's own
    /// default otherwise.
    async fn collect_matching_fids(
        &self,
        handle: &LayerHandle,
        attribute_filter: Option<&str>,
        predicate: SpatialPredicate,
        source_wkb: &[u8],
        cancelled: &AtomicBool,
        chunk_size: usize,
        total_feature_count: u64,
    ) -> EngineResult<Vec<i64>> {
        let mut matched = Vec::new();
        let mut offset = 0usize;
        let sequential_threshold = 2 * chunk_size as u64;
        let use_parallel = total_feature_count >= sequential_threshold;
        loop {
            if cancelled.load(Ordering::Relaxed) || self.host.is_cancelled() {
                return Err(EngineError::AbortedByUser);
            }
            let chunk = self
                .host
                .target_feature_chunk(handle, attribute_filter, chunk_size, offset)
                .await?;
            let len = chunk.len();

            if use_parallel {
                let host = &self.host;
                let hits: Vec<i64> = chunk
                    .par_iter()
                    .filter(|f| host.evaluate_spatial_predicate(predicate, source_wkb, &f.wkb))
                    .map(|f| f.fid)
                    .collect();
                matched.extend(hits);
            } else {
                for feature in &chunk {
                    if self.host.evaluate_spatial_predicate(predicate, source_wkb, &feature.wkb) {
                        matched.push(feature.fid);
                    }
                }
            }

            offset += len;
            if len < chunk_size {
                break;
            }
        }
        Ok(matched)
    }
}

/// Compacts a sorted list of FIDs into `(fid >= a AND fid <= b)` ranges
/// when doing so uses at most [`RANGE_COMPACTION_RATIO`] as many ranges
/// as raw FIDs; otherwise emits a flat `IN (...)` expression (spec
/// §4.8.3 step 3).
#[must_use]
pub fn build_subset_expression(mut fids: Vec<i64>) -> String {
    if fids.is_empty() {
        return "1=0".to_string();
    }
    fids.sort_unstable();
    fids.dedup();

    let mut ranges: Vec<(i64, i64)> = Vec::new();
    for fid in fids.iter().copied() {
        if let Some(last) = ranges.last_mut() {
            if fid == last.1 + 1 {
                last.1 = fid;
                continue;
            }
        }
        ranges.push((fid, fid));
    }

    if (ranges.len() as f64) <= fids.len() as f64 * RANGE_COMPACTION_RATIO {
        ranges
            .into_iter()
            .map(|(a, b)| if a == b { format!("fid = {a}") } else { format!("(fid >= {a} AND fid <= {b})") })
            .collect::<Vec<_>>()
            .join(" OR ")
    } else {
        let in_list = crate::ident::format_in_list_numeric(fids);
        format!("fid IN {in_list}")
    }
}

#[async_trait]
impl super::port::Backend for OgrBackend {
    async fn execute(&self, request: &ApplyRequest<'_>) -> EngineResult<ApplyOutcome> {
        let tag = backend_tag(&request.layer.layer_id);
        let handle = LayerHandle(request.layer.layer_id.clone());
        let cancelled = AtomicBool::new(false);

        let attribute_filter = if request.expression.sql.trim().is_empty() { None } else { Some(request.expression.sql.as_str()) };

        let candidate_fids = self.collect_candidate_fids(&handle, attribute_filter, &cancelled).await?;
        debug!(%tag, candidates = candidate_fids.len(), "attribute pre-filter complete");

        let fids = if request.expression.is_spatial() {
            let source_wkb = request
                .expression
                .source_geometry_wkb
                .as_deref()
                .ok_or_else(|| EngineError::GeometryStagingFailed {
                    layer_id: request.layer.layer_id.clone(),
                    reason: "ogr executor requires a staged source geometry WKB".to_string(),
                })?;
            let predicate = request.expression.spatial_predicates.first().copied().unwrap_or(SpatialPredicate::Intersects);
            let chunk_size = request.plan.map(|p| p.chunk_size).filter(|&c| c > 0).unwrap_or(SPATIAL_CHUNK_SIZE);
            self.collect_matching_fids(
                &handle,
                attribute_filter,
                predicate,
                source_wkb,
                &cancelled,
                chunk_size,
                request.layer.feature_count,
            )
            .await?
        } else {
            candidate_fids
        };

        let new_subset = build_subset_expression(fids);
        let resolved = resolve_old_subset(request.old_subset, request.combine_operator, &new_subset);

        let mut metrics = self.metrics.lock().expect("metrics lock");
        metrics.executions += 1;
        metrics.direct_executions += 1;
        drop(metrics);

        Ok(ApplyOutcome {
            subset_sql: Some(resolved),
            strategy_used: Strategy::Progressive,
        })
    }

    fn supports_layer(&self, layer: &LayerInfo) -> bool {
        layer.provider == BackendKind::Ogr || layer.provider == BackendKind::Memory
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ogr
    }

    fn get_info(&self) -> String {
        "ogr".to_string()
    }

    async fn cleanup(&self, _session_id: &str) -> EngineResult<usize> {
        Ok(0)
    }

    fn validate_expression(&self, expression: &FilterExpression) -> EngineResult<()> {
        if expression.is_spatial() && expression.source_geometry_wkt.is_none() {
            return Err(EngineError::GeometryStagingFailed {
                layer_id: String::new(),
                reason: "spatial filter without staged source geometry".to_string(),
            });
        }
        Ok(())
    }

    fn metrics(&self) -> BackendMetrics {
        self.metrics.lock().expect("metrics lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_fids_compact_to_a_range() {
        let expr = build_subset_expression(vec![1, 2, 3, 4, 5]);
        assert_eq!(expr, "(fid >= 1 AND fid <= 5)");
    }

    #[test]
    fn scattered_fids_stay_as_in_list() {
        let expr = build_subset_expression(vec![1, 100, 9_000]);
        assert!(expr.starts_with("fid IN"));
    }

    #[test]
    fn empty_fids_yield_always_false() {
        assert_eq!(build_subset_expression(vec![]), "1=0");
    }

    #[test]
    fn duplicate_fids_are_deduped_before_compaction() {
        let expr = build_subset_expression(vec![1, 1, 2, 2, 3]);
        assert_eq!(expr, "(fid >= 1 AND fid <= 3)");
    }
}
