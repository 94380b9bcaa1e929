//! Filter orchestrator & history (C9).
//!
//! Ties every other component together behind the four actions a host
//! actually calls: `filter`, `unfilter` (undo), `redo`, and `reset`,
//! plus `export` for persisting the current state (spec §4.9). This is
//! the only module that touches [`crate::host::Host`] for subset
//! application; backends only read from it (OGR) or don't touch it at
//! all (PostgreSQL/SpatiaLite work entirely through their own pools).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::backend::{ApplyRequest, BackendRegistry};
use crate::cache::{MemoizedGeometry, SourceGeometryCache, SourceGeometryKey, StatisticsCache};
use crate::config::Config;
use crate::encoder::{choose_encoding, order_predicates, PgSourceTable, SourceEncoding};
use crate::error::{EngineError, EngineResult};
use crate::geom::{stage_buffered_geometry_for_ogr, stage_union, BufferOptions, StagedGeometry};
use crate::host::{BoxedHost, FeatureRequest, LayerHandle};
use crate::ident::{format_in_list_numeric, format_in_list_str, quote_ident};
use crate::model::{
    Backend as BackendKind, BackendMetrics, BufferStyle, CombineOperator, Extent, FilterExpression, FilterResult,
    FilterState, LayerFilterHistory, LayerId, LayerInfo, SpatialPredicate,
};

/// Generates an 8-hex-digit session token from the process id and
/// clock, the way a UI would hand the engine a fresh id per editing
/// session. Not cryptographically random; session ids are log
/// correlation keys, not secrets.
#[must_use]
pub fn new_session_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mixed = (nanos as u64) ^ (u64::from(std::process::id()) << 32);
    format!("{:08x}", xxhash_rust::xxh3::xxh3_64(&mixed.to_le_bytes()) as u32)
}

/// Circuit breaker guarding materialized-view/temp-table cleanup: once
/// `trip_threshold` consecutive cleanup failures happen within a
/// session, further cleanup attempts are skipped (and logged) rather
/// than retried on every subsequent call, so a database outage during
/// teardown doesn't turn every later action into a multi-second stall.
#[derive(Debug)]
pub struct CleanupCircuit {
    trip_threshold: u32,
    consecutive_failures: AtomicU32,
    tripped: AtomicBool,
}

impl CleanupCircuit {
    #[must_use]
    pub fn new(trip_threshold: u32) -> Self {
        CleanupCircuit {
            trip_threshold,
            consecutive_failures: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }

    /// Records a cleanup failure, tripping the breaker once
    /// `trip_threshold` consecutive failures have been seen. Returns
    /// whether the breaker is now tripped.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.trip_threshold {
            self.tripped.store(true, Ordering::Relaxed);
        }
        self.is_tripped()
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Manually resets the breaker, e.g. after the host confirms the
    /// underlying connection has recovered.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.tripped.store(false, Ordering::Relaxed);
    }
}

impl Default for CleanupCircuit {
    fn default() -> Self {
        // Three consecutive failures is the same band the PostgreSQL
        // backend's own statement-timeout retries use before giving up.
        CleanupCircuit::new(3)
    }
}

/// Per-session mutable state the orchestrator owns (spec §3
/// `SessionState`): the session token every materialized view/temp
/// table this run creates is named after, running metrics, and the
/// per-layer backend overrides forced by a prior timeout/cancel.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: String,
    pub metrics: BackendMetrics,
    pub forced_backends: HashMap<LayerId, BackendKind>,
}

impl SessionState {
    #[must_use]
    pub fn new(session_id: String) -> Self {
        SessionState {
            session_id,
            metrics: BackendMetrics::default(),
            forced_backends: HashMap::new(),
        }
    }
}

/// How the source layer's feature set for a `filter` call is selected
/// (spec §4.9 step 1).
#[derive(Debug, Clone)]
pub enum SourceSpec {
    /// An explicit set of primary-key values, e.g. the host's current
    /// map selection.
    Fids(Vec<i64>),
    /// A raw attribute expression the source layer is restricted to
    /// before its geometry is staged.
    Expression(String),
}

/// Buffer to apply to the staged source geometry before it's compared
/// against target layers (spec §4.2).
#[derive(Debug, Clone, Copy)]
pub struct BufferRequest {
    pub value: f64,
    pub style: BufferStyle,
}

/// A single `filter` call: one source selection, one or more spatial
/// predicates, and every target layer it should be applied to (spec
/// §4.9).
#[derive(Debug, Clone)]
pub struct FilterRequest {
    pub source_layer: LayerInfo,
    pub source: SourceSpec,
    /// How the source selection combines with whatever subset the
    /// source layer itself is already showing. `None` always replaces.
    pub source_combine_operator: Option<CombineOperator>,
    pub target_layers: Vec<LayerInfo>,
    pub predicates: Vec<SpatialPredicate>,
    pub buffer: Option<BufferRequest>,
    /// Extra attribute predicate ANDed into every target layer's
    /// spatial predicate, e.g. `"importance" > 5`.
    pub attribute_filter: Option<String>,
    pub combine_operators: HashMap<LayerId, CombineOperator>,
    pub description: Option<String>,
}

/// Ties C1-C8 together behind the four host-facing actions (spec
/// §4.9). One `Engine` per editing session; `Host`, backend registry,
/// and caches are shared across every `filter`/`unfilter`/`redo`/
/// `reset` call the host makes during that session.
pub struct Engine {
    host: Arc<BoxedHost>,
    config: Config,
    session: Mutex<SessionState>,
    history: Mutex<HashMap<LayerId, LayerFilterHistory>>,
    stats_cache: StatisticsCache,
    geometry_cache: SourceGeometryCache,
    backends: BackendRegistry,
    cleanup_circuit: CleanupCircuit,
    cancelled: Arc<AtomicBool>,
    history_depth: usize,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session", &self.session.lock().expect("session lock").session_id)
            .field("backends", &self.backends)
            .finish()
    }
}

/// Bounded undo/redo depth per layer (spec §3 `LayerFilterHistory`);
/// not user-configurable, matching the fixed cost table and predicate
/// ordering defaults in [`crate::config`].
const HISTORY_MAX_DEPTH: usize = 20;

impl Engine {
    #[must_use]
    pub fn new(host: Arc<BoxedHost>, config: Config, backends: BackendRegistry, session_id: String) -> Self {
        Engine {
            host,
            stats_cache: StatisticsCache::new(config.cache.stats_ttl_ms),
            geometry_cache: SourceGeometryCache::new(config.cache.source_geometry_max_entries),
            config,
            session: Mutex::new(SessionState::new(session_id)),
            history: Mutex::new(HashMap::new()),
            backends,
            cleanup_circuit: CleanupCircuit::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
            history_depth: HISTORY_MAX_DEPTH,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> String {
        self.session.lock().expect("session lock").session_id.clone()
    }

    /// Aggregated counters across every backend this engine dispatched
    /// to plus the orchestrator's own cache-hit count (spec §4.9).
    #[must_use]
    pub fn metrics(&self) -> BackendMetrics {
        self.session.lock().expect("session lock").metrics.clone()
    }

    /// Requests cooperative cancellation; in-flight loops (OGR chunk
    /// iteration, multi-target `filter` runs) check this between steps
    /// and return [`EngineError::AbortedByUser`] once observed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed) || self.host.is_cancelled()
    }

    /// The statistics cache backing [`crate::planner`]/[`crate::estimator`]
    /// reporting. Exposed so a host can pre-warm or inspect it without
    /// the orchestrator needing its own stats-fetching API.
    #[must_use]
    pub fn stats_cache(&self) -> &crate::cache::StatisticsCache {
        &self.stats_cache
    }

    /// Runs a `filter` call: restricts the source layer, stages and
    /// (optionally) buffers its geometry once per distinct target CRS,
    /// and applies a spatial (plus optional attribute) predicate to
    /// every target layer in turn (spec §4.9).
    ///
    /// A failure while restricting the source layer aborts the whole
    /// run: every target layer is reported failed without a backend
    /// ever being invoked, since none of them have a valid source
    /// geometry to compare against.
    pub async fn filter(&self, request: FilterRequest) -> Vec<FilterResult> {
        if let Err(err) = self.apply_source_selection(&request).await {
            let message = err.to_string();
            warn!(source_layer = %request.source_layer.layer_id, %message, "source selection failed, aborting run");
            return request
                .target_layers
                .iter()
                .map(|layer| FilterResult {
                    layer_id: layer.layer_id.clone(),
                    success: false,
                    error: Some(format!("source layer restriction failed: {message}")),
                    strategy_used: None,
                })
                .collect();
        }

        let total = request.target_layers.len().max(1);
        let mut results = Vec::with_capacity(request.target_layers.len());

        for (index, target) in request.target_layers.iter().enumerate() {
            if self.is_cancelled() {
                results.push(FilterResult {
                    layer_id: target.layer_id.clone(),
                    success: false,
                    error: Some(EngineError::AbortedByUser.to_string()),
                    strategy_used: None,
                });
                continue;
            }

            let handle = LayerHandle(target.layer_id.clone());
            let fraction = index as f64 / total as f64;
            self.host.report_progress(&handle, fraction, "staging source geometry").await;

            let result = self.filter_one_layer(&request, target).await;
            match &result {
                Ok(outcome) => {
                    results.push(FilterResult {
                        layer_id: target.layer_id.clone(),
                        success: true,
                        error: None,
                        strategy_used: Some(outcome.strategy_used),
                    });
                }
                Err(err) => {
                    warn!(layer = %target.layer_id, error = %err, "filter failed for target layer");
                    results.push(FilterResult {
                        layer_id: target.layer_id.clone(),
                        success: false,
                        error: Some(err.to_string()),
                        strategy_used: None,
                    });
                }
            }
            self.host.report_progress(&handle, (index + 1) as f64 / total as f64, "done").await;
        }

        results
    }

    async fn apply_source_selection(&self, request: &FilterRequest) -> EngineResult<()> {
        let handle = LayerHandle(request.source_layer.layer_id.clone());
        let new_subset = match &request.source {
            SourceSpec::Fids(fids) => build_fid_subset(&request.source_layer, fids)?,
            SourceSpec::Expression(expr) => expr.clone(),
        };
        let old_subset = self.host.current_subset(&handle).await?;
        let resolved = crate::backend::port::resolve_old_subset(
            old_subset.as_deref(),
            request.source_combine_operator,
            &new_subset,
        );
        self.host.apply_subset(&handle, Some(&resolved)).await
    }

    async fn filter_one_layer(
        &self,
        request: &FilterRequest,
        target: &LayerInfo,
    ) -> EngineResult<crate::backend::ApplyOutcome> {
        let target_srid = target.srid();
        let staging = self.stage_for_target(request, target_srid).await?;

        let plan = self.plan_for_target(request, target, staging.staged.bbox).await;
        info!(
            layer = %target.layer_id,
            strategy = ?plan.strategy,
            chunk_size = plan.chunk_size,
            estimated_selectivity = plan.estimated_selectivity,
            "C7 filter plan computed"
        );

        let ordered_predicates = if self.config.predicate_ordering.enabled {
            order_predicates(&request.predicates)
        } else {
            request.predicates.clone()
        };
        let pg_source = pg_source_table(&request.source_layer);
        let is_ogr_source = request.source_layer.provider == BackendKind::Ogr
            || request.source_layer.provider == BackendKind::Memory;

        // Only the EXISTS branch of `choose_encoding` consults this: it
        // references the live source table's own geometry column, which
        // (unlike `staging.staged.wkt`) was never pre-buffered by the
        // Host (spec §4.3 `<buffered_source_geom>`).
        let buffer_opts = request.buffer.map(|b| BufferOptions {
            value: b.value,
            style: b.style,
            segments: self.config.buffer.default_segments,
        });
        let (encoding, warnings) =
            choose_encoding(&staging.staged, buffer_opts, pg_source.as_ref(), is_ogr_source, target_srid);
        for warning in &warnings {
            warn!(layer = %target.layer_id, %warning, "source encoding warning");
        }

        let geometry_column = target.geometry_column.clone().unwrap_or_else(|| "geom".to_string());
        let target_geom_q = quote_ident(&geometry_column)?;

        let predicate_sql = build_predicate_sql(&encoding, &ordered_predicates, &target_geom_q)?;
        let attribute_sql = request.attribute_filter.clone().filter(|a| !a.trim().is_empty());
        let full_sql = match &attribute_sql {
            Some(attr) => format!("({predicate_sql}) AND ({attr})"),
            None => predicate_sql,
        };

        let base_expression = FilterExpression {
            raw: request.description.clone().unwrap_or_default(),
            sql: full_sql,
            spatial_predicates: ordered_predicates,
            buffer_value: request.buffer.map(|b| b.value).unwrap_or(0.0),
            buffer_style: request.buffer.map(|b| b.style),
            buffer_expression: None,
            source_geometry_wkt: Some(staging.staged.wkt.clone()),
            source_geometry_wkb: None,
            source_srid: Some(staging.staged.srid),
            source_feature_count: staging.staged.feature_count,
            source_bbox: Some(staging.staged.bbox),
        };

        // The OGR executor tests geometry in-process via WKB and treats
        // `sql` as a plain attribute filter (spec §4.8.3); embedding the
        // assembled spatial predicate there would hand it SQL functions
        // the host's attribute query has no obligation to understand.
        let mut ogr_expression = base_expression.clone();
        ogr_expression.sql = attribute_sql.unwrap_or_default();
        ogr_expression.source_geometry_wkb = staging.wkb.clone();

        let handle = LayerHandle(target.layer_id.clone());
        let old_subset = self.host.current_subset(&handle).await?;
        let combine_operator = request.combine_operators.get(&target.layer_id).copied();

        let outcome = self
            .execute_with_fallback(target, &base_expression, &ogr_expression, old_subset.as_deref(), combine_operator, &plan)
            .await?;

        self.host.apply_subset(&handle, outcome.subset_sql.as_deref()).await?;

        let mut history = self.history.lock().expect("history lock");
        history
            .entry(target.layer_id.clone())
            .or_insert_with(|| LayerFilterHistory::new(self.history_depth))
            .push(FilterState {
                expression: base_expression,
                description: request.description.clone().unwrap_or_default(),
                applied_at: unix_seconds(),
            });
        drop(history);

        let mut session = self.session.lock().expect("session lock");
        session.metrics.executions += 1;
        drop(session);

        Ok(outcome)
    }

    /// Executes against the layer's resolved backend, switching to the
    /// OGR executor and retrying once when the first attempt reports a
    /// timeout or cancellation (spec §4.8.4 / §7). `sql_expression` is
    /// used against PostgreSQL/SpatiaLite; `ogr_expression` against the
    /// in-process executor, whichever the resolved backend turns out to
    /// be (see [`crate::backend::port::Backend::kind`]).
    async fn execute_with_fallback(
        &self,
        target: &LayerInfo,
        sql_expression: &FilterExpression,
        ogr_expression: &FilterExpression,
        old_subset: Option<&str>,
        combine_operator: Option<CombineOperator>,
        plan: &crate::model::FilterPlan,
    ) -> EngineResult<crate::backend::ApplyOutcome> {
        let forced = self.session.lock().expect("session lock").forced_backends.get(&target.layer_id).copied();
        let backend = self.backends.resolve(target, forced)?;
        let expression = if backend.kind() == BackendKind::Ogr { ogr_expression } else { sql_expression };
        backend.validate_expression(expression)?;

        let request = ApplyRequest {
            layer: target,
            expression,
            old_subset,
            combine_operator,
            plan: Some(plan),
        };

        match backend.execute(&request).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.should_force_ogr_fallback() && forced != Some(BackendKind::Ogr) => {
                warn!(layer = %target.layer_id, error = %err, "forcing OGR fallback after backend failure");
                self.session
                    .lock()
                    .expect("session lock")
                    .forced_backends
                    .insert(target.layer_id.clone(), BackendKind::Ogr);
                let ogr = self.backends.resolve(target, Some(BackendKind::Ogr))?;
                let ogr_request = ApplyRequest {
                    layer: target,
                    expression: ogr_expression,
                    old_subset,
                    combine_operator,
                    plan: Some(plan),
                };
                ogr.execute(&ogr_request).await
            }
            Err(err) => Err(err),
        }
    }

    /// Asks C7 for a generic per-layer plan (spec §2 data flow, §4.7),
    /// building the `LayerStatistics` it needs from the target layer's
    /// descriptor and caching the result for the statistics TTL (spec §3).
    /// Attribute selectivity sampling needs an expression evaluator the
    /// engine doesn't own (spec §1 Non-goals: no generic SQL builder), so
    /// it's left `None` here; the cascade simply skips the
    /// attribute-first branch in that case, same as spec §4.7 describes
    /// for "no sample available".
    async fn plan_for_target(&self, request: &FilterRequest, target: &LayerInfo, spatial_extent: Extent) -> crate::model::FilterPlan {
        let stats = match self.stats_cache.get(&target.layer_id).await {
            Some(cached) => cached,
            None => {
                let stats = crate::model::LayerStatistics {
                    feature_count: target.feature_count,
                    extent_area: target.extent.map(|e| e.area()).unwrap_or(0.0),
                    extent_bounds: target.extent,
                    has_spatial_index: target.has_spatial_index,
                    geometry_type: target.geometry_type.clone(),
                    avg_vertices_per_feature: 0.0,
                    estimated_complexity: 0.0,
                };
                self.stats_cache.insert(target.layer_id.clone(), stats.clone()).await;
                stats
            }
        };

        let complexity_score = crate::estimator::estimate_complexity(
            request.attribute_filter.as_deref().unwrap_or(""),
            target.feature_count,
        )
        .total_score;

        let input = crate::planner::PlannerInput {
            stats: &stats,
            attribute_filter: request.attribute_filter.as_deref(),
            attribute_selectivity: None,
            spatial_extent: Some(spatial_extent),
            has_spatial_filter: !request.predicates.is_empty(),
            complexity_score,
        };
        crate::planner::plan(&input)
    }

    /// Stages (or reuses a memoized) source geometry finalized for
    /// `target_srid`: unioned across selected source features, buffered,
    /// and reprojected via the Host (spec §4.2, §4.9 memoization).
    async fn stage_for_target(&self, request: &FilterRequest, target_srid: i32) -> EngineResult<StagedForTarget> {
        let buffer_value = request.buffer.map(|b| b.value).unwrap_or(0.0);
        let cache_key = match &request.source {
            SourceSpec::Fids(fids) => {
                Some(SourceGeometryKey::new(request.source_layer.layer_id.clone(), fids.clone(), buffer_value, target_srid))
            }
            // An attribute expression has no fixed fid list to key on;
            // recomputed every time rather than risk a stale hit.
            SourceSpec::Expression(_) => None,
        };

        if let Some(key) = &cache_key {
            if let Some(memoized) = self.geometry_cache.get(key) {
                self.session.lock().expect("session lock").metrics.cache_hits += 1;
                return Ok(staged_from_memoized(memoized));
            }
        }

        let handle = LayerHandle(request.source_layer.layer_id.clone());
        let native_srid = request.source_layer.srid();
        let feature_request = FeatureRequest {
            selected_only: matches!(request.source, SourceSpec::Fids(_)),
            limit: None,
        };

        let unioned = stage_union(self.host.as_ref(), &handle, &feature_request, native_srid, &request.source_layer.layer_id).await?;

        let buffer_opts = request.buffer.map(|b| BufferOptions {
            value: b.value,
            style: b.style,
            segments: self.config.buffer.default_segments,
        });
        let finalized = stage_buffered_geometry_for_ogr(self.host.as_ref(), &unioned, buffer_opts, target_srid).await?;

        let staging = StagedForTarget {
            staged: StagedGeometry {
                wkt: finalized.wkt,
                srid: target_srid,
                bbox: unioned.bbox,
                feature_count: unioned.feature_count,
            },
            wkb: finalized.wkb,
        };

        if let Some(key) = cache_key {
            self.geometry_cache.insert(
                key,
                MemoizedGeometry {
                    wkt: staging.staged.wkt.clone(),
                    srid: staging.staged.srid,
                    bbox: staging.staged.bbox,
                    feature_count: staging.staged.feature_count,
                    wkb: staging.wkb.clone(),
                },
            );
        }

        Ok(staging)
    }

    /// Undoes the most recent filter applied to `layer` (spec §4.9
    /// `unfilter`), restoring the subset string from one step back in
    /// history (or clearing it, when undoing the very first filter).
    pub async fn unfilter(&self, layer: &LayerInfo) -> EngineResult<()> {
        let previous = {
            let mut history = self.history.lock().expect("history lock");
            let entry = history
                .get_mut(&layer.layer_id)
                .ok_or_else(|| EngineError::NoHistory(layer.layer_id.clone()))?;
            if !entry.can_undo() {
                return Err(EngineError::NoHistory(layer.layer_id.clone()));
            }
            entry.undo()
        };
        let handle = LayerHandle(layer.layer_id.clone());
        let subset = previous.map(|state| state.expression.sql);
        self.host.apply_subset(&handle, subset.as_deref()).await
    }

    /// Re-applies the most recently undone filter for `layer` (spec
    /// §4.9 `redo`).
    pub async fn redo(&self, layer: &LayerInfo) -> EngineResult<()> {
        let state = {
            let mut history = self.history.lock().expect("history lock");
            let entry = history
                .get_mut(&layer.layer_id)
                .ok_or_else(|| EngineError::NoHistory(layer.layer_id.clone()))?;
            entry.redo().ok_or_else(|| EngineError::NoHistory(layer.layer_id.clone()))?
        };
        let handle = LayerHandle(layer.layer_id.clone());
        self.host.apply_subset(&handle, Some(&state.expression.sql)).await
    }

    /// Clears every filter this session applied to `layer`, dropping
    /// its history and restoring an unfiltered view (spec §4.9 `reset`).
    pub async fn reset(&self, layer: &LayerInfo) -> EngineResult<()> {
        {
            let mut history = self.history.lock().expect("history lock");
            if let Some(entry) = history.get_mut(&layer.layer_id) {
                entry.clear();
            }
        }
        let handle = LayerHandle(layer.layer_id.clone());
        self.host.apply_subset(&handle, None).await
    }

    /// Current filter state for `layer`, suitable for persisting
    /// alongside a host project file (spec §6 persisted state layout:
    /// `fm_subset_history`).
    #[must_use]
    pub fn export(&self, layer: &LayerInfo) -> Option<FilterState> {
        self.history
            .lock()
            .expect("history lock")
            .get(&layer.layer_id)
            .and_then(|h| h.current())
            .cloned()
    }

    /// Drops every materialized view/temp table this session created,
    /// across every registered backend, short-circuiting once the
    /// cleanup circuit breaker has tripped (spec §4.5, §7, §C.2).
    pub async fn cleanup_session(&self) -> usize {
        if self.cleanup_circuit.is_tripped() {
            warn!(session = %self.session_id(), "cleanup circuit breaker tripped, skipping session cleanup");
            return 0;
        }
        let session_id = self.session_id();
        let mut dropped = 0usize;
        for backend in self.backends.values() {
            match backend.cleanup(&session_id).await {
                Ok(n) => {
                    dropped += n;
                    self.cleanup_circuit.record_success();
                }
                Err(err) => {
                    warn!(%err, "backend cleanup failed");
                    if self.cleanup_circuit.record_failure() {
                        warn!(session = %session_id, "cleanup circuit breaker tripped after repeated failures");
                        break;
                    }
                }
            }
        }
        info!(session = %session_id, dropped, "session cleanup complete");
        dropped
    }
}

/// A source geometry finalized for one target layer's CRS, plus the WKB
/// encoding the in-process (OGR) executor needs, when staging produced
/// or recovered one.
struct StagedForTarget {
    staged: StagedGeometry,
    wkb: Option<Vec<u8>>,
}

fn staged_from_memoized(memoized: MemoizedGeometry) -> StagedForTarget {
    StagedForTarget {
        staged: StagedGeometry {
            wkt: memoized.wkt,
            srid: memoized.srid,
            bbox: memoized.bbox,
            feature_count: memoized.feature_count,
        },
        wkb: memoized.wkb,
    }
}

fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Builds the subset expression restricting the source layer to `fids`
/// (spec §4.9 step 1), quoting/escaping through [`crate::ident`] the
/// way every other generated predicate in this crate does.
fn build_fid_subset(layer: &LayerInfo, fids: &[i64]) -> EngineResult<String> {
    let pk = layer.pk_name.as_deref().unwrap_or("fid");
    let pk_q = quote_ident(pk)?;
    if layer.pk_numeric {
        Ok(format!("{pk_q} IN {}", format_in_list_numeric(fids.iter().copied())))
    } else {
        let as_strings = fids.iter().map(|f| f.to_string());
        Ok(format!("{pk_q} IN {}", format_in_list_str(as_strings)?))
    }
}

/// Describes a PostgreSQL source table for the `EXISTS` encoding path,
/// when the source layer itself is backed by PostgreSQL.
fn pg_source_table(layer: &LayerInfo) -> Option<PgSourceTable> {
    if layer.provider != BackendKind::Postgres {
        return None;
    }
    Some(PgSourceTable {
        schema: layer.schema.clone().unwrap_or_else(|| "public".to_string()),
        table: layer.table.clone()?,
        geometry_column: layer.geometry_column.clone().unwrap_or_else(|| "geom".to_string()),
        adapted_filter: None,
        srid: layer.srid(),
    })
}

/// Turns a staged-geometry encoding plus ordered predicates into the
/// boolean SQL fragment a target layer's own predicate is built from:
/// an `OR` of every predicate against a literal geometry, or the
/// `EXISTS` subquery template with its `<predicate>`/`<target_geom>`
/// placeholders filled in (spec §4.3).
///
/// Cross-provider source staging into a session view
/// ([`SourceEncoding::ViewReference`]) is out of scope for this
/// engine: every source layer must either fit the literal-WKT
/// threshold or be a live PostgreSQL table the target can run an
/// `EXISTS` subquery against.
fn build_predicate_sql(
    encoding: &SourceEncoding,
    predicates: &[SpatialPredicate],
    target_geom_q: &str,
) -> EngineResult<String> {
    let predicate = predicates.first().copied().unwrap_or(SpatialPredicate::Intersects);
    match encoding {
        SourceEncoding::Literal { sql } => {
            if predicates.len() <= 1 {
                Ok(format!("{}({target_geom_q}, {sql})", predicate.sql_fn()))
            } else {
                let clauses: Vec<String> =
                    predicates.iter().map(|p| format!("{}({target_geom_q}, {sql})", p.sql_fn())).collect();
                Ok(format!("({})", clauses.join(" OR ")))
            }
        }
        SourceEncoding::ExistsSubquery { sql } => {
            Ok(sql.replace("<predicate>", predicate.sql_fn()).replace("<target_geom>", target_geom_q))
        }
        SourceEncoding::ViewReference { .. } => Err(EngineError::UnsupportedLayer {
            layer_id: String::new(),
            reason: "source geometry requires a view-reference encoding, which this engine does not stage for cross-provider sources".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_circuit_trips_after_threshold() {
        let circuit = CleanupCircuit::new(2);
        assert!(!circuit.record_failure());
        assert!(circuit.record_failure());
        assert!(circuit.is_tripped());
    }

    #[test]
    fn cleanup_circuit_success_resets_consecutive_count() {
        let circuit = CleanupCircuit::new(2);
        assert!(!circuit.record_failure());
        circuit.record_success();
        assert!(!circuit.record_failure());
        assert!(!circuit.is_tripped());
    }

    #[test]
    fn cleanup_circuit_manual_reset_clears_trip() {
        let circuit = CleanupCircuit::new(1);
        assert!(circuit.record_failure());
        circuit.reset();
        assert!(!circuit.is_tripped());
    }

    #[test]
    fn fid_subset_uses_in_list_for_numeric_pk() {
        let layer = LayerInfo {
            layer_id: "l1".to_string(),
            name: "l1".to_string(),
            provider: BackendKind::Postgres,
            schema: Some("public".to_string()),
            table: Some("t".to_string()),
            geometry_column: Some("geom".to_string()),
            pk_name: Some("id".to_string()),
            pk_numeric: true,
            crs_authid: "EPSG:4326".to_string(),
            feature_count: 10,
            extent: None,
            geometry_type: None,
            has_spatial_index: false,
        };
        let subset = build_fid_subset(&layer, &[1, 2, 3]).unwrap();
        assert_eq!(subset, "\"id\" IN (1, 2, 3)");
    }

    #[test]
    fn predicate_sql_wraps_literal_with_predicate_function() {
        let encoding = SourceEncoding::Literal {
            sql: "ST_MakeValid(ST_GeomFromText('POINT(1 1)', 4326))".to_string(),
        };
        let sql = build_predicate_sql(&encoding, &[SpatialPredicate::Intersects], "\"geom\"").unwrap();
        assert_eq!(sql, "ST_Intersects(\"geom\", ST_MakeValid(ST_GeomFromText('POINT(1 1)', 4326)))");
    }

    #[test]
    fn predicate_sql_ors_multiple_predicates() {
        let encoding = SourceEncoding::Literal { sql: "g".to_string() };
        let sql = build_predicate_sql(&encoding, &[SpatialPredicate::Disjoint, SpatialPredicate::Contains], "\"geom\"").unwrap();
        assert_eq!(sql, "(ST_Disjoint(\"geom\", g) OR ST_Contains(\"geom\", g))");
    }

    #[test]
    fn predicate_sql_fills_exists_template() {
        let encoding = SourceEncoding::ExistsSubquery {
            sql: "EXISTS (SELECT 1 FROM \"public\".\"src\" AS __source WHERE <predicate>(<target_geom>, __source.\"geom\"))".to_string(),
        };
        let sql = build_predicate_sql(&encoding, &[SpatialPredicate::Within], "\"geom\"").unwrap();
        assert!(sql.contains("ST_Within(\"geom\", __source.\"geom\")"));
    }

    #[test]
    fn view_reference_encoding_is_unsupported() {
        let encoding = SourceEncoding::ViewReference {
            view_name: String::new(),
            pk_column: "pk".to_string(),
        };
        assert!(build_predicate_sql(&encoding, &[SpatialPredicate::Intersects], "\"geom\"").is_err());
    }
}
