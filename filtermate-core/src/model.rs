//! The engine's typed data model (spec §3).
//!
//! Everything here is a plain tagged record — no duck-typed dicts, no
//! stringly-typed enums. `Backend` is the sum type the source used to
//! encode as a free-form string.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Host-assigned opaque layer identifier.
pub type LayerId = String;

/// The backend a layer's provider maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Postgres,
    Spatialite,
    Ogr,
    Memory,
}

/// Immutable layer descriptor (spec §3 `LayerInfo`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub layer_id: LayerId,
    pub name: String,
    pub provider: Backend,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub geometry_column: Option<String>,
    pub pk_name: Option<String>,
    pub pk_numeric: bool,
    pub crs_authid: String,
    pub feature_count: u64,
    pub extent: Option<Extent>,
    pub geometry_type: Option<String>,
    pub has_spatial_index: bool,
}

impl LayerInfo {
    /// Invariant checked at construction boundaries: for `postgres`/
    /// `spatialite` providers, `table` and `geometry_column` must be set.
    pub fn validate(&self) -> Result<(), String> {
        if matches!(self.provider, Backend::Postgres | Backend::Spatialite)
            && (self.table.is_none() || self.geometry_column.is_none())
        {
            return Err(format!(
                "layer {} ({:?}) is missing table/geometry_column",
                self.layer_id, self.provider
            ));
        }
        Ok(())
    }

    /// `true` when the layer's primary key is PostgreSQL's physical row
    /// identifier, in which case no materialized view may ever be created
    /// for it (ctid is not stable across VACUUM FULL / CLUSTER).
    #[must_use]
    pub fn pk_is_ctid(&self) -> bool {
        self.provider == Backend::Postgres && self.pk_name.as_deref() == Some("ctid")
    }

    /// Numeric SRID parsed from `crs_authid` (e.g. `"EPSG:4326"`),
    /// defaulting to 4326 when the authority string is missing a
    /// trailing numeric code.
    #[must_use]
    pub fn srid(&self) -> i32 {
        self.crs_authid.rsplit(':').next().and_then(|s| s.parse().ok()).unwrap_or(4326)
    }
}

/// Axis-aligned bounding box, `(xmin, ymin, xmax, ymax)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Extent {
    #[must_use]
    pub fn area(&self) -> f64 {
        (self.xmax - self.xmin).max(0.0) * (self.ymax - self.ymin).max(0.0)
    }

    /// Area of the intersection of `self` and `other`, or 0 if disjoint.
    #[must_use]
    pub fn overlap_area(&self, other: &Extent) -> f64 {
        let ix_min = self.xmin.max(other.xmin);
        let iy_min = self.ymin.max(other.ymin);
        let ix_max = self.xmax.min(other.xmax);
        let iy_max = self.ymax.min(other.ymax);
        (ix_max - ix_min).max(0.0) * (iy_max - iy_min).max(0.0)
    }

    #[must_use]
    pub fn to_envelope_args(self) -> (f64, f64, f64, f64) {
        (self.xmin, self.ymin, self.xmax, self.ymax)
    }
}

/// One of the eight spatial predicates the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialPredicate {
    Intersects,
    Within,
    Contains,
    Overlaps,
    Touches,
    Crosses,
    Disjoint,
    Equals,
}

impl SpatialPredicate {
    /// ST_ function name emitted into SQL.
    #[must_use]
    pub fn sql_fn(self) -> &'static str {
        match self {
            SpatialPredicate::Intersects => "ST_Intersects",
            SpatialPredicate::Within => "ST_Within",
            SpatialPredicate::Contains => "ST_Contains",
            SpatialPredicate::Overlaps => "ST_Overlaps",
            SpatialPredicate::Touches => "ST_Touches",
            SpatialPredicate::Crosses => "ST_Crosses",
            SpatialPredicate::Disjoint => "ST_Disjoint",
            SpatialPredicate::Equals => "ST_Equals",
        }
    }

    /// Fixed cost-table rank used for OR-reordering (spec §4.3): lower
    /// sorts first so the planner short-circuits quickly.
    #[must_use]
    pub fn cost_rank(self) -> u8 {
        match self {
            SpatialPredicate::Disjoint => 1,
            SpatialPredicate::Intersects => 2,
            SpatialPredicate::Touches => 3,
            SpatialPredicate::Crosses => 4,
            SpatialPredicate::Within => 5,
            SpatialPredicate::Contains => 6,
            SpatialPredicate::Overlaps => 7,
            SpatialPredicate::Equals => 8,
        }
    }
}

/// Buffer endcap style (spec GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStyle {
    Round,
    Flat,
    Square,
}

impl BufferStyle {
    #[must_use]
    pub fn endcap_name(self) -> &'static str {
        match self {
            BufferStyle::Round => "round",
            BufferStyle::Flat => "flat",
            BufferStyle::Square => "square",
        }
    }
}

impl Default for BufferStyle {
    fn default() -> Self {
        BufferStyle::Round
    }
}

/// The compiled predicate to apply (spec §3 `FilterExpression`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterExpression {
    pub raw: String,
    pub sql: String,
    pub spatial_predicates: Vec<SpatialPredicate>,
    pub buffer_value: f64,
    pub buffer_style: Option<BufferStyle>,
    pub buffer_expression: Option<String>,
    pub source_geometry_wkt: Option<String>,
    /// WKB encoding of the same staged geometry, populated only when the
    /// in-process (OGR) executor needs it (spec §4.8.3); SQL-backed
    /// executors work from `source_geometry_wkt` alone.
    pub source_geometry_wkb: Option<Vec<u8>>,
    pub source_srid: Option<i32>,
    pub source_feature_count: usize,
    /// Bounding box of the staged source geometry, for executors that
    /// run their own bbox pre-filter against it (e.g. the SpatiaLite
    /// R-tree window in spec §4.8.2) rather than against the target
    /// layer's own extent.
    pub source_bbox: Option<Extent>,
}

impl FilterExpression {
    #[must_use]
    pub fn is_spatial(&self) -> bool {
        !self.spatial_predicates.is_empty()
    }

    #[must_use]
    pub fn has_buffer(&self) -> bool {
        self.buffer_value != 0.0 || self.buffer_expression.is_some()
    }
}

/// Strategy chosen by the planner (spec §3 `FilterPlan`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Direct,
    Materialized,
    TwoPhase,
    Progressive,
    LazyCursor,
    AttributeFirst,
    MultiStep,
    BboxThenExact,
    ProgressiveChunks,
    Hybrid,
}

/// A single ordered step within a [`FilterPlan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterStep {
    pub kind: String,
    pub expression: Option<String>,
    pub estimated_output: u64,
    pub metadata: BTreeMap<String, String>,
}

/// Execution intent produced by the planner (spec §3 `FilterPlan`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterPlan {
    pub strategy: Strategy,
    pub steps: Vec<FilterStep>,
    pub estimated_selectivity: f64,
    pub estimated_cost: f64,
    pub chunk_size: usize,
    pub use_spatial_index: bool,
    pub attribute_filter: Option<String>,
    pub spatial_filter: Option<String>,
}

impl FilterPlan {
    #[must_use]
    pub fn direct(expression: String) -> Self {
        FilterPlan {
            strategy: Strategy::Direct,
            steps: vec![FilterStep {
                kind: "direct".to_string(),
                expression: Some(expression),
                estimated_output: 0,
                metadata: BTreeMap::new(),
            }],
            estimated_selectivity: 1.0,
            estimated_cost: 1.0,
            chunk_size: 0,
            use_spatial_index: false,
            attribute_filter: None,
            spatial_filter: None,
        }
    }
}

/// Per-layer statistics, cached with a TTL (spec §3 `LayerStatistics`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerStatistics {
    pub feature_count: u64,
    pub extent_area: f64,
    pub extent_bounds: Option<Extent>,
    pub has_spatial_index: bool,
    pub geometry_type: Option<String>,
    pub avg_vertices_per_feature: f64,
    pub estimated_complexity: f64,
}

/// A cache entry wrapping a [`LayerStatistics`] with its fetch time, used
/// by the 5-minute TTL statistics cache (spec §3).
#[derive(Debug, Clone)]
pub struct CachedStatistics {
    pub stats: LayerStatistics,
    pub fetched_at: Instant,
}

impl CachedStatistics {
    #[must_use]
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }
}

/// Kind of cached result set managed by the MV/temp-table manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    MaterializedView,
    TempTable,
}

/// A managed cached result (spec §3 `ViewInfo`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewInfo {
    pub name: String,
    pub kind: ViewKind,
    pub schema: Option<String>,
    pub created_at: u64,
    pub last_refresh: Option<u64>,
    pub row_count: i64,
    pub size_bytes: u64,
    pub is_populated: bool,
    pub definition: String,
    pub session_id: Option<String>,
    pub geometry_column: Option<String>,
    pub srid: Option<i32>,
    pub has_spatial_index: bool,
}

impl ViewInfo {
    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{schema}\".\"{}\"", self.name),
            None => format!("\"{}\"", self.name),
        }
    }
}

/// Metrics counters carried per session (supplemented feature, see
/// SPEC_FULL.md §C.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendMetrics {
    pub executions: u64,
    pub mv_executions: u64,
    pub direct_executions: u64,
    pub two_phase_executions: u64,
    pub errors: u64,
    pub total_time_ms: f64,
    pub cache_hits: u64,
}

/// One applied filter state, pushed to a layer's history stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterState {
    pub expression: FilterExpression,
    pub description: String,
    pub applied_at: u64,
}

/// Bounded undo/redo stack per layer (spec §3 `LayerFilterHistory`).
#[derive(Debug, Clone, Default)]
pub struct LayerFilterHistory {
    undo_stack: Vec<FilterState>,
    redo_stack: Vec<FilterState>,
    max_depth: usize,
}

impl LayerFilterHistory {
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        LayerFilterHistory {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_depth,
        }
    }

    /// Records a newly-applied state. Clears the redo stack: a fresh
    /// `filter` invalidates any pending redo, per spec §4.9.
    pub fn push(&mut self, state: FilterState) {
        self.undo_stack.push(state);
        if self.undo_stack.len() > self.max_depth {
            self.undo_stack.remove(0);
        }
        self.redo_stack.clear();
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Pops the current state onto the redo stack and returns the
    /// previous one, if any.
    pub fn undo(&mut self) -> Option<FilterState> {
        let current = self.undo_stack.pop()?;
        let previous = self.undo_stack.last().cloned();
        self.redo_stack.push(current);
        previous
    }

    /// Reapplies a state previously undone. Returns `None` if no redo is
    /// available (a new `filter` was pushed since, emptying the stack).
    pub fn redo(&mut self) -> Option<FilterState> {
        let state = self.redo_stack.pop()?;
        self.undo_stack.push(state.clone());
        Some(state)
    }

    #[must_use]
    pub fn current(&self) -> Option<&FilterState> {
        self.undo_stack.last()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

/// Combine operator used when a new filter composes with an existing
/// subset string (spec §4.8.1 filter-preservation rules).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineOperator {
    And,
    AndNot,
    Or,
}

impl CombineOperator {
    /// Parses a combine operator, aliasing the UI string `"NOT AND"` to
    /// `AndNot` per the Open Question resolution in SPEC_FULL.md §E.2.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "AND" => Some(CombineOperator::And),
            "AND NOT" | "NOT AND" => Some(CombineOperator::AndNot),
            "OR" => Some(CombineOperator::Or),
            _ => None,
        }
    }

    #[must_use]
    pub fn sql_op(self) -> &'static str {
        match self {
            CombineOperator::And => "AND",
            CombineOperator::AndNot => "AND NOT",
            CombineOperator::Or => "OR",
        }
    }
}

/// Outcome of filtering a single layer, returned to the orchestrator's
/// caller without aborting the remaining run (spec §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResult {
    pub layer_id: LayerId,
    pub success: bool,
    pub error: Option<String>,
    pub strategy_used: Option<Strategy>,
}
