//! The `Backend` contract (C8) and its provider-keyed factory.
//!
//! Mirrors the `Source` trait abstraction this crate's sibling tiling
//! engine uses for `Pg`/`Mbtiles`/`Pmtiles` sources: one trait, one
//! impl per provider, selected by [`crate::model::Backend`] rather than
//! by runtime type inspection.

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::model::{Backend as BackendKind, BackendMetrics, FilterExpression, FilterPlan, LayerId, LayerInfo, Strategy};

/// Old-subset combine request threaded down from the orchestrator
/// (spec §4.8.1 filter-preservation rules).
#[derive(Debug, Clone)]
pub struct ApplyRequest<'a> {
    pub layer: &'a LayerInfo,
    pub expression: &'a FilterExpression,
    pub old_subset: Option<&'a str>,
    pub combine_operator: Option<crate::model::CombineOperator>,
    /// The generic cross-backend plan C7 produced for this layer (spec
    /// §2 data flow, §4.7). Advisory: PostgreSQL/SpatiaLite executors
    /// still apply their own backend-specific strategy rules (spec
    /// §4.8.1/§4.8.2), but the OGR executor has no such refinement and
    /// takes its chunk size straight from here. `None` only in tests
    /// that exercise a backend directly without going through the
    /// orchestrator.
    pub plan: Option<&'a FilterPlan>,
}

/// Outcome of a single [`Backend::execute`] call.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub subset_sql: Option<String>,
    pub strategy_used: Strategy,
}

/// One provider's executor (spec §4.8: PostgreSQL / SpatiaLite / OGR).
///
/// Every method here is infallible with respect to cooperative
/// cancellation and timeout handling: those surface as `Ok` outcomes
/// carrying no subset (timeout/cancel) or as `EngineError` variants the
/// orchestrator inspects via [`crate::error::EngineError::should_force_ogr_fallback`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Computes and (through the host) applies the subset string for
    /// one target layer. Returns `false` when the run should retry via
    /// the OGR executor (timeout/cancel), `true` on success.
    async fn execute(&self, request: &ApplyRequest<'_>) -> EngineResult<ApplyOutcome>;

    /// Whether this backend can handle the given layer at all.
    fn supports_layer(&self, layer: &LayerInfo) -> bool;

    /// Which provider this executor implements. Lets the orchestrator
    /// tell, after [`crate::backend::BackendRegistry::resolve`] may have
    /// silently substituted the OGR executor, which shape of
    /// [`FilterExpression`] (attribute-only vs. full SQL predicate) a
    /// given attempt actually needs.
    fn kind(&self) -> BackendKind;

    /// Human-readable identity string, used in logs and diagnostics.
    fn get_info(&self) -> String;

    /// Drops any session-scoped resources (materialized views, temp
    /// tables, cursors) this backend created. Never fails loudly: every
    /// individual cleanup error is logged and counted, not propagated
    /// (spec §4.5, §7).
    async fn cleanup(&self, session_id: &str) -> EngineResult<usize>;

    /// Rough wall-clock estimate in milliseconds, used only for
    /// progress-bar weighting; never blocks on a live query.
    fn estimate_execution_time(&self, feature_count: u64, complexity: f64) -> u64 {
        let base = (feature_count as f64).sqrt() * 2.0;
        (base * complexity.max(1.0)) as u64
    }

    /// Cheap pre-flight syntax/shape check of an expression before
    /// handing it to `execute`, so obviously-malformed input fails
    /// fast without a round trip.
    fn validate_expression(&self, expression: &FilterExpression) -> EngineResult<()>;

    /// Snapshot of this executor's accumulated counters, used by the
    /// orchestrator to aggregate per-session metrics across backends
    /// (spec §4.9). Default for executors with nothing to report.
    fn metrics(&self) -> BackendMetrics {
        BackendMetrics::default()
    }
}

/// Classification of an existing subset string against filter-
/// preservation rules (spec §4.8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsetClass {
    Geometric,
    Style,
    Attribute,
}

/// Classifies `old_subset` per spec §4.8.1: a geometric filter if it
/// references `__source`, an `EXISTS(`, any `ST_*` function, or a
/// materialized-view reference; a style expression if it looks like a
/// `CASE WHEN ... THEN true|false` rule; an attribute filter otherwise.
#[must_use]
pub fn classify_subset(old_subset: &str) -> SubsetClass {
    let upper = old_subset.to_uppercase();
    if old_subset.contains("__source")
        || upper.contains("EXISTS(")
        || upper.contains("EXISTS (")
        || upper.contains("ST_")
        || upper.contains("FILTERMATE_TEMP")
    {
        return SubsetClass::Geometric;
    }
    if upper.contains("CASE WHEN") && (upper.contains("THEN TRUE") || upper.contains("THEN FALSE")) {
        return SubsetClass::Style;
    }
    SubsetClass::Attribute
}

/// Per spec §4.8.1: geometric/style old subsets are replaced outright;
/// attribute old subsets combine with the new expression using
/// `combine_operator` (default `AND` when one wasn't supplied but a
/// combine was still requested); an explicit "no operator" request with
/// an existing old subset always means replace (multi-step FID
/// replacement signal).
#[must_use]
pub fn resolve_old_subset(
    old_subset: Option<&str>,
    combine_operator: Option<crate::model::CombineOperator>,
    new_expression: &str,
) -> String {
    let Some(old) = old_subset else {
        return new_expression.to_string();
    };
    if old.trim().is_empty() {
        return new_expression.to_string();
    }
    match classify_subset(old) {
        SubsetClass::Geometric | SubsetClass::Style => new_expression.to_string(),
        SubsetClass::Attribute => match combine_operator {
            Some(op) => format!("({old}) {} ({new_expression})", op.sql_op()),
            None => new_expression.to_string(),
        },
    }
}

/// A tag used purely for log correlation; not a stable identifier.
#[must_use]
pub fn backend_tag(layer_id: &LayerId) -> String {
    format!("backend[{layer_id}]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CombineOperator;

    #[test]
    fn classifies_geometric_subset() {
        assert_eq!(classify_subset("EXISTS (SELECT 1 FROM x)"), SubsetClass::Geometric);
        assert_eq!(classify_subset("__source.\"geom\" IS NOT NULL"), SubsetClass::Geometric);
        assert_eq!(classify_subset("\"pk\" IN (SELECT \"pk\" FROM \"filtermate_temp\".\"fm_temp_mv_x\")"), SubsetClass::Geometric);
    }

    #[test]
    fn classifies_style_subset() {
        assert_eq!(classify_subset("CASE WHEN \"importance\" > 5 THEN true ELSE false END"), SubsetClass::Style);
    }

    #[test]
    fn classifies_attribute_subset() {
        assert_eq!(classify_subset("\"importance\" > 5"), SubsetClass::Attribute);
    }

    #[test]
    fn geometric_old_subset_is_replaced() {
        let resolved = resolve_old_subset(Some("EXISTS (SELECT 1 FROM x)"), Some(CombineOperator::And), "\"a\" = 1");
        assert_eq!(resolved, "\"a\" = 1");
    }

    #[test]
    fn attribute_old_subset_combines_with_operator() {
        let resolved = resolve_old_subset(Some("\"a\" = 1"), Some(CombineOperator::AndNot), "\"b\" = 2");
        assert_eq!(resolved, "(\"a\" = 1) AND NOT (\"b\" = 2)");
    }

    #[test]
    fn attribute_old_subset_without_operator_replaces() {
        let resolved = resolve_old_subset(Some("\"a\" = 1"), None, "\"b\" = 2");
        assert_eq!(resolved, "\"b\" = 2");
    }

    #[test]
    fn no_old_subset_is_new_expression() {
        assert_eq!(resolve_old_subset(None, Some(CombineOperator::And), "\"a\" = 1"), "\"a\" = 1");
    }
}
