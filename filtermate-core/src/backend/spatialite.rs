//! SpatiaLite executor (spec §4.8.2).
//!
//! Builds an R-tree bbox pre-filter plus an exact spatial predicate and
//! applies the match set as a `rowid IN (...)` subset, or promotes to a
//! temp table (C5 SpatiaLite variant) once the source is large or
//! complex enough that re-running the predicate on every render would
//! be wasteful.

use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::Row;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::ident::{escape_literal_str, quote_ident};
use crate::model::{Backend as BackendKind, BackendMetrics, Extent, FilterExpression, LayerInfo, Strategy};
use crate::mv::MaterializedViewPort;
use crate::pool::sqlite::execute_with_retry;

use super::port::{backend_tag, resolve_old_subset, ApplyOutcome, ApplyRequest};

pub struct SpatialiteBackend {
    pool: sqlx::SqlitePool,
    mv: std::sync::Arc<dyn MaterializedViewPort>,
    session_id: String,
    metrics: Mutex<BackendMetrics>,
}

impl SpatialiteBackend {
    #[must_use]
    pub fn new(pool: sqlx::SqlitePool, mv: std::sync::Arc<dyn MaterializedViewPort>, session_id: String) -> Self {
        SpatialiteBackend {
            pool,
            mv,
            session_id,
            metrics: Mutex::new(BackendMetrics::default()),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> BackendMetrics {
        self.metrics.lock().expect("metrics lock").clone()
    }
}

/// Builds the bbox-pre-filter + exact-predicate SQL described in spec
/// §4.8.2, against `table`'s R-tree shadow table (SpatiaLite names it
/// `idx_<table>_<geom>`).
///
/// `source_geom_sql` is the staged source geometry already embedded as a
/// literal `ST_GeomFromText(...)` expression (see [`source_geom_literal`]),
/// not a bind parameter: `rusqlite`/`sqlx`'s SpatiaLite driver has no
/// portable way to bind a geometry blob through this pool, so the engine
/// takes the same route as the literal-WKT encoding in C3 and inlines it.
#[must_use]
fn build_rtree_query(
    table: &str,
    geometry_column: &str,
    attribute_filter: Option<&str>,
    spatial_predicate_sql: &str,
    bbox: Extent,
    source_geom_sql: &str,
) -> EngineResult<String> {
    let table_q = quote_ident(table)?;
    let geom_q = quote_ident(geometry_column)?;
    let idx_q = quote_ident(&format!("idx_{table}_{geometry_column}"))?;
    let attr_clause = attribute_filter.map(|a| format!("{a} AND ")).unwrap_or_default();
    Ok(format!(
        "SELECT rowid FROM {table_q} WHERE {attr_clause}rowid IN (SELECT pkid FROM {idx_q} WHERE xmin<={} AND xmax>={} AND ymin<={} AND ymax>={}) AND {spatial_predicate_sql}({geom_q}, {source_geom_sql})",
        bbox.xmax, bbox.xmin, bbox.ymax, bbox.ymin,
    ))
}

/// Embeds the staged source geometry as a SpatiaLite `ST_GeomFromText`
/// literal, the way [`crate::geom::build_staging_sql`] does for the
/// literal-WKT encoding path.
#[must_use]
fn source_geom_literal(wkt: &str, srid: i32) -> EngineResult<String> {
    let escaped = escape_literal_str(wkt)?;
    Ok(format!("ST_GeomFromText({escaped}, {srid})"))
}

#[async_trait]
impl super::port::Backend for SpatialiteBackend {
    async fn execute(&self, request: &ApplyRequest<'_>) -> EngineResult<ApplyOutcome> {
        let tag = backend_tag(&request.layer.layer_id);
        let layer = request.layer;
        let table = layer.table.clone().ok_or_else(|| EngineError::UnsupportedLayer {
            layer_id: layer.layer_id.clone(),
            reason: "spatialite layer missing table".to_string(),
        })?;
        let geometry_column = layer.geometry_column.clone().unwrap_or_else(|| "geom".to_string());

        let predicate = request
            .expression
            .spatial_predicates
            .first()
            .copied()
            .unwrap_or(crate::model::SpatialPredicate::Intersects);

        let source_wkt = request.expression.source_geometry_wkt.as_deref().ok_or_else(|| EngineError::GeometryStagingFailed {
            layer_id: layer.layer_id.clone(),
            reason: "spatialite executor requires a staged source geometry".to_string(),
        })?;
        let source_srid = request.expression.source_srid.unwrap_or_else(|| layer_srid(layer));
        let source_geom_sql = source_geom_literal(source_wkt, source_srid)?;
        // The R-tree pre-filter window is the *source* geometry's bbox
        // (spec §4.8.2's MbrMinX/MbrMaxX), not the target layer's own
        // extent — using the latter makes the window cover the whole
        // layer and the pre-filter a no-op.
        let bbox = request.expression.source_bbox.unwrap_or(Extent { xmin: 0.0, ymin: 0.0, xmax: 0.0, ymax: 0.0 });

        let new_expression = resolve_old_subset(request.old_subset, request.combine_operator, &request.expression.sql);

        let breakdown = crate::estimator::estimate_complexity(&new_expression, layer.feature_count);
        // Temp-table promotion is the SpatiaLite side of C5's generic
        // should_use_view threshold (spec §4.5), which also halves the
        // feature threshold for spatial queries; this executor's filter
        // is always spatial.
        let use_temp_table = self.mv.should_use_view(layer.feature_count, breakdown.total_score, true);

        if use_temp_table {
            let sql = build_rtree_query(&table, &geometry_column, Some(&new_expression), predicate.sql_fn(), bbox, &source_geom_sql)?;
            let view = self
                .mv
                .create_view(&sql, &table, &geometry_column, layer_srid(layer), &[], true)
                .await?;
            let view_q = quote_ident(&view)?;
            return Ok(ApplyOutcome {
                subset_sql: Some(format!("rowid IN (SELECT rowid FROM {view_q})")),
                strategy_used: Strategy::Materialized,
            });
        }

        let sql = build_rtree_query(&table, &geometry_column, Some(&new_expression), predicate.sql_fn(), bbox, &source_geom_sql)?;
        let rows = execute_with_retry(|| async { sqlx::query(sql.as_str()).fetch_all(&self.pool).await })
            .await
            .map_err(EngineError::from)?;
        let rowids: Vec<i64> = rows.iter().map(|r| r.get::<i64, _>("rowid")).collect();
        let in_list = crate::ident::format_in_list_numeric(rowids);

        let mut metrics = self.metrics.lock().expect("metrics lock");
        metrics.executions += 1;
        metrics.direct_executions += 1;
        drop(metrics);

        let _ = tag;
        Ok(ApplyOutcome {
            subset_sql: Some(format!("rowid IN {in_list}")),
            strategy_used: Strategy::Direct,
        })
    }

    fn supports_layer(&self, layer: &LayerInfo) -> bool {
        layer.provider == BackendKind::Spatialite
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Spatialite
    }

    fn get_info(&self) -> String {
        "spatialite".to_string()
    }

    async fn cleanup(&self, session_id: &str) -> EngineResult<usize> {
        if session_id != self.session_id {
            return Ok(0);
        }
        self.mv.cleanup_session_views().await
    }

    fn validate_expression(&self, expression: &FilterExpression) -> EngineResult<()> {
        if expression.sql.trim().is_empty() && expression.raw.trim().is_empty() {
            return Err(EngineError::Config("empty filter expression"));
        }
        Ok(())
    }

    fn metrics(&self) -> BackendMetrics {
        self.metrics.lock().expect("metrics lock").clone()
    }
}

fn layer_srid(layer: &LayerInfo) -> i32 {
    layer.crs_authid.rsplit(':').next().and_then(|s| s.parse().ok()).unwrap_or(4326)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtree_query_uses_shadow_index_table() {
        let source_geom = source_geom_literal("POINT(0 0)", 4326).unwrap();
        let sql = build_rtree_query(
            "roads",
            "geom",
            Some("\"kind\" = 'highway'"),
            "ST_Intersects",
            Extent { xmin: 0.0, ymin: 0.0, xmax: 1.0, ymax: 1.0 },
            &source_geom,
        )
        .unwrap();
        assert!(sql.contains("\"idx_roads_geom\""));
        assert!(sql.contains("ST_Intersects(\"geom\", ST_GeomFromText('POINT(0 0)', 4326))"));
        assert!(sql.contains("\"kind\" = 'highway' AND"));
    }

    #[test]
    fn rtree_query_without_attribute_filter_has_no_dangling_and() {
        let source_geom = source_geom_literal("POINT(0 0)", 4326).unwrap();
        let sql = build_rtree_query(
            "roads",
            "geom",
            None,
            "ST_Intersects",
            Extent { xmin: 0.0, ymin: 0.0, xmax: 1.0, ymax: 1.0 },
            &source_geom,
        );
        assert!(sql.unwrap().contains("WHERE rowid IN"));
    }

    #[test]
    fn rtree_query_embeds_source_geometry_as_literal_not_placeholder() {
        let source_geom = source_geom_literal("POLYGON((0 0,1 0,1 1,0 1,0 0))", 2154).unwrap();
        let bbox = Extent { xmin: 0.0, ymin: 0.0, xmax: 1.0, ymax: 1.0 };
        let sql = build_rtree_query("roads", "geom", None, "ST_Contains", bbox, &source_geom).unwrap();
        assert!(!sql.contains('?'));
        assert!(sql.contains("ST_GeomFromText('POLYGON((0 0,1 0,1 1,0 1,0 0))', 2154)"));
    }

    #[test]
    fn rtree_query_bbox_comes_from_passed_in_extent() {
        let source_geom = source_geom_literal("POINT(0 0)", 4326).unwrap();
        let bbox = Extent { xmin: 10.0, ymin: 20.0, xmax: 30.0, ymax: 40.0 };
        let sql = build_rtree_query("roads", "geom", None, "ST_Intersects", bbox, &source_geom).unwrap();
        assert!(sql.contains("xmin<=30"));
        assert!(sql.contains("xmax>=10"));
        assert!(sql.contains("ymin<=40"));
        assert!(sql.contains("ymax>=20"));
    }

    #[test]
    fn source_geom_literal_escapes_quotes() {
        let literal = source_geom_literal("O'Brien's field", 4326).unwrap();
        assert!(literal.contains("O''Brien''s field"));
    }
}
