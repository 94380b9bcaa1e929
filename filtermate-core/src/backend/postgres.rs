//! PostgreSQL/PostGIS executor (spec §4.8.1).
//!
//! Grounded on this crate's sibling tiling engine's `pg::table_source`
//! (quoting/escaping every interpolated identifier through
//! `postgres_protocol`) and `pg::pool` (one pooled connection per call,
//! no shared mutable state across calls except the metrics counters).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::error::{EngineError, EngineResult};
use crate::ident::{format_in_list_numeric, quote_ident, quote_qualified};
use crate::model::{Backend as BackendKind, BackendMetrics, FilterExpression, LayerInfo, Strategy};
use crate::mv::MaterializedViewPort;
use crate::pool::pg::PgPool;

use super::port::{backend_tag, resolve_old_subset, ApplyOutcome, ApplyRequest};

/// Feature count at/above which a materialized view is used outright
/// (spec §4.8.1), independent of complexity.
const MV_FEATURE_THRESHOLD: u64 = 10_000;

/// Feature count that, paired with [`ExecutionConfig::two_phase_min_complexity`],
/// triggers the two-phase strategy (spec §4.8.1, §8 boundary: `9_999`/99
/// stays DIRECT, `10_000`/100 goes TWO_PHASE).
const TWO_PHASE_FEATURE_THRESHOLD: u64 = 10_000;

#[derive(Debug, Clone)]
struct ColumnMeta {
    name: String,
    is_text_like: bool,
}

pub struct PostgresBackend {
    pool: PgPool,
    mv: std::sync::Arc<dyn MaterializedViewPort>,
    session_id: String,
    execution: ExecutionConfig,
    columns_cache: Mutex<HashMap<String, Vec<ColumnMeta>>>,
    metrics: Mutex<BackendMetrics>,
}

impl PostgresBackend {
    #[must_use]
    pub fn new(pool: PgPool, mv: std::sync::Arc<dyn MaterializedViewPort>, session_id: String) -> Self {
        Self::with_execution_config(pool, mv, session_id, ExecutionConfig::default())
    }

    /// As [`Self::new`], but with the two-phase complexity gate and
    /// phase-2 `IN` chunk size taken from the host's loaded
    /// [`ExecutionConfig`] (spec §6 `TwoPhase.min_complexity`,
    /// `ProgressiveFilter.max_ids_per_in_clause`) instead of their
    /// defaults.
    #[must_use]
    pub fn with_execution_config(
        pool: PgPool,
        mv: std::sync::Arc<dyn MaterializedViewPort>,
        session_id: String,
        execution: ExecutionConfig,
    ) -> Self {
        PostgresBackend {
            pool,
            mv,
            session_id,
            execution,
            columns_cache: Mutex::new(HashMap::new()),
            metrics: Mutex::new(BackendMetrics::default()),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> BackendMetrics {
        self.metrics.lock().expect("metrics lock").clone()
    }

    async fn columns_for(&self, schema: &str, table: &str) -> EngineResult<Vec<ColumnMeta>> {
        let key = format!("{schema}.{table}");
        if let Some(cols) = self.columns_cache.lock().expect("columns cache lock").get(&key) {
            return Ok(cols.clone());
        }
        let client = self.pool.get().await.map_err(EngineError::from)?;
        let rows = client
            .query(
                "SELECT column_name, data_type FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2",
                &[&schema, &table],
            )
            .await
            .map_err(|e| EngineError::Postgres(crate::pool::pg::PgError::PostgresError(e, "listing columns")))?;
        let cols: Vec<ColumnMeta> = rows
            .iter()
            .map(|r| {
                let name: String = r.get("column_name");
                let data_type: String = r.get("data_type");
                let is_text_like = matches!(
                    data_type.as_str(),
                    "character varying" | "character" | "text" | "varchar"
                );
                ColumnMeta { name, is_text_like }
            })
            .collect();
        self.columns_cache.lock().expect("columns cache lock").insert(key, cols.clone());
        Ok(cols)
    }

    async fn select_strategy_for(
        &self,
        layer: &LayerInfo,
        sql: &str,
    ) -> Strategy {
        if layer.pk_is_ctid() {
            return Strategy::Direct;
        }
        let breakdown = crate::estimator::estimate_complexity(sql, layer.feature_count);
        let complexity = breakdown.total_score;
        let feature_count = layer.feature_count;
        if complexity >= self.execution.two_phase_min_complexity && feature_count >= TWO_PHASE_FEATURE_THRESHOLD {
            return Strategy::TwoPhase;
        }
        if feature_count >= MV_FEATURE_THRESHOLD || is_expensive_expression(sql) {
            return Strategy::Materialized;
        }
        Strategy::Direct
    }
}

/// Parses the numeric SRID out of a `"EPSG:4326"`-style authority id.
#[must_use]
fn parse_srid(crs_authid: &str) -> Option<i32> {
    crs_authid.rsplit(':').next()?.parse().ok()
}

/// True when `sql` matches one of the "always materialize, regardless
/// of feature count" shapes from spec §4.8.1: an `EXISTS` subquery
/// paired with a spatial predicate or `ST_Buffer`, a materialized-view
/// reference paired with `EXISTS`, or a `__source` reference paired
/// with a spatial predicate.
#[must_use]
fn is_expensive_expression(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    let has_exists = upper.contains("EXISTS(") || upper.contains("EXISTS (");
    let has_spatial = upper.contains("ST_");
    let has_buffer = upper.contains("ST_BUFFER");
    let has_mv_ref = upper.contains("FILTERMATE_TEMP");
    let has_source = sql.contains("__source");
    (has_exists && has_spatial) || (has_exists && has_buffer) || (has_mv_ref && has_exists) || (has_source && has_spatial)
}

/// Rewrites quoted identifiers in `expression` to match `columns`' live
/// case when the quoted identifier differs only in case (spec §4.8.1:
/// PostgreSQL quoted identifiers are case-sensitive). Returns the
/// corrected expression and a list of corrections made, for logging.
#[must_use]
fn normalize_column_case(expression: &str, columns: &[ColumnMeta]) -> (String, Vec<String>) {
    let ident_re = Regex::new(r#""([A-Za-z_][A-Za-z0-9_]*)""#).expect("static regex");
    let mut corrections = Vec::new();
    let corrected = ident_re
        .replace_all(expression, |caps: &regex::Captures<'_>| {
            let found = &caps[1];
            if columns.iter().any(|c| c.name == found) {
                return format!("\"{found}\"");
            }
            if let Some(authoritative) = columns.iter().find(|c| c.name.eq_ignore_ascii_case(found)) {
                corrections.push(format!("{found} -> {}", authoritative.name));
                return format!("\"{}\"", authoritative.name);
            }
            format!("\"{found}\"")
        })
        .into_owned();
    (corrected, corrections)
}

/// Inserts `::numeric` casts on text-like columns compared to a bare
/// numeric literal, e.g. `"importance" < 4` -> `"importance"::numeric < 4`
/// (spec §4.8.1).
#[must_use]
fn insert_numeric_casts(expression: &str, columns: &[ColumnMeta]) -> String {
    let mut result = expression.to_string();
    for col in columns.iter().filter(|c| c.is_text_like) {
        let pattern = format!(
            r#""{}"(\s*(?:<=|>=|<>|!=|<|>|=)\s*-?\d+(?:\.\d+)?)"#,
            regex::escape(&col.name)
        );
        if let Ok(re) = Regex::new(&pattern) {
            result = re.replace_all(&result, format!("\"{}\"::numeric$1", col.name)).into_owned();
        }
    }
    result
}

#[async_trait]
impl super::port::Backend for PostgresBackend {
    async fn execute(&self, request: &ApplyRequest<'_>) -> EngineResult<ApplyOutcome> {
        let tag = backend_tag(&request.layer.layer_id);
        let layer = request.layer;
        let schema = layer.schema.clone().unwrap_or_else(|| "public".to_string());
        let table = layer.table.clone().ok_or_else(|| EngineError::UnsupportedLayer {
            layer_id: layer.layer_id.clone(),
            reason: "postgres layer missing table".to_string(),
        })?;

        let columns = self.columns_for(&schema, &table).await?;
        let (normalized, corrections) = normalize_column_case(&request.expression.sql, &columns);
        if !corrections.is_empty() {
            info!(%tag, ?corrections, "normalized column case in expression");
        }
        let casted = insert_numeric_casts(&normalized, &columns);

        let resolved = resolve_old_subset(request.old_subset, request.combine_operator, &casted);

        let strategy = self.select_strategy_for(layer, &resolved).await;

        // Complex plans are worth rewriting to index-friendly shapes
        // before they're embedded in a materialized view or a two-phase
        // query that will be re-evaluated (spec §2: "the chosen Executor
        // composes SQL... and (for complex PG) rewrites with C6").
        // Direct, cheap predicates aren't: `optimize` is a pure string
        // rewrite, not free to apply blindly on every call.
        let new_expression = if strategy == Strategy::Direct {
            resolved
        } else {
            let analysis = crate::optimizer::analyze(&resolved);
            for warning in &analysis.warnings {
                warn!(%tag, %warning, "query optimizer warning");
            }
            for suggestion in &analysis.suggestions {
                info!(%tag, %suggestion, "query optimizer suggestion");
            }
            crate::optimizer::optimize(&resolved)
        };

        let pk = layer.pk_name.clone().unwrap_or_else(|| "ctid".to_string());
        let pk_q = quote_ident(&pk)?;
        let table_q = quote_qualified(Some(&schema), &table)?;

        let outcome = match strategy {
            Strategy::Direct => ApplyOutcome {
                subset_sql: Some(new_expression),
                strategy_used: Strategy::Direct,
            },
            Strategy::Materialized => {
                let query = format!("SELECT {pk_q} AS pk FROM {table_q} WHERE {new_expression}");
                let view = self
                    .mv
                    .create_view(
                        &query,
                        &table,
                        layer.geometry_column.as_deref().unwrap_or("geom"),
                        parse_srid(&layer.crs_authid).unwrap_or(4326),
                        &[pk.clone()],
                        true,
                    )
                    .await?;
                let view_q = quote_ident(&view)?;
                ApplyOutcome {
                    subset_sql: Some(format!("{pk_q} IN (SELECT {pk_q} FROM {view_q})")),
                    strategy_used: Strategy::Materialized,
                }
            }
            Strategy::TwoPhase => {
                let extent = layer.extent.ok_or_else(|| EngineError::UnsupportedLayer {
                    layer_id: layer.layer_id.clone(),
                    reason: "two-phase strategy requires a known extent for the bbox pre-filter".to_string(),
                })?;
                let geom_q = quote_ident(layer.geometry_column.as_deref().unwrap_or("geom"))?;
                let srid = parse_srid(&layer.crs_authid).unwrap_or(4326);
                let bbox_sql = format!(
                    "SELECT {pk_q} AS pk FROM {table_q} WHERE {geom_q} && ST_MakeEnvelope({}, {}, {}, {}, {srid})",
                    extent.xmin, extent.ymin, extent.xmax, extent.ymax
                );
                let client = self.pool.get().await.map_err(EngineError::from)?;
                let rows = client.query(bbox_sql.as_str(), &[]).await.map_err(|e| {
                    EngineError::Postgres(crate::pool::pg::PgError::PostgresError(e, "two-phase bbox pre-filter"))
                })?;
                let phase1_pks: Vec<i64> = rows.iter().map(|r| r.get::<_, i64>("pk")).collect();

                let mut matched: Vec<i64> = Vec::new();
                let chunk_size = self.execution.progressive_max_ids_per_in_clause.max(1);
                for chunk in phase1_pks.chunks(chunk_size) {
                    let in_list = format_in_list_numeric(chunk.iter().copied());
                    let phase2_sql =
                        format!("SELECT {pk_q} AS pk FROM {table_q} WHERE {pk_q} IN {in_list} AND {new_expression}");
                    let rows = client.query(phase2_sql.as_str(), &[]).await.map_err(|e| {
                        EngineError::Postgres(crate::pool::pg::PgError::PostgresError(e, "two-phase exact predicate"))
                    })?;
                    matched.extend(rows.iter().map(|r| r.get::<_, i64>("pk")));
                }

                ApplyOutcome {
                    subset_sql: Some(format!("{pk_q} IN {}", format_in_list_numeric(matched))),
                    strategy_used: Strategy::TwoPhase,
                }
            }
            other => {
                warn!(%tag, ?other, "unexpected strategy selected for postgres executor, falling back to direct");
                ApplyOutcome {
                    subset_sql: Some(new_expression),
                    strategy_used: Strategy::Direct,
                }
            }
        };

        let mut metrics = self.metrics.lock().expect("metrics lock");
        metrics.executions += 1;
        match outcome.strategy_used {
            Strategy::Materialized => metrics.mv_executions += 1,
            Strategy::TwoPhase => metrics.two_phase_executions += 1,
            Strategy::Direct => metrics.direct_executions += 1,
            _ => {}
        }
        drop(metrics);

        Ok(outcome)
    }

    fn supports_layer(&self, layer: &LayerInfo) -> bool {
        layer.provider == BackendKind::Postgres
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn get_info(&self) -> String {
        format!("postgres[{}]", self.pool.id())
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

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, is_text_like: bool) -> ColumnMeta {
        ColumnMeta { name: name.to_string(), is_text_like }
    }

    #[test]
    fn parses_srid_from_epsg_authid() {
        assert_eq!(parse_srid("EPSG:2154"), Some(2154));
        assert_eq!(parse_srid("garbage"), None);
    }

    #[test]
    fn detects_expensive_exists_with_spatial() {
        assert!(is_expensive_expression("EXISTS (SELECT 1 FROM x WHERE ST_Intersects(a, b))"));
    }

    #[test]
    fn detects_expensive_source_with_spatial() {
        assert!(is_expensive_expression("ST_Intersects(geom, __source.geom)"));
    }

    #[test]
    fn plain_attribute_filter_is_not_expensive() {
        assert!(!is_expensive_expression("\"importance\" > 5"));
    }

    #[test]
    fn normalizes_wrong_case_identifier() {
        let columns = vec![col("Importance", false)];
        let (fixed, corrections) = normalize_column_case("\"importance\" > 5", &columns);
        assert_eq!(fixed, "\"Importance\" > 5");
        assert_eq!(corrections.len(), 1);
    }

    #[test]
    fn leaves_correct_case_untouched() {
        let columns = vec![col("importance", false)];
        let (fixed, corrections) = normalize_column_case("\"importance\" > 5", &columns);
        assert_eq!(fixed, "\"importance\" > 5");
        assert!(corrections.is_empty());
    }

    #[test]
    fn inserts_numeric_cast_on_text_column() {
        let columns = vec![col("importance", true)];
        let out = insert_numeric_casts("\"importance\" < 4", &columns);
        assert_eq!(out, "\"importance\"::numeric < 4");
    }

    #[test]
    fn does_not_cast_non_text_column() {
        let columns = vec![col("importance", false)];
        let out = insert_numeric_casts("\"importance\" < 4", &columns);
        assert_eq!(out, "\"importance\" < 4");
    }
}
