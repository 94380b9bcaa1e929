//! Source-geometry encoder (C3).
//!
//! Turns a [`crate::geom::StagedGeometry`] plus target backend into the
//! SQL fragment a backend executor embeds in its predicate: an inline
//! WKT literal, an `EXISTS` subquery against the live source table, or a
//! reference into a cached materialized view / temp table.

use regex::Regex;
use std::sync::LazyLock;

use crate::geom::{build_staging_sql, BufferOptions, StagedGeometry};
use crate::model::SpatialPredicate;

/// Source-feature count at or under which a literal WKT encoding is
/// used (spec §4.3, §8 boundary behavior: 50 uses WKT, 51 does not).
pub const LITERAL_MAX_FEATURES: usize = 50;

/// WKT byte-length at or under which a literal encoding is used (spec
/// §8 boundary: 100_000 uses WKT, 100_001 switches over for PostgreSQL
/// sources).
pub const LITERAL_MAX_WKT_LEN: usize = 100_000;

/// How the staged source geometry is represented in generated SQL.
#[derive(Debug, Clone)]
pub enum SourceEncoding {
    /// `ST_MakeValid(ST_GeomFromText(...))`, inlined directly.
    Literal { sql: String },
    /// `EXISTS (SELECT 1 FROM "schema"."table" AS __source WHERE ...)`.
    ExistsSubquery { sql: String },
    /// A reference to a cached view/temp-table holding `(pk, geom)`.
    ViewReference { view_name: String, pk_column: String },
}

impl SourceEncoding {
    /// The SQL fragment representing the source geometry itself (not
    /// the whole predicate), for encodings where that's meaningful.
    #[must_use]
    pub fn geometry_sql(&self) -> Option<&str> {
        match self {
            SourceEncoding::Literal { sql } => Some(sql),
            SourceEncoding::ExistsSubquery { .. } | SourceEncoding::ViewReference { .. } => None,
        }
    }
}

/// Describes the PostgreSQL source table backing an `EXISTS`/view
/// encoding, when the source layer is itself a PostgreSQL table.
#[derive(Debug, Clone)]
pub struct PgSourceTable {
    pub schema: String,
    pub table: String,
    pub geometry_column: String,
    /// The source layer's own current subset filter, if any, to AND
    /// into the subquery after rewriting its table-qualified columns.
    pub adapted_filter: Option<String>,
    /// SRID of `geometry_column` as stored live in this table — the
    /// `EXISTS` encoding buffers `__source."<geometry_column>"` in this
    /// SRID, since that reference is the live (unbuffered, untransformed)
    /// column, not the already-staged/target-SRID geometry.
    pub srid: i32,
}

/// Chooses the encoding for a staged geometry against a given backend
/// and, for PostgreSQL-backed sources, an optional live source table.
///
/// `is_ogr_source` forces the literal path even past the WKT-length
/// threshold: OGR in-process encoding has no EXISTS/MV fallback, so it
/// logs a warning instead of switching (spec §8 boundary behavior).
///
/// `target_srid` is the geometry-column SRID of the layer being
/// filtered; the staged geometry is reprojected into it whenever it
/// differs from the SRID it was staged in.
///
/// `buffer` is only consulted by the `EXISTS`/view branches below. The
/// literal-WKT branch's `staged.wkt` already comes out of
/// [`crate::geom::stage_buffered_geometry_for_ogr`] with any requested
/// buffer baked in by the Host (spec §1 Non-goals: the engine delegates
/// geometry math, including buffering, to the Host rather than running
/// `ST_Buffer` twice over the same geometry); the `EXISTS` path instead
/// references the *live* source table's own (unbuffered) geometry
/// column, so it has to apply the buffer stack itself in SQL.
#[must_use]
pub fn choose_encoding(
    staged: &StagedGeometry,
    buffer: Option<BufferOptions>,
    pg_source: Option<&PgSourceTable>,
    is_ogr_source: bool,
    target_srid: i32,
) -> (SourceEncoding, Vec<String>) {
    let mut warnings = Vec::new();
    let fits_literal =
        staged.feature_count <= LITERAL_MAX_FEATURES && staged.wkt.len() <= LITERAL_MAX_WKT_LEN;

    if fits_literal {
        let sql = build_staging_sql(&staged.wkt, staged.srid, None, target_srid);
        return (SourceEncoding::Literal { sql }, warnings);
    }

    if is_ogr_source {
        warnings.push(format!(
            "source geometry exceeds the literal-encoding threshold ({} bytes); using inline WKT anyway because the OGR path has no EXISTS/MV fallback",
            staged.wkt.len()
        ));
        let sql = build_staging_sql(&staged.wkt, staged.srid, None, target_srid);
        return (SourceEncoding::Literal { sql }, warnings);
    }

    if let Some(pg) = pg_source {
        let sql = build_exists_subquery(pg, buffer);
        return (SourceEncoding::ExistsSubquery { sql }, warnings);
    }

    // Fallback: neither a fitting literal nor a live PostgreSQL source
    // table is available; caller is expected to have created a view
    // and supply its name through the MV manager instead.
    warnings.push("falling back to view-reference encoding: no PostgreSQL source table available for EXISTS".to_string());
    (
        SourceEncoding::ViewReference {
            view_name: String::new(),
            pk_column: "pk".to_string(),
        },
        warnings,
    )
}

/// Builds the `EXISTS` encoding (spec §4.3). The source geometry
/// reference is run through the same reprojection-detour/buffer/guard
/// stack the literal-WKT path uses (spec §4.3 `<buffered_source_geom>`;
/// SPEC_FULL §E.3: `buffer_value` wins on the EXISTS path) — a buffer
/// requested alongside a large PostgreSQL source must still apply, not
/// just be silently dropped because the source didn't fit inline.
fn build_exists_subquery(pg: &PgSourceTable, buffer: Option<BufferOptions>) -> String {
    let source_geom = format!("__source.\"{}\"", pg.geometry_column);
    let buffered_source_geom = crate::geom::apply_buffer_stack(&source_geom, pg.srid, buffer, pg.srid);
    let mut sql = format!(
        "EXISTS (SELECT 1 FROM \"{}\".\"{}\" AS __source WHERE <predicate>(<target_geom>, {})",
        pg.schema, pg.table, buffered_source_geom
    );
    if let Some(filter) = &pg.adapted_filter {
        if let Some(adapted) = adapt_filter_for_subquery(filter, &pg.table) {
            sql.push_str(" AND ");
            sql.push_str(&adapted);
        }
    }
    sql.push(')');
    sql
}

static QUALIFIED_COLUMN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([A-Za-z_][A-Za-z0-9_]*)"\."([A-Za-z_][A-Za-z0-9_]*)"\."([A-Za-z_][A-Za-z0-9_]*)"|"([A-Za-z_][A-Za-z0-9_]*)"\."([A-Za-z_][A-Za-z0-9_]*)""#).expect("static regex")
});

/// Rewrites `"schema"."table"."col"` or `"table"."col"` references to
/// `__source."col"`, strips balanced outer parentheses, and rejects
/// (returns `None` for) filters that still reference other tables,
/// nested EXISTS, or materialized views after rewriting — any of which
/// would break the generated SQL by capturing the wrong rows (spec
/// §4.3, §8 invariant: never emits unbalanced parentheses).
#[must_use]
pub fn adapt_filter_for_subquery(filter: &str, own_table: &str) -> Option<String> {
    let rewritten = QUALIFIED_COLUMN_RE
        .replace_all(filter, |caps: &regex::Captures<'_>| {
            if let (Some(table), Some(col)) = (caps.get(2), caps.get(3)) {
                if table.as_str().eq_ignore_ascii_case(own_table) {
                    return format!("__source.\"{}\"", col.as_str());
                }
                return format!("\"{}\".\"{}\"", table.as_str(), col.as_str());
            }
            if let (Some(table), Some(col)) = (caps.get(4), caps.get(5)) {
                if table.as_str().eq_ignore_ascii_case(own_table) {
                    return format!("__source.\"{}\"", col.as_str());
                }
                return format!("\"{}\".\"{}\"", table.as_str(), col.as_str());
            }
            caps[0].to_string()
        })
        .into_owned();

    let stripped = strip_balanced_parens(&rewritten);

    if references_other_table(&stripped, own_table) {
        return None;
    }
    if stripped.contains("EXISTS(") || stripped.contains("EXISTS (") {
        return None;
    }
    if stripped.to_lowercase().contains("filtermate_temp") {
        return None;
    }
    if stripped.chars().filter(|&c| c == '(').count() != stripped.chars().filter(|&c| c == ')').count() {
        return None;
    }
    Some(stripped)
}

fn strip_balanced_parens(s: &str) -> String {
    let trimmed = s.trim();
    if !trimmed.starts_with('(') || !trimmed.ends_with(')') {
        return trimmed.to_string();
    }
    let inner = &trimmed[1..trimmed.len() - 1];
    let mut depth = 0i32;
    for (i, c) in inner.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    // the outer parens weren't actually a matching pair
                    return trimmed.to_string();
                }
            }
            _ => {}
        }
        let _ = i;
    }
    if depth == 0 {
        inner.trim().to_string()
    } else {
        trimmed.to_string()
    }
}

fn references_other_table(sql: &str, own_table: &str) -> bool {
    for caps in QUALIFIED_COLUMN_RE.captures_iter(sql) {
        let table = caps.get(2).or(caps.get(4));
        if let Some(table) = table {
            if !table.as_str().eq_ignore_ascii_case(own_table) && table.as_str() != "__source" {
                return true;
            }
        }
    }
    false
}

/// Sorts spatial predicates for OR-combination by the fixed cost table
/// (spec §4.3) and deduplicates, preserving first-seen order among ties.
/// Idempotent: sorting an already-sorted, deduplicated list is a no-op,
/// satisfying the §8 invariant.
#[must_use]
pub fn order_predicates(predicates: &[SpatialPredicate]) -> Vec<SpatialPredicate> {
    let mut seen = std::collections::HashSet::new();
    let mut deduped: Vec<SpatialPredicate> = Vec::new();
    for &p in predicates {
        if seen.insert(p) {
            deduped.push(p);
        }
    }
    deduped.sort_by_key(|p| p.cost_rank());
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Extent;

    fn staged(feature_count: usize, wkt_len: usize) -> StagedGeometry {
        StagedGeometry {
            wkt: "X".repeat(wkt_len),
            srid: 2154,
            bbox: Extent {
                xmin: 0.0,
                ymin: 0.0,
                xmax: 1.0,
                ymax: 1.0,
            },
            feature_count,
        }
    }

    #[test]
    fn fifty_features_use_literal() {
        let s = staged(50, 10);
        let (enc, warnings) = choose_encoding(&s, None, None, false, 2154);
        assert!(matches!(enc, SourceEncoding::Literal { .. }));
        assert!(warnings.is_empty());
    }

    #[test]
    fn fifty_one_features_fall_through() {
        let s = staged(51, 10);
        let pg = PgSourceTable {
            schema: "public".to_string(),
            table: "src".to_string(),
            geometry_column: "geom".to_string(),
            adapted_filter: None,
            srid: 2154,
        };
        let (enc, _) = choose_encoding(&s, None, Some(&pg), false, 2154);
        assert!(matches!(enc, SourceEncoding::ExistsSubquery { .. }));
    }

    #[test]
    fn exists_subquery_wraps_source_geom_in_buffer_when_requested() {
        let s = staged(51, 10);
        let pg = PgSourceTable {
            schema: "public".to_string(),
            table: "src".to_string(),
            geometry_column: "geom".to_string(),
            adapted_filter: None,
            srid: 2154,
        };
        let buffer = BufferOptions { value: 25.0, style: crate::model::BufferStyle::Round, segments: 5 };
        let (enc, _) = choose_encoding(&s, Some(buffer), Some(&pg), false, 2154);
        match enc {
            SourceEncoding::ExistsSubquery { sql } => {
                assert!(sql.contains("ST_Buffer(__source.\"geom\", 25, "));
            }
            _ => panic!("expected EXISTS subquery encoding"),
        }
    }

    #[test]
    fn exists_subquery_without_buffer_uses_bare_source_geom() {
        let s = staged(51, 10);
        let pg = PgSourceTable {
            schema: "public".to_string(),
            table: "src".to_string(),
            geometry_column: "geom".to_string(),
            adapted_filter: None,
            srid: 2154,
        };
        let (enc, _) = choose_encoding(&s, None, Some(&pg), false, 2154);
        match enc {
            SourceEncoding::ExistsSubquery { sql } => {
                assert!(sql.contains("__source.\"geom\")"));
                assert!(!sql.contains("ST_Buffer"));
            }
            _ => panic!("expected EXISTS subquery encoding"),
        }
    }

    #[test]
    fn oversized_wkt_for_ogr_stays_literal_with_warning() {
        let s = staged(1, LITERAL_MAX_WKT_LEN + 1);
        let (enc, warnings) = choose_encoding(&s, None, None, true, 2154);
        assert!(matches!(enc, SourceEncoding::Literal { .. }));
        assert!(!warnings.is_empty());
    }

    #[test]
    fn cross_srid_literal_gets_trailing_transform() {
        let s = staged(1, 10);
        let (enc, _) = choose_encoding(&s, None, None, false, 4326);
        match enc {
            SourceEncoding::Literal { sql } => assert!(sql.contains("ST_Transform(") && sql.ends_with(", 4326)")),
            _ => panic!("expected literal encoding"),
        }
    }

    #[test]
    fn adapt_filter_rewrites_own_table_column() {
        let out = adapt_filter_for_subquery("(\"public\".\"src\".\"importance\" > 5)", "src").unwrap();
        assert_eq!(out, "__source.\"importance\" > 5");
    }

    #[test]
    fn adapt_filter_rejects_other_table_reference() {
        assert!(adapt_filter_for_subquery("\"other\".\"col\" = 1", "src").is_none());
    }

    #[test]
    fn adapt_filter_rejects_nested_exists() {
        assert!(adapt_filter_for_subquery("EXISTS (SELECT 1 FROM x)", "src").is_none());
    }

    #[test]
    fn adapt_filter_balances_parens_or_rejects() {
        let adapted = adapt_filter_for_subquery("(a > 1)", "src").unwrap();
        assert_eq!(adapted.matches('(').count(), adapted.matches(')').count());
    }

    #[test]
    fn predicate_ordering_is_cost_sorted_and_deduped() {
        let ordered = order_predicates(&[
            SpatialPredicate::Contains,
            SpatialPredicate::Disjoint,
            SpatialPredicate::Contains,
            SpatialPredicate::Intersects,
        ]);
        assert_eq!(
            ordered,
            vec![
                SpatialPredicate::Disjoint,
                SpatialPredicate::Intersects,
                SpatialPredicate::Contains,
            ]
        );
    }

    #[test]
    fn predicate_ordering_is_idempotent() {
        let once = order_predicates(&[SpatialPredicate::Overlaps, SpatialPredicate::Within]);
        let twice = order_predicates(&once);
        assert_eq!(once, twice);
    }
}
