//! Query optimizer & rewriter (C6).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Coarse classification of a predicate's shape (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Select,
    Spatial,
    Aggregate,
    Subquery,
}

/// Result of [`analyze`] (spec §4.6 `QueryAnalysis`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub query_type: QueryType,
    pub estimated_complexity: u8,
    pub uses_spatial_index: bool,
    pub uses_btree_index: bool,
    pub has_subquery: bool,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

static SPATIAL_FN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bST_[A-Za-z]+\(").expect("static regex"));
static AGGREGATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(count|sum|avg|min|max)\s*\(").expect("static regex"));
static SUBQUERY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bSELECT\b").expect("static regex"));
static INDEXED_SPATIAL_PREDICATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bST_(Intersects|DWithin|Contains|Within|Crosses|Touches|Overlaps)\(").expect("static regex")
});
static LEADING_WILDCARD_LIKE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIKE\s+'%").expect("static regex"));
static IN_LITERAL_LIST_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bIN\s*\(([^)]*)\)").expect("static regex"));
static NOT_EQUAL_NULL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\S+)\s*(!=|<>)\s*NULL\b").expect("static regex"));
static EQUAL_NULL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\S+)\s*=\s*NULL\b").expect("static regex"));
static ST_DISTANCE_LT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ST_Distance\(([^,]+),\s*([^)]+)\)\s*<\s*([0-9.]+)").expect("static regex"));

/// Analyzes a SQL-ish predicate fragment, producing a shallow
/// classification plus index-usage/index-suggestion hints.
#[must_use]
pub fn analyze(sql: &str) -> QueryAnalysis {
    let has_spatial = SPATIAL_FN_RE.is_match(sql);
    let has_aggregate = AGGREGATE_RE.is_match(sql);
    let select_count = SUBQUERY_RE.find_iter(sql).count();
    let has_subquery = select_count > 1 || (select_count == 1 && sql.trim_start().to_uppercase().find("SELECT") != Some(0));

    let query_type = if has_subquery {
        QueryType::Subquery
    } else if has_spatial {
        QueryType::Spatial
    } else if has_aggregate {
        QueryType::Aggregate
    } else {
        QueryType::Select
    };

    let uses_spatial_index = INDEXED_SPATIAL_PREDICATE_RE.is_match(sql);
    let uses_btree_index = !has_spatial && (sql.contains('=') || sql.contains('<') || sql.contains('>'));

    let mut warnings = Vec::new();
    let mut suggestions = Vec::new();

    if LEADING_WILDCARD_LIKE_RE.is_match(sql) {
        warnings.push("LIKE pattern starts with a wildcard; this cannot use a btree index".to_string());
    }

    for caps in IN_LITERAL_LIST_RE.captures_iter(sql) {
        let count = caps[1].split(',').filter(|s| !s.trim().is_empty()).count();
        if count > 100 {
            warnings.push("consider temp table".to_string());
        }
    }

    let spatial_count = SPATIAL_FN_RE.find_iter(sql).count();
    let estimated_complexity = (1 + spatial_count + usize::from(has_subquery) * 3).min(10) as u8;

    if has_spatial && !uses_spatial_index {
        suggestions.push("no indexable spatial predicate recognized; consider ST_Intersects/ST_DWithin".to_string());
    }

    QueryAnalysis {
        query_type,
        estimated_complexity,
        uses_spatial_index,
        uses_btree_index,
        has_subquery,
        warnings,
        suggestions,
    }
}

/// Rewrites a predicate into more index-friendly forms (spec §4.6):
/// `ST_Distance(a,b) < k` → `ST_DWithin(a,b,k)`;
/// `col != NULL`/`col <> NULL` → `col IS NOT NULL`; `col = NULL` → `col IS NULL`.
#[must_use]
pub fn optimize(sql: &str) -> String {
    let rewritten = ST_DISTANCE_LT_RE.replace_all(sql, "ST_DWithin($1, $2, $3)");
    let rewritten = NOT_EQUAL_NULL_RE.replace_all(&rewritten, "$1 IS NOT NULL");
    let rewritten = EQUAL_NULL_RE.replace_all(&rewritten, "$1 IS NULL");
    rewritten.into_owned()
}

/// Suggests index-creation statements for spatial and equality/range
/// predicates found in `sql` against `table` (spec §4.6).
#[must_use]
pub fn suggest_indexes(sql: &str, table: &str) -> Vec<String> {
    let mut suggestions = Vec::new();
    let arg_re = Regex::new(r"\bST_(?:Intersects|DWithin|Contains|Within|Crosses|Touches|Overlaps)\(\s*([A-Za-z_][A-Za-z0-9_]*)").expect("static regex");
    for caps in arg_re.captures_iter(sql) {
        let col = &caps[1];
        suggestions.push(format!("CREATE INDEX ON \"{table}\" USING GIST(\"{col}\")"));
    }

    let eq_re = Regex::new(r#""?([A-Za-z_][A-Za-z0-9_]*)"?\s*(?:=|<|>|<=|>=)\s*"#).expect("static regex");
    for caps in eq_re.captures_iter(sql) {
        let col = &caps[1];
        if !suggestions.iter().any(|s: &String| s.contains(col)) {
            suggestions.push(format!("CREATE INDEX ON \"{table}\" (\"{col}\")"));
        }
    }

    suggestions
}

/// Planner-facing cost estimate: `(startup_cost, total_cost)` from
/// PostgreSQL's planner, or `(0.0, 0.0)` when unavailable (spec §4.6:
/// this must never block the caller on a connection problem).
#[cfg(feature = "postgres")]
pub async fn estimate_cost(sql: &str, pool: &crate::pool::pg::PgPool) -> (f64, f64) {
    let Ok(client) = pool.get().await else {
        return (0.0, 0.0);
    };
    let explain_sql = format!("EXPLAIN (FORMAT JSON, ANALYZE false) {sql}");
    let Ok(row) = client.query_one(explain_sql.as_str(), &[]).await else {
        return (0.0, 0.0);
    };
    let plan: serde_json::Value = row.get(0);
    let node = &plan[0]["Plan"];
    let startup = node["Startup Cost"].as_f64().unwrap_or(0.0);
    let total = node["Total Cost"].as_f64().unwrap_or(0.0);
    (startup, total)
}

/// Planner-facing row-count estimate from the same `EXPLAIN` output
/// (spec §4.6).
#[cfg(feature = "postgres")]
pub async fn estimate_row_count(sql: &str, pool: &crate::pool::pg::PgPool) -> u64 {
    let Ok(client) = pool.get().await else {
        return 0;
    };
    let explain_sql = format!("EXPLAIN (FORMAT JSON, ANALYZE false) {sql}");
    let Ok(row) = client.query_one(explain_sql.as_str(), &[]).await else {
        return 0;
    };
    let plan: serde_json::Value = row.get(0);
    plan[0]["Plan"]["Plan Rows"].as_u64().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_distance_to_dwithin() {
        let out = optimize("ST_Distance(a, b) < 100");
        assert_eq!(out, "ST_DWithin(a, b, 100)");
    }

    #[test]
    fn rewrites_not_equal_null() {
        assert_eq!(optimize("\"col\" != NULL"), "\"col\" IS NOT NULL");
        assert_eq!(optimize("\"col\" <> NULL"), "\"col\" IS NOT NULL");
    }

    #[test]
    fn rewrites_equal_null() {
        assert_eq!(optimize("\"col\" = NULL"), "\"col\" IS NULL");
    }

    #[test]
    fn leading_wildcard_like_warns_without_rewrite() {
        let analysis = analyze("name LIKE '%foo'");
        assert!(!analysis.warnings.is_empty());
    }

    #[test]
    fn large_in_list_warns() {
        let list: Vec<String> = (0..150).map(|i| i.to_string()).collect();
        let sql = format!("id IN ({})", list.join(", "));
        let analysis = analyze(&sql);
        assert!(analysis.warnings.iter().any(|w| w.contains("temp table")));
    }

    #[test]
    fn suggests_gist_index_for_spatial_predicate() {
        let suggestions = suggest_indexes("ST_Intersects(geom, x)", "buildings");
        assert!(suggestions.iter().any(|s| s.contains("GIST")));
    }

    #[test]
    fn classifies_spatial_query() {
        let analysis = analyze("ST_Intersects(geom, x)");
        assert_eq!(analysis.query_type, QueryType::Spatial);
    }
}
