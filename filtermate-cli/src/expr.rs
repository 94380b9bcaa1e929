//! A tiny attribute-expression evaluator for [`crate::memory_host::MemoryHost`].
//!
//! The engine never asks a host to *parse* SQL (spec §1 Non-goals), only
//! to apply subset strings it builds itself. A real desktop application
//! hands those strings to its own query engine (PostgreSQL, SpatiaLite,
//! GDAL/OGR); this in-memory host has no such engine, so it needs just
//! enough of one to interpret what `filtermate-core` actually emits:
//! quoted-identifier comparisons, `IN` lists, `IS [NOT] NULL`, and the
//! `(a) AND (b)` / `(a) AND NOT (b)` / `(a) OR (b)` combinators from
//! [`filtermate_core::backend::port::resolve_old_subset`], plus the bare
//! `fid` ranges/lists [`filtermate_core::backend::ogr::build_subset_expression`]
//! emits.
//!
//! Anything outside that shape (an `ST_*` call, an `EXISTS` subquery) is
//! treated as unconditionally true: those only ever reach a SQL-backed
//! executor, never this host, and the orchestrator's own spatial pass
//! (`evaluate_spatial_predicate`) re-checks geometry regardless.

/// One feature's attribute row, as seen by an expression leaf.
pub trait Row {
    fn fid(&self) -> i64;
    fn attr(&self, name: &str) -> Option<&AttrValue>;
}

/// An attribute value a row carries.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Number(f64),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    And,
    AndNot,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Number(f64),
}

/// Evaluates `expr` against `row`. Never fails: an expression this
/// evaluator can't make sense of is treated as matching (see module docs).
#[must_use]
pub fn eval<R: Row>(expr: &str, row: &R) -> bool {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return true;
    }
    if let Some((lhs, op, rhs)) = split_top_level(trimmed) {
        return match op {
            Combinator::And => eval(lhs, row) && eval(rhs, row),
            Combinator::AndNot => eval(lhs, row) && !eval(rhs, row),
            Combinator::Or => eval(lhs, row) || eval(rhs, row),
        };
    }
    let stripped = strip_wrapping_parens(trimmed);
    if stripped != trimmed {
        return eval(stripped, row);
    }
    eval_leaf(stripped, row)
}

/// Finds the outermost `AND NOT` / `AND` / `OR` separator, ignoring
/// anything nested inside parens or a quoted string literal.
fn split_top_level(s: &str) -> Option<(&str, Combinator, &str)> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if in_quote {
            if c == b'\'' {
                in_quote = false;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' => in_quote = true,
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
        if depth == 0 {
            for (pat, op) in [(" AND NOT ", Combinator::AndNot), (" AND ", Combinator::And), (" OR ", Combinator::Or)] {
                if s[i..].starts_with(pat) {
                    let lhs = s[..i].trim();
                    let rhs = s[i + pat.len()..].trim();
                    if !lhs.is_empty() && !rhs.is_empty() {
                        return Some((lhs, op, rhs));
                    }
                }
            }
        }
        i += 1;
    }
    None
}

/// Strips one layer of parens when they wrap the whole string, not just
/// its first token (`(a) AND (b)` keeps its parens; `((a) AND (b))` loses
/// the outer pair).
fn strip_wrapping_parens(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'(') || bytes.last() != Some(&b')') {
        return s;
    }
    let mut depth = 0i32;
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
        if depth == 0 {
            return if i == bytes.len() - 1 { s[1..s.len() - 1].trim() } else { s };
        }
    }
    s
}

fn eval_leaf<R: Row>(s: &str, row: &R) -> bool {
    match s {
        "1=1" => return true,
        "1=0" => return false,
        _ => {}
    }

    let Some((column, rest)) = take_column(s) else {
        return true;
    };
    let rest = rest.trim_start();
    let current = attr_value_for(column, row);

    if let Some(list) = rest.strip_prefix_ci("IN") {
        return parse_literal_list(list.trim_start()).is_some_and(|values| in_list(current.as_ref(), &values));
    }
    if let Some(null_rest) = rest.strip_prefix_ci("IS") {
        let null_rest = null_rest.trim_start();
        if let Some(not_rest) = null_rest.strip_prefix_ci("NOT") {
            if not_rest.trim_start().eq_ignore_ascii_case("NULL") {
                return !matches!(current, None | Some(AttrValue::Null));
            }
        } else if null_rest.eq_ignore_ascii_case("NULL") {
            return matches!(current, None | Some(AttrValue::Null));
        }
        return true;
    }

    let Some((cmp, value_str)) = take_comparison(rest) else {
        return true;
    };
    let Some(literal) = parse_literal(value_str.trim()) else {
        return true;
    };
    compare(current.as_ref(), cmp, &literal)
}

/// Extracts a leading column reference: `"quoted ident"` or a bare word
/// (the unquoted `fid` the OGR executor emits).
fn take_column(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('"') {
        let end = rest.find('"')?;
        return Some((&rest[..end], &rest[end + 1..]));
    }
    let end = s.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some((&s[..end], &s[end..]))
}

fn take_comparison(s: &str) -> Option<(Comparison, &str)> {
    for (pat, cmp) in [
        (">=", Comparison::Ge),
        ("<=", Comparison::Le),
        ("<>", Comparison::Ne),
        ("!=", Comparison::Ne),
        ("=", Comparison::Eq),
        (">", Comparison::Gt),
        ("<", Comparison::Lt),
    ] {
        if let Some(rest) = s.strip_prefix(pat) {
            return Some((cmp, rest));
        }
    }
    None
}

fn parse_literal(s: &str) -> Option<Literal> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix('\'') {
        let inner = rest.strip_suffix('\'')?;
        return Some(Literal::Text(inner.to_string()));
    }
    s.parse::<f64>().ok().map(Literal::Number)
}

fn parse_literal_list(s: &str) -> Option<Vec<Literal>> {
    let inner = s.strip_prefix('(')?.strip_suffix(')')?;
    inner.split(',').map(|part| parse_literal(part.trim())).collect()
}

fn attr_value_for<R: Row>(column: &str, row: &R) -> Option<AttrValue> {
    if column.eq_ignore_ascii_case("fid") {
        return Some(AttrValue::Number(row.fid() as f64));
    }
    row.attr(column).cloned()
}

fn in_list(current: Option<&AttrValue>, values: &[Literal]) -> bool {
    values.iter().any(|v| compare(current, Comparison::Eq, v))
}

fn compare(current: Option<&AttrValue>, cmp: Comparison, target: &Literal) -> bool {
    match (current, target) {
        (Some(AttrValue::Number(n)), Literal::Number(t)) => match cmp {
            Comparison::Eq => n == t,
            Comparison::Ne => n != t,
            Comparison::Gt => n > t,
            Comparison::Lt => n < t,
            Comparison::Ge => n >= t,
            Comparison::Le => n <= t,
        },
        (Some(AttrValue::Text(s)), Literal::Text(t)) => match cmp {
            Comparison::Eq => s == t,
            Comparison::Ne => s != t,
            Comparison::Gt => s.as_str() > t.as_str(),
            Comparison::Lt => s.as_str() < t.as_str(),
            Comparison::Ge => s.as_str() >= t.as_str(),
            Comparison::Le => s.as_str() <= t.as_str(),
        },
        _ => false,
    }
}

/// Case-insensitive `strip_prefix`, for the SQL keywords (`IN`, `IS`,
/// `NOT`) this grammar cares about.
trait StripPrefixCi {
    fn strip_prefix_ci(&self, prefix: &str) -> Option<&str>;
}

impl StripPrefixCi for str {
    fn strip_prefix_ci(&self, prefix: &str) -> Option<&str> {
        if self.len() < prefix.len() {
            return None;
        }
        let (head, tail) = self.split_at(prefix.len());
        head.eq_ignore_ascii_case(prefix).then_some(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestRow {
        fid: i64,
        attrs: std::collections::HashMap<&'static str, AttrValue>,
    }

    impl Row for TestRow {
        fn fid(&self) -> i64 {
            self.fid
        }

        fn attr(&self, name: &str) -> Option<&AttrValue> {
            self.attrs.get(name)
        }
    }

    fn row(fid: i64, attrs: &[(&'static str, AttrValue)]) -> TestRow {
        TestRow {
            fid,
            attrs: attrs.iter().cloned().collect(),
        }
    }

    #[test]
    fn literal_booleans() {
        let r = row(1, &[]);
        assert!(eval("1=1", &r));
        assert!(!eval("1=0", &r));
    }

    #[test]
    fn bare_fid_comparisons() {
        let r = row(7, &[]);
        assert!(eval("fid = 7", &r));
        assert!(eval("(fid >= 1 AND fid <= 10)", &r));
        assert!(!eval("(fid >= 8 AND fid <= 10)", &r));
    }

    #[test]
    fn fid_in_list_and_range_or() {
        let r = row(9, &[]);
        assert!(eval("fid IN (1, 5, 9)", &r));
        assert!(eval("(fid >= 1 AND fid <= 3) OR fid = 9", &r));
    }

    #[test]
    fn quoted_attribute_comparison() {
        let r = row(1, &[("importance", AttrValue::Number(6.0))]);
        assert!(eval("\"importance\" > 5", &r));
        assert!(!eval("\"importance\" > 10", &r));
    }

    #[test]
    fn quoted_text_equality() {
        let r = row(1, &[("category", AttrValue::Text("road".to_string()))]);
        assert!(eval("\"category\" = 'road'", &r));
        assert!(!eval("\"category\" = 'river'", &r));
    }

    #[test]
    fn is_null_and_is_not_null() {
        let r = row(1, &[("category", AttrValue::Null)]);
        assert!(eval("\"category\" IS NULL", &r));
        assert!(!eval("\"category\" IS NOT NULL", &r));
    }

    #[test]
    fn missing_attribute_is_treated_as_null() {
        let r = row(1, &[]);
        assert!(eval("\"missing\" IS NULL", &r));
        assert!(!eval("\"missing\" = 'x'", &r));
    }

    #[test]
    fn and_combinator() {
        let r = row(1, &[("a", AttrValue::Number(1.0)), ("b", AttrValue::Number(2.0))]);
        assert!(eval("(\"a\" = 1) AND (\"b\" = 2)", &r));
        assert!(!eval("(\"a\" = 1) AND (\"b\" = 3)", &r));
    }

    #[test]
    fn and_not_combinator() {
        let r = row(1, &[("a", AttrValue::Number(1.0)), ("b", AttrValue::Number(2.0))]);
        assert!(eval("(\"a\" = 1) AND NOT (\"b\" = 3)", &r));
        assert!(!eval("(\"a\" = 1) AND NOT (\"b\" = 2)", &r));
    }

    #[test]
    fn or_combinator_nested_with_and() {
        let r = row(1, &[("a", AttrValue::Number(1.0)), ("b", AttrValue::Number(9.0))]);
        assert!(eval("(\"a\" = 1) OR (\"b\" = 2)", &r));
        assert!(eval("((\"a\" = 9) OR (\"b\" = 9))", &r));
    }

    #[test]
    fn unrecognized_shape_defaults_to_true() {
        let r = row(1, &[]);
        assert!(eval("ST_Intersects(\"geom\", ST_GeomFromText('POINT(0 0)'))", &r));
        assert!(eval("EXISTS (SELECT 1 FROM x)", &r));
    }
}
