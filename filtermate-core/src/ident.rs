//! Identifier and literal safety (C1).
//!
//! All SQL text the engine builds goes through these helpers rather than
//! ad-hoc string interpolation. Quoting follows `postgres_protocol`'s own
//! escaping rules so PostgreSQL and SpatiaLite output stays consistent
//! with how the rest of the crate already escapes values for wire
//! queries.

use postgres_protocol::escape::{escape_identifier, escape_literal};

use crate::error::{EngineError, EngineResult};

/// Characters that are never legal inside an unquoted-but-validated
/// identifier: NUL terminates C strings early in both libpq and
/// SQLite's C API and must be rejected outright rather than escaped.
fn reject_nul(id: &str) -> EngineResult<()> {
    if id.contains('\0') {
        return Err(EngineError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}

/// Quotes a single identifier (table, column, view, schema name) for
/// safe interpolation into generated SQL.
pub fn quote_ident(id: &str) -> EngineResult<String> {
    reject_nul(id)?;
    Ok(escape_identifier(id))
}

/// Quotes a `schema.table`-style qualified name, quoting each part
/// independently so a schema or table containing a literal `.` cannot
/// be confused with the separator.
pub fn quote_qualified(schema: Option<&str>, table: &str) -> EngineResult<String> {
    let table = quote_ident(table)?;
    match schema {
        Some(schema) => Ok(format!("{}.{}", quote_ident(schema)?, table)),
        None => Ok(table),
    }
}

/// Escapes a string literal for interpolation into generated SQL.
pub fn escape_literal_str(value: &str) -> EngineResult<String> {
    reject_nul(value)?;
    Ok(escape_literal(value))
}

/// Formats a list of string values as a parenthesized, comma-separated
/// `IN (...)` literal list, e.g. for primary-key batches.
pub fn format_in_list_str<I, S>(values: I) -> EngineResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parts = Vec::new();
    for v in values {
        parts.push(escape_literal_str(v.as_ref())?);
    }
    Ok(format!("({})", parts.join(", ")))
}

/// Formats a list of numeric primary keys as an `IN (...)` literal list.
/// Numeric keys never need escaping, only a shared, safe `Display`.
#[must_use]
pub fn format_in_list_numeric<I>(values: I) -> String
where
    I: IntoIterator<Item = i64>,
{
    let parts: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(", "))
}

/// Heuristic used when a layer's primary-key type wasn't reported by the
/// host: an identifier named `id`, `ogc_fid`, `fid`, `gid`, `objectid` or
/// ending in `_id` is treated as numeric for batching purposes.
#[must_use]
pub fn detect_pk_numeric(pk_name: &str) -> bool {
    let lower = pk_name.to_lowercase();
    matches!(lower.as_str(), "id" | "ogc_fid" | "fid" | "gid" | "objectid") || lower.ends_with("_id")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_identifier() {
        assert_eq!(quote_ident("roads").unwrap(), "\"roads\"");
    }

    #[test]
    fn quotes_identifier_with_embedded_quote() {
        assert_eq!(quote_ident("weird\"name").unwrap(), "\"weird\"\"name\"");
    }

    #[test]
    fn rejects_nul_byte() {
        assert!(quote_ident("bad\0name").is_err());
    }

    #[test]
    fn qualified_name_quotes_both_parts() {
        assert_eq!(
            quote_qualified(Some("public"), "roads").unwrap(),
            "\"public\".\"roads\""
        );
        assert_eq!(quote_qualified(None, "roads").unwrap(), "\"roads\"");
    }

    #[test]
    fn escapes_literal_with_quote() {
        assert_eq!(escape_literal_str("O'Brien").unwrap(), "'O''Brien'");
    }

    #[test]
    fn formats_in_list() {
        assert_eq!(
            format_in_list_str(["a", "b"]).unwrap(),
            "('a', 'b')"
        );
        assert_eq!(format_in_list_numeric([1, 2, 3]), "(1, 2, 3)");
    }

    #[test]
    fn detects_numeric_pk_names() {
        assert!(detect_pk_numeric("id"));
        assert!(detect_pk_numeric("ogc_fid"));
        assert!(detect_pk_numeric("parcel_id"));
        assert!(!detect_pk_numeric("uuid"));
    }
}
