//! SQL text helpers for turning compiled queries into PostGIS subqueries.
use crate::geometry::{to_ewkb, to_hex};
use crate::query::{CompiledQuery, SqlParam, Value};
use crate::Error;

/// Alias the wrapped subquery is exposed under.
pub const SUBQUERY_ALIAS: &str = "geoquery_table";

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Renders a scalar as a PostgreSQL literal.
pub fn quote_literal(value: &Value) -> String {
    match value {
        Value::Null => String::from("NULL"),
        Value::Bool(true) => String::from("TRUE"),
        Value::Bool(false) => String::from("FALSE"),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => format!("{:?}", f),
        Value::Float(f) => format!("'{}'::float8", f),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bytes(b) => format!("'\\x{}'::bytea", to_hex(b)),
    }
}

/// Renders a geometry parameter as an inline EWKB constructor.
pub fn geometry_literal(wkb: &[u8], srid: i32) -> Result<String, Error> {
    let ewkb = to_ewkb(wkb, srid)?;
    Ok(format!("ST_GeomFromEWKB('\\x{}'::bytea)", to_hex(&ewkb)))
}

/// Replaces each `$n` placeholder outside of quoted literals and identifiers
/// with whatever `replace(n)` returns.
pub fn rewrite_placeholders<F>(sql: &str, mut replace: F) -> Result<String, Error>
where
    F: FnMut(usize) -> Result<String, Error>,
{
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), c) => out.push(c),
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                out.push(c);
            }
            (None, '$') if chars.peek().map_or(false, char::is_ascii_digit) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                let index = digits
                    .parse::<usize>()
                    .map_err(|_| Error::InvalidOption(format!("${}", digits)))?;
                out.push_str(&replace(index)?);
            }
            (None, c) => out.push(c),
        }
    }

    Ok(out)
}

/// Inlines every bound parameter into the SQL text.
pub fn substitute_params(query: &CompiledQuery) -> Result<String, Error> {
    let bound = query.params.len();
    rewrite_placeholders(&query.sql, |index| {
        let param = index
            .checked_sub(1)
            .and_then(|i| query.params.get(i))
            .ok_or(Error::MissingParameter { index, bound })?;
        match param {
            SqlParam::Scalar(value) => Ok(quote_literal(value)),
            SqlParam::Geometry { wkb, srid } => geometry_literal(wkb, *srid),
        }
    })
}

/// Wraps a compiled query as a named subquery usable in place of a table.
pub fn as_subquery(query: &CompiledQuery) -> Result<String, Error> {
    let sql = substitute_params(query)?;
    Ok(format!("({}) as {}", sql, SUBQUERY_ALIAS))
}

/// Whether a table-level extent estimate can't be trusted for this SQL, so the
/// extent must be computed over the subquery itself.
///
/// This is a substring heuristic, not a parse.
pub fn needs_subquery_extent(sql: &str) -> bool {
    let lower = sql.to_lowercase();
    lower.contains("where") || lower.matches("from").count() > 1
}

/// Pulls the table name out of the last ` from ` clause.
pub fn table_from_sql(sql: &str) -> String {
    let lower = sql.to_ascii_lowercase();
    let start = match lower.rfind(" from ") {
        Some(idx) => idx + " from ".len(),
        None => return sql.to_string(),
    };

    let rest = sql[start..].trim_start_matches(' ');
    let end = rest.find(&[' ', ')', ','][..]).unwrap_or(rest.len());
    rest[..end].to_string()
}
