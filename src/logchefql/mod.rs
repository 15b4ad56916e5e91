//! LogchefQL: the log filter DSL
//!
//! Whitespace-separated clauses AND together; `and`/`or` keywords and
//! parenthesised groups are supported. Each clause is `field OP rhs` with
//! OP in `=, !=, ~, !~, >, >=, <, <=, in, not in, exists, not exists`.
//! Translation targets a ClickHouse WHERE fragment or a VictoriaLogs
//! LogsQL filter.

mod clickhouse;
mod lexer;
mod logsql;
mod parser;

pub use parser::{Clause, CompareOp, Expr, FieldPath, Value};

use crate::error::{Error, ErrorDetail};
use crate::models::Schema;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error as ThisError;

/// Why a query failed to translate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Lexical or grammatical failure
    Syntax,
    /// Field unknown to the provided schema
    Schema,
}

#[derive(Debug, Clone, ThisError)]
#[error("{message} at line {line}, column {col}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn syntax(line: usize, col: usize, message: impl Into<String>) -> Self {
        ParseError {
            kind: ParseErrorKind::Syntax,
            line,
            col,
            message: message.into(),
        }
    }

    pub(crate) fn schema(line: usize, col: usize, message: impl Into<String>) -> Self {
        ParseError {
            kind: ParseErrorKind::Schema,
            line,
            col,
            message: message.into(),
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        let detail = ErrorDetail {
            field: None,
            line: Some(err.line),
            col: Some(err.col),
            message: err.message.clone(),
        };
        Error::validation_with(err.to_string(), vec![detail])
    }
}

/// Result of translating a LogchefQL expression
#[derive(Debug, Clone, Default)]
pub struct Translation {
    /// Boolean fragment safe to interpolate after WHERE; empty for empty input
    pub sql: String,
    /// Individual clause renderings in source order
    pub conditions: Vec<String>,
    /// Base column names referenced, in first-use order
    pub fields_used: Vec<String>,
}

/// Lex and parse only; no schema binding.
pub fn validate(query: &str) -> Result<(), ParseError> {
    parser::parse(query).map(|_| ())
}

/// Translate to a ClickHouse boolean expression.
pub fn translate(query: &str, schema: Option<&Schema>) -> Result<Translation, ParseError> {
    match parser::parse(query)? {
        None => Ok(Translation::default()),
        Some(expr) => clickhouse::emit(&expr, schema),
    }
}

/// Translate to a VictoriaLogs LogsQL filter.
pub fn translate_to_logsql(
    query: &str,
    schema: Option<&Schema>,
) -> Result<Translation, ParseError> {
    match parser::parse(query)? {
        None => Ok(Translation::default()),
        Some(expr) => logsql::emit(&expr, schema),
    }
}

/// Inputs for assembling a complete SELECT around a translated filter
#[derive(Debug, Clone)]
pub struct FullQueryParams<'a> {
    pub database: &'a str,
    pub table: &'a str,
    pub timestamp_field: &'a str,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timezone: &'a str,
    pub limit: u32,
    /// Already-translated boolean fragment; empty means no extra filter
    pub condition: &'a str,
}

pub(crate) fn resolve_timezone(timezone: &str) -> crate::Result<Tz> {
    let name = if timezone.is_empty() { "UTC" } else { timezone };
    name.parse::<Tz>()
        .map_err(|_| Error::validation(format!("unknown timezone: {name}")))
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn format_local(ts: DateTime<Utc>, tz: &Tz) -> String {
    ts.with_timezone(tz).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Assemble `SELECT * FROM db.table WHERE ts BETWEEN ... ORDER BY ts DESC LIMIT n`.
pub fn build_full_query(p: &FullQueryParams<'_>) -> crate::Result<String> {
    let tz = resolve_timezone(p.timezone)?;
    let ts = quote_ident(p.timestamp_field);
    let mut sql = format!(
        "SELECT * FROM {}.{} WHERE {} BETWEEN toDateTime('{}','{}') AND toDateTime('{}','{}')",
        quote_ident(p.database),
        quote_ident(p.table),
        ts,
        format_local(p.start, &tz),
        tz.name(),
        format_local(p.end, &tz),
        tz.name(),
    );
    if !p.condition.is_empty() {
        sql.push_str(&format!(" AND ({})", p.condition));
    }
    sql.push_str(&format!(" ORDER BY {} DESC LIMIT {}", ts, p.limit));
    Ok(sql)
}

/// Inputs for assembling a complete LogsQL query
#[derive(Debug, Clone)]
pub struct FullLogsQueryParams<'a> {
    pub stream_selector: Option<&'a str>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: u32,
    /// Already-translated LogsQL filter; empty means match-all
    pub condition: &'a str,
}

/// Assemble `_time:[start, end] AND (...) | sort by (_time desc) | limit n`.
pub fn build_full_logsql_query(p: &FullLogsQueryParams<'_>) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(selector) = p.stream_selector {
        if !selector.is_empty() {
            parts.push(selector.to_string());
        }
    }
    parts.push(format!(
        "_time:[{}, {}]",
        p.start.format("%Y-%m-%dT%H:%M:%SZ"),
        p.end.format("%Y-%m-%dT%H:%M:%SZ"),
    ));
    if !p.condition.is_empty() {
        parts.push(format!("AND ({})", p.condition));
    }
    format!(
        "{} | sort by (_time desc) | limit {}",
        parts.join(" "),
        p.limit
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn full_query_matches_expected_shape() {
        let translated = translate(r#"level="error" and service="api""#, None).unwrap();
        let sql = build_full_query(&FullQueryParams {
            database: "logs",
            table: "events",
            timestamp_field: "ts",
            start: t(2024, 1, 1, 0),
            end: t(2024, 1, 1, 1),
            timezone: "UTC",
            limit: 500,
            condition: &translated.sql,
        })
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM `logs`.`events` WHERE `ts` BETWEEN \
             toDateTime('2024-01-01 00:00:00','UTC') AND toDateTime('2024-01-01 01:00:00','UTC') \
             AND (`level`='error' AND `service`='api') ORDER BY `ts` DESC LIMIT 500"
        );
    }

    #[test]
    fn full_query_without_condition_has_no_and_group() {
        let sql = build_full_query(&FullQueryParams {
            database: "logs",
            table: "events",
            timestamp_field: "ts",
            start: t(2024, 1, 1, 0),
            end: t(2024, 1, 1, 1),
            timezone: "UTC",
            limit: 100,
            condition: "",
        })
        .unwrap();
        assert!(!sql.contains("AND ("));
        assert!(sql.ends_with("ORDER BY `ts` DESC LIMIT 100"));
    }

    #[test]
    fn full_query_rejects_unknown_timezone() {
        let err = build_full_query(&FullQueryParams {
            database: "logs",
            table: "events",
            timestamp_field: "ts",
            start: t(2024, 1, 1, 0),
            end: t(2024, 1, 1, 1),
            timezone: "Mars/Olympus",
            limit: 100,
            condition: "",
        })
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn full_logsql_query_shape() {
        let translated = translate_to_logsql(r#"level="error""#, None).unwrap();
        let q = build_full_logsql_query(&FullLogsQueryParams {
            stream_selector: Some(r#"{app="nginx"}"#),
            start: t(2024, 1, 1, 0),
            end: t(2024, 1, 1, 1),
            limit: 200,
            condition: &translated.sql,
        });
        assert_eq!(
            q,
            r#"{app="nginx"} _time:[2024-01-01T00:00:00Z, 2024-01-01T01:00:00Z] AND (level:="error") | sort by (_time desc) | limit 200"#
        );
    }

    #[test]
    fn empty_input_translates_to_empty_fragment() {
        let tr = translate("  ", None).unwrap();
        assert!(tr.sql.is_empty());
        assert!(tr.conditions.is_empty());
        let tr = translate_to_logsql("", None).unwrap();
        assert!(tr.sql.is_empty());
    }
}
