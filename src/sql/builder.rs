//! Restricted/extended SQL validation and rewriting over a parsed
//! ClickHouse AST. Restricted mode pins the FROM to one table and rejects
//! joins; extended mode accepts any single SELECT.

use crate::error::{Error, Result};
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Ident, Query, Select, SelectItem, SetExpr,
    Statement, TableFactor, Value,
};
use sqlparser::dialect::ClickHouseDialect;
use sqlparser::parser::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Translator-emitted SQL: single table, no joins, no subqueries
    Restricted,
    /// User-authored SQL: any single SELECT
    Extended,
}

fn parse_single(sql: &str) -> Result<Statement> {
    let mut statements = Parser::parse_sql(&ClickHouseDialect {}, sql)
        .map_err(|e| Error::validation(format!("SQL parse error: {e}")))?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        0 => Err(Error::validation("empty SQL statement")),
        n => Err(Error::validation(format!(
            "expected exactly one statement, found {n}"
        ))),
    }
}

fn into_query(statement: Statement) -> Result<Box<Query>> {
    match statement {
        Statement::Query(query) => Ok(query),
        Statement::Insert { .. } => Err(Error::validation("INSERT statements are not allowed")),
        Statement::Update { .. } => Err(Error::validation("UPDATE statements are not allowed")),
        Statement::Delete { .. } => Err(Error::validation("DELETE statements are not allowed")),
        Statement::AlterTable { .. } => {
            Err(Error::validation("ALTER statements are not allowed"))
        }
        Statement::Drop { .. } => Err(Error::validation("DROP statements are not allowed")),
        Statement::Truncate { .. } => {
            Err(Error::validation("TRUNCATE statements are not allowed"))
        }
        other => Err(Error::validation(format!(
            "only SELECT statements are allowed, found {}",
            statement_name(&other)
        ))),
    }
}

fn statement_name(statement: &Statement) -> &'static str {
    match statement {
        Statement::CreateTable { .. } | Statement::CreateView { .. } => "CREATE",
        Statement::ExplainTable { .. } | Statement::Explain { .. } => "EXPLAIN",
        Statement::ShowTables { .. } | Statement::ShowColumns { .. } => "SHOW",
        _ => "a non-SELECT statement",
    }
}

fn outer_select_mut(query: &mut Query) -> Option<&mut Select> {
    match query.body.as_mut() {
        SetExpr::Select(select) => Some(select),
        SetExpr::Query(inner) => outer_select_mut(inner),
        _ => None,
    }
}

fn outer_select(query: &Query) -> Option<&Select> {
    match query.body.as_ref() {
        SetExpr::Select(select) => Some(select),
        SetExpr::Query(inner) => outer_select(inner),
        _ => None,
    }
}

fn check_restricted(query: &Query, expected_table: Option<&str>) -> Result<()> {
    if query.with.is_some() {
        return Err(Error::validation(
            "WITH clauses are not allowed in restricted mode",
        ));
    }
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => {
            return Err(Error::validation(
                "restricted mode requires a plain SELECT",
            ))
        }
    };
    if select.from.len() != 1 {
        return Err(Error::validation(
            "restricted mode requires exactly one FROM table (JOIN is not allowed)",
        ));
    }
    let from = &select.from[0];
    if !from.joins.is_empty() {
        return Err(Error::validation("JOIN is not allowed in restricted mode"));
    }
    let TableFactor::Table { name, .. } = &from.relation else {
        return Err(Error::validation(
            "subqueries in FROM are not allowed in restricted mode",
        ));
    };
    if let Some(expected) = expected_table {
        let actual: Vec<&str> = name.0.iter().map(|i| i.value.as_str()).collect();
        let expected_parts: Vec<&str> = expected.split('.').collect();
        let matches = match actual.len() {
            2 => actual == expected_parts,
            1 => expected_parts.last() == actual.last(),
            _ => false,
        };
        if !matches {
            return Err(Error::validation(format!(
                "query must read from {expected}, found {}",
                actual.join(".")
            )));
        }
    }
    Ok(())
}

/// Validate a SELECT, then set or replace its terminal LIMIT when
/// `limit > 0`. Restricted mode additionally pins the FROM table.
pub fn build_raw_query(
    sql: &str,
    limit: i64,
    mode: QueryMode,
    expected_table: Option<&str>,
) -> Result<String> {
    let mut query = into_query(parse_single(sql)?)?;
    if mode == QueryMode::Restricted {
        check_restricted(&query, expected_table)?;
    }
    if limit > 0 {
        query.limit = Some(Expr::Value(Value::Number(limit.to_string(), false)));
    }
    Ok(query.to_string())
}

/// Strip the terminal LIMIT, if any.
pub fn remove_limit(sql: &str) -> Result<String> {
    let mut query = into_query(parse_single(sql)?)?;
    query.limit = None;
    query.offset = None;
    Ok(query.to_string())
}

fn ident_is(ident: &Ident, field: &str) -> bool {
    ident.value == field
}

fn projection_has_field(select: &Select, field: &str) -> bool {
    select.projection.iter().any(|item| match item {
        SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => true,
        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => ident_is(ident, field),
        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
            parts.last().map(|i| ident_is(i, field)).unwrap_or(false)
        }
        SelectItem::ExprWithAlias {
            expr: Expr::Identifier(ident),
            ..
        } => ident_is(ident, field),
        _ => false,
    })
}

/// Guarantee the timestamp column is selectable so histogram queries can
/// bucket by it. `SELECT *` and qualified wildcards are left unchanged;
/// note a MATERIALIZED timestamp column is excluded from `*` by the
/// backend and such tables need an explicit select item upstream.
pub fn ensure_timestamp_in_select(sql: &str, ts_field: &str) -> Result<String> {
    let mut query = into_query(parse_single(sql)?)?;
    let Some(select) = outer_select_mut(&mut query) else {
        return Ok(query.to_string());
    };
    if !projection_has_field(select, ts_field) {
        select.projection.insert(
            0,
            SelectItem::UnnamedExpr(Expr::Identifier(Ident::with_quote('`', ts_field))),
        );
    }
    Ok(query.to_string())
}

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count",
    "sum",
    "avg",
    "min",
    "max",
    "any",
    "anylast",
    "uniq",
    "uniqexact",
    "uniqcombined",
    "median",
    "quantile",
    "quantiles",
    "topk",
    "grouparray",
    "groupuniqarray",
    "argmin",
    "argmax",
    "countif",
    "sumif",
    "avgif",
    "minif",
    "maxif",
];

fn expr_has_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Function(func) => {
            let name = func
                .name
                .0
                .last()
                .map(|i| i.value.to_ascii_lowercase())
                .unwrap_or_default();
            if AGGREGATE_FUNCTIONS.contains(&name.as_str()) {
                return true;
            }
            func.args.iter().any(|arg| match arg {
                FunctionArg::Named {
                    arg: FunctionArgExpr::Expr(e),
                    ..
                }
                | FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => expr_has_aggregate(e),
                _ => false,
            })
        }
        Expr::BinaryOp { left, right, .. } => {
            expr_has_aggregate(left) || expr_has_aggregate(right)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => expr_has_aggregate(expr),
        Expr::Cast { expr, .. } => expr_has_aggregate(expr),
        Expr::Tuple(items) => items.iter().any(expr_has_aggregate),
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            operand.as_deref().map(expr_has_aggregate).unwrap_or(false)
                || conditions.iter().any(expr_has_aggregate)
                || results.iter().any(expr_has_aggregate)
                || else_result.as_deref().map(expr_has_aggregate).unwrap_or(false)
        }
        _ => false,
    }
}

/// Whether the outermost projection already aggregates (or groups), so an
/// alert evaluation can use its scalar directly instead of wrapping the
/// query in a count.
pub fn has_aggregate_projection(sql: &str) -> Result<bool> {
    let query = into_query(parse_single(sql)?)?;
    let Some(select) = outer_select(&query) else {
        return Ok(false);
    };
    match &select.group_by {
        GroupByExpr::Expressions(exprs) if !exprs.is_empty() => return Ok(true),
        GroupByExpr::All => return Ok(true),
        _ => {}
    }
    Ok(select.projection.iter().any(|item| match item {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
            expr_has_aggregate(expr)
        }
        _ => false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_limit_replaces_existing() {
        let out = build_raw_query(
            "SELECT host FROM logs.events LIMIT 100000",
            1000,
            QueryMode::Extended,
            None,
        )
        .unwrap();
        assert!(out.ends_with("LIMIT 1000"), "got: {out}");
        assert!(!out.contains("100000"));
    }

    #[test]
    fn non_positive_limit_leaves_query_alone() {
        let out = build_raw_query(
            "SELECT host FROM logs.events LIMIT 7",
            0,
            QueryMode::Extended,
            None,
        )
        .unwrap();
        assert!(out.ends_with("LIMIT 7"), "got: {out}");
        let out =
            build_raw_query("SELECT host FROM logs.events", -1, QueryMode::Extended, None)
                .unwrap();
        assert!(!out.contains("LIMIT"), "got: {out}");
    }

    #[test]
    fn restricted_rejects_join() {
        let err = build_raw_query(
            "SELECT * FROM logs.events a JOIN logs.events b ON a.id = b.id",
            100,
            QueryMode::Restricted,
            Some("logs.events"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("JOIN"), "got: {err}");
    }

    #[test]
    fn restricted_rejects_wrong_table_and_subquery() {
        let err = build_raw_query(
            "SELECT * FROM other.events",
            100,
            QueryMode::Restricted,
            Some("logs.events"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("logs.events"));

        assert!(build_raw_query(
            "SELECT * FROM (SELECT 1)",
            100,
            QueryMode::Restricted,
            Some("logs.events"),
        )
        .is_err());
    }

    #[test]
    fn restricted_accepts_alias() {
        let out = build_raw_query(
            "SELECT * FROM logs.events e WHERE e.level = 'error'",
            100,
            QueryMode::Restricted,
            Some("logs.events"),
        )
        .unwrap();
        assert!(out.contains("logs.events"));
    }

    #[test]
    fn extended_accepts_cte_and_join() {
        let sql = "WITH recent AS (SELECT * FROM logs.events) \
                   SELECT a.host FROM recent a JOIN logs.meta b ON a.host = b.host";
        assert!(build_raw_query(sql, 10, QueryMode::Extended, None).is_ok());
    }

    #[test]
    fn rejects_dml_and_multi_statement() {
        assert!(build_raw_query(
            "INSERT INTO logs.events VALUES (1)",
            10,
            QueryMode::Extended,
            None
        )
        .is_err());
        assert!(build_raw_query(
            "SELECT 1; SELECT 2",
            10,
            QueryMode::Extended,
            None
        )
        .is_err());
    }

    #[test]
    fn remove_limit_strips_terminal_limit() {
        let out = remove_limit("SELECT host FROM logs.events LIMIT 50").unwrap();
        assert!(!out.contains("LIMIT"));
        // invariant: removeLimit(buildRawQuery(s, N)) == removeLimit(s)
        let built =
            build_raw_query("SELECT host FROM logs.events", 99, QueryMode::Extended, None)
                .unwrap();
        assert_eq!(
            remove_limit(&built).unwrap(),
            remove_limit("SELECT host FROM logs.events").unwrap()
        );
    }

    #[test]
    fn ensure_timestamp_injects_leading_item() {
        let out = ensure_timestamp_in_select(
            "SELECT host, status FROM logs.nginx WHERE status = 200",
            "parsed_timestamp",
        )
        .unwrap();
        assert!(
            out.starts_with("SELECT `parsed_timestamp`, host, status"),
            "got: {out}"
        );
    }

    #[test]
    fn ensure_timestamp_leaves_wildcards_and_existing() {
        let sql = "SELECT * FROM logs.events";
        assert_eq!(ensure_timestamp_in_select(sql, "ts").unwrap(), sql);

        let sql = "SELECT logs.events.* FROM logs.events";
        let out = ensure_timestamp_in_select(sql, "ts").unwrap();
        assert!(!out.contains("`ts`"));

        let sql = "SELECT ts, host FROM logs.events";
        let out = ensure_timestamp_in_select(sql, "ts").unwrap();
        assert!(out.starts_with("SELECT ts, host"));
    }

    #[test]
    fn ensure_timestamp_is_idempotent() {
        let once = ensure_timestamp_in_select(
            "SELECT host FROM logs.events",
            "ts",
        )
        .unwrap();
        let twice = ensure_timestamp_in_select(&once, "ts").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn escaped_quotes_survive_round_trips() {
        let sql = "SELECT * FROM logs.events WHERE msg = 'it''s fine'";
        let out = build_raw_query(sql, 10, QueryMode::Extended, None).unwrap();
        assert!(out.contains("it''s fine"), "got: {out}");
    }

    #[test]
    fn aggregate_detection() {
        assert!(has_aggregate_projection("SELECT count() FROM logs.events").unwrap());
        assert!(has_aggregate_projection(
            "SELECT host, count() AS c FROM logs.events GROUP BY host"
        )
        .unwrap());
        assert!(
            has_aggregate_projection("SELECT uniq(host) / 2 FROM logs.events").unwrap()
        );
        assert!(!has_aggregate_projection("SELECT host FROM logs.events").unwrap());
        assert!(
            !has_aggregate_projection("SELECT lower(host) FROM logs.events").unwrap()
        );
    }
}
