//! VictoriaLogs LogsQL emission for parsed LogchefQL expressions.
//! Field names pass through verbatim; VictoriaLogs accepts dotted names.

use super::parser::{Clause, CompareOp, Expr, Value};
use super::{ParseError, Translation};
use crate::models::Schema;

fn escape_dq(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", escape_dq(s))
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Str(s) | Value::Bare(s) => quoted(s),
        Value::Number(n) => n.clone(),
        Value::List(items) => items
            .iter()
            .map(render_scalar)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn check_schema(clause: &Clause, schema: Option<&Schema>) -> Result<(), ParseError> {
    let Some(schema) = schema else { return Ok(()) };
    // dotted names may be literal VictoriaLogs fields, so try the raw name first
    if schema.has_column(&clause.field.raw) || schema.has_column(&clause.field.base) {
        return Ok(());
    }
    Err(ParseError::schema(
        clause.line,
        clause.col,
        format!("unknown field '{}'", clause.field.base),
    ))
}

fn render_clause(clause: &Clause, schema: Option<&Schema>) -> Result<String, ParseError> {
    check_schema(clause, schema)?;
    let field = clause.field.raw.as_str();
    let value = clause.value.as_ref();
    let required = || {
        value.ok_or_else(|| {
            ParseError::syntax(clause.line, clause.col, "operator requires a value")
        })
    };

    let rendered = match clause.op {
        CompareOp::Eq => format!("{field}:={}", render_scalar(required()?)),
        CompareOp::Neq => format!("!{field}:={}", render_scalar(required()?)),
        CompareOp::Regex => format!("{field}:~{}", pattern(clause)?),
        CompareOp::NotRegex => format!("!{field}:~{}", pattern(clause)?),
        CompareOp::Gt => format!("{field}:>{}", render_scalar(required()?)),
        CompareOp::Gte => format!("{field}:>={}", render_scalar(required()?)),
        CompareOp::Lt => format!("{field}:<{}", render_scalar(required()?)),
        CompareOp::Lte => format!("{field}:<={}", render_scalar(required()?)),
        CompareOp::In => format!("{field}:in({})", render_scalar(required()?)),
        CompareOp::NotIn => format!("!{field}:in({})", render_scalar(required()?)),
        CompareOp::Exists => format!("{field}:*"),
        CompareOp::NotExists => format!("!{field}:*"),
    };
    Ok(rendered)
}

fn pattern(clause: &Clause) -> Result<String, ParseError> {
    match clause.value.as_ref() {
        Some(Value::Str(s)) | Some(Value::Bare(s)) => Ok(quoted(s)),
        _ => Err(ParseError::syntax(
            clause.line,
            clause.col,
            "regex operator needs a string pattern",
        )),
    }
}

struct Emitter<'a> {
    schema: Option<&'a Schema>,
    conditions: Vec<String>,
    fields_used: Vec<String>,
}

impl<'a> Emitter<'a> {
    fn walk(&mut self, expr: &Expr, out: &mut String, in_and: bool) -> Result<(), ParseError> {
        match expr {
            Expr::Clause(clause) => {
                let filter = render_clause(clause, self.schema)?;
                if !self.fields_used.contains(&clause.field.base) {
                    self.fields_used.push(clause.field.base.clone());
                }
                self.conditions.push(filter.clone());
                out.push_str(&filter);
            }
            Expr::And(left, right) => {
                self.walk(left, out, true)?;
                out.push_str(" AND ");
                self.walk(right, out, true)?;
            }
            Expr::Or(left, right) => {
                if in_and {
                    out.push('(');
                }
                self.walk(left, out, false)?;
                out.push_str(" OR ");
                self.walk(right, out, false)?;
                if in_and {
                    out.push(')');
                }
            }
            Expr::Group(inner) => {
                out.push('(');
                self.walk(inner, out, false)?;
                out.push(')');
            }
        }
        Ok(())
    }
}

pub(super) fn emit(expr: &Expr, schema: Option<&Schema>) -> Result<Translation, ParseError> {
    let mut emitter = Emitter {
        schema,
        conditions: Vec::new(),
        fields_used: Vec::new(),
    };
    let mut filter = String::new();
    emitter.walk(expr, &mut filter, false)?;
    Ok(Translation {
        sql: filter,
        conditions: emitter.conditions,
        fields_used: emitter.fields_used,
    })
}

#[cfg(test)]
mod tests {
    use super::super::translate_to_logsql;
    use crate::models::{Column, Schema};

    #[test]
    fn eq_and_neq() {
        let tr = translate_to_logsql(r#"level="error" and service!="api""#, None).unwrap();
        assert_eq!(tr.sql, r#"level:="error" AND !service:="api""#);
    }

    #[test]
    fn ranges_and_regex() {
        let tr = translate_to_logsql(r#"status>=500 path~"^/api""#, None).unwrap();
        assert_eq!(tr.sql, r#"status:>=500 AND path:~"^/api""#);
    }

    #[test]
    fn sets_and_presence() {
        let tr =
            translate_to_logsql(r#"host in (web-1, web-2) trace_id not exists"#, None).unwrap();
        assert_eq!(tr.sql, r#"host:in("web-1", "web-2") AND !trace_id:*"#);
    }

    #[test]
    fn or_groups_keep_parens() {
        let tr = translate_to_logsql(r#"a="1" and (b="2" or c="3")"#, None).unwrap();
        assert_eq!(tr.sql, r#"a:="1" AND (b:="2" OR c:="3")"#);
    }

    #[test]
    fn dotted_fields_pass_through() {
        let tr = translate_to_logsql(r#"kubernetes.pod_name="api-0""#, None).unwrap();
        assert_eq!(tr.sql, r#"kubernetes.pod_name:="api-0""#);
    }

    #[test]
    fn schema_checks_raw_then_base() {
        let schema = Schema {
            columns: vec![Column {
                name: "kubernetes.pod_name".to_string(),
                column_type: "String".to_string(),
            }],
            ..Default::default()
        };
        assert!(
            translate_to_logsql(r#"kubernetes.pod_name="api-0""#, Some(&schema)).is_ok()
        );
        assert!(translate_to_logsql(r#"nope="x""#, Some(&schema)).is_err());
    }

    #[test]
    fn quotes_are_escaped() {
        let tr = translate_to_logsql(r#"msg="say \"hi\"""#, None).unwrap();
        assert_eq!(tr.sql, r#"msg:="say \"hi\"""#);
    }
}
