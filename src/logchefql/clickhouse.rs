//! ClickHouse SQL emission for parsed LogchefQL expressions.

use super::parser::{Clause, CompareOp, Expr, FieldPath, Value};
use super::{quote_ident, ParseError, Translation};
use crate::models::Schema;

/// How a field reference maps onto the table
enum Binding {
    Column(String),
    MapKey { column: String, key: String },
    JsonPath { column: String, path: Vec<String> },
}

fn bind(field: &FieldPath, schema: Option<&Schema>, line: usize, col: usize) -> Result<Binding, ParseError> {
    if let Some(schema) = schema {
        let Some(column_type) = schema.column_type(&field.base) else {
            return Err(ParseError::schema(
                line,
                col,
                format!("unknown field '{}'", field.base),
            ));
        };
        if field.path.is_empty() {
            return Ok(Binding::Column(field.base.clone()));
        }
        if column_type.starts_with("Map(") {
            return Ok(Binding::MapKey {
                column: field.base.clone(),
                key: field.path.join("."),
            });
        }
        return Ok(Binding::JsonPath {
            column: field.base.clone(),
            path: field.path.clone(),
        });
    }
    if field.path.is_empty() {
        Ok(Binding::Column(field.base.clone()))
    } else {
        Ok(Binding::JsonPath {
            column: field.base.clone(),
            path: field.path.clone(),
        })
    }
}

fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn string_literal(s: &str) -> String {
    format!("'{}'", escape_string(s))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Str(s) | Value::Bare(s) => string_literal(s),
        Value::Number(n) => n.clone(),
        Value::List(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn value_is_numeric(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::List(items) => !items.is_empty() && items.iter().all(value_is_numeric),
        _ => false,
    }
}

fn render_lhs(binding: &Binding, numeric: bool) -> String {
    match binding {
        Binding::Column(name) => quote_ident(name),
        Binding::MapKey { column, key } => {
            format!("{}[{}]", quote_ident(column), string_literal(key))
        }
        Binding::JsonPath { column, path } => {
            let keys = path
                .iter()
                .map(|k| string_literal(k))
                .collect::<Vec<_>>()
                .join(", ");
            if numeric {
                format!("JSONExtractFloat({}, {})", quote_ident(column), keys)
            } else {
                format!("JSONExtractString({}, {})", quote_ident(column), keys)
            }
        }
    }
}

fn render_clause(clause: &Clause, schema: Option<&Schema>) -> Result<String, ParseError> {
    let binding = bind(&clause.field, schema, clause.line, clause.col)?;
    let numeric = clause.value.as_ref().is_some_and(value_is_numeric);
    let lhs = render_lhs(&binding, numeric);

    let rendered = match clause.op {
        CompareOp::Eq => format!("{lhs}={}", render_value(required(clause)?)),
        CompareOp::Neq => format!("{lhs}!={}", render_value(required(clause)?)),
        CompareOp::Gt => format!("{lhs}>{}", render_value(required(clause)?)),
        CompareOp::Gte => format!("{lhs}>={}", render_value(required(clause)?)),
        CompareOp::Lt => format!("{lhs}<{}", render_value(required(clause)?)),
        CompareOp::Lte => format!("{lhs}<={}", render_value(required(clause)?)),
        CompareOp::Regex => format!("match({lhs}, {})", pattern_literal(clause)?),
        CompareOp::NotRegex => format!("NOT match({lhs}, {})", pattern_literal(clause)?),
        CompareOp::In => format!("{lhs} IN ({})", render_value(required(clause)?)),
        CompareOp::NotIn => format!("{lhs} NOT IN ({})", render_value(required(clause)?)),
        CompareOp::Exists => match &binding {
            Binding::Column(_) => format!("{lhs} IS NOT NULL"),
            Binding::MapKey { column, key } => {
                format!("mapContains({}, {})", quote_ident(column), string_literal(key))
            }
            Binding::JsonPath { column, path } => json_has(column, path),
        },
        CompareOp::NotExists => match &binding {
            Binding::Column(_) => format!("{lhs} IS NULL"),
            Binding::MapKey { column, key } => format!(
                "NOT mapContains({}, {})",
                quote_ident(column),
                string_literal(key)
            ),
            Binding::JsonPath { column, path } => format!("NOT {}", json_has(column, path)),
        },
    };
    Ok(rendered)
}

fn json_has(column: &str, path: &[String]) -> String {
    let keys = path
        .iter()
        .map(|k| string_literal(k))
        .collect::<Vec<_>>()
        .join(", ");
    format!("JSONHas({}, {})", quote_ident(column), keys)
}

fn required(clause: &Clause) -> Result<&Value, ParseError> {
    clause.value.as_ref().ok_or_else(|| {
        ParseError::syntax(clause.line, clause.col, "operator requires a value")
    })
}

fn pattern_literal(clause: &Clause) -> Result<String, ParseError> {
    match required(clause)? {
        Value::Str(s) | Value::Bare(s) => Ok(string_literal(s)),
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
                let sql = render_clause(clause, self.schema)?;
                if !self.fields_used.contains(&clause.field.base) {
                    self.fields_used.push(clause.field.base.clone());
                }
                self.conditions.push(sql.clone());
                out.push_str(&sql);
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
    let mut sql = String::new();
    emitter.walk(expr, &mut sql, false)?;
    Ok(Translation {
        sql,
        conditions: emitter.conditions,
        fields_used: emitter.fields_used,
    })
}

#[cfg(test)]
mod tests {
    use super::super::translate;
    use crate::models::{Column, Schema};

    fn schema(cols: &[(&str, &str)]) -> Schema {
        Schema {
            columns: cols
                .iter()
                .map(|(n, t)| Column {
                    name: n.to_string(),
                    column_type: t.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn simple_and_chain() {
        let tr = translate(r#"level="error" and service="api""#, None).unwrap();
        assert_eq!(tr.sql, "`level`='error' AND `service`='api'");
        assert_eq!(tr.conditions.len(), 2);
        assert_eq!(tr.fields_used, vec!["level", "service"]);
    }

    #[test]
    fn or_inside_and_is_parenthesised() {
        let tr = translate(r#"service="api" and (level="error" or level="warn")"#, None).unwrap();
        assert_eq!(
            tr.sql,
            "`service`='api' AND (`level`='error' OR `level`='warn')"
        );
    }

    #[test]
    fn numeric_and_range_operators() {
        let tr = translate("status>=500 latency<1.5", None).unwrap();
        assert_eq!(tr.sql, "`status`>=500 AND `latency`<1.5");
    }

    #[test]
    fn regex_uses_match() {
        let tr = translate(r#"path~"^/api/v1" method!~"GET|HEAD""#, None).unwrap();
        assert_eq!(
            tr.sql,
            "match(`path`, '^/api/v1') AND NOT match(`method`, 'GET|HEAD')"
        );
    }

    #[test]
    fn in_lists_mix_types() {
        let tr = translate(r#"status in (500, 502) host not in (web-1, "web 2")"#, None).unwrap();
        assert_eq!(
            tr.sql,
            "`status` IN (500,502) AND `host` NOT IN ('web-1','web 2')"
        );
    }

    #[test]
    fn exists_on_plain_column() {
        let tr = translate("trace_id exists span_id not exists", None).unwrap();
        assert_eq!(
            tr.sql,
            "`trace_id` IS NOT NULL AND `span_id` IS NULL"
        );
    }

    #[test]
    fn map_columns_use_bracket_access() {
        let s = schema(&[("labels", "Map(String, String)"), ("ts", "DateTime")]);
        let tr = translate(r#"labels.region="eu-west""#, Some(&s)).unwrap();
        assert_eq!(tr.sql, "`labels`['region']='eu-west'");

        let tr = translate("labels.region exists", Some(&s)).unwrap();
        assert_eq!(tr.sql, "mapContains(`labels`, 'region')");
    }

    #[test]
    fn json_columns_pick_extractor_by_rhs_shape() {
        let s = schema(&[("payload", "String")]);
        let tr = translate(r#"payload.user.name="ada""#, Some(&s)).unwrap();
        assert_eq!(
            tr.sql,
            "JSONExtractString(`payload`, 'user', 'name')='ada'"
        );
        let tr = translate("payload.retries>3", Some(&s)).unwrap();
        assert_eq!(tr.sql, "JSONExtractFloat(`payload`, 'retries')>3");
    }

    #[test]
    fn unknown_field_fails_with_schema() {
        let s = schema(&[("level", "String")]);
        let err = translate(r#"serv="api""#, Some(&s)).unwrap_err();
        assert_eq!(err.kind, super::super::ParseErrorKind::Schema);
        assert!(err.message.contains("serv"));
        // without a schema the same query is fine
        assert!(translate(r#"serv="api""#, None).is_ok());
    }

    #[test]
    fn strings_escape_backslashes_and_quotes() {
        let tr = translate(r#"msg="it's a \\ test""#, None).unwrap();
        assert_eq!(tr.sql, r"`msg`='it\'s a \\ test'");
    }

    #[test]
    fn translation_is_deterministic() {
        let a = translate(r#"a=1 or (b=2 c~"x")"#, None).unwrap();
        let b = translate(r#"a=1 or (b=2 c~"x")"#, None).unwrap();
        assert_eq!(a.sql, b.sql);
        assert_eq!(a.sql, "`a`=1 OR (`b`=2 AND match(`c`, 'x'))");
    }
}
