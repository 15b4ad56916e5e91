//! `{{var}}` template substitution applied to raw SQL before any parsing.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    String,
    Number,
    Boolean,
    Identifier,
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVar {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    pub value: serde_json::Value,
}

fn placeholder_regex() -> regex::Regex {
    // compiled per call; substitution happens once per request
    regex::Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap()
}

/// Purely syntactic scan for `{{name}}` placeholders, first-use order.
pub fn extract_variable_names(sql: &str) -> Vec<String> {
    let re = placeholder_regex();
    let mut names = Vec::new();
    for cap in re.captures_iter(sql) {
        let name = cap[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn quote_identifier(s: &str) -> String {
    format!("`{}`", s.replace('`', "``"))
}

fn render_scalar(var: &TemplateVar, value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(quote_string(s)),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::validation(format!(
            "variable '{}' has unsupported list element {other}",
            var.name
        ))),
    }
}

fn render(var: &TemplateVar) -> Result<String> {
    match var.var_type {
        VarType::String => match &var.value {
            serde_json::Value::String(s) => Ok(quote_string(s)),
            other => Err(Error::validation(format!(
                "variable '{}' declared string but holds {other}",
                var.name
            ))),
        },
        VarType::Number => match &var.value {
            serde_json::Value::Number(n) => Ok(n.to_string()),
            serde_json::Value::String(s) if s.parse::<f64>().is_ok() => Ok(s.clone()),
            other => Err(Error::validation(format!(
                "variable '{}' declared number but holds {other}",
                var.name
            ))),
        },
        VarType::Boolean => match &var.value {
            serde_json::Value::Bool(b) => Ok(b.to_string()),
            other => Err(Error::validation(format!(
                "variable '{}' declared boolean but holds {other}",
                var.name
            ))),
        },
        VarType::Identifier => match &var.value {
            serde_json::Value::String(s) => Ok(quote_identifier(s)),
            other => Err(Error::validation(format!(
                "variable '{}' declared identifier but holds {other}",
                var.name
            ))),
        },
        VarType::List => match &var.value {
            serde_json::Value::Array(items) => {
                let rendered: Result<Vec<String>> =
                    items.iter().map(|v| render_scalar(var, v)).collect();
                Ok(rendered?.join(", "))
            }
            other => Err(Error::validation(format!(
                "variable '{}' declared list but holds {other}",
                var.name
            ))),
        },
    }
}

/// Replace every `{{name}}` with a typed, escaped SQL literal.
pub fn substitute(sql: &str, vars: &[TemplateVar]) -> Result<String> {
    let re = placeholder_regex();
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for cap in re.captures_iter(sql) {
        let whole = cap.get(0).unwrap();
        let name = &cap[1];
        let var = vars.iter().find(|v| v.name == name).ok_or_else(|| {
            Error::validation(format!("unknown template variable '{name}'"))
        })?;
        out.push_str(&sql[last..whole.start()]);
        out.push_str(&render(var)?);
        last = whole.end();
    }
    out.push_str(&sql[last..]);
    Ok(out)
}
