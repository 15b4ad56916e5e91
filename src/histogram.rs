//! Histogram engine: wraps a user query in a windowed aggregation over
//! the source timestamp, optionally constrained to the top-N groups of an
//! additional field.

use crate::client::BackendClient as _;
use crate::error::{Error, Result};
use crate::logchefql::{self, quote_ident, resolve_timezone};
use crate::metastore::MetadataStore as _;
use crate::models::{Backend, HistogramBucket};
use crate::query::{QueryMode, QueryService};
use crate::sql::{self, TemplateVar};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TOP_GROUPS: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct HistogramRequest {
    pub mode: QueryMode,
    #[serde(default)]
    pub query: String,
    pub source_id: i64,
    #[serde(default)]
    pub team_id: i64,
    #[serde(default)]
    pub user_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub timezone: String,
    /// `Ns`, `Nm` or `Nh`
    pub window: String,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub variables: Vec<TemplateVar>,
}

#[derive(Debug, Serialize)]
pub struct HistogramResponse {
    pub buckets: Vec<HistogramBucket>,
    pub window: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

/// Parse the `Ns|Nm|Nh` window grammar into an interval count, a SQL
/// interval unit and the equivalent duration.
pub fn parse_window(window: &str) -> Result<(u64, &'static str, Duration)> {
    let window = window.trim();
    let Some(unit) = window.chars().last() else {
        return Err(Error::validation("empty histogram window"));
    };
    let count: u64 = window[..window.len() - 1]
        .parse()
        .map_err(|_| Error::validation(format!("bad histogram window '{window}'")))?;
    if count == 0 {
        return Err(Error::validation("histogram window must be positive"));
    }
    match unit {
        's' => Ok((count, "SECOND", Duration::from_secs(count))),
        'm' => Ok((count, "MINUTE", Duration::from_secs(count * 60))),
        'h' => Ok((count, "HOUR", Duration::from_secs(count * 3600))),
        _ => Err(Error::validation(format!(
            "bad histogram window '{window}': expected Ns, Nm or Nh"
        ))),
    }
}

/// Wrap `inner` in the bucketing aggregation. With a group field, a
/// `top_groups` CTE bounds the outer aggregation to the ten largest
/// groups.
pub fn build_histogram_sql(
    inner: &str,
    ts_field: &str,
    count: u64,
    unit: &str,
    tz: &Tz,
    group_by: Option<&str>,
) -> String {
    let ts = quote_ident(ts_field);
    let bucket = format!(
        "toStartOfInterval({ts}, INTERVAL {count} {unit}, '{}') AS bucket",
        tz.name()
    );
    match group_by {
        None => format!(
            "SELECT {bucket}, count() AS log_count FROM ({inner}) \
             GROUP BY bucket ORDER BY bucket ASC"
        ),
        Some(group) => {
            let group = quote_ident(group);
            format!(
                "WITH top_groups AS (SELECT {group} AS group_value, count() AS group_total \
                 FROM ({inner}) GROUP BY group_value ORDER BY group_total DESC LIMIT {TOP_GROUPS}) \
                 SELECT {bucket}, {group} AS group_value, count() AS log_count FROM ({inner}) \
                 WHERE {group} IN (SELECT group_value FROM top_groups) \
                 GROUP BY bucket, group_value ORDER BY bucket ASC"
            )
        }
    }
}

fn parse_bucket(raw: &str, tz: &Tz) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| Error::internal(format!("bad bucket timestamp '{raw}': {e}")))?;
    naive
        .and_local_timezone(*tz)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| Error::internal(format!("bucket timestamp '{raw}' has no {tz} mapping")))
}

impl QueryService {
    /// Execute a histogram request over the source's timestamp field.
    pub async fn histogram(&self, req: HistogramRequest) -> Result<HistogramResponse> {
        if req.end_time <= req.start_time {
            return Err(Error::validation("end_time must be after start_time"));
        }
        let (count, unit, step) = parse_window(&req.window)?;
        let tz = resolve_timezone(&req.timezone)?;
        let source = self.store().get_source(req.source_id).await?;
        let schema = match self.schema(req.source_id).await {
            Ok(schema) => Some(schema),
            Err(_) => None,
        };
        if let (Some(schema), Some(group)) = (schema.as_ref(), req.group_by.as_deref()) {
            if !schema.has_column(group) {
                return Err(Error::validation(format!(
                    "group_by field '{group}' does not exist on this source"
                )));
            }
        }
        let query = sql::substitute(&req.query, &req.variables)?;
        let timeout = self.clamp_timeout(req.timeout_secs);
        let cancel = CancellationToken::new();

        match source.backend {
            Backend::Clickhouse => {
                let underlying = self
                    .build_native_query(
                        &source,
                        schema.as_ref(),
                        req.mode,
                        &query,
                        self.clamp_limit(0),
                        req.start_time,
                        req.end_time,
                        &req.timezone,
                    )?;
                let inner = sql::ensure_timestamp_in_select(
                    &sql::remove_limit(&underlying)?,
                    &source.timestamp_field,
                )?;
                let histogram_sql = build_histogram_sql(
                    &inner,
                    &source.timestamp_field,
                    count,
                    unit,
                    &tz,
                    req.group_by.as_deref(),
                );
                let result = self
                    .execute_internal(req.source_id, &histogram_sql, timeout, cancel)
                    .await?;

                let mut buckets = Vec::with_capacity(result.rows.len());
                for row in &result.rows {
                    let Some(crate::client::Value::String(raw)) = row.get("bucket") else {
                        continue;
                    };
                    let bucket = parse_bucket(raw, &tz)?;
                    let count = row
                        .get("log_count")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0) as u64;
                    let group_value = match row.get("group_value") {
                        Some(crate::client::Value::String(g)) => Some(g.clone()),
                        Some(other) => other.as_f64().map(|f| f.to_string()),
                        None => None,
                    };
                    buckets.push(HistogramBucket {
                        bucket,
                        group_value,
                        count,
                    });
                }
                Ok(HistogramResponse {
                    buckets,
                    window: req.window,
                    group_by: req.group_by,
                })
            }
            Backend::Victorialogs => {
                if req.mode != QueryMode::Logchefql {
                    return Err(Error::validation(
                        "VictoriaLogs histograms accept logchefql queries only",
                    ));
                }
                let translated = logchefql::translate_to_logsql(&query, schema.as_ref())?;
                let conn = source.victorialogs().ok_or_else(|| {
                    Error::internal(format!(
                        "source {} missing victorialogs connection",
                        source.id
                    ))
                })?;
                let mut parts: Vec<String> = Vec::new();
                if let Some(selector) = conn.stream_selector.as_deref() {
                    if !selector.is_empty() {
                        parts.push(selector.to_string());
                    }
                }
                if !translated.sql.is_empty() {
                    parts.push(if parts.is_empty() {
                        translated.sql.clone()
                    } else {
                        format!("AND ({})", translated.sql)
                    });
                }
                if parts.is_empty() {
                    parts.push("*".to_string());
                }
                let filter = parts.join(" ");
                let client = self.manager().get(req.source_id).await?;
                let buckets = client
                    .hits(
                        &filter,
                        req.start_time,
                        req.end_time,
                        step,
                        req.group_by.as_deref(),
                        cancel,
                    )
                    .await?;
                Ok(HistogramResponse {
                    buckets,
                    window: req.window,
                    group_by: req.group_by,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_grammar() {
        assert_eq!(parse_window("30s").unwrap().1, "SECOND");
        assert_eq!(parse_window("5m").unwrap(), (5, "MINUTE", Duration::from_secs(300)));
        assert_eq!(parse_window("2h").unwrap().2, Duration::from_secs(7200));
        assert!(parse_window("0m").is_err());
        assert!(parse_window("5d").is_err());
        assert!(parse_window("m").is_err());
        assert!(parse_window("").is_err());
    }

    #[test]
    fn histogram_sql_without_groups() {
        let tz: Tz = "UTC".parse().unwrap();
        let sql = build_histogram_sql(
            "SELECT `parsed_timestamp`, host, status FROM logs.nginx WHERE status = 200",
            "parsed_timestamp",
            5,
            "MINUTE",
            &tz,
            None,
        );
        assert!(sql.contains(
            "toStartOfInterval(`parsed_timestamp`, INTERVAL 5 MINUTE, 'UTC') AS bucket"
        ));
        assert!(sql.contains("count() AS log_count"));
        assert!(sql.ends_with("GROUP BY bucket ORDER BY bucket ASC"));
        assert!(!sql.contains("top_groups"));
    }

    #[test]
    fn histogram_sql_with_groups_constrains_to_top_n() {
        let tz: Tz = "UTC".parse().unwrap();
        let sql = build_histogram_sql(
            "SELECT `ts`, host FROM logs.events",
            "ts",
            1,
            "HOUR",
            &tz,
            Some("host"),
        );
        assert!(sql.starts_with("WITH top_groups AS ("));
        assert!(sql.contains("ORDER BY group_total DESC LIMIT 10"));
        assert!(sql.contains("`host` IN (SELECT group_value FROM top_groups)"));
        assert!(sql.contains("GROUP BY bucket, group_value"));
    }

    #[test]
    fn bucket_parsing_respects_timezone() {
        let utc: Tz = "UTC".parse().unwrap();
        let parsed = parse_bucket("2024-01-01 00:05:00", &utc).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-01-01T00:05:00+00:00");

        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let parsed = parse_bucket("2024-01-01 01:05:00", &berlin).unwrap();
        // 01:05 Berlin winter time is 00:05 UTC
        assert_eq!(parsed.to_rfc3339(), "2024-01-01T00:05:00+00:00");
    }
}
