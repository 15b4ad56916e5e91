//! VictoriaLogs backend client over the `/select/logsql/*` HTTP API.

use super::{
    fingerprint, BackendClient, FieldValuesParams, HookChain, QueryContext, QueryHook, ResultSet,
    Row as ResultRow, Value,
};
use crate::error::{Error, Result};
use crate::models::{
    Column, FieldValue, FieldValues, HistogramBucket, Schema, Source, VictoriaLogsConnection,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct VictoriaLogsClient {
    source_id: i64,
    conn: VictoriaLogsConnection,
    http: RwLock<reqwest::Client>,
    hooks: RwLock<Vec<Arc<dyn QueryHook>>>,
    max_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct NamedHits {
    value: String,
    #[serde(default)]
    hits: u64,
}

#[derive(Debug, Deserialize)]
struct NamedHitsResponse {
    #[serde(default)]
    values: Vec<NamedHits>,
}

#[derive(Debug, Deserialize)]
struct HitsSeries {
    #[serde(default)]
    fields: std::collections::HashMap<String, String>,
    #[serde(default)]
    timestamps: Vec<String>,
    #[serde(default)]
    values: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct HitsResponse {
    #[serde(default)]
    hits: Vec<HitsSeries>,
}

impl VictoriaLogsClient {
    pub fn from_source(source: &Source, max_timeout: Duration) -> Result<Self> {
        let conn = source
            .victorialogs()
            .ok_or_else(|| {
                Error::config(format!("source {} is not a VictoriaLogs source", source.id))
            })?
            .clone();
        Ok(VictoriaLogsClient::new(source.id, conn, max_timeout))
    }

    pub fn new(source_id: i64, conn: VictoriaLogsConnection, max_timeout: Duration) -> Self {
        VictoriaLogsClient {
            source_id,
            conn,
            http: RwLock::new(reqwest::Client::new()),
            hooks: RwLock::new(Vec::new()),
            max_timeout,
        }
    }

    fn http(&self) -> reqwest::Client {
        self.http.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn hook_chain(&self) -> HookChain {
        HookChain::new(self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.conn.base_url.trim_end_matches('/'))
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.conn.username {
            Some(user) => request.basic_auth(user, self.conn.password.as_deref()),
            None => request,
        }
    }

    fn map_transport_error(&self, err: reqwest::Error, query: &str) -> Error {
        if err.is_timeout() {
            Error::timeout(format!("source {}: {err}", self.source_id))
        } else if err.is_connect() {
            Error::backend_unavailable(format!("source {}: {err}", self.source_id))
        } else {
            Error::backend(format!(
                "source {}: {err} [query: {}]",
                self.source_id,
                fingerprint(query)
            ))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        timeout: Duration,
        cancel: &CancellationToken,
        query_for_errors: &str,
    ) -> Result<T> {
        let request = self
            .authed(self.http().get(self.endpoint(path)))
            .query(params)
            .timeout(timeout);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = request.send() => res.map_err(|e| self.map_transport_error(e, query_for_errors))?,
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let truncated: String = body.trim().chars().take(300).collect();
            return Err(Error::backend(format!(
                "source {}: victorialogs returned {status}: {truncated} [query: {}]",
                self.source_id,
                fingerprint(query_for_errors)
            )));
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            body = response.json::<T>() => body.map_err(|e| self.map_transport_error(e, query_for_errors)),
        }
    }

    async fn execute_inner(
        &self,
        query: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResultSet> {
        let started = Instant::now();
        let request = self
            .authed(self.http().post(self.endpoint("/select/logsql/query")))
            .form(&[
                ("query", query.to_string()),
                ("timeout", format!("{}s", timeout.as_secs().max(1))),
            ])
            .timeout(timeout + Duration::from_secs(1));
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = request.send() => res.map_err(|e| self.map_transport_error(e, query))?,
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let truncated: String = body.trim().chars().take(300).collect();
            return Err(Error::backend(format!(
                "source {}: victorialogs returned {status}: {truncated} [query: {}]",
                self.source_id,
                fingerprint(query)
            )));
        }

        // the query endpoint streams NDJSON, one log entry per line
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            body = response.text() => body.map_err(|e| self.map_transport_error(e, query))?,
        };

        let mut columns: Vec<Column> = Vec::new();
        let mut rows: Vec<ResultRow> = Vec::new();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: serde_json::Value = serde_json::from_str(line).map_err(|e| {
                Error::backend(format!(
                    "source {}: malformed NDJSON line: {e}",
                    self.source_id
                ))
            })?;
            let serde_json::Value::Object(object) = parsed else {
                continue;
            };
            for key in object.keys() {
                if !columns.iter().any(|c| &c.name == key) {
                    columns.push(Column {
                        name: key.clone(),
                        column_type: "String".to_string(),
                    });
                }
            }
            rows.push(
                object
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            );
        }

        let rows_read = rows.len() as u64;
        Ok(ResultSet {
            columns,
            rows,
            stats: super::QueryStats {
                rows_read,
                exec_ms: started.elapsed().as_millis() as u64,
                bytes_read: None,
            },
        })
    }

    fn scoped_query(&self, params: &FieldValuesParams) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(selector) = self.conn.stream_selector.as_deref() {
            if !selector.is_empty() {
                parts.push(selector.to_string());
            }
        }
        parts.push(format!(
            "_time:[{}, {}]",
            params.start.format("%Y-%m-%dT%H:%M:%SZ"),
            params.end.format("%Y-%m-%dT%H:%M:%SZ"),
        ));
        if let Some(cond) = params.condition.as_deref() {
            if !cond.is_empty() {
                parts.push(format!("AND ({cond})"));
            }
        }
        parts.join(" ")
    }
}

#[async_trait]
impl BackendClient for VictoriaLogsClient {
    fn source_id(&self) -> i64 {
        self.source_id
    }

    async fn execute(
        &self,
        query: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ResultSet> {
        let timeout = timeout.min(self.max_timeout);
        let chain = self.hook_chain();
        let mut ctx = QueryContext {
            source_id: self.source_id,
            ..Default::default()
        };
        chain.run_before(&mut ctx, query).await?;
        let started = Instant::now();
        let result = self.execute_inner(query, timeout, &cancel).await;
        chain
            .run_after(&ctx, query, result.as_ref().err(), started.elapsed())
            .await;
        result
    }

    async fn ping(&self, deadline: Duration) -> Result<()> {
        let request = self
            .authed(self.http().get(self.endpoint("/health")))
            .timeout(deadline);
        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(Error::backend_unavailable(format!(
                "source {}: health returned {}",
                self.source_id,
                response.status()
            ))),
            Err(e) => Err(Error::backend_unavailable(format!(
                "source {}: ping failed: {e}",
                self.source_id
            ))),
        }
    }

    async fn reconnect(&self, deadline: Duration) -> Result<()> {
        let fresh = reqwest::Client::new();
        let probe = self
            .authed(fresh.get(self.endpoint("/health")))
            .timeout(deadline)
            .send()
            .await;
        match probe {
            Ok(response) if response.status().is_success() => {
                *self.http.write().unwrap_or_else(|e| e.into_inner()) = fresh;
                Ok(())
            }
            Ok(response) => Err(Error::backend_unavailable(format!(
                "source {}: reconnect health returned {}",
                self.source_id,
                response.status()
            ))),
            Err(e) => Err(Error::backend_unavailable(format!(
                "source {}: reconnect failed: {e}",
                self.source_id
            ))),
        }
    }

    async fn get_schema(&self) -> Result<Schema> {
        let query = self
            .conn
            .stream_selector
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "*".to_string());
        let response: NamedHitsResponse = self
            .get_json(
                "/select/logsql/field_names",
                &[("query", query.clone())],
                Duration::from_secs(10),
                &CancellationToken::new(),
                &query,
            )
            .await?;
        Ok(Schema {
            columns: response
                .values
                .into_iter()
                .map(|v| Column {
                    name: v.value,
                    column_type: "String".to_string(),
                })
                .collect(),
            ..Default::default()
        })
    }

    async fn get_field_values(
        &self,
        field: &str,
        params: &FieldValuesParams,
        cancel: CancellationToken,
    ) -> Result<FieldValues> {
        let query = self.scoped_query(params);
        let response: NamedHitsResponse = self
            .get_json(
                "/select/logsql/field_values",
                &[
                    ("query", query.clone()),
                    ("field", field.to_string()),
                    ("limit", params.limit.max(1).to_string()),
                ],
                Duration::from_secs(10),
                &cancel,
                &query,
            )
            .await?;
        let values: Vec<FieldValue> = response
            .values
            .into_iter()
            .map(|v| FieldValue {
                value: v.value,
                count: v.hits,
            })
            .collect();
        Ok(FieldValues {
            total_distinct: values.len() as u64,
            values,
            is_low_cardinality: false,
        })
    }

    async fn hits(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        group_by: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Vec<HistogramBucket>> {
        let mut params: Vec<(&str, String)> = vec![
            ("query", query.to_string()),
            ("start", start.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            ("end", end.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            ("step", format!("{}s", step.as_secs().max(1))),
        ];
        if let Some(field) = group_by {
            params.push(("field", field.to_string()));
        }
        let response: HitsResponse = self
            .get_json(
                "/select/logsql/hits",
                &params,
                Duration::from_secs(30),
                &cancel,
                query,
            )
            .await?;

        let mut buckets: Vec<HistogramBucket> = Vec::new();
        for series in response.hits {
            let group_value = group_by
                .and_then(|field| series.fields.get(field).cloned())
                .filter(|v| !v.is_empty());
            for (timestamp, count) in series.timestamps.iter().zip(series.values.iter()) {
                if *count == 0 {
                    continue;
                }
                let bucket = timestamp
                    .parse::<DateTime<Utc>>()
                    .map_err(|e| {
                        Error::backend(format!(
                            "source {}: bad hits timestamp '{timestamp}': {e}",
                            self.source_id
                        ))
                    })?;
                buckets.push(HistogramBucket {
                    bucket,
                    group_value: group_value.clone(),
                    count: *count,
                });
            }
        }
        buckets.sort_by_key(|b| b.bucket);
        Ok(buckets)
    }

    fn add_hook(&self, hook: Arc<dyn QueryHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    async fn close(&self, _deadline: Duration) {
        tracing::debug!(source_id = self.source_id, "victorialogs client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn client(selector: Option<&str>) -> VictoriaLogsClient {
        VictoriaLogsClient::new(
            3,
            VictoriaLogsConnection {
                base_url: "http://localhost:9428/".to_string(),
                username: None,
                password: None,
                stream_selector: selector.map(|s| s.to_string()),
            },
            Duration::from_secs(60),
        )
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let c = client(None);
        assert_eq!(
            c.endpoint("/select/logsql/query"),
            "http://localhost:9428/select/logsql/query"
        );
    }

    #[test]
    fn scoped_query_includes_selector_time_and_condition() {
        let c = client(Some(r#"{app="nginx"}"#));
        let params = FieldValuesParams {
            timestamp_field: "_time".into(),
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            timezone: "UTC".into(),
            limit: 10,
            condition: Some(r#"level:="error""#.to_string()),
        };
        assert_eq!(
            c.scoped_query(&params),
            r#"{app="nginx"} _time:[2024-01-01T00:00:00Z, 2024-01-01T01:00:00Z] AND (level:="error")"#
        );
    }

    #[test]
    fn scoped_query_without_condition() {
        let c = client(None);
        let params = FieldValuesParams {
            timestamp_field: "_time".into(),
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            timezone: "UTC".into(),
            limit: 10,
            condition: None,
        };
        assert_eq!(
            c.scoped_query(&params),
            "_time:[2024-01-01T00:00:00Z, 2024-01-01T01:00:00Z]"
        );
    }
}
