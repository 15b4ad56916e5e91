//! ClickHouse backend client.
//!
//! Typed control queries (pings, system-table introspection, distinct
//! values) go through the `clickhouse` crate; arbitrary-shape SELECTs go
//! through the HTTP interface with `FORMAT JSON` so rows can be decoded
//! without compile-time row types.

use super::{
    fingerprint, BackendClient, FieldValuesParams, HookChain, QueryContext, QueryHook, ResultSet,
    Row as ResultRow, Value,
};
use crate::error::{Error, Result};
use crate::logchefql::{quote_ident, resolve_timezone};
use crate::models::{
    ClickHouseConnection, Column, ColumnExtended, FieldValue, FieldValues, Schema, Source,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const DDL_PREFIXES: &[&str] = &["CREATE", "ALTER", "DROP", "TRUNCATE", "RENAME"];

fn is_ddl(query: &str) -> bool {
    let Some(first) = query.split_whitespace().next() else {
        return false;
    };
    DDL_PREFIXES
        .iter()
        .any(|p| first.eq_ignore_ascii_case(p))
}

struct Inner {
    ch: clickhouse::Client,
    http: reqwest::Client,
}

pub struct ClickHouseClient {
    source_id: i64,
    conn: ClickHouseConnection,
    inner: RwLock<Inner>,
    hooks: RwLock<Vec<Arc<dyn QueryHook>>>,
    max_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct JsonMeta {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct JsonStatistics {
    #[serde(default)]
    elapsed: f64,
    #[serde(default)]
    rows_read: u64,
    #[serde(default)]
    bytes_read: u64,
}

#[derive(Debug, Deserialize)]
struct JsonResponse {
    #[serde(default)]
    meta: Vec<JsonMeta>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(default)]
    statistics: Option<JsonStatistics>,
}

#[derive(Debug, Row, Deserialize)]
struct TableRow {
    engine: String,
    engine_full: String,
    sorting_key: String,
    create_table_query: String,
}

#[derive(Debug, Row, Deserialize)]
struct ColumnRow {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    default_kind: String,
    default_expression: String,
    comment: String,
    is_in_primary_key: u8,
    is_in_sorting_key: u8,
}

#[derive(Debug, Row, Deserialize)]
struct ValueCountRow {
    value: String,
    cnt: u64,
}

#[derive(Debug, Row, Deserialize)]
struct TotalRow {
    total: u64,
}

#[derive(Debug, Row, Deserialize)]
struct StatsRow {
    total_rows: u64,
    compressed_bytes: u64,
    uncompressed_bytes: u64,
    oldest_entry: u32,
    newest_entry: u32,
}

/// Engine, columns and sort keys of one table, following Distributed
/// engines down to their local table for the column list.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub engine: String,
    pub columns: Vec<TableColumn>,
    pub sort_keys: Vec<String>,
    pub create_statement: String,
}

/// Column projection shared by schema and table info
#[derive(Debug, Clone)]
pub struct TableColumn {
    pub name: String,
    pub column_type: String,
    pub default_expression: String,
    pub comment: String,
    pub is_primary_key: bool,
}

impl ClickHouseClient {
    pub fn from_source(source: &Source, max_timeout: Duration) -> Result<Self> {
        let conn = source
            .clickhouse()
            .ok_or_else(|| Error::config(format!("source {} is not a ClickHouse source", source.id)))?
            .clone();
        Ok(ClickHouseClient::new(source.id, conn, max_timeout))
    }

    pub fn new(source_id: i64, conn: ClickHouseConnection, max_timeout: Duration) -> Self {
        let inner = Self::build_inner(&conn);
        ClickHouseClient {
            source_id,
            conn,
            inner: RwLock::new(inner),
            hooks: RwLock::new(Vec::new()),
            max_timeout,
        }
    }

    fn build_inner(conn: &ClickHouseConnection) -> Inner {
        let mut ch = clickhouse::Client::default()
            .with_url(&conn.host)
            .with_database(&conn.database)
            .with_compression(clickhouse::Compression::Lz4);
        if !conn.username.is_empty() {
            ch = ch.with_user(&conn.username);
        }
        if !conn.password.is_empty() {
            ch = ch.with_password(&conn.password);
        }
        Inner {
            ch,
            http: reqwest::Client::new(),
        }
    }

    fn ch(&self) -> clickhouse::Client {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ch
            .clone()
    }

    fn http(&self) -> reqwest::Client {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .http
            .clone()
    }

    fn hook_chain(&self) -> HookChain {
        HookChain::new(self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn clamp_timeout(&self, timeout: Duration) -> Duration {
        timeout.min(self.max_timeout)
    }

    fn wrap_http_error(&self, status: reqwest::StatusCode, body: &str, sql: &str) -> Error {
        let body = body.trim();
        let truncated: String = body.chars().take(300).collect();
        if body.contains("TIMEOUT_EXCEEDED") || body.contains("Code: 159") {
            return Error::timeout(format!(
                "source {}: query exceeded max_execution_time", self.source_id
            ));
        }
        Error::backend(format!(
            "source {}: clickhouse returned {status}: {truncated} [query: {}]",
            self.source_id,
            fingerprint(sql)
        ))
    }

    async fn post_query(
        &self,
        sql: String,
        timeout: Duration,
        ctx: &QueryContext,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let mut params: Vec<(String, String)> = vec![
            ("database".to_string(), self.conn.database.clone()),
            (
                "max_execution_time".to_string(),
                timeout.as_secs().max(1).to_string(),
            ),
        ];
        for (key, value) in &ctx.settings {
            params.push((key.clone(), value.clone()));
        }
        let mut request = self
            .http()
            .post(&self.conn.host)
            .query(&params)
            .timeout(timeout + Duration::from_secs(1))
            .body(sql.clone());
        if !self.conn.username.is_empty() {
            request = request.basic_auth(&self.conn.username, Some(&self.conn.password));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = request.send() => res.map_err(|e| self.map_transport_error(e, &sql))?,
        };
        Ok(response)
    }

    fn map_transport_error(&self, err: reqwest::Error, sql: &str) -> Error {
        if err.is_timeout() {
            Error::timeout(format!("source {}: {err}", self.source_id))
        } else if err.is_connect() {
            Error::backend_unavailable(format!("source {}: {err}", self.source_id))
        } else {
            Error::backend(format!(
                "source {}: {err} [query: {}]",
                self.source_id,
                fingerprint(sql)
            ))
        }
    }

    async fn execute_inner(
        &self,
        query: &str,
        timeout: Duration,
        ctx: &QueryContext,
        cancel: &CancellationToken,
    ) -> Result<ResultSet> {
        if is_ddl(query) {
            let started = Instant::now();
            let response = self
                .post_query(query.to_string(), timeout, ctx, cancel)
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(self.wrap_http_error(status, &body, query));
            }
            return Ok(ResultSet {
                stats: super::QueryStats {
                    exec_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                },
                ..Default::default()
            });
        }

        let sql = format!("{query} FORMAT JSON");
        let started = Instant::now();
        let response = self.post_query(sql, timeout, ctx, cancel).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.wrap_http_error(status, &body, query));
        }

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            body = response.text() => body.map_err(|e| self.map_transport_error(e, query))?,
        };
        let parsed: JsonResponse = serde_json::from_str(&body).map_err(|e| {
            Error::backend(format!(
                "source {}: malformed response: {e} [query: {}]",
                self.source_id,
                fingerprint(query)
            ))
        })?;

        let columns: Vec<Column> = parsed
            .meta
            .into_iter()
            .map(|m| Column {
                name: m.name,
                column_type: m.column_type,
            })
            .collect();
        let mut rows: Vec<ResultRow> = Vec::with_capacity(parsed.data.len());
        for entry in parsed.data {
            let serde_json::Value::Object(object) = entry else {
                continue;
            };
            rows.push(
                object
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            );
        }
        let statistics = parsed.statistics.unwrap_or_default();
        Ok(ResultSet {
            columns,
            rows,
            stats: super::QueryStats {
                rows_read: statistics.rows_read,
                exec_ms: if statistics.elapsed > 0.0 {
                    (statistics.elapsed * 1000.0) as u64
                } else {
                    started.elapsed().as_millis() as u64
                },
                bytes_read: Some(statistics.bytes_read),
            },
        })
    }

    /// Engine, columns and sort keys; Distributed engines are followed to
    /// the local table for the column list while keeping their identity.
    pub async fn table_info(&self, database: &str, table: &str) -> Result<TableInfo> {
        let ch = self.ch();
        let mut tables: Vec<TableRow> = ch
            .query(
                "SELECT engine, engine_full, sorting_key, create_table_query \
                 FROM system.tables WHERE database = ? AND table = ?",
            )
            .bind(database)
            .bind(table)
            .fetch_all()
            .await
            .map_err(|e| Error::backend(format!("source {}: {e}", self.source_id)))?;
        if tables.is_empty() {
            return Err(Error::not_found(format!("table {database}.{table}")));
        }
        let head = tables.remove(0);

        // Distributed tables carry no useful column metadata themselves
        let (column_db, column_table) = if head.engine == "Distributed" {
            parse_distributed_target(&head.engine_full)
                .unwrap_or_else(|| (database.to_string(), table.to_string()))
        } else {
            (database.to_string(), table.to_string())
        };

        let columns: Vec<ColumnRow> = ch
            .query(
                "SELECT name, type, default_kind, default_expression, comment, \
                 is_in_primary_key, is_in_sorting_key \
                 FROM system.columns WHERE database = ? AND table = ? ORDER BY position",
            )
            .bind(&column_db)
            .bind(&column_table)
            .fetch_all()
            .await
            .map_err(|e| Error::backend(format!("source {}: {e}", self.source_id)))?;

        let sort_keys: Vec<String> = if head.sorting_key.is_empty() {
            columns
                .iter()
                .filter(|c| c.is_in_sorting_key == 1)
                .map(|c| c.name.clone())
                .collect()
        } else {
            head.sorting_key
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };

        Ok(TableInfo {
            engine: head.engine,
            columns: columns
                .into_iter()
                .map(|c| TableColumn {
                    name: c.name,
                    column_type: c.column_type,
                    default_expression: if c.default_kind.is_empty() {
                        c.default_expression
                    } else {
                        format!("{} {}", c.default_kind, c.default_expression)
                    },
                    comment: c.comment,
                    is_primary_key: c.is_in_primary_key == 1,
                })
                .collect(),
            sort_keys,
            create_statement: head.create_table_query,
        })
    }

    fn time_bounds(&self, params: &FieldValuesParams) -> Result<(String, String, String)> {
        let tz = resolve_timezone(&params.timezone)?;
        let fmt = |t: DateTime<Utc>| t.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string();
        Ok((fmt(params.start), fmt(params.end), tz.name().to_string()))
    }
}

/// Extract `(database, table)` from a Distributed engine declaration such
/// as `Distributed('cluster', 'logs', 'events_local', rand())`.
fn parse_distributed_target(engine_full: &str) -> Option<(String, String)> {
    let re = regex::Regex::new(
        r"Distributed\(\s*'[^']*'\s*,\s*'([^']*)'\s*,\s*'([^']*)'",
    )
    .ok()?;
    let caps = re.captures(engine_full)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

#[async_trait]
impl BackendClient for ClickHouseClient {
    fn source_id(&self) -> i64 {
        self.source_id
    }

    async fn execute(
        &self,
        query: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ResultSet> {
        let timeout = self.clamp_timeout(timeout);
        let chain = self.hook_chain();
        let mut ctx = QueryContext {
            source_id: self.source_id,
            ..Default::default()
        };
        chain.run_before(&mut ctx, query).await?;
        let started = Instant::now();
        let result = self.execute_inner(query, timeout, &ctx, &cancel).await;
        chain
            .run_after(&ctx, query, result.as_ref().err(), started.elapsed())
            .await;
        result
    }

    async fn ping(&self, deadline: Duration) -> Result<()> {
        let ch = self.ch();
        let probe = ch.query("SELECT 1").fetch_one::<u8>();
        match tokio::time::timeout(deadline, probe).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::backend_unavailable(format!(
                "source {}: ping failed: {e}",
                self.source_id
            ))),
            Err(_) => Err(Error::backend_unavailable(format!(
                "source {}: ping timed out after {deadline:?}",
                self.source_id
            ))),
        }
    }

    async fn reconnect(&self, deadline: Duration) -> Result<()> {
        let fresh = Self::build_inner(&self.conn);
        let probe = fresh.ch.query("SELECT 1").fetch_one::<u8>();
        match tokio::time::timeout(deadline, probe).await {
            Ok(Ok(_)) => {
                *self.inner.write().unwrap_or_else(|e| e.into_inner()) = fresh;
                Ok(())
            }
            Ok(Err(e)) => Err(Error::backend_unavailable(format!(
                "source {}: reconnect failed: {e}",
                self.source_id
            ))),
            Err(_) => Err(Error::backend_unavailable(format!(
                "source {}: reconnect timed out after {deadline:?}",
                self.source_id
            ))),
        }
    }

    async fn get_schema(&self) -> Result<Schema> {
        let info = self
            .table_info(&self.conn.database, &self.conn.table)
            .await?;
        Ok(Schema {
            columns: info
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    column_type: c.column_type.clone(),
                })
                .collect(),
            sort_keys: info.sort_keys.clone(),
            engine: Some(info.engine.clone()),
            extended: Some(
                info.columns
                    .into_iter()
                    .map(|c| ColumnExtended {
                        is_nullable: c.column_type.starts_with("Nullable("),
                        name: c.name,
                        column_type: c.column_type,
                        is_primary_key: c.is_primary_key,
                        default_expression: c.default_expression,
                        comment: c.comment,
                    })
                    .collect(),
            ),
        })
    }

    async fn get_field_values(
        &self,
        field: &str,
        params: &FieldValuesParams,
        cancel: CancellationToken,
    ) -> Result<FieldValues> {
        let (start, end, tz) = self.time_bounds(params)?;
        let table = format!(
            "{}.{}",
            quote_ident(&self.conn.database),
            quote_ident(&self.conn.table)
        );
        let prewhere = format!(
            "PREWHERE {} BETWEEN toDateTime('{start}','{tz}') AND toDateTime('{end}','{tz}')",
            quote_ident(&params.timestamp_field)
        );
        let extra = params
            .condition
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(|c| format!(" WHERE ({c})"))
            .unwrap_or_default();

        let values_sql = format!(
            "SELECT toString({field}) AS value, count() AS cnt FROM {table} {prewhere}{extra} \
             GROUP BY value ORDER BY cnt DESC LIMIT {limit}",
            field = quote_ident(field),
            limit = params.limit.max(1),
        );
        let total_sql = format!(
            "SELECT uniq({field}) AS total FROM {table} {prewhere}{extra}",
            field = quote_ident(field),
        );

        let ch = self.ch();
        let values: Vec<ValueCountRow> = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = ch.query(&values_sql).fetch_all() => res
                .map_err(|e| Error::backend(format!("source {}: {e}", self.source_id)))?,
        };
        let totals: Vec<TotalRow> = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = ch.query(&total_sql).fetch_all() => res
                .map_err(|e| Error::backend(format!("source {}: {e}", self.source_id)))?,
        };

        Ok(FieldValues {
            values: values
                .into_iter()
                .map(|v| FieldValue {
                    value: v.value,
                    count: v.cnt,
                })
                .collect(),
            total_distinct: totals.first().map(|t| t.total).unwrap_or(0),
            is_low_cardinality: false,
        })
    }

    async fn stats(&self) -> Result<crate::models::SourceStats> {
        // fixed statement; only the identifiers vary and they are escaped,
        // never interpolated as raw SQL
        let sql = format!(
            "SELECT sum(rows) AS total_rows, \
             sum(data_compressed_bytes) AS compressed_bytes, \
             sum(data_uncompressed_bytes) AS uncompressed_bytes, \
             toUnixTimestamp(min(min_time)) AS oldest_entry, \
             toUnixTimestamp(max(max_time)) AS newest_entry \
             FROM system.parts WHERE database = '{}' AND table = '{}' AND active",
            self.conn.database.replace('\'', "''"),
            self.conn.table.replace('\'', "''"),
        );
        let rows: Vec<StatsRow> = self
            .ch()
            .query(&sql)
            .fetch_all()
            .await
            .map_err(|e| Error::backend(format!("source {}: {e}", self.source_id)))?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(crate::models::SourceStats::default());
        };
        let to_time = |secs: u32| {
            (secs > 0)
                .then(|| chrono::DateTime::<Utc>::from_timestamp(secs as i64, 0))
                .flatten()
        };
        Ok(crate::models::SourceStats {
            total_rows: row.total_rows,
            compressed_bytes: row.compressed_bytes,
            uncompressed_bytes: row.uncompressed_bytes,
            oldest_entry: to_time(row.oldest_entry),
            newest_entry: to_time(row.newest_entry),
        })
    }

    fn add_hook(&self, hook: Arc<dyn QueryHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    async fn close(&self, _deadline: Duration) {
        // HTTP transports drop their pooled connections on drop
        tracing::debug!(source_id = self.source_id, "clickhouse client closed");
    }
}
