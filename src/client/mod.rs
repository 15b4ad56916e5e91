//! Uniform backend client capability over ClickHouse and VictoriaLogs.
//!
//! Every client owns a pre/post-query hook chain used for structured
//! logging and metrics. Row values cross this boundary as a tagged sum,
//! never as driver types.

pub mod clickhouse;
pub mod victorialogs;

pub use self::clickhouse::ClickHouseClient;
pub use self::victorialogs::VictoriaLogsClient;

use crate::error::{Error, Result};
use crate::models::{FieldValues, HistogramBucket, Schema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A single cell value, losslessly JSON-encodable
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    /// Arrays, maps and nested objects pass through as-is
    Json(serde_json::Value),
}

impl Value {
    pub fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            other => Value::Json(other),
        }
    }

    /// Numeric view used by alert threshold comparison
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

pub type Row = HashMap<String, Value>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    pub rows_read: u64,
    pub exec_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_read: Option<u64>,
}

/// Result of one query; lives for the duration of one request
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultSet {
    pub columns: Vec<crate::models::Column>,
    pub rows: Vec<Row>,
    pub stats: QueryStats,
}

/// Parameters for bounded distinct-value queries
#[derive(Debug, Clone)]
pub struct FieldValuesParams {
    pub timestamp_field: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timezone: String,
    pub limit: u32,
    /// Translated filter fragment applied on top of the time range
    pub condition: Option<String>,
}

/// Mutable context threaded through the hook chain
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub source_id: i64,
    pub query_id: Option<String>,
    /// Per-query settings hooks may augment (e.g. timeout overrides)
    pub settings: HashMap<String, String>,
}

/// Pre/post query hook. `before_query` failures abort the query.
#[async_trait]
pub trait QueryHook: Send + Sync {
    async fn before_query(&self, ctx: &mut QueryContext, query: &str) -> Result<()>;
    async fn after_query(
        &self,
        ctx: &QueryContext,
        query: &str,
        error: Option<&Error>,
        elapsed: Duration,
    );
}

/// Ordered hook invocation with correct pairing under partial failure:
/// only hooks whose `before` ran get their `after`, in registration order.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn QueryHook>>,
}

impl HookChain {
    pub fn new(hooks: Vec<Arc<dyn QueryHook>>) -> Self {
        HookChain { hooks }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run `before` hooks in order. On failure, runs `after` for the hooks
    /// that already observed `before`, then returns the hook error.
    pub async fn run_before(&self, ctx: &mut QueryContext, query: &str) -> Result<()> {
        for (idx, hook) in self.hooks.iter().enumerate() {
            if let Err(err) = hook.before_query(ctx, query).await {
                for observed in &self.hooks[..idx] {
                    observed
                        .after_query(ctx, query, Some(&err), Duration::ZERO)
                        .await;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub async fn run_after(
        &self,
        ctx: &QueryContext,
        query: &str,
        error: Option<&Error>,
        elapsed: Duration,
    ) {
        for hook in &self.hooks {
            hook.after_query(ctx, query, error, elapsed).await;
        }
    }
}

/// Uniform capability implemented by every backend client
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn source_id(&self) -> i64;

    /// Execute a native query and materialise the result. Cancellation is
    /// honoured between I/O steps; the smaller of `timeout` and any caller
    /// deadline wins.
    async fn execute(
        &self,
        query: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ResultSet>;

    async fn ping(&self, deadline: Duration) -> Result<()>;

    /// Re-establish the underlying connection; the old connection is only
    /// replaced after the fresh one answers a ping.
    async fn reconnect(&self, deadline: Duration) -> Result<()>;

    async fn get_schema(&self) -> Result<Schema>;

    async fn get_field_values(
        &self,
        field: &str,
        params: &FieldValuesParams,
        cancel: CancellationToken,
    ) -> Result<FieldValues>;

    /// Windowed count buckets fetched natively; backends whose histograms
    /// are expressed in SQL return Unsupported and are wrapped upstream.
    async fn hits(
        &self,
        _query: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _step: Duration,
        _group_by: Option<&str>,
        _cancel: CancellationToken,
    ) -> Result<Vec<HistogramBucket>> {
        Err(Error::internal("native hit buckets are not supported by this backend"))
    }

    /// Ingestion statistics for the source's table; backends without part
    /// metadata return zeroed stats.
    async fn stats(&self) -> Result<crate::models::SourceStats> {
        Ok(crate::models::SourceStats::default())
    }

    /// Append a hook; existing in-flight queries keep the chain they copied.
    fn add_hook(&self, hook: Arc<dyn QueryHook>);

    async fn close(&self, deadline: Duration);
}

impl std::fmt::Debug for dyn BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("source_id", &self.source_id())
            .finish()
    }
}

/// Compact query identity for error wrapping and logs
pub fn fingerprint(sql: &str) -> String {
    let collapsed: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out: String = collapsed.chars().take(96).collect();
    if collapsed.chars().count() > 96 {
        out.push('…');
    }
    out
}

/// Structured query logging installed on every client
pub struct LoggingHook;

#[async_trait]
impl QueryHook for LoggingHook {
    async fn before_query(&self, ctx: &mut QueryContext, query: &str) -> Result<()> {
        tracing::debug!(
            source_id = ctx.source_id,
            query_id = ctx.query_id.as_deref(),
            query = %fingerprint(query),
            "executing query"
        );
        Ok(())
    }

    async fn after_query(
        &self,
        ctx: &QueryContext,
        query: &str,
        error: Option<&Error>,
        elapsed: Duration,
    ) {
        match error {
            None => tracing::debug!(
                source_id = ctx.source_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "query completed"
            ),
            Some(err) => tracing::warn!(
                source_id = ctx.source_id,
                elapsed_ms = elapsed.as_millis() as u64,
                query = %fingerprint(query),
                error = %err,
                "query failed"
            ),
        }
    }
}

/// Atomic per-client query counters
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub total_queries: AtomicU64,
    pub successful_queries: AtomicU64,
    pub failed_queries: AtomicU64,
    pub total_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub total_duration_ms: u64,
}

impl ClientMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            successful_queries: self.successful_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Hook feeding the shared metrics counters
pub struct MetricsHook {
    metrics: Arc<ClientMetrics>,
}

impl MetricsHook {
    pub fn new(metrics: Arc<ClientMetrics>) -> Self {
        MetricsHook { metrics }
    }
}

#[async_trait]
impl QueryHook for MetricsHook {
    async fn before_query(&self, _ctx: &mut QueryContext, _query: &str) -> Result<()> {
        self.metrics.total_queries.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn after_query(
        &self,
        _ctx: &QueryContext,
        _query: &str,
        error: Option<&Error>,
        elapsed: Duration,
    ) {
        if error.is_some() {
            self.metrics.failed_queries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics
                .successful_queries
                .fetch_add(1, Ordering::Relaxed);
        }
        self.metrics
            .total_duration_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHook {
        name: &'static str,
        fail_before: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl QueryHook for RecordingHook {
        async fn before_query(&self, _ctx: &mut QueryContext, _query: &str) -> Result<()> {
            self.log.lock().unwrap().push(format!("before:{}", self.name));
            if self.fail_before {
                return Err(Error::internal(format!("{} refused", self.name)));
            }
            Ok(())
        }

        async fn after_query(
            &self,
            _ctx: &QueryContext,
            _query: &str,
            _error: Option<&Error>,
            _elapsed: Duration,
        ) {
            self.log.lock().unwrap().push(format!("after:{}", self.name));
        }
    }

    fn chain(specs: &[(&'static str, bool)], log: &Arc<Mutex<Vec<String>>>) -> HookChain {
        HookChain::new(
            specs
                .iter()
                .map(|(name, fail)| {
                    Arc::new(RecordingHook {
                        name,
                        fail_before: *fail,
                        log: log.clone(),
                    }) as Arc<dyn QueryHook>
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&[("a", false), ("b", false)], &log);
        let mut ctx = QueryContext::default();
        chain.run_before(&mut ctx, "SELECT 1").await.unwrap();
        chain
            .run_after(&ctx, "SELECT 1", None, Duration::ZERO)
            .await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "after:a", "after:b"]
        );
    }

    #[tokio::test]
    async fn failed_before_runs_after_only_for_observed_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&[("a", false), ("b", true), ("c", false)], &log);
        let mut ctx = QueryContext::default();
        let err = chain.run_before(&mut ctx, "SELECT 1").await.unwrap_err();
        assert!(err.to_string().contains("b refused"));
        // c never observed before, so it gets no after; a does
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "after:a"]
        );
    }

    #[test]
    fn value_json_round_trip() {
        assert_eq!(Value::from_json(serde_json::json!(3)), Value::Int(3));
        assert_eq!(
            Value::from_json(serde_json::json!(u64::MAX)),
            Value::UInt(u64::MAX)
        );
        assert_eq!(Value::from_json(serde_json::json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from_json(serde_json::json!(null)), Value::Null);
        assert_eq!(
            Value::from_json(serde_json::json!("x")),
            Value::String("x".into())
        );
        assert!(matches!(
            Value::from_json(serde_json::json!([1, 2])),
            Value::Json(_)
        ));
        assert_eq!(Value::String("12".into()).as_f64(), Some(12.0));
    }

    #[test]
    fn fingerprint_collapses_and_truncates() {
        let fp = fingerprint("SELECT *\n  FROM   logs.events");
        assert_eq!(fp, "SELECT * FROM logs.events");
        let long = format!("SELECT {}", "x".repeat(200));
        assert!(fingerprint(&long).ends_with('…'));
    }
}
