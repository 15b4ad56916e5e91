//! Query orchestrator: the user-facing façade that drives substitution,
//! translation/validation, tracked execution, and result normalisation.

use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::logchefql;
use crate::manager::ConnectionManager;
use crate::metastore::MetadataStore;
use crate::models::{Backend, Schema, Source};
use crate::client::{BackendClient as _, QueryStats, ResultSet, Row};
use crate::sql::{self, TemplateVar};
use crate::tracker::QueryTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How the request's `query` field is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Logchefql,
    Sql,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub mode: QueryMode,
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
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub variables: Vec<TemplateVar>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub query_id: Uuid,
    pub columns: Vec<crate::models::Column>,
    pub rows: Vec<Row>,
    pub stats: QueryStats,
    pub generated_query: String,
}

pub struct QueryService {
    config: QueryConfig,
    manager: Arc<ConnectionManager>,
    tracker: Arc<QueryTracker>,
    store: Arc<dyn MetadataStore>,
    schemas: RwLock<HashMap<i64, (Instant, Schema)>>,
}

impl QueryService {
    pub fn new(
        config: QueryConfig,
        manager: Arc<ConnectionManager>,
        tracker: Arc<QueryTracker>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        QueryService {
            config,
            manager,
            tracker,
            store,
            schemas: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn tracker(&self) -> &Arc<QueryTracker> {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Fetch the source schema, serving cached copies within the TTL and
    /// opportunistically persisting fresh ones to the metadata store.
    pub async fn schema(&self, source_id: i64) -> Result<Schema> {
        let ttl = Duration::from_secs(self.config.schema_cache_secs);
        {
            let cache = self.schemas.read().await;
            if let Some((fetched, schema)) = cache.get(&source_id) {
                if fetched.elapsed() < ttl {
                    return Ok(schema.clone());
                }
            }
        }
        let client = self.manager.get(source_id).await?;
        let schema = client.get_schema().await?;
        {
            let mut cache = self.schemas.write().await;
            cache.insert(source_id, (Instant::now(), schema.clone()));
        }
        if let Err(e) = self.store.update_source_schema(source_id, &schema).await {
            tracing::debug!(source_id, error = %e, "schema cache write skipped");
        }
        Ok(schema)
    }

    pub fn clamp_limit(&self, limit: u32) -> u32 {
        let limit = if limit == 0 {
            self.config.default_limit
        } else {
            limit
        };
        limit.min(self.config.max_limit)
    }

    pub fn clamp_timeout(&self, timeout_secs: Option<u64>) -> Duration {
        let secs = timeout_secs
            .unwrap_or(self.config.default_timeout_secs)
            .min(self.config.max_timeout_secs)
            .max(1);
        Duration::from_secs(secs)
    }

    /// Build the backend-native query for a request without executing it.
    pub fn build_native_query(
        &self,
        source: &Source,
        schema: Option<&Schema>,
        mode: QueryMode,
        query: &str,
        limit: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timezone: &str,
    ) -> Result<String> {
        match (mode, source.backend) {
            (QueryMode::Logchefql, Backend::Clickhouse) => {
                let translated = logchefql::translate(query, schema)?;
                let conn = source.clickhouse().ok_or_else(|| {
                    Error::internal(format!("source {} missing clickhouse connection", source.id))
                })?;
                logchefql::build_full_query(&logchefql::FullQueryParams {
                    database: &conn.database,
                    table: &conn.table,
                    timestamp_field: &source.timestamp_field,
                    start,
                    end,
                    timezone,
                    limit,
                    condition: &translated.sql,
                })
            }
            (QueryMode::Logchefql, Backend::Victorialogs) => {
                let translated = logchefql::translate_to_logsql(query, schema)?;
                let conn = source.victorialogs().ok_or_else(|| {
                    Error::internal(format!(
                        "source {} missing victorialogs connection",
                        source.id
                    ))
                })?;
                Ok(logchefql::build_full_logsql_query(
                    &logchefql::FullLogsQueryParams {
                        stream_selector: conn.stream_selector.as_deref(),
                        start,
                        end,
                        limit,
                        condition: &translated.sql,
                    },
                ))
            }
            (QueryMode::Sql, Backend::Clickhouse) => sql::build_raw_query(
                query,
                limit as i64,
                sql::QueryMode::Extended,
                None,
            ),
            (QueryMode::Sql, Backend::Victorialogs) => Err(Error::validation(
                "raw SQL queries are not supported for VictoriaLogs sources",
            )),
        }
    }

    /// Execute a user query end to end: resolve the source, substitute
    /// template variables, translate/validate, run under a tracked cancel
    /// handle, and normalise the result.
    pub async fn execute(&self, req: QueryRequest) -> Result<QueryResponse> {
        if req.end_time <= req.start_time {
            return Err(Error::validation("end_time must be after start_time"));
        }
        let source = self.store.get_source(req.source_id).await?;
        let schema = match self.schema(req.source_id).await {
            Ok(schema) => Some(schema),
            Err(e) => {
                tracing::debug!(source_id = req.source_id, error = %e, "schema unavailable");
                None
            }
        };

        let query = sql::substitute(&req.query, &req.variables)?;
        let limit = self.clamp_limit(req.limit);
        let generated = self
            .build_native_query(
                &source,
                schema.as_ref(),
                req.mode,
                &query,
                limit,
                req.start_time,
                req.end_time,
                &req.timezone,
            )?;

        let timeout = self.clamp_timeout(req.timeout_secs);
        let (query_id, token) = self
            .tracker
            .register(req.user_id, req.source_id, req.team_id, &generated)?;

        let result = self.run(req.source_id, &generated, timeout, token).await;
        self.tracker.remove(query_id);
        let result_set = result?;

        Ok(QueryResponse {
            query_id,
            columns: result_set.columns,
            rows: result_set.rows,
            stats: result_set.stats,
            generated_query: generated,
        })
    }

    async fn run(
        &self,
        source_id: i64,
        query: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ResultSet> {
        let client = self.manager.get(source_id).await?;
        // hard overall deadline: the backend enforces max_execution_time,
        // this guards against stuck transports
        let hard_deadline = timeout + Duration::from_secs(2);
        match tokio::time::timeout(hard_deadline, client.execute(query, timeout, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "query exceeded {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Execution path for internal callers (alert evaluation, histograms):
    /// no per-user budget, no tracker entry.
    pub async fn execute_internal(
        &self,
        source_id: i64,
        query: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ResultSet> {
        self.run(source_id, query, timeout, cancel).await
    }

    /// Owner-scoped cancellation of a running query.
    pub fn cancel(&self, query_id: Uuid, user_id: i64) -> Result<bool> {
        self.tracker.cancel(query_id, user_id)
    }
}
