//! HTTP handlers for the query service API.
//! Thin layer: request decoding, user scoping, and the error-to-status
//! mapping live here; everything else is the services.

use crate::client::BackendClient as _;
use crate::error::Result;
use crate::fields::FieldValuesQuery;
use crate::histogram::HistogramRequest;
use crate::logchefql;
use crate::metastore::MetadataStore as _;
use crate::models::Schema;
use crate::query::{QueryRequest, QueryResponse};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/query", post(execute_query))
        .route("/api/query/cancel/:id", post(cancel_query))
        .route("/api/queries", get(list_queries))
        .route("/api/histogram", post(histogram))
        .route("/api/logchefql/translate", post(translate))
        .route("/api/logchefql/validate", post(validate))
        .route("/api/sources/:id/schema", get(source_schema))
        .route("/api/sources/:id/stats", get(source_stats))
        .route("/api/sources/:id/fields/values", get(all_field_values))
        .route("/api/sources/:id/fields/:field/values", get(field_values))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.manager.all_health().await;
    Json(json!({
        "status": "ok",
        "active_queries": state.tracker.len(),
        "sources": health,
        "query_metrics": state.manager.metrics().snapshot(),
    }))
}

async fn execute_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>> {
    let response = state.queries.execute(request).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct UserScope {
    #[serde(default)]
    user_id: i64,
}

async fn cancel_query(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(scope): Query<UserScope>,
) -> Result<Json<serde_json::Value>> {
    let cancelled = state.queries.cancel(id, scope.user_id)?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn list_queries(
    State(state): State<AppState>,
    Query(scope): Query<UserScope>,
) -> Json<serde_json::Value> {
    let queries = state.tracker.list_by_user(scope.user_id);
    Json(json!({ "queries": queries }))
}

async fn histogram(
    State(state): State<AppState>,
    Json(request): Json<HistogramRequest>,
) -> Result<Json<crate::histogram::HistogramResponse>> {
    let response = state.queries.histogram(request).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct TranslateRequest {
    query: String,
    #[serde(default)]
    source_id: Option<i64>,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Default, Serialize)]
struct TranslateResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    full_sql: Option<String>,
    logsql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    full_logsql: Option<String>,
    conditions: Vec<String>,
    fields_used: Vec<String>,
}

/// Translate a LogchefQL expression to both dialects. Parse and schema
/// failures surface as `valid: false` rather than an error status.
async fn translate(
    State(state): State<AppState>,
    Json(request): Json<TranslateRequest>,
) -> Result<Json<TranslateResponse>> {
    let schema = match request.source_id {
        Some(id) => state.queries.schema(id).await.ok(),
        None => None,
    };
    let translated = match logchefql::translate(&request.query, schema.as_ref()) {
        Ok(translated) => translated,
        Err(e) => {
            return Ok(Json(TranslateResponse {
                valid: false,
                error: Some(e.to_string()),
                ..Default::default()
            }))
        }
    };
    let logsql = match logchefql::translate_to_logsql(&request.query, schema.as_ref()) {
        Ok(translated) => translated.sql,
        Err(e) => {
            return Ok(Json(TranslateResponse {
                valid: false,
                error: Some(e.to_string()),
                ..Default::default()
            }))
        }
    };

    let mut response = TranslateResponse {
        valid: true,
        error: None,
        sql: translated.sql.clone(),
        full_sql: None,
        logsql: logsql.clone(),
        full_logsql: None,
        conditions: translated.conditions,
        fields_used: translated.fields_used,
    };

    if let (Some(start), Some(end)) = (request.start_time, request.end_time) {
        let timezone = request.timezone.as_deref().unwrap_or("UTC");
        let limit = state.queries.clamp_limit(request.limit.unwrap_or(0));
        if let Some(source) = match request.source_id {
            Some(id) => state.store.get_source(id).await.ok(),
            None => None,
        } {
            if let Some(conn) = source.clickhouse() {
                response.full_sql = Some(logchefql::build_full_query(
                    &logchefql::FullQueryParams {
                        database: &conn.database,
                        table: &conn.table,
                        timestamp_field: &source.timestamp_field,
                        start,
                        end,
                        timezone,
                        limit,
                        condition: &translated.sql,
                    },
                )?);
            }
            if let Some(conn) = source.victorialogs() {
                response.full_logsql = Some(logchefql::build_full_logsql_query(
                    &logchefql::FullLogsQueryParams {
                        stream_selector: conn.stream_selector.as_deref(),
                        start,
                        end,
                        limit,
                        condition: &logsql,
                    },
                ));
            }
        }
    }
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    query: String,
}

async fn validate(Json(request): Json<ValidateRequest>) -> Json<serde_json::Value> {
    match logchefql::validate(&request.query) {
        Ok(()) => Json(json!({ "valid": true })),
        Err(e) => Json(json!({
            "valid": false,
            "error": e.to_string(),
            "line": e.line,
            "col": e.col,
        })),
    }
}

async fn source_schema(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Schema>> {
    // resolve through the store first so unknown ids are 404, not 502
    state.store.get_source(id).await?;
    let schema = state.queries.schema(id).await?;
    Ok(Json(schema))
}

async fn source_stats(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<crate::models::SourceStats>> {
    state.store.get_source(id).await?;
    let client = state.manager.get(id).await?;
    Ok(Json(client.stats().await?))
}

async fn all_field_values(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<FieldValuesQuery>,
) -> Result<Json<serde_json::Value>> {
    let fields = state
        .queries
        .all_field_values(id, &query, CancellationToken::new())
        .await?;
    Ok(Json(json!({ "fields": fields })))
}

async fn field_values(
    State(state): State<AppState>,
    Path((id, field)): Path<(i64, String)>,
    Query(query): Query<FieldValuesQuery>,
) -> Result<Json<crate::models::FieldValues>> {
    let values = state
        .queries
        .field_values(id, &field, &query, CancellationToken::new())
        .await?;
    Ok(Json(values))
}
