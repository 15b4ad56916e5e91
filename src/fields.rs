//! Field-value service: bounded distinct-value queries for filterable
//! columns over a time range, tolerant of per-field failures and request
//! cancellation.

use crate::client::{BackendClient as _, FieldValuesParams};
use crate::error::{Error, Result};
use crate::logchefql;
use crate::metastore::MetadataStore as _;
use crate::models::{Backend, FieldValues};
use crate::query::QueryService;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const LOW_CARDINALITY_TIMEOUT: Duration = Duration::from_secs(10);
const STRING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct FieldValuesQuery {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Optional LogchefQL predicate narrowing the scanned rows
    #[serde(default)]
    pub logchefql: Option<String>,
}

/// Columns whose distinct values are worth offering as filters
fn is_filterable(column_type: &str) -> bool {
    column_type == "String"
        || column_type == "Nullable(String)"
        || column_type.starts_with("LowCardinality(")
        || column_type.starts_with("Enum8(")
        || column_type.starts_with("Enum16(")
}

fn is_low_cardinality(column_type: &str) -> bool {
    column_type.starts_with("LowCardinality(")
        || column_type.starts_with("Enum8(")
        || column_type.starts_with("Enum16(")
}

impl QueryService {
    fn field_params(
        &self,
        source_backend: Backend,
        timestamp_field: &str,
        query: &FieldValuesQuery,
    ) -> Result<FieldValuesParams> {
        let condition = match query.logchefql.as_deref().filter(|q| !q.trim().is_empty()) {
            None => None,
            Some(expr) => {
                let translated = match source_backend {
                    Backend::Clickhouse => logchefql::translate(expr, None)?,
                    Backend::Victorialogs => logchefql::translate_to_logsql(expr, None)?,
                };
                Some(translated.sql).filter(|s| !s.is_empty())
            }
        };
        Ok(FieldValuesParams {
            timestamp_field: timestamp_field.to_string(),
            start: query.start_time,
            end: query.end_time,
            timezone: query.timezone.clone(),
            limit: query.limit.unwrap_or(50).clamp(1, 500),
            condition,
        })
    }

    /// Distinct values of one field. The field must exist on the source
    /// schema and be of a filterable type.
    pub async fn field_values(
        &self,
        source_id: i64,
        field: &str,
        query: &FieldValuesQuery,
        cancel: CancellationToken,
    ) -> Result<FieldValues> {
        let source = self.store().get_source(source_id).await?;
        let schema = self.schema(source_id).await?;
        let Some(column_type) = schema.column_type(field) else {
            return Err(Error::not_found(format!("field {field}")));
        };
        if !is_filterable(column_type) {
            return Err(Error::validation(format!(
                "field '{field}' of type {column_type} is not filterable"
            )));
        }
        let low_cardinality = is_low_cardinality(column_type);
        let params = self
            .field_params(source.backend, &source.timestamp_field, query)?;
        let client = self.manager().get(source_id).await?;
        let timeout = if low_cardinality {
            LOW_CARDINALITY_TIMEOUT
        } else {
            STRING_TIMEOUT
        };
        let mut values =
            match tokio::time::timeout(timeout, client.get_field_values(field, &params, cancel))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::timeout(format!(
                        "distinct values for '{field}' exceeded {}s",
                        timeout.as_secs()
                    )))
                }
            };
        values.is_low_cardinality = low_cardinality;
        Ok(values)
    }

    /// Distinct values for every filterable column. Per-field failures are
    /// logged and skipped; request cancellation short-circuits the loop.
    pub async fn all_field_values(
        &self,
        source_id: i64,
        query: &FieldValuesQuery,
        cancel: CancellationToken,
    ) -> Result<HashMap<String, FieldValues>> {
        let source = self.store().get_source(source_id).await?;
        let schema = self.schema(source_id).await?;
        let params = self
            .field_params(source.backend, &source.timestamp_field, query)?;
        let client = self.manager().get(source_id).await?;

        let mut collected = HashMap::new();
        for column in &schema.columns {
            if cancel.is_cancelled() {
                tracing::debug!(source_id, "field collection cancelled");
                break;
            }
            if !is_filterable(&column.column_type) {
                continue;
            }
            let low_cardinality = is_low_cardinality(&column.column_type);
            let timeout = if low_cardinality {
                LOW_CARDINALITY_TIMEOUT
            } else {
                STRING_TIMEOUT
            };
            let fetched = tokio::time::timeout(
                timeout,
                client.get_field_values(&column.name, &params, cancel.child_token()),
            )
            .await;
            match fetched {
                Ok(Ok(mut values)) => {
                    values.is_low_cardinality = low_cardinality;
                    collected.insert(column.name.clone(), values);
                }
                Ok(Err(Error::Cancelled)) => {
                    tracing::debug!(source_id, field = %column.name, "field collection cancelled");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(source_id, field = %column.name, error = %e, "field values failed");
                }
                Err(_) => {
                    tracing::warn!(
                        source_id,
                        field = %column.name,
                        timeout_secs = timeout.as_secs(),
                        "field values timed out"
                    );
                }
            }
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filterable_types() {
        assert!(is_filterable("String"));
        assert!(is_filterable("Nullable(String)"));
        assert!(is_filterable("LowCardinality(String)"));
        assert!(is_filterable("LowCardinality(Nullable(String))"));
        assert!(is_filterable("Enum8('a' = 1)"));
        assert!(is_filterable("Enum16('a' = 1)"));
        assert!(!is_filterable("UInt64"));
        assert!(!is_filterable("DateTime"));
        assert!(!is_filterable("Map(String, String)"));
    }

    #[test]
    fn low_cardinality_types() {
        assert!(is_low_cardinality("LowCardinality(String)"));
        assert!(is_low_cardinality("Enum8('a' = 1)"));
        assert!(!is_low_cardinality("String"));
        assert!(!is_low_cardinality("Nullable(String)"));
    }
}
