//! Domain entities shared across the gateway: sources, schemas, health.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported log backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Clickhouse,
    Victorialogs,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Clickhouse => write!(f, "clickhouse"),
            Backend::Victorialogs => write!(f, "victorialogs"),
        }
    }
}

/// ClickHouse connection details for a source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConnection {
    /// HTTP interface URL, e.g. http://localhost:8123
    pub host: String,
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// VictoriaLogs connection details for a source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VictoriaLogsConnection {
    /// Base URL, e.g. http://localhost:9428
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Optional stream selector prepended to every LogsQL query
    #[serde(default)]
    pub stream_selector: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionInfo {
    Clickhouse(ClickHouseConnection),
    Victorialogs(VictoriaLogsConnection),
}

/// A registered log table or stream plus its connection details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub backend: Backend,
    pub connection: ConnectionInfo,
    /// Column used for time filtering, ordering and histogram bucketing
    pub timestamp_field: String,
    #[serde(default)]
    pub severity_field: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ttl_days: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// `db.table` identity for ClickHouse sources
    pub fn table_identifier(&self) -> Option<String> {
        match &self.connection {
            ConnectionInfo::Clickhouse(c) => Some(format!("{}.{}", c.database, c.table)),
            ConnectionInfo::Victorialogs(_) => None,
        }
    }

    pub fn clickhouse(&self) -> Option<&ClickHouseConnection> {
        match &self.connection {
            ConnectionInfo::Clickhouse(c) => Some(c),
            _ => None,
        }
    }

    pub fn victorialogs(&self) -> Option<&VictoriaLogsConnection> {
        match &self.connection {
            ConnectionInfo::Victorialogs(c) => Some(c),
            _ => None,
        }
    }
}

/// One column of a source schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

/// Extended column metadata from system.columns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnExtended {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    #[serde(default)]
    pub default_expression: String,
    #[serde(default)]
    pub comment: String,
}

/// Schema of a source table or stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
    #[serde(default)]
    pub sort_keys: Vec<String>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<Vec<ColumnExtended>>,
}

impl Schema {
    pub fn column_type(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.column_type.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Cached liveness of a backend connection
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source_id: i64,
    pub status: HealthStatus,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceHealth {
    pub fn unhealthy(source_id: i64, error: impl Into<String>) -> Self {
        SourceHealth {
            source_id,
            status: HealthStatus::Unhealthy,
            last_checked: Utc::now(),
            error: Some(error.into()),
        }
    }

    pub fn healthy(source_id: i64) -> Self {
        SourceHealth {
            source_id,
            status: HealthStatus::Healthy,
            last_checked: Utc::now(),
            error: None,
        }
    }
}

/// Ingestion statistics of one source table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub total_rows: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_entry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_entry: Option<DateTime<Utc>>,
}

/// One time bucket of a histogram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub bucket: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_value: Option<String>,
    pub count: u64,
}

/// One distinct value of a filterable field with its frequency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: String,
    pub count: u64,
}

/// Distinct values of one field over a time range
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldValues {
    pub values: Vec<FieldValue>,
    pub total_distinct: u64,
    pub is_low_cardinality: bool,
}
