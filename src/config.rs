//! Configuration for the query gateway
//! Loaded from a TOML file with LOGCHEF__ environment overrides; sources
//! and alert rules can be seeded directly from the file.

use crate::alerts::{AlertSeverity, QueryType, ThresholdOp};
use crate::error::{Error, Result};
use crate::models::{Backend, ConnectionInfo, Source};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    /// Sources seeded into the metadata store at startup
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Alert rules seeded into the metadata store at startup
    #[serde(default)]
    pub alert_rules: Vec<AlertRuleConfig>,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8125,
            request_timeout_secs: 120,
            enable_cors: false,
            cors_origins: Vec::new(),
        }
    }
}

/// Query execution limits and tracker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Hard cap on any result-producing LIMIT
    pub max_limit: u32,
    pub default_limit: u32,
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    /// Active-query budget per user; exceeding it yields 429
    pub max_queries_per_user: usize,
    /// Tracker entries older than this are cancelled by the janitor
    pub stale_query_secs: u64,
    pub sweep_interval_secs: u64,
    /// Opportunistic schema cache TTL
    pub schema_cache_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            max_limit: 10_000,
            default_limit: 100,
            default_timeout_secs: 30,
            max_timeout_secs: 120,
            max_queries_per_user: 10,
            stale_query_secs: 3600,
            sweep_interval_secs: 60,
            schema_cache_secs: 300,
        }
    }
}

/// Background health checking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            check_interval_secs: 60,
        }
    }
}

/// Alert scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub tick_interval_secs: u64,
    /// History rows kept per alert after pruning
    pub history_limit: u32,
    pub max_concurrent_evaluations: usize,
    /// Re-notify a still-firing alert after this many seconds; None suppresses
    pub resend_interval_secs: Option<u64>,
    pub shutdown_grace_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        AlertsConfig {
            enabled: true,
            tick_interval_secs: 10,
            history_limit: 100,
            max_concurrent_evaluations: 4,
            resend_interval_secs: None,
            shutdown_grace_secs: 10,
        }
    }
}

/// A source definition as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: i64,
    pub name: String,
    pub backend: Backend,
    pub connection: ConnectionInfo,
    pub timestamp_field: String,
    #[serde(default)]
    pub severity_field: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ttl_days: Option<u32>,
}

impl SourceConfig {
    pub fn to_source(&self) -> Source {
        let now = Utc::now();
        Source {
            id: self.id,
            name: self.name.clone(),
            backend: self.backend,
            connection: self.connection.clone(),
            timestamp_field: self.timestamp_field.clone(),
            severity_field: self.severity_field.clone(),
            description: self.description.clone(),
            ttl_days: self.ttl_days,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An alert rule definition as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub id: i64,
    pub name: String,
    pub source_id: i64,
    #[serde(default)]
    pub team_id: i64,
    pub query_type: QueryType,
    pub query: String,
    pub lookback_seconds: u64,
    pub threshold_op: ThresholdOp,
    pub threshold_value: f64,
    pub frequency_seconds: u64,
    #[serde(default = "default_severity")]
    pub severity: AlertSeverity,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub webhook_urls: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_severity() -> AlertSeverity {
    AlertSeverity::Warning
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load from a TOML file, then apply LOGCHEF__SECTION__KEY env overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("LOGCHEF")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::config("server.port must be non-zero"));
        }
        if self.query.max_limit == 0 {
            return Err(Error::config("query.max_limit must be positive"));
        }
        if self.query.default_timeout_secs > self.query.max_timeout_secs {
            return Err(Error::config(
                "query.default_timeout_secs exceeds query.max_timeout_secs",
            ));
        }
        if self.health.check_interval_secs == 0 {
            return Err(Error::config("health.check_interval_secs must be positive"));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id) {
                return Err(Error::config(format!(
                    "duplicate source id {}",
                    source.id
                )));
            }
            if source.timestamp_field.is_empty() {
                return Err(Error::config(format!(
                    "source {} has an empty timestamp_field",
                    source.id
                )));
            }
            match (&source.backend, &source.connection) {
                (Backend::Clickhouse, ConnectionInfo::Clickhouse(c)) => {
                    if c.database.is_empty() || c.table.is_empty() {
                        return Err(Error::config(format!(
                            "source {} needs both database and table",
                            source.id
                        )));
                    }
                }
                (Backend::Victorialogs, ConnectionInfo::Victorialogs(v)) => {
                    if v.base_url.is_empty() {
                        return Err(Error::config(format!(
                            "source {} needs a base_url",
                            source.id
                        )));
                    }
                }
                _ => {
                    return Err(Error::config(format!(
                        "source {} connection does not match backend {}",
                        source.id, source.backend
                    )));
                }
            }
        }

        for rule in &self.alert_rules {
            if !seen.contains(&rule.source_id) {
                return Err(Error::config(format!(
                    "alert rule {} references unknown source {}",
                    rule.id, rule.source_id
                )));
            }
            if rule.frequency_seconds == 0 || rule.lookback_seconds == 0 {
                return Err(Error::config(format!(
                    "alert rule {} needs positive frequency and lookback",
                    rule.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.query.max_limit, 10_000);
        assert_eq!(cfg.alerts.tick_interval_secs, 10);
    }

    #[test]
    fn parses_source_seed() {
        let raw = r#"
            [[sources]]
            id = 1
            name = "nginx"
            backend = "clickhouse"
            timestamp_field = "ts"

            [sources.connection]
            host = "http://localhost:8123"
            database = "logs"
            table = "events"
        "#;
        let cfg: Config = toml::from_str(raw).expect("parse");
        assert!(cfg.validate().is_ok());
        let src = cfg.sources[0].to_source();
        assert_eq!(src.table_identifier().as_deref(), Some("logs.events"));
    }

    #[test]
    fn rejects_mismatched_connection() {
        let raw = r#"
            [[sources]]
            id = 1
            name = "vl"
            backend = "victorialogs"
            timestamp_field = "_time"

            [sources.connection]
            host = "http://localhost:8123"
            database = "logs"
            table = "events"
        "#;
        let cfg: Config = toml::from_str(raw).expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_rule_for_unknown_source() {
        let raw = r#"
            [[alert_rules]]
            id = 5
            name = "errors"
            source_id = 42
            query_type = "sql"
            query = "SELECT count() FROM logs.events"
            lookback_seconds = 300
            threshold_op = "gt"
            threshold_value = 10.0
            frequency_seconds = 60
        "#;
        let cfg: Config = toml::from_str(raw).expect("parse");
        assert!(cfg.validate().is_err());
    }
}
