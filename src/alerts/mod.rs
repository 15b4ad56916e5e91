//! Alert definitions, threshold semantics and the evaluation scheduler.

pub mod scheduler;

pub use scheduler::AlertScheduler;

use crate::config::AlertRuleConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Raw SQL evaluated against the source
    Sql,
    /// A LogchefQL condition compiled into a canned count aggregation
    Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl ThresholdOp {
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdOp::Gt => value > threshold,
            ThresholdOp::Gte => value >= threshold,
            ThresholdOp::Lt => value < threshold,
            ThresholdOp::Lte => value <= threshold,
            ThresholdOp::Eq => value == threshold,
            ThresholdOp::Neq => value != threshold,
        }
    }
}

impl std::fmt::Display for ThresholdOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            ThresholdOp::Gt => ">",
            ThresholdOp::Gte => ">=",
            ThresholdOp::Lt => "<",
            ThresholdOp::Lte => "<=",
            ThresholdOp::Eq => "=",
            ThresholdOp::Neq => "!=",
        };
        write!(f, "{symbol}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Firing,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertHistoryStatus {
    Triggered,
    Resolved,
    Error,
}

/// A stored query plus threshold, evaluated periodically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub team_id: i64,
    pub source_id: i64,
    pub name: String,
    pub query_type: QueryType,
    pub query: String,
    pub lookback_seconds: u64,
    pub threshold_op: ThresholdOp,
    pub threshold_value: f64,
    pub frequency_seconds: u64,
    pub severity: AlertSeverity,
    pub recipients: Vec<String>,
    pub webhook_urls: Vec<String>,
    pub is_active: bool,
    pub last_state: AlertState,
    #[serde(default)]
    pub last_evaluated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn from_rule(rule: &AlertRuleConfig) -> Self {
        Alert {
            id: rule.id,
            team_id: rule.team_id,
            source_id: rule.source_id,
            name: rule.name.clone(),
            query_type: rule.query_type,
            query: rule.query.clone(),
            lookback_seconds: rule.lookback_seconds,
            threshold_op: rule.threshold_op,
            threshold_value: rule.threshold_value,
            frequency_seconds: rule.frequency_seconds,
            severity: rule.severity,
            recipients: rule.recipients.clone(),
            webhook_urls: rule.webhook_urls.clone(),
            is_active: rule.is_active,
            last_state: AlertState::Resolved,
            last_evaluated_at: None,
            last_triggered_at: None,
        }
    }

    /// Due when never evaluated or the frequency window has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_evaluated_at {
            None => true,
            Some(last) => last + Duration::seconds(self.frequency_seconds as i64) <= now,
        }
    }
}

/// Append-only evaluation record, pruned per alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHistoryEntry {
    pub id: i64,
    pub alert_id: i64,
    pub status: AlertHistoryStatus,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl AlertHistoryEntry {
    pub fn triggered(alert_id: i64, value: f64, message: impl Into<String>) -> Self {
        AlertHistoryEntry {
            id: 0,
            alert_id,
            status: AlertHistoryStatus::Triggered,
            triggered_at: Utc::now(),
            resolved_at: None,
            value: Some(value),
            message: Some(message.into()),
            payload: None,
        }
    }

    pub fn error(alert_id: i64, message: impl Into<String>) -> Self {
        AlertHistoryEntry {
            id: 0,
            alert_id,
            status: AlertHistoryStatus::Error,
            triggered_at: Utc::now(),
            resolved_at: None,
            value: None,
            message: Some(message.into()),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_operators() {
        assert!(ThresholdOp::Gt.compare(12.0, 10.0));
        assert!(!ThresholdOp::Gt.compare(10.0, 10.0));
        assert!(ThresholdOp::Gte.compare(10.0, 10.0));
        assert!(ThresholdOp::Lt.compare(3.0, 10.0));
        assert!(ThresholdOp::Lte.compare(10.0, 10.0));
        assert!(ThresholdOp::Eq.compare(5.0, 5.0));
        assert!(ThresholdOp::Neq.compare(5.0, 6.0));
    }

    #[test]
    fn due_window() {
        let mut alert = Alert {
            id: 1,
            team_id: 1,
            source_id: 1,
            name: "a".into(),
            query_type: QueryType::Sql,
            query: "SELECT count() FROM t".into(),
            lookback_seconds: 60,
            threshold_op: ThresholdOp::Gt,
            threshold_value: 1.0,
            frequency_seconds: 60,
            severity: AlertSeverity::Info,
            recipients: vec![],
            webhook_urls: vec![],
            is_active: true,
            last_state: AlertState::Resolved,
            last_evaluated_at: None,
            last_triggered_at: None,
        };
        let now = Utc::now();
        assert!(alert.is_due(now));
        alert.last_evaluated_at = Some(now - Duration::seconds(30));
        assert!(!alert.is_due(now));
        alert.last_evaluated_at = Some(now - Duration::seconds(61));
        assert!(alert.is_due(now));
    }
}
