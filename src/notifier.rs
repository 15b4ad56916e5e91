//! Notifier contract. Transports (email, webhooks, Alertmanager) live
//! outside the gateway; the shipped implementation emits structured log
//! events so alert flow is observable without one.

use crate::alerts::{Alert, AlertSeverity};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Triggered,
    Resolved,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub alert_id: i64,
    pub alert_name: String,
    pub status: NotificationStatus,
    pub severity: AlertSeverity,
    pub value: Option<f64>,
    pub triggered_at: DateTime<Utc>,
    pub recipients: Vec<String>,
    pub webhook_urls: Vec<String>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator_url: Option<String>,
}

impl Notification {
    pub fn for_alert(
        alert: &Alert,
        status: NotificationStatus,
        value: Option<f64>,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        let mut labels = HashMap::new();
        labels.insert("alert".to_string(), alert.name.clone());
        labels.insert("severity".to_string(), alert.severity.to_string());
        labels.insert("source_id".to_string(), alert.source_id.to_string());
        let mut annotations = HashMap::new();
        annotations.insert(
            "description".to_string(),
            match (status, value) {
                (NotificationStatus::Triggered, Some(v)) => format!(
                    "{}: value {v} crossed threshold {} {}",
                    alert.name, alert.threshold_op, alert.threshold_value
                ),
                (NotificationStatus::Triggered, None) => {
                    format!("{} triggered", alert.name)
                }
                (NotificationStatus::Resolved, _) => format!("{} resolved", alert.name),
            },
        );
        Notification {
            alert_id: alert.id,
            alert_name: alert.name.clone(),
            status,
            severity: alert.severity,
            value,
            triggered_at,
            recipients: alert.recipients.clone(),
            webhook_urls: alert.webhook_urls.clone(),
            labels,
            annotations,
            generator_url: None,
        }
    }
}

/// Delivery failures are reported but never block alert state transitions.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Default notifier: structured log events only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            alert_id = notification.alert_id,
            alert = %notification.alert_name,
            status = ?notification.status,
            severity = %notification.severity,
            value = notification.value,
            recipients = notification.recipients.len(),
            "alert notification"
        );
        Ok(())
    }
}
