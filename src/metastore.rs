//! Metadata store contract consumed by the gateway, plus a config-seeded
//! in-memory implementation so the binary runs without a relational
//! database. Production deployments provide their own implementation.

use crate::alerts::{Alert, AlertHistoryEntry, AlertHistoryStatus, AlertState};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Schema, Source};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_source(&self, id: i64) -> Result<Source>;
    async fn list_sources(&self) -> Result<Vec<Source>>;
    async fn update_source_schema(&self, id: i64, schema: &Schema) -> Result<()>;

    /// Alerts that are active and due for evaluation at `now`.
    async fn list_due_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>>;
    async fn get_alert(&self, id: i64) -> Result<Alert>;
    async fn update_alert_state(
        &self,
        id: i64,
        state: AlertState,
        last_evaluated_at: DateTime<Utc>,
        last_triggered_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn insert_alert_history(&self, entry: AlertHistoryEntry) -> Result<i64>;
    /// Mark the latest unresolved (triggered) history row as resolved.
    async fn resolve_latest_alert_history(&self, alert_id: i64, message: &str) -> Result<()>;
    async fn prune_alert_history(&self, alert_id: i64, keep: u32) -> Result<()>;
    async fn list_alert_history(&self, alert_id: i64, limit: u32) -> Result<Vec<AlertHistoryEntry>>;

    async fn get_setting(&self, key: &str, default: &str) -> Result<String>;
}

#[derive(Default)]
struct MemoryInner {
    sources: HashMap<i64, Source>,
    schemas: HashMap<i64, Schema>,
    alerts: HashMap<i64, Alert>,
    history: HashMap<i64, Vec<AlertHistoryEntry>>,
    settings: HashMap<String, String>,
    next_history_id: i64,
}

/// In-memory store seeded from the config file.
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        MemoryMetadataStore::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let mut inner = MemoryInner::default();
        for source in &config.sources {
            inner.insert_source(source.to_source());
        }
        for rule in &config.alert_rules {
            let alert = Alert::from_rule(rule);
            inner.alerts.insert(alert.id, alert);
        }
        MemoryMetadataStore {
            inner: RwLock::new(inner),
        }
    }

    pub async fn put_source(&self, source: Source) {
        self.inner.write().await.insert_source(source);
    }

    pub async fn put_alert(&self, alert: Alert) {
        self.inner.write().await.alerts.insert(alert.id, alert);
    }

    pub async fn set_setting(&self, key: &str, value: &str) {
        self.inner
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
    }
}

impl MemoryInner {
    fn insert_source(&mut self, source: Source) {
        self.sources.insert(source.id, source);
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_source(&self, id: i64) -> Result<Source> {
        self.inner
            .read()
            .await
            .sources
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("source {id}")))
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let mut sources: Vec<Source> = self.inner.read().await.sources.values().cloned().collect();
        sources.sort_by_key(|s| s.id);
        Ok(sources)
    }

    async fn update_source_schema(&self, id: i64, schema: &Schema) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.sources.contains_key(&id) {
            return Err(Error::not_found(format!("source {id}")));
        }
        inner.schemas.insert(id, schema.clone());
        if let Some(source) = inner.sources.get_mut(&id) {
            source.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_due_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let inner = self.inner.read().await;
        let mut due: Vec<Alert> = inner
            .alerts
            .values()
            .filter(|alert| alert.is_active && alert.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|a| a.id);
        Ok(due)
    }

    async fn get_alert(&self, id: i64) -> Result<Alert> {
        self.inner
            .read()
            .await
            .alerts
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("alert {id}")))
    }

    async fn update_alert_state(
        &self,
        id: i64,
        state: AlertState,
        last_evaluated_at: DateTime<Utc>,
        last_triggered_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let alert = inner
            .alerts
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("alert {id}")))?;
        alert.last_state = state;
        alert.last_evaluated_at = Some(last_evaluated_at);
        if last_triggered_at.is_some() {
            alert.last_triggered_at = last_triggered_at;
        }
        Ok(())
    }

    async fn insert_alert_history(&self, mut entry: AlertHistoryEntry) -> Result<i64> {
        let mut inner = self.inner.write().await;
        inner.next_history_id += 1;
        let id = inner.next_history_id;
        entry.id = id;
        inner.history.entry(entry.alert_id).or_default().push(entry);
        Ok(id)
    }

    async fn resolve_latest_alert_history(&self, alert_id: i64, message: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(rows) = inner.history.get_mut(&alert_id) else {
            return Ok(());
        };
        if let Some(row) = rows
            .iter_mut()
            .rev()
            .find(|r| r.status == AlertHistoryStatus::Triggered && r.resolved_at.is_none())
        {
            row.status = AlertHistoryStatus::Resolved;
            row.resolved_at = Some(Utc::now());
            row.message = Some(message.to_string());
        }
        Ok(())
    }

    async fn prune_alert_history(&self, alert_id: i64, keep: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(rows) = inner.history.get_mut(&alert_id) else {
            return Ok(());
        };
        let keep = keep as usize;
        if rows.len() > keep {
            // rows are append-ordered; keep the most recent
            let drop = rows.len() - keep;
            rows.drain(..drop);
        }
        Ok(())
    }

    async fn list_alert_history(&self, alert_id: i64, limit: u32) -> Result<Vec<AlertHistoryEntry>> {
        let inner = self.inner.read().await;
        let rows = inner.history.get(&alert_id).cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .rev()
            .take(limit.max(1) as usize)
            .collect())
    }

    async fn get_setting(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .inner
            .read()
            .await
            .settings
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertSeverity, QueryType, ThresholdOp};
    use chrono::Duration;

    fn alert(id: i64, frequency: u64) -> Alert {
        Alert {
            id,
            team_id: 1,
            source_id: 1,
            name: format!("alert-{id}"),
            query_type: QueryType::Sql,
            query: "SELECT count() FROM logs.events".into(),
            lookback_seconds: 300,
            threshold_op: ThresholdOp::Gt,
            threshold_value: 10.0,
            frequency_seconds: frequency,
            severity: AlertSeverity::Warning,
            recipients: Vec::new(),
            webhook_urls: Vec::new(),
            is_active: true,
            last_state: AlertState::Resolved,
            last_evaluated_at: None,
            last_triggered_at: None,
        }
    }

    #[tokio::test]
    async fn due_filter_honours_frequency_and_activity() {
        let store = MemoryMetadataStore::new();
        let now = Utc::now();

        let never_evaluated = alert(1, 60);
        let mut recently_evaluated = alert(2, 60);
        recently_evaluated.last_evaluated_at = Some(now - Duration::seconds(10));
        let mut overdue = alert(3, 60);
        overdue.last_evaluated_at = Some(now - Duration::seconds(120));
        let mut inactive = alert(4, 60);
        inactive.is_active = false;

        for a in [never_evaluated, recently_evaluated, overdue, inactive] {
            store.put_alert(a).await;
        }

        let due: Vec<i64> = store
            .list_due_alerts(now)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(due, vec![1, 3]);
    }

    #[tokio::test]
    async fn history_resolution_and_prune() {
        let store = MemoryMetadataStore::new();
        for i in 0..5 {
            store
                .insert_alert_history(AlertHistoryEntry::triggered(9, 1.0 + i as f64, "fired"))
                .await
                .unwrap();
        }
        store
            .resolve_latest_alert_history(9, "back to normal")
            .await
            .unwrap();
        let rows = store.list_alert_history(9, 10).await.unwrap();
        assert_eq!(rows.len(), 5);
        // newest first; the newest was resolved
        assert_eq!(rows[0].status, AlertHistoryStatus::Resolved);
        assert!(rows[0].resolved_at.is_some());
        assert_eq!(rows[1].status, AlertHistoryStatus::Triggered);

        store.prune_alert_history(9, 2).await.unwrap();
        let rows = store.list_alert_history(9, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn settings_fall_back_to_default() {
        let store = MemoryMetadataStore::new();
        assert_eq!(store.get_setting("k", "fallback").await.unwrap(), "fallback");
        store.set_setting("k", "v").await;
        assert_eq!(store.get_setting("k", "fallback").await.unwrap(), "v");
    }
}
