//! Alert evaluation loop: polls the metadata store for due rules, runs
//! their queries through the orchestrator with a lookback window, compares
//! the scalar against the threshold, and drives state transitions,
//! history writes and notifications.

use super::{Alert, AlertHistoryEntry, AlertState, QueryType};
use crate::client::ResultSet;
use crate::config::AlertsConfig;
use crate::error::{Error, Result};
use crate::logchefql;
use crate::metastore::MetadataStore;
use crate::models::{Backend, Source};
use crate::notifier::{Notification, NotificationStatus, Notifier};
use crate::query::QueryService;
use crate::sql;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct AlertScheduler {
    config: AlertsConfig,
    store: Arc<dyn MetadataStore>,
    notifier: Arc<dyn Notifier>,
    queries: Arc<QueryService>,
    stop: CancellationToken,
}

impl AlertScheduler {
    pub fn new(
        config: AlertsConfig,
        store: Arc<dyn MetadataStore>,
        notifier: Arc<dyn Notifier>,
        queries: Arc<QueryService>,
    ) -> Arc<Self> {
        Arc::new(AlertScheduler {
            config,
            store,
            notifier,
            queries,
            stop: CancellationToken::new(),
        })
    }

    /// Spawn the coordinator loop. One tick never overlaps the next: a
    /// tick awaits all of its evaluations before the ticker fires again.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(scheduler.config.tick_interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                tick_secs = scheduler.config.tick_interval_secs,
                "alert scheduler started"
            );
            loop {
                tokio::select! {
                    _ = scheduler.stop.cancelled() => break,
                    _ = ticker.tick() => scheduler.tick().await,
                }
            }
            tracing::info!("alert scheduler stopped");
        })
    }

    /// Signal shutdown; the caller bounds the drain by awaiting the
    /// handle returned from `start` with a grace timeout.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.config.shutdown_grace_secs)
    }

    /// Evaluate every due alert with bounded parallelism.
    pub async fn tick(self: &Arc<Self>) {
        let now = Utc::now();
        let due = match self.store.list_due_alerts(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "failed to list due alerts");
                return;
            }
        };
        if due.is_empty() {
            return;
        }
        tracing::debug!(count = due.len(), "evaluating due alerts");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_evaluations.max(1)));
        let mut evaluations = JoinSet::new();
        for alert in due {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let scheduler = self.clone();
            evaluations.spawn(async move {
                let _permit = permit;
                scheduler.evaluate(alert, now).await;
            });
        }
        while evaluations.join_next().await.is_some() {}
    }

    /// Evaluate one alert and apply the resulting state transition.
    pub async fn evaluate(&self, alert: Alert, now: DateTime<Utc>) {
        let alert_id = alert.id;
        let outcome = self.evaluate_value(&alert, now).await;
        match outcome {
            Err(e) => {
                tracing::warn!(alert_id, error = %e, "alert evaluation failed");
                if let Err(e) = self
                    .store
                    .insert_alert_history(AlertHistoryEntry::error(alert_id, e.to_string()))
                    .await
                {
                    tracing::error!(alert_id, error = %e, "failed to record evaluation error");
                }
                // state and last_evaluated_at stay put: the alert is retried
                // on the next tick
            }
            Ok(value) => {
                let firing = alert.threshold_op.compare(value, alert.threshold_value);
                if let Err(e) = self.transition(&alert, value, firing, now).await {
                    tracing::error!(alert_id, error = %e, "failed to apply alert transition");
                }
            }
        }
        if let Err(e) = self
            .store
            .prune_alert_history(alert_id, self.config.history_limit)
            .await
        {
            tracing::warn!(alert_id, error = %e, "history prune failed");
        }
    }

    async fn evaluate_value(&self, alert: &Alert, now: DateTime<Utc>) -> Result<f64> {
        let source = self.store.get_source(alert.source_id).await?;
        let start = now - ChronoDuration::seconds(alert.lookback_seconds as i64);
        let query = self.build_scalar_query(alert, &source, start, now)?;
        let timeout = self.evaluation_timeout(alert);
        let result = self
            .queries
            .execute_internal(alert.source_id, &query, timeout, self.stop.child_token())
            .await?;
        Ok(extract_scalar(&result))
    }

    fn evaluation_timeout(&self, alert: &Alert) -> Duration {
        let half_frequency = (alert.frequency_seconds / 2).max(1);
        Duration::from_secs(half_frequency.min(self.queries.config().max_timeout_secs))
    }

    /// Build the backend-native query producing the alert's scalar.
    fn build_scalar_query(
        &self,
        alert: &Alert,
        source: &Source,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<String> {
        match source.backend {
            Backend::Clickhouse => self.clickhouse_scalar_query(alert, source, start, end),
            Backend::Victorialogs => self.logsql_scalar_query(alert, source, start, end),
        }
    }

    fn clickhouse_scalar_query(
        &self,
        alert: &Alert,
        source: &Source,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<String> {
        let ts = logchefql::quote_ident(&source.timestamp_field);
        let between = format!(
            "{ts} BETWEEN toDateTime('{}','UTC') AND toDateTime('{}','UTC')",
            start.format("%Y-%m-%d %H:%M:%S"),
            end.format("%Y-%m-%d %H:%M:%S"),
        );
        match alert.query_type {
            QueryType::Sql => {
                let validated =
                    sql::build_raw_query(&alert.query, 0, sql::QueryMode::Extended, None)?;
                if sql::has_aggregate_projection(&validated)? {
                    // the user supplied their own aggregate; its first
                    // numeric column is the scalar
                    return Ok(validated);
                }
                let inner = sql::ensure_timestamp_in_select(
                    &sql::remove_limit(&validated)?,
                    &source.timestamp_field,
                )?;
                Ok(format!(
                    "SELECT count() AS value FROM ({inner}) WHERE {between}"
                ))
            }
            QueryType::Condition => {
                let translated = logchefql::translate(&alert.query, None)?;
                let conn = source.clickhouse().ok_or_else(|| {
                    Error::internal(format!("source {} missing clickhouse connection", source.id))
                })?;
                let mut where_clause = between;
                if !translated.sql.is_empty() {
                    where_clause.push_str(&format!(" AND ({})", translated.sql));
                }
                Ok(format!(
                    "SELECT count() AS value FROM {}.{} WHERE {}",
                    logchefql::quote_ident(&conn.database),
                    logchefql::quote_ident(&conn.table),
                    where_clause
                ))
            }
        }
    }

    fn logsql_scalar_query(
        &self,
        alert: &Alert,
        source: &Source,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<String> {
        let filter = match alert.query_type {
            QueryType::Condition => logchefql::translate_to_logsql(&alert.query, None)?.sql,
            // raw LogsQL passes through as the filter
            QueryType::Sql => alert.query.trim().to_string(),
        };
        let conn = source.victorialogs().ok_or_else(|| {
            Error::internal(format!(
                "source {} missing victorialogs connection",
                source.id
            ))
        })?;
        let mut parts: Vec<String> = Vec::new();
        if let Some(selector) = conn.stream_selector.as_deref() {
            if !selector.is_empty() {
                parts.push(selector.to_string());
            }
        }
        parts.push(format!(
            "_time:[{}, {}]",
            start.format("%Y-%m-%dT%H:%M:%SZ"),
            end.format("%Y-%m-%dT%H:%M:%SZ"),
        ));
        if !filter.is_empty() {
            parts.push(format!("AND ({filter})"));
        }
        Ok(format!("{} | stats count(*) as value", parts.join(" ")))
    }

    async fn transition(
        &self,
        alert: &Alert,
        value: f64,
        firing: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match (alert.last_state, firing) {
            (AlertState::Resolved, true) => {
                let message = format!(
                    "value {value} {} threshold {}",
                    alert.threshold_op, alert.threshold_value
                );
                self.store
                    .insert_alert_history(AlertHistoryEntry::triggered(alert.id, value, message))
                    .await?;
                self.notify(alert, NotificationStatus::Triggered, Some(value), now)
                    .await;
                self.store
                    .update_alert_state(alert.id, AlertState::Firing, now, Some(now))
                    .await?;
            }
            (AlertState::Firing, true) => {
                let resend = self.config.resend_interval_secs.is_some_and(|interval| {
                    alert
                        .last_triggered_at
                        .map(|last| {
                            last + ChronoDuration::seconds(interval as i64) <= now
                        })
                        .unwrap_or(true)
                });
                if resend {
                    self.notify(alert, NotificationStatus::Triggered, Some(value), now)
                        .await;
                    self.store
                        .update_alert_state(alert.id, AlertState::Firing, now, Some(now))
                        .await?;
                } else {
                    self.store
                        .update_alert_state(alert.id, AlertState::Firing, now, None)
                        .await?;
                }
            }
            (AlertState::Firing, false) => {
                let message = format!(
                    "value {value} back within threshold {} {}",
                    alert.threshold_op, alert.threshold_value
                );
                self.store
                    .resolve_latest_alert_history(alert.id, &message)
                    .await?;
                self.notify(alert, NotificationStatus::Resolved, Some(value), now)
                    .await;
                self.store
                    .update_alert_state(alert.id, AlertState::Resolved, now, None)
                    .await?;
            }
            (AlertState::Resolved, false) => {
                self.store
                    .update_alert_state(alert.id, AlertState::Resolved, now, None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn notify(
        &self,
        alert: &Alert,
        status: NotificationStatus,
        value: Option<f64>,
        now: DateTime<Utc>,
    ) {
        let notification = Notification::for_alert(alert, status, value, now);
        if let Err(e) = self.notifier.send(&notification).await {
            // delivery failures never block state transitions
            tracing::warn!(alert_id = alert.id, error = %e, "notification failed");
        }
    }
}

/// Pull the scalar out of a result set: the `value` column if present,
/// otherwise the first numeric column of the first row; no rows means 0.
fn extract_scalar(result: &ResultSet) -> f64 {
    let Some(row) = result.rows.first() else {
        return 0.0;
    };
    if let Some(v) = row.get("value").and_then(|v| v.as_f64()) {
        return v;
    }
    for column in &result.columns {
        if let Some(v) = row.get(&column.name).and_then(|v| v.as_f64()) {
            return v;
        }
    }
    0.0
}
